//! Maps typed network events into idempotent graph mutations.

use anyhow::{anyhow, Result};
use neo4rs::{query, Txn};
use tracing::warn;

use crate::event::Event;
use crate::graph::GraphStore;
use crate::objects::ObjectStore;

/// Translates each event kind into graph mutations, one write transaction
/// per event. All relations use `merge`, so repeated delivery of the same
/// event across relays is a no-op.
#[derive(Clone)]
pub struct Mapper {
    graph: GraphStore,
    objects: ObjectStore,
}

impl Mapper {
    pub fn new(graph: GraphStore, objects: ObjectStore) -> Self {
        Self { graph, objects }
    }

    /// Dispatch an event by kind. Unknown kinds are logged and dropped.
    pub async fn store_event(&self, ev: &Event) -> Result<()> {
        match ev.kind {
            1 => self.store_post(ev).await,
            3 => self.store_contact(ev).await,
            6 => self.store_repost(ev).await,
            7 => self.store_like(ev).await,
            9735 => self.store_zap(ev).await,
            kind => {
                warn!(kind, id = %ev.id, "unsupported event kind");
                Ok(())
            }
        }
    }

    /// Store a kind-1 text note with a REPLY edge to its first `e`-tag.
    pub async fn store_post(&self, ev: &Event) -> Result<()> {
        self.store_with_edge(ev, "REPLY", None).await
    }

    /// Store a kind-7 reaction with a LIKE edge to its first `e`-tag.
    pub async fn store_like(&self, ev: &Event) -> Result<()> {
        self.store_with_edge(ev, "LIKE", None).await
    }

    /// Store a kind-6 repost with a REPOST edge to its first `e`-tag.
    pub async fn store_repost(&self, ev: &Event) -> Result<()> {
        self.store_with_edge(ev, "REPOST", None).await
    }

    /// Store a kind-9735 zap receipt with a weighted ZAP edge.
    ///
    /// The amount comes from the invoice in the `bolt11` tag. A receipt that
    /// does not reference a post is accepted without producing anything.
    pub async fn store_zap(&self, ev: &Event) -> Result<()> {
        let bolt11 = ev
            .last_tag_value("bolt11")
            .ok_or_else(|| anyhow!("zap receipt {} has no bolt11 tag", ev.id))?;
        let amount = bolt11_amount_msat(bolt11)? / 1000;

        if ev.first_tag_value("e").is_none() {
            return Ok(());
        }
        self.store_with_edge(ev, "ZAP", Some(amount)).await
    }

    /// Replace the author's entire FOLLOW set from a kind-3 contact list.
    pub async fn store_contact(&self, ev: &Event) -> Result<()> {
        let mut txn = self.graph.txn().await?;
        txn.run(
            query("match (u:User {pubkey: $pubkey})-[r:FOLLOW]->() delete r")
                .param("pubkey", ev.pubkey.as_str()),
        )
        .await?;
        for followed in ev.tag_values("p") {
            txn.run(
                query(
                    "merge (u:User {pubkey: $pubkey}) \
                     merge (p:User {pubkey: $p}) \
                     merge (u)-[:FOLLOW]->(p)",
                )
                .param("pubkey", ev.pubkey.as_str())
                .param("p", followed),
            )
            .await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Upsert author, blob, post node and CREATE edge, then the type-specific
    /// edge to the first referenced post when that post is already known.
    async fn store_with_edge(&self, ev: &Event, rel: &str, amount: Option<i64>) -> Result<()> {
        let mut txn = self.graph.txn().await?;
        self.save_user_and_post(&mut txn, ev).await?;

        if let Some(ref_id) = ev.first_tag_value("e") {
            let cypher = ref_edge_cypher(rel, amount.is_some());
            let mut q = query(&cypher)
                .param("id", ev.id.as_str())
                .param("ref_id", ref_id);
            if let Some(amount) = amount {
                q = q.param("amount", amount);
            }
            txn.run(q).await?;
        }

        txn.commit().await?;
        Ok(())
    }

    /// The canonical upsert block shared by every post-bearing handler.
    async fn save_user_and_post(&self, txn: &mut Txn, ev: &Event) -> Result<()> {
        txn.run(query("merge (u:User {pubkey: $pubkey})").param("pubkey", ev.pubkey.as_str()))
            .await?;

        let raw = serde_json::to_vec(ev)?;
        self.objects.write(&ev.id, &raw)?;

        txn.run(
            query(
                "merge (p:Post {id: $id, kind: $kind, author: $author, \
                 created_at: $created_at})",
            )
            .param("id", ev.id.as_str())
            .param("kind", ev.kind as i64)
            .param("author", ev.pubkey.as_str())
            .param("created_at", ev.created_at as i64),
        )
        .await?;

        txn.run(
            query(
                "match (u:User), (p:Post) where u.pubkey = $pubkey and p.id = $id \
                 merge (u)-[:CREATE]->(p)",
            )
            .param("pubkey", ev.pubkey.as_str())
            .param("id", ev.id.as_str()),
        )
        .await?;
        Ok(())
    }
}

/// Cypher for the type-specific edge. The `match … match … merge` shape means
/// a reference to a not-yet-seen post creates no edge.
fn ref_edge_cypher(rel: &str, with_amount: bool) -> String {
    let props = if with_amount { " {amount: $amount}" } else { "" };
    format!(
        "match (p:Post), (r:Post) where p.id = $id and r.id = $ref_id \
         merge (p)-[:{}{}]->(r)",
        rel, props
    )
}

/// Extract the amount in millisatoshi from a bolt11 invoice.
///
/// The amount lives entirely in the human-readable prefix:
/// `ln<currency><amount><multiplier>`. An invoice without an amount part
/// decodes to zero.
pub fn bolt11_amount_msat(invoice: &str) -> Result<i64> {
    let invoice = invoice.to_lowercase();
    let sep = invoice
        .rfind('1')
        .ok_or_else(|| anyhow!("invalid invoice: missing separator"))?;
    let hrp = &invoice[..sep];
    if !hrp.starts_with("ln") {
        return Err(anyhow!("invalid invoice prefix"));
    }
    let rest = &hrp[2..];
    let Some(start) = rest.find(|c: char| c.is_ascii_digit()) else {
        // Amountless invoice.
        return Ok(0);
    };
    let amount_part = &rest[start..];
    let (digits, multiplier) = match amount_part.chars().last() {
        Some(c) if c.is_ascii_digit() => (amount_part, None),
        Some(c) => (&amount_part[..amount_part.len() - 1], Some(c)),
        None => return Ok(0),
    };
    let value: i64 = digits
        .parse()
        .map_err(|_| anyhow!("invalid invoice amount"))?;
    let msat = match multiplier {
        None => value.checked_mul(100_000_000_000),
        Some('m') => value.checked_mul(100_000_000),
        Some('u') => value.checked_mul(100_000),
        Some('n') => value.checked_mul(100),
        Some('p') => {
            if value % 10 != 0 {
                return Err(anyhow!("invalid invoice amount precision"));
            }
            Some(value / 10)
        }
        Some(c) => return Err(anyhow!("invalid invoice multiplier: {}", c)),
    }
    .ok_or_else(|| anyhow!("invoice amount overflow"))?;
    Ok(msat)
}
