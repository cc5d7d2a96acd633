//! Persistent subscription registry.

use anyhow::Result;
use async_trait::async_trait;
use neo4rs::{query, Row};
use tracing::{debug, warn};

use crate::graph::GraphStore;

/// A subscriber record. Active while `unsubscribed_at` is unset.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscriber {
    pub pubkey: String,
    /// Secret key of the bot-issued channel identity. Never rotated.
    pub channel_secret: String,
    pub subscribed_at: u64,
    pub unsubscribed_at: Option<u64>,
}

impl Subscriber {
    pub fn is_active(&self) -> bool {
        self.unsubscribed_at.is_none()
    }
}

/// Subscriber lifecycle operations.
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    async fn get(&self, pubkey: &str) -> Result<Option<Subscriber>>;
    async fn create(&self, pubkey: &str, channel_secret: &str, subscribed_at: u64) -> Result<()>;
    async fn delete(&self, pubkey: &str, unsubscribed_at: u64) -> Result<()>;
    async fn restore(&self, pubkey: &str, subscribed_at: u64) -> Result<bool>;
    async fn list(&self, limit: u64, skip: u64) -> Result<Vec<Subscriber>>;
}

/// Subscriber registry backed by the graph store.
///
/// All mutations are MERGE-based upserts; there is no application-level
/// locking.
#[derive(Clone)]
pub struct Registry {
    graph: GraphStore,
}

impl Registry {
    pub fn new(graph: GraphStore) -> Self {
        Self { graph }
    }

    /// Fetch a subscriber, or `None` when absent.
    pub async fn get(&self, pubkey: &str) -> Result<Option<Subscriber>> {
        let mut rows = self
            .graph
            .graph()
            .execute(
                query(
                    "MATCH (s:Subscriber {pubkey: $pubkey}) \
                     RETURN s.pubkey AS pubkey, \
                            s.channel_secret AS channel_secret, \
                            s.subscribed_at AS subscribed_at, \
                            s.unsubscribed_at AS unsubscribed_at",
                )
                .param("pubkey", pubkey),
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_subscriber(&row)?)),
            None => Ok(None),
        }
    }

    /// Create a subscriber record. Idempotent: an existing record is left
    /// untouched.
    pub async fn create(
        &self,
        pubkey: &str,
        channel_secret: &str,
        subscribed_at: u64,
    ) -> Result<()> {
        debug!(pubkey, "creating subscriber");
        self.graph
            .run(
                query(
                    "MERGE (s:Subscriber {pubkey: $pubkey}) ON CREATE \
                     SET s.channel_secret = $channel_secret, \
                         s.subscribed_at = $subscribed_at, \
                         s.unsubscribed_at = null",
                )
                .param("pubkey", pubkey)
                .param("channel_secret", channel_secret)
                .param("subscribed_at", subscribed_at as i64),
            )
            .await
    }

    /// Mark a subscriber inactive. The record itself is retained.
    pub async fn delete(&self, pubkey: &str, unsubscribed_at: u64) -> Result<()> {
        debug!(pubkey, "deleting subscriber");
        self.graph
            .run(
                query(
                    "MATCH (s:Subscriber {pubkey: $pubkey}) \
                     SET s.unsubscribed_at = $unsubscribed_at",
                )
                .param("pubkey", pubkey)
                .param("unsubscribed_at", unsubscribed_at as i64),
            )
            .await
    }

    /// Reactivate an inactive subscriber.
    ///
    /// Returns `true` only when the record transitioned from inactive to
    /// active; callers use this to decide whether to greet again.
    pub async fn restore(&self, pubkey: &str, subscribed_at: u64) -> Result<bool> {
        debug!(pubkey, "restoring subscriber");
        let subscriber = match self.get(pubkey).await? {
            Some(s) => s,
            None => {
                warn!(pubkey, "restore requested for unknown subscriber");
                return Ok(false);
            }
        };
        if subscriber.unsubscribed_at.is_none() {
            return Ok(false);
        }

        self.graph
            .run(
                query(
                    "MATCH (s:Subscriber {pubkey: $pubkey}) \
                     SET s.unsubscribed_at = null, \
                         s.subscribed_at = $subscribed_at",
                )
                .param("pubkey", pubkey)
                .param("subscribed_at", subscribed_at as i64),
            )
            .await?;
        Ok(true)
    }

    /// Page through subscribers ordered by pubkey.
    pub async fn list(&self, limit: u64, skip: u64) -> Result<Vec<Subscriber>> {
        let mut rows = self
            .graph
            .graph()
            .execute(
                query(
                    "MATCH (s:Subscriber) \
                     RETURN s.pubkey AS pubkey, \
                            s.channel_secret AS channel_secret, \
                            s.subscribed_at AS subscribed_at, \
                            s.unsubscribed_at AS unsubscribed_at \
                     ORDER BY s.pubkey \
                     SKIP $skip LIMIT $limit",
                )
                .param("limit", limit as i64)
                .param("skip", skip as i64),
            )
            .await?;
        let mut subscribers = Vec::new();
        while let Some(row) = rows.next().await? {
            subscribers.push(row_to_subscriber(&row)?);
        }
        Ok(subscribers)
    }
}

#[async_trait]
impl SubscriberStore for Registry {
    async fn get(&self, pubkey: &str) -> Result<Option<Subscriber>> {
        Registry::get(self, pubkey).await
    }

    async fn create(&self, pubkey: &str, channel_secret: &str, subscribed_at: u64) -> Result<()> {
        Registry::create(self, pubkey, channel_secret, subscribed_at).await
    }

    async fn delete(&self, pubkey: &str, unsubscribed_at: u64) -> Result<()> {
        Registry::delete(self, pubkey, unsubscribed_at).await
    }

    async fn restore(&self, pubkey: &str, subscribed_at: u64) -> Result<bool> {
        Registry::restore(self, pubkey, subscribed_at).await
    }

    async fn list(&self, limit: u64, skip: u64) -> Result<Vec<Subscriber>> {
        Registry::list(self, limit, skip).await
    }
}

fn row_to_subscriber(row: &Row) -> Result<Subscriber> {
    Ok(Subscriber {
        pubkey: row.get("pubkey")?,
        channel_secret: row.get("channel_secret")?,
        subscribed_at: row.get::<i64>("subscribed_at")? as u64,
        // A null property fails extraction, which here means "still active".
        unsubscribed_at: row.get::<i64>("unsubscribed_at").ok().map(|t| t as u64),
    })
}
