//! Feed computation: scorer seam plus raw-blob attachment.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use neo4rs::query;
use serde::Serialize;
use tracing::{error, warn};

use crate::event::Event;
use crate::graph::GraphStore;
use crate::objects::ObjectStore;

/// A ranked post as returned by the scorer.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPost {
    pub id: String,
    pub kind: u32,
    pub pubkey: String,
    pub created_at: u64,
    pub score: f64,
}

/// A feed entry: a scored post with its raw serialized event attached.
#[derive(Debug, Clone, Serialize)]
pub struct FeedEntry {
    pub id: String,
    pub kind: u32,
    pub pubkey: String,
    pub created_at: u64,
    pub score: f64,
    pub raw: String,
}

/// Ranking engine seam. An empty subscriber pubkey means the global
/// trending feed.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn get_feed(
        &self,
        subscriber_pub: &str,
        start: u64,
        end: u64,
        limit: u64,
    ) -> Result<Vec<ScoredPost>>;
}

/// Default scorer ranking posts by interaction weight inside the graph.
///
/// Zaps weigh in proportionally to their amount, reposts over replies over
/// likes. A subscriber's feed restricts candidates to authors in their
/// FOLLOW/SIMILAR neighbourhood and falls back to the global ranking when
/// the neighbourhood yields nothing.
pub struct GraphScorer {
    graph: GraphStore,
}

impl GraphScorer {
    pub fn new(graph: GraphStore) -> Self {
        Self { graph }
    }

    async fn run_feed_query(
        &self,
        cypher: &str,
        subscriber_pub: &str,
        start: u64,
        end: u64,
        limit: u64,
    ) -> Result<Vec<ScoredPost>> {
        let mut q = query(cypher)
            .param("start", start as i64)
            .param("end", end as i64)
            .param("limit", limit as i64);
        if !subscriber_pub.is_empty() {
            q = q.param("pubkey", subscriber_pub);
        }
        let mut rows = self.graph.graph().execute(q).await?;
        let mut posts = Vec::new();
        while let Some(row) = rows.next().await? {
            posts.push(ScoredPost {
                id: row.get("id")?,
                kind: row.get::<i64>("kind")? as u32,
                pubkey: row.get("pubkey")?,
                created_at: row.get::<i64>("created_at")? as u64,
                score: row.get("score")?,
            });
        }
        Ok(posts)
    }
}

const SCORE_CLAUSE: &str = "with p, sum(case type(i) \
     when 'ZAP' then 10.0 + coalesce(i.amount, 0) / 100.0 \
     when 'REPOST' then 5.0 \
     when 'REPLY' then 3.0 \
     when 'LIKE' then 1.0 \
     else 0.0 end) as score \
     where score > 0 \
     return p.id as id, p.kind as kind, p.author as pubkey, \
            p.created_at as created_at, score \
     order by score desc limit $limit";

fn feed_cypher(personalized: bool) -> String {
    let candidates = if personalized {
        "match (s:User {pubkey: $pubkey})-[:FOLLOW|SIMILAR]->(:User)-[:CREATE]->(p:Post) \
         where p.created_at >= $start and p.created_at < $end and p.kind = 1 \
         with distinct p"
    } else {
        "match (p:Post) \
         where p.created_at >= $start and p.created_at < $end and p.kind = 1"
    };
    format!(
        "{} optional match (p)<-[i:REPLY|LIKE|REPOST|ZAP]-(:Post) {}",
        candidates, SCORE_CLAUSE
    )
}

#[async_trait]
impl Scorer for GraphScorer {
    async fn get_feed(
        &self,
        subscriber_pub: &str,
        start: u64,
        end: u64,
        limit: u64,
    ) -> Result<Vec<ScoredPost>> {
        if !subscriber_pub.is_empty() {
            let personalized = self
                .run_feed_query(&feed_cypher(true), subscriber_pub, start, end, limit)
                .await?;
            if !personalized.is_empty() {
                return Ok(personalized);
            }
        }
        self.run_feed_query(&feed_cypher(false), "", start, end, limit)
            .await
    }
}

/// Thin adapter over the scorer that attaches raw blobs to each entry.
#[derive(Clone)]
pub struct FeedService {
    scorer: Arc<dyn Scorer>,
    objects: ObjectStore,
}

impl FeedService {
    pub fn new(scorer: Arc<dyn Scorer>, objects: ObjectStore) -> Self {
        Self { scorer, objects }
    }

    /// Compute the top posts for a subscriber over a time window. An empty
    /// `subscriber_pub` yields the global trending feed.
    pub async fn get_feed(
        &self,
        subscriber_pub: &str,
        start: u64,
        end: u64,
        limit: u64,
    ) -> Result<Vec<FeedEntry>> {
        let posts = self
            .scorer
            .get_feed(subscriber_pub, start, end, limit)
            .await?;
        let mut feed = Vec::with_capacity(posts.len());
        for post in posts {
            let raw = match self.objects.read(&post.id) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    error!(id = %post.id, err = %e, "failed to read object");
                    continue;
                }
            };
            feed.push(FeedEntry {
                id: post.id,
                kind: post.kind,
                pubkey: post.pubkey,
                created_at: post.created_at,
                score: post.score,
                raw,
            });
        }
        Ok(feed)
    }

    /// Global trending window parsed back into events.
    pub async fn trends(&self, start: u64, end: u64, limit: u64) -> Result<Vec<Event>> {
        let feed = self.get_feed("", start, end, limit).await?;
        let mut events = Vec::with_capacity(feed.len());
        for entry in feed {
            match serde_json::from_str::<Event>(&entry.raw) {
                Ok(ev) => events.push(ev),
                Err(e) => {
                    warn!(id = %entry.id, err = %e, "failed to parse raw event");
                }
            }
        }
        Ok(events)
    }
}
