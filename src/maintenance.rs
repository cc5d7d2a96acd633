//! Daily maintenance: retention, blob GC, and affinity rebuild.

use std::time::Duration;

use anyhow::Result;
use neo4rs::query;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::event;
use crate::graph::GraphStore;
use crate::objects::ObjectStore;

/// Posts older than this are deleted from the graph.
const POST_RETENTION: Duration = Duration::from_secs(30 * 86400);
/// Raw blobs older than this are garbage collected.
const BLOB_RETENTION: Duration = Duration::from_secs(7 * 86400);
/// Window of recent interactions projected into LIKES edges.
const AFFINITY_WINDOW: Duration = Duration::from_secs(2 * 86400);

const DELETE_BATCH: u32 = 10_000;

/// Runs the retention sweeps and similarity rebuild at midnight UTC.
#[derive(Clone)]
pub struct Maintenance {
    graph: GraphStore,
    objects: ObjectStore,
}

impl Maintenance {
    pub fn new(graph: GraphStore, objects: ObjectStore) -> Self {
        Self { graph, objects }
    }

    /// Start the daily schedule.
    pub fn start(&self) -> JoinHandle<()> {
        let job = self.clone();
        tokio::spawn(async move {
            info!("registered maintenance job at midnight UTC");
            loop {
                let wait = secs_until_next_utc_midnight(event::now() as i64);
                tokio::time::sleep(Duration::from_secs(wait)).await;
                job.run_daily().await;
            }
        })
    }

    /// One full maintenance pass. Each sweep's failure is logged and the
    /// remaining sweeps still run.
    pub async fn run_daily(&self) {
        info!("running daily maintenance");
        if let Err(e) = self.clean_posts().await {
            error!(err = %e, "failed to batch delete old posts and inactive users");
        }
        if let Err(e) = self.clean_objects() {
            error!(err = %e, "failed to clean raw objects");
        }
        if let Err(e) = self.update_affinity().await {
            error!(err = %e, "failed to update user affinity");
        }
    }

    /// Batch-delete posts past retention, then users left without edges.
    async fn clean_posts(&self) -> Result<()> {
        let cutoff = event::now().saturating_sub(POST_RETENTION.as_secs()) as i64;
        self.graph
            .run(
                query(
                    "call apoc.periodic.iterate(\
                     'match (r:Post) where r.created_at < $cutoff return r', \
                     'detach delete r', \
                     {batchSize: $batch, iterateList: true, parallel: false, \
                      params: {cutoff: $cutoff}})",
                )
                .param("cutoff", cutoff)
                .param("batch", DELETE_BATCH as i64),
            )
            .await?;
        self.graph
            .run(
                query(
                    "call apoc.periodic.iterate(\
                     'match (u:User) where not (u)--() return u', \
                     'detach delete u', \
                     {batchSize: $batch, iterateList: true, parallel: false})",
                )
                .param("batch", DELETE_BATCH as i64),
            )
            .await?;
        Ok(())
    }

    /// Remove raw blobs past retention.
    fn clean_objects(&self) -> Result<()> {
        let removed = self.objects.gc(BLOB_RETENTION)?;
        info!(removed, "cleaned raw objects");
        Ok(())
    }

    /// Materialize LIKES edges from recent interactions, then rebuild the
    /// SIMILAR edges with the store's node-similarity algorithm.
    async fn update_affinity(&self) -> Result<()> {
        let cutoff = event::now().saturating_sub(AFFINITY_WINDOW.as_secs()) as i64;
        self.graph
            .run(
                query(
                    "match (r:Post) where r.created_at > $cutoff \
                     match (a:User)-[:CREATE]->(r)-[:ZAP|REPLY|LIKE|REPOST]->(p:Post) \
                     merge (a)-[:LIKES]->(p)",
                )
                .param("cutoff", cutoff),
            )
            .await?;
        self.graph
            .run(query("match (:User)-[s:SIMILAR]->(:User) delete s"))
            .await?;

        // Re-project the affinity graph before running the algorithm.
        self.graph
            .run(query("call gds.graph.drop('affinity', false)"))
            .await?;
        self.graph
            .run(query(
                "call gds.graph.project('affinity', ['User', 'Post'], ['LIKES'])",
            ))
            .await?;
        self.graph
            .run(query(
                "call gds.nodeSimilarity.write('affinity', { \
                 similarityCutoff: 0.01, degreeCutoff: 3, \
                 writeRelationshipType: 'SIMILAR', writeProperty: 'score' })",
            ))
            .await?;
        Ok(())
    }
}

/// Seconds from `now_ts` until the next UTC midnight.
fn secs_until_next_utc_midnight(now_ts: i64) -> u64 {
    (86400 - now_ts.rem_euclid(86400)) as u64
}
