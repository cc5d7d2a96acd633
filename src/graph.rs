//! Graph store gateway over the Neo4j bolt driver.

use anyhow::{Context, Result};
use neo4rs::{query, Graph, Query, Txn};

/// Owns the single driver instance shared by every component.
///
/// Sessions are managed by the driver; every transaction scope obtained via
/// [`GraphStore::txn`] is single-use and either committed or dropped.
#[derive(Clone)]
pub struct GraphStore {
    graph: Graph,
}

impl GraphStore {
    /// Connect to the graph store with basic auth.
    ///
    /// Failure here is fatal for the process.
    pub async fn connect(url: &str, username: &str, password: &str) -> Result<Self> {
        let graph = Graph::new(url, username, password)
            .await
            .context("connecting to graph store")?;
        Ok(Self { graph })
    }

    /// Declare the uniqueness constraints once at startup.
    pub async fn init_constraints(&self) -> Result<()> {
        self.graph
            .run(query(
                "CREATE CONSTRAINT post_id_uniq IF NOT EXISTS \
                 FOR (p:Post) REQUIRE p.id IS UNIQUE",
            ))
            .await
            .context("declaring post id constraint")?;
        self.graph
            .run(query(
                "CREATE CONSTRAINT user_pk_uniq IF NOT EXISTS \
                 FOR (u:User) REQUIRE u.pubkey IS UNIQUE",
            ))
            .await
            .context("declaring user pubkey constraint")?;
        Ok(())
    }

    /// Begin a write transaction scope.
    pub async fn txn(&self) -> Result<Txn> {
        Ok(self.graph.start_txn().await?)
    }

    /// Run a single auto-committed statement.
    pub async fn run(&self, q: Query) -> Result<()> {
        self.graph.run(q).await?;
        Ok(())
    }

    /// Underlying driver handle, for read queries and external engines.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}
