//! A cluster node: topology, key registry and storage collaborators, plus the
//! entry points that run queries as initiator or as worker.

use std::fmt;
use std::sync::Arc;

use arrow::array::RecordBatch;
use datafusion::execution::SendableRecordBatchStream;
use datafusion::prelude::SessionContext;
use sqlparser::ast::Statement;

use crate::config::{NodeConfig, ScanSettings};
use crate::error::Result;
use crate::reader::{KeyLister, ObjectReaderFactory};
use crate::rewrite::{self, TABLE_FUNCTION_NAME};
use crate::table_function::S3ClusterFunction;
use crate::task_registry::TaskRegistry;
use crate::topology::{self, ClusterTopology};

struct NodeInner {
    topology: Arc<ClusterTopology>,
    local_port: u16,
    settings: ScanSettings,
    registry: TaskRegistry,
    readers: Arc<dyn ObjectReaderFactory>,
    lister: Arc<dyn KeyLister>,
}

/// Cheaply cloneable handle to one node's shared state.
#[derive(Clone)]
pub struct ClusterNode {
    inner: Arc<NodeInner>,
}

impl fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterNode")
            .field("local_port", &self.inner.local_port)
            .field("clusters", &self.inner.topology.cluster_names())
            .field("registry", &self.inner.registry)
            .finish()
    }
}

impl ClusterNode {
    pub fn new(
        topology: ClusterTopology,
        local_port: u16,
        settings: ScanSettings,
        readers: Arc<dyn ObjectReaderFactory>,
        lister: Arc<dyn KeyLister>,
    ) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                topology: Arc::new(topology),
                local_port,
                settings,
                registry: TaskRegistry::new(),
                readers,
                lister,
            }),
        }
    }

    pub fn from_config(
        config: &NodeConfig,
        readers: Arc<dyn ObjectReaderFactory>,
        lister: Arc<dyn KeyLister>,
    ) -> Self {
        Self::new(
            config.topology(),
            config.listen_port,
            config.settings(),
            readers,
            lister,
        )
    }

    pub fn topology(&self) -> &Arc<ClusterTopology> {
        &self.inner.topology
    }

    pub fn local_port(&self) -> u16 {
        self.inner.local_port
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    pub fn readers(&self) -> &Arc<dyn ObjectReaderFactory> {
        &self.inner.readers
    }

    pub fn lister(&self) -> &Arc<dyn KeyLister> {
        &self.inner.lister
    }

    /// This node's identity hash within `cluster`.
    pub fn self_hash(&self, cluster: &str) -> Result<String> {
        topology::resolve_self_hash(&self.inner.topology, cluster, self.inner.local_port)
    }

    /// Secrets of every configured cluster; requests must present one.
    pub fn accepted_secrets(&self) -> Vec<String> {
        self.inner
            .topology
            .cluster_names()
            .iter()
            .filter_map(|name| self.inner.topology.cluster(name))
            .filter_map(|addresses| addresses.first())
            .map(|a| a.cluster_secret().to_string())
            .collect()
    }

    fn session(&self, scope: QueryScope) -> SessionContext {
        let ctx = SessionContext::new();
        ctx.register_udtf(TABLE_FUNCTION_NAME, Arc::new(S3ClusterFunction::new(scope)));
        ctx
    }

    /// Run `sql` as the initiator of a new distributed query.
    pub async fn sql(&self, sql: &str) -> Result<Vec<RecordBatch>> {
        let stream = self.execute_sql(sql).await?;
        Ok(datafusion::physical_plan::common::collect(stream).await?)
    }

    /// Run `sql` as the initiator and return its result stream.
    pub async fn execute_sql(&self, sql: &str) -> Result<SendableRecordBatchStream> {
        let query_id = uuid::Uuid::new_v4().to_string();
        let statement = rewrite::parse_statement(sql)?;
        crate::cluster_info!("node", "Starting query {query_id} on port {}", self.inner.local_port);

        let scope = QueryScope::initial(&query_id, statement, self.clone());
        let df = self.session(scope).sql(sql).await?;
        Ok(df.execute_stream().await?)
    }

    /// Run a rewritten query received from the initiator of
    /// `initial_query_id`.
    pub async fn execute_worker_query(
        &self,
        sql: &str,
        initial_query_id: &str,
    ) -> Result<SendableRecordBatchStream> {
        let query_id = uuid::Uuid::new_v4().to_string();
        crate::cluster_debug!(
            "node",
            "Executing worker query {query_id} for initiator query {initial_query_id}"
        );

        let scope = QueryScope::worker(&query_id, initial_query_id, self.clone());
        let df = self.session(scope).sql(sql).await?;
        Ok(df.execute_stream().await?)
    }
}

/// Per-query context handed to the table function.
#[derive(Debug, Clone)]
pub struct QueryScope {
    query_id: String,
    initial_query_id: String,
    statement: Option<Arc<Statement>>,
    node: ClusterNode,
}

impl QueryScope {
    pub fn initial(query_id: &str, statement: Statement, node: ClusterNode) -> Self {
        Self {
            query_id: query_id.to_string(),
            initial_query_id: query_id.to_string(),
            statement: Some(Arc::new(statement)),
            node,
        }
    }

    pub fn worker(query_id: &str, initial_query_id: &str, node: ClusterNode) -> Self {
        Self {
            query_id: query_id.to_string(),
            initial_query_id: initial_query_id.to_string(),
            statement: None,
            node,
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn initial_query_id(&self) -> &str {
        &self.initial_query_id
    }

    /// The parsed original query, present on the initiator only.
    pub fn statement(&self) -> Option<&Statement> {
        self.statement.as_deref()
    }

    pub fn node(&self) -> &ClusterNode {
        &self.node
    }

    /// Whether this node received the query from a client.
    pub fn is_initial(&self) -> bool {
        self.query_id == self.initial_query_id
    }
}
