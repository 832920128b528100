//! The `s3_cluster` table function.
//!
//! On the initiator it lists keys, registers them and fans the rewritten
//! query out to every replica. On a worker (where the URL argument carries
//! the initiator's identity hash) it pulls keys from the initiator and reads
//! them.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use async_trait::async_trait;
use datafusion::catalog::{Session, TableFunctionImpl};
use datafusion::common::{Result as DFResult, ScalarValue};
use datafusion::datasource::{TableProvider, TableType};
use datafusion::logical_expr::Expr;
use datafusion::physical_plan::ExecutionPlan;

use crate::error::{ClusterError, Result};
use crate::fan_out::FanOutExec;
use crate::node::QueryScope;
use crate::protocol::WorkerTicket;
use crate::pull_channel::FlightTaskPuller;
use crate::reader::{self, DataFormat, SourceDescriptor};
use crate::rewrite::{self, TableFunctionKey, TABLE_FUNCTION_NAME};
use crate::s3_uri::AuthContext;
use crate::topology;
use crate::worker_exec::WorkerExec;

/// Arguments of one `s3_cluster(...)` invocation.
#[derive(Clone, PartialEq, Eq)]
pub struct S3ClusterArgs {
    pub cluster: String,
    /// Object URL on the initiator, the initiator's identity hash on workers.
    pub url: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub format: String,
    pub structure: String,
    pub compression: String,
}

impl fmt::Debug for S3ClusterArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3ClusterArgs")
            .field("cluster", &self.cluster)
            .field("url", &self.url)
            .field("format", &self.format)
            .field("structure", &self.structure)
            .field("compression", &self.compression)
            .finish()
    }
}

impl S3ClusterArgs {
    /// `(cluster, url, [access_key_id, secret_access_key,] format, structure [, compression])`
    pub fn parse(args: &[String]) -> Result<Self> {
        let (keys, rest): ((&str, &str), &[String]) = match args.len() {
            4 | 5 => (("", ""), &args[2..]),
            6 | 7 => ((args[2].as_str(), args[3].as_str()), &args[4..]),
            n => {
                return Err(ClusterError::Arguments(format!(
                    "{TABLE_FUNCTION_NAME} expects 4 to 7 arguments \
                     (cluster, url, [access_key_id, secret_access_key,] format, structure [, compression]), got {n}"
                )))
            }
        };

        Ok(Self {
            cluster: args[0].clone(),
            url: args[1].clone(),
            access_key_id: keys.0.to_string(),
            secret_access_key: keys.1.to_string(),
            format: rest[0].clone(),
            structure: rest[1].clone(),
            compression: rest.get(2).cloned().unwrap_or_else(|| "auto".to_string()),
        })
    }
}

/// Extract string literal arguments; anything else is rejected.
fn literal_args(args: &[Expr]) -> Result<Vec<String>> {
    args.iter()
        .enumerate()
        .map(|(i, expr)| match expr {
            Expr::Literal(ScalarValue::Utf8(Some(s)), _)
            | Expr::Literal(ScalarValue::LargeUtf8(Some(s)), _)
            | Expr::Literal(ScalarValue::Utf8View(Some(s)), _) => Ok(s.clone()),
            other => Err(ClusterError::Arguments(format!(
                "argument {} of {TABLE_FUNCTION_NAME} must be a string literal, got {other}",
                i + 1
            ))),
        })
        .collect()
}

/// DataFusion table function bound to one query scope.
#[derive(Debug)]
pub struct S3ClusterFunction {
    scope: QueryScope,
}

impl S3ClusterFunction {
    pub fn new(scope: QueryScope) -> Self {
        Self { scope }
    }
}

impl TableFunctionImpl for S3ClusterFunction {
    fn call(&self, args: &[Expr]) -> DFResult<Arc<dyn TableProvider>> {
        let literals = literal_args(args)?;
        let key = TableFunctionKey::new(TABLE_FUNCTION_NAME, &literals);
        let args = S3ClusterArgs::parse(&literals)?;

        let format = DataFormat::parse(&args.format)?;
        let column_schema = reader::parse_structure(&args.structure)?;

        Ok(Arc::new(S3ClusterTable {
            scope: self.scope.clone(),
            key,
            table_schema: reader::table_schema(&column_schema),
            column_schema,
            format,
            args,
        }))
    }
}

/// Provider for one `s3_cluster(...)` invocation.
#[derive(Debug)]
pub struct S3ClusterTable {
    scope: QueryScope,
    key: TableFunctionKey,
    args: S3ClusterArgs,
    format: DataFormat,
    column_schema: SchemaRef,
    table_schema: SchemaRef,
}

impl S3ClusterTable {
    fn auth_context(&self) -> AuthContext {
        AuthContext {
            access_key_id: self.args.access_key_id.clone(),
            secret_access_key: self.args.secret_access_key.clone(),
            max_connections: self.scope.node().settings().s3_max_connections,
        }
    }

    async fn plan_initiator(&self, descriptor: SourceDescriptor) -> Result<Arc<dyn ExecutionPlan>> {
        let node = self.scope.node();
        let cluster = &self.args.cluster;

        // Fail before anything touches the network.
        let self_hash = node.self_hash(cluster)?;
        let replicas = node.topology().require(cluster)?.to_vec();

        let statement = self.scope.statement().ok_or_else(|| {
            ClusterError::Rewrite("the initiator has no parsed query to rewrite".to_string())
        })?;
        let columns: Vec<String> = descriptor
            .output_schema
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        let worker_query = rewrite::worker_scan_query(statement, self.key, &columns, &self_hash)?;

        let keys = node.lister().list(&self.args.url, &self.auth_context()).await?;
        crate::cluster_info!(
            "initiator",
            "Query {}: {} key(s) for {} across {} replica(s) of cluster '{}'",
            self.scope.initial_query_id(),
            keys.len(),
            self.args.url,
            replicas.len(),
            cluster
        );
        let registration = node.registry().register(self.scope.initial_query_id(), keys)?;

        let ticket = WorkerTicket {
            query: worker_query,
            initial_query_id: self.scope.initial_query_id().to_string(),
        };
        Ok(Arc::new(FanOutExec::new(
            descriptor.output_schema.clone(),
            replicas,
            ticket,
            node.settings().fan_out_connect_timeout,
            registration,
        )))
    }

    fn plan_worker(&self, descriptor: SourceDescriptor) -> Result<Arc<dyn ExecutionPlan>> {
        let node = self.scope.node();
        let initiator =
            topology::resolve_initiator(node.topology(), &self.args.cluster, &self.args.url)?.clone();
        let tasks = Arc::new(FlightTaskPuller::new(&initiator, node.settings()));

        Ok(Arc::new(WorkerExec::new(
            self.scope.initial_query_id(),
            initiator,
            tasks,
            node.readers().clone(),
            self.auth_context(),
            Arc::new(descriptor),
        )))
    }
}

#[async_trait]
impl TableProvider for S3ClusterTable {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        self.table_schema.clone()
    }

    fn table_type(&self) -> TableType {
        TableType::Base
    }

    async fn scan(
        &self,
        state: &dyn Session,
        projection: Option<&Vec<usize>>,
        _filters: &[Expr],
        _limit: Option<usize>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        let descriptor = SourceDescriptor::new(
            self.column_schema.clone(),
            projection,
            self.format,
            &self.args.compression,
            state.config_options().execution.batch_size,
        )?;

        let plan = if self.scope.is_initial() {
            self.plan_initiator(descriptor).await?
        } else {
            self.plan_worker(descriptor)?
        };
        Ok(plan)
    }
}
