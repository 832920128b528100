//! Initiator fan-out: one Flight stream per cluster replica, exposed as the
//! partitions of a single execution plan.

use std::any::Any;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use arrow::array::{RecordBatch, RecordBatchOptions};
use arrow::datatypes::SchemaRef;
use datafusion::common::Result as DFResult;
use datafusion::error::DataFusionError;
use datafusion::execution::{SendableRecordBatchStream, TaskContext};
use datafusion::physical_expr::EquivalenceProperties;
use datafusion::physical_plan::execution_plan::{Boundedness, EmissionType};
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use datafusion::physical_plan::{
    DisplayAs, DisplayFormatType, ExecutionPlan, Partitioning, PlanProperties,
};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};

use crate::error::{ClusterError, Result};
use crate::flight_client::FlightClient;
use crate::protocol::WorkerTicket;
use crate::task_registry::TaskRegistration;
use crate::topology::ClusterAddress;

/// ExecutionPlan that submits the worker query to every replica in parallel
/// via Arrow Flight. Partition `i` streams the rows of replica `i`.
///
/// The plan and each of its streams keep the query's key sequence registered;
/// it is deregistered once all of them are dropped.
pub struct FanOutExec {
    schema: SchemaRef,
    replicas: Vec<ClusterAddress>,
    ticket: WorkerTicket,
    connect_timeout: Duration,
    registration: Arc<TaskRegistration>,
    properties: PlanProperties,
}

impl FanOutExec {
    pub fn new(
        schema: SchemaRef,
        replicas: Vec<ClusterAddress>,
        ticket: WorkerTicket,
        connect_timeout: Duration,
        registration: TaskRegistration,
    ) -> Self {
        let properties = PlanProperties::new(
            EquivalenceProperties::new(schema.clone()),
            Partitioning::UnknownPartitioning(replicas.len()),
            EmissionType::Incremental,
            Boundedness::Bounded,
        );

        Self {
            schema,
            replicas,
            ticket,
            connect_timeout,
            registration: Arc::new(registration),
            properties,
        }
    }

    pub fn ticket(&self) -> &WorkerTicket {
        &self.ticket
    }

    pub fn replicas(&self) -> &[ClusterAddress] {
        &self.replicas
    }
}

impl fmt::Debug for FanOutExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanOutExec")
            .field("query_id", &self.ticket.initial_query_id)
            .field("replicas", &self.replicas.len())
            .field("query", &self.ticket.query)
            .finish()
    }
}

impl DisplayAs for FanOutExec {
    fn fmt_as(&self, _t: DisplayFormatType, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "FanOutExec: query={}, replicas={}",
            self.ticket.initial_query_id,
            self.replicas.len(),
        )
    }
}

/// Fit a worker batch to the plan schema. An empty schema keeps only the row
/// count (the worker query selected `1 AS _row`).
fn conform_batch(schema: &SchemaRef, batch: RecordBatch) -> Result<RecordBatch> {
    if schema.fields().is_empty() {
        return Ok(RecordBatch::try_new_with_options(
            schema.clone(),
            vec![],
            &RecordBatchOptions::new().with_row_count(Some(batch.num_rows())),
        )?);
    }
    Ok(RecordBatch::try_new(schema.clone(), batch.columns().to_vec())?)
}

/// Replica stream that keeps the query's key sequence registered while alive.
struct RegisteredStream {
    inner: BoxStream<'static, DFResult<RecordBatch>>,
    _registration: Arc<TaskRegistration>,
}

impl Stream for RegisteredStream {
    type Item = DFResult<RecordBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl ExecutionPlan for FanOutExec {
    fn name(&self) -> &str {
        "FanOutExec"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn properties(&self) -> &PlanProperties {
        &self.properties
    }

    fn children(&self) -> Vec<&Arc<dyn ExecutionPlan>> {
        vec![]
    }

    fn with_new_children(
        self: Arc<Self>,
        _children: Vec<Arc<dyn ExecutionPlan>>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        Ok(self)
    }

    fn execute(
        &self,
        partition: usize,
        _context: Arc<TaskContext>,
    ) -> DFResult<SendableRecordBatchStream> {
        let replica = self.replicas.get(partition).cloned().ok_or_else(|| {
            DataFusionError::Internal(format!(
                "Partition {} out of range (0..{})",
                partition,
                self.replicas.len()
            ))
        })?;

        let ticket = self.ticket.clone();
        let connect_timeout = self.connect_timeout;
        let endpoint = replica.flight_endpoint();

        // Connect lazily so that opening the stream never blocks.
        let batches = futures::stream::once(async move {
            crate::cluster_debug!(
                "fan-out",
                "Submitting query {} to replica {} [partition {}]",
                ticket.initial_query_id,
                endpoint,
                partition
            );
            let mut client =
                FlightClient::connect(&endpoint, replica.cluster_secret(), connect_timeout).await?;
            let stream = client.execute_query(&ticket).await?;
            Ok::<_, ClusterError>(stream.map_err(move |e| {
                ClusterError::Transport(format!("stream from replica {endpoint} failed: {e}"))
            }))
        })
        .try_flatten();

        let schema = self.schema.clone();
        let conformed = batches
            .and_then(move |batch| futures::future::ready(conform_batch(&schema, batch)))
            .map_err(DataFusionError::from)
            .boxed();

        Ok(Box::pin(RecordBatchStreamAdapter::new(
            self.schema.clone(),
            RegisteredStream {
                inner: conformed,
                _registration: self.registration.clone(),
            },
        )))
    }
}
