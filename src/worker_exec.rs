//! Execution plan for the worker side of an `s3_cluster` scan.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use datafusion::common::Result as DFResult;
use datafusion::error::DataFusionError;
use datafusion::execution::{SendableRecordBatchStream, TaskContext};
use datafusion::physical_expr::EquivalenceProperties;
use datafusion::physical_plan::execution_plan::{Boundedness, EmissionType};
use datafusion::physical_plan::{
    DisplayAs, DisplayFormatType, ExecutionPlan, Partitioning, PlanProperties,
};

use crate::pull_channel::NextTaskSource;
use crate::reader::{ObjectReaderFactory, SourceDescriptor};
use crate::s3_uri::AuthContext;
use crate::topology::ClusterAddress;
use crate::worker_source::WorkerScanSource;

/// Single-partition plan that drains keys pulled from the initiator.
pub struct WorkerExec {
    query_id: String,
    initiator: ClusterAddress,
    tasks: Arc<dyn NextTaskSource>,
    readers: Arc<dyn ObjectReaderFactory>,
    auth: AuthContext,
    descriptor: Arc<SourceDescriptor>,
    properties: PlanProperties,
}

impl WorkerExec {
    pub fn new(
        query_id: &str,
        initiator: ClusterAddress,
        tasks: Arc<dyn NextTaskSource>,
        readers: Arc<dyn ObjectReaderFactory>,
        auth: AuthContext,
        descriptor: Arc<SourceDescriptor>,
    ) -> Self {
        let properties = PlanProperties::new(
            EquivalenceProperties::new(descriptor.output_schema.clone()),
            Partitioning::UnknownPartitioning(1),
            EmissionType::Incremental,
            Boundedness::Bounded,
        );

        Self {
            query_id: query_id.to_string(),
            initiator,
            tasks,
            readers,
            auth,
            descriptor,
            properties,
        }
    }

    pub fn initiator(&self) -> &ClusterAddress {
        &self.initiator
    }
}

impl fmt::Debug for WorkerExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerExec")
            .field("query_id", &self.query_id)
            .field("initiator", &self.initiator)
            .finish()
    }
}

impl DisplayAs for WorkerExec {
    fn fmt_as(&self, _t: DisplayFormatType, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "WorkerExec: query={}, initiator={}:{}",
            self.query_id,
            self.initiator.host(),
            self.initiator.port(),
        )
    }
}

impl ExecutionPlan for WorkerExec {
    fn name(&self) -> &str {
        "WorkerExec"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        self.descriptor.output_schema.clone()
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
        if partition != 0 {
            return Err(DataFusionError::Internal(format!(
                "Partition {partition} out of range (0..1)"
            )));
        }

        crate::cluster_debug!(
            "worker-exec",
            "Starting pull-driven scan for query {} from initiator {}",
            self.query_id,
            self.initiator.flight_endpoint()
        );

        let source = WorkerScanSource::new(
            &self.query_id,
            self.initiator.clone(),
            self.tasks.clone(),
            self.readers.clone(),
            self.auth.clone(),
            self.descriptor.clone(),
        );
        Ok(source.into_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::reader::{parse_structure, DataFormat, MemoryObjectStore};
    use async_trait::async_trait;
    use datafusion::physical_plan::collect;
    use std::sync::Mutex;

    struct FixedKeys(Mutex<Vec<String>>);

    #[async_trait]
    impl NextTaskSource for FixedKeys {
        async fn next_task(&self, _query_id: &str) -> Result<Option<String>> {
            Ok(self.0.lock().unwrap().pop())
        }
    }

    fn exec(keys: &[&str], store: &MemoryObjectStore) -> WorkerExec {
        let schema = parse_structure("id Int64").unwrap();
        let descriptor =
            SourceDescriptor::new(schema, Some(&vec![0]), DataFormat::Csv { with_names: false }, "auto", 8)
                .unwrap();
        WorkerExec::new(
            "q",
            ClusterAddress::new("10.0.0.1", 9100, "default", "", "lake", "", false),
            Arc::new(FixedKeys(Mutex::new(keys.iter().map(|k| k.to_string()).collect()))),
            Arc::new(store.clone()),
            AuthContext::default(),
            Arc::new(descriptor),
        )
    }

    #[test]
    fn single_partition_with_projected_schema() {
        let exec = exec(&[], &MemoryObjectStore::new());
        assert_eq!(exec.properties().output_partitioning().partition_count(), 1);
        assert_eq!(exec.schema().fields().len(), 1);
        assert!(exec.children().is_empty());
    }

    #[test]
    fn out_of_range_partition_returns_error() {
        let exec = exec(&[], &MemoryObjectStore::new());
        let err = exec.execute(1, Arc::new(TaskContext::default())).err().unwrap();
        assert!(err.to_string().contains("Partition 1 out of range"), "{err}");
    }

    #[tokio::test]
    async fn collects_rows_from_every_pulled_key() {
        let store = MemoryObjectStore::new();
        store.put("s3://lake/a.csv", "1\n2\n").unwrap();
        store.put("s3://lake/b.csv", "3\n").unwrap();

        let plan: Arc<dyn ExecutionPlan> = Arc::new(exec(&["s3://lake/a.csv", "s3://lake/b.csv"], &store));
        let batches = collect(plan, Arc::new(TaskContext::default())).await.unwrap();
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 3);
    }
}
