//! Pull-driven scan source run by every worker.
//!
//! The source owns at most one per-object reader at a time. When that reader
//! is exhausted it pulls the next key from the initiator, builds a fresh
//! client authorization and reader for it, and keeps producing rows until the
//! initiator reports that no work is left.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use arrow::array::RecordBatch;
use datafusion::error::DataFusionError;
use datafusion::execution::SendableRecordBatchStream;
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{ClusterError, Result};
use crate::pull_channel::NextTaskSource;
use crate::reader::{ObjectReader, ObjectReaderFactory, SourceDescriptor};
use crate::s3_uri::{AuthContext, ClientAuth, S3Uri};
use crate::topology::ClusterAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// No key pulled yet.
    Idle,
    /// A reader is open.
    Active,
    /// The initiator reported no more work; the next request closes.
    Exhausted,
    Closed,
}

/// The object currently being read. Dropping it releases the reader and the
/// client authorization it was built with.
struct ActiveObject {
    uri: S3Uri,
    reader: Box<dyn ObjectReader>,
}

pub struct WorkerScanSource {
    query_id: String,
    initiator: ClusterAddress,
    tasks: Arc<dyn NextTaskSource>,
    readers: Arc<dyn ObjectReaderFactory>,
    auth: AuthContext,
    descriptor: Arc<SourceDescriptor>,
    current: Option<ActiveObject>,
    state: ScanState,
    cancel: CancellationToken,
}

impl fmt::Debug for WorkerScanSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerScanSource")
            .field("query_id", &self.query_id)
            .field("initiator", &self.initiator)
            .field("state", &self.state)
            .field("current", &self.current.as_ref().map(|a| a.uri.to_string()))
            .finish()
    }
}

impl WorkerScanSource {
    pub fn new(
        query_id: &str,
        initiator: ClusterAddress,
        tasks: Arc<dyn NextTaskSource>,
        readers: Arc<dyn ObjectReaderFactory>,
        auth: AuthContext,
        descriptor: Arc<SourceDescriptor>,
    ) -> Self {
        Self {
            query_id: query_id.to_string(),
            initiator,
            tasks,
            readers,
            auth,
            descriptor,
            current: None,
            state: ScanState::Idle,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Token that abandons an in-flight pull when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Produce the next output batch, or `None` once every key is drained.
    ///
    /// Any error closes the source.
    pub async fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        match self.advance().await {
            Ok(batch) => Ok(batch),
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    pub fn close(&mut self) {
        self.current = None;
        self.state = ScanState::Closed;
    }

    async fn advance(&mut self) -> Result<Option<RecordBatch>> {
        loop {
            match self.state {
                ScanState::Closed => return Ok(None),
                ScanState::Exhausted => {
                    self.state = ScanState::Closed;
                    return Ok(None);
                }
                ScanState::Idle => {
                    if !self.pull_and_open().await? {
                        return Ok(None);
                    }
                }
                ScanState::Active => {
                    let Some(active) = self.current.as_mut() else {
                        // No reader although active: pull a fresh key.
                        if !self.pull_and_open().await? {
                            return Ok(None);
                        }
                        continue;
                    };

                    match active.reader.next_batch().await? {
                        Some(batch) if batch.num_rows() == 0 => continue,
                        Some(batch) => {
                            return self.descriptor.project(&batch, &active.uri).map(Some);
                        }
                        None => {
                            crate::cluster_trace!("worker-scan", "query {}: finished {}", self.query_id, active.uri);
                            if !self.pull_and_open().await? {
                                return Ok(None);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Pull a key and install its reader. Returns `false` (and moves to
    /// `Exhausted`, releasing the reader) on an empty reply.
    async fn pull_and_open(&mut self) -> Result<bool> {
        match self.pull().await? {
            Some(key) => {
                self.open(&key).await?;
                self.state = ScanState::Active;
                Ok(true)
            }
            None => {
                self.current = None;
                self.state = ScanState::Exhausted;
                crate::cluster_debug!("worker-scan", "query {}: no more work from {}", self.query_id, self.initiator.host());
                Ok(false)
            }
        }
    }

    /// One pull, abandoned as soon as the source is cancelled. The future
    /// owns what it needs so the source is not borrowed across the await.
    fn pull(&self) -> impl Future<Output = Result<Option<String>>> + Send + 'static {
        let tasks = self.tasks.clone();
        let cancel = self.cancel.clone();
        let query_id = self.query_id.clone();

        async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ClusterError::Cancelled),
                reply = tasks.next_task(&query_id) => {
                    if cancel.is_cancelled() {
                        crate::cluster_debug!("worker-scan", "query {query_id}: discarding pull reply received after cancellation");
                        return Err(ClusterError::Cancelled);
                    }
                    reply
                }
            }
        }
    }

    async fn open(&mut self, key: &str) -> Result<()> {
        let auth = ClientAuth::for_key(&self.auth, key)?;
        let uri = auth.uri.clone();
        let reader = self.readers.open(auth, &self.descriptor).await?;
        crate::cluster_trace!("worker-scan", "query {}: reading {}", self.query_id, uri);

        // Replacing the slot drops the previous reader.
        self.current = Some(ActiveObject { uri, reader });
        Ok(())
    }

    /// Turn the source into a DataFusion stream. Dropping the stream cancels
    /// any in-flight pull.
    pub fn into_stream(self) -> SendableRecordBatchStream {
        let schema = self.descriptor.output_schema.clone();
        let guard = self.cancel.clone().drop_guard();

        let batches = futures::stream::try_unfold((self, guard), |(mut source, guard)| async move {
            let next = source.next_batch().await?;
            Ok::<_, ClusterError>(next.map(|batch| (batch, (source, guard))))
        })
        .map_err(DataFusionError::from);

        Box::pin(RecordBatchStreamAdapter::new(schema, batches))
    }
}
