//! Worker-side task pull channel.
//!
//! A worker reaches the initiator over a small pool of persistent Flight
//! connections. Each pull borrows one connection for a single `next_task`
//! request/reply exchange and hands it back afterwards; a connection that saw
//! a transport failure is discarded instead.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::config::ScanSettings;
use crate::error::{ClusterError, Result};
use crate::flight_client::FlightClient;
use crate::protocol::NextTaskRequest;
use crate::topology::ClusterAddress;

/// Source of task keys for one distributed query.
#[async_trait]
pub trait NextTaskSource: Send + Sync {
    /// The next key, or `None` once the initiator has no more work.
    async fn next_task(&self, query_id: &str) -> Result<Option<String>>;
}

/// Bounded pool of Flight connections to one initiator.
pub struct PullConnectionPool {
    endpoint: String,
    secret: String,
    settings: ScanSettings,
    permits: Semaphore,
    idle: Mutex<Vec<FlightClient>>,
}

impl fmt::Debug for PullConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullConnectionPool")
            .field("endpoint", &self.endpoint)
            .field("size", &self.settings.pull_pool_size)
            .finish()
    }
}

impl PullConnectionPool {
    pub fn new(initiator: &ClusterAddress, settings: &ScanSettings) -> Self {
        Self {
            endpoint: initiator.flight_endpoint(),
            secret: initiator.cluster_secret().to_string(),
            settings: settings.clone(),
            permits: Semaphore::new(settings.pull_pool_size.max(1)),
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn acquire(&self) -> Result<PooledClient<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ClusterError::Transport(format!("connection pool for {} is closed", self.endpoint)))?;

        let reused = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let client = match reused {
            Some(client) => client,
            None => {
                FlightClient::connect(&self.endpoint, &self.secret, self.settings.pull_connect_timeout)
                    .await?
            }
        };

        Ok(PooledClient {
            pool: self,
            client: Some(client),
            _permit: permit,
        })
    }

    fn release(&self, client: FlightClient) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(client);
    }

    /// Connections currently parked in the pool.
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A connection borrowed from the pool, returned on drop unless discarded.
struct PooledClient<'a> {
    pool: &'a PullConnectionPool,
    client: Option<FlightClient>,
    _permit: SemaphorePermit<'a>,
}

impl PooledClient<'_> {
    fn discard(&mut self) {
        self.client = None;
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(client);
        }
    }
}

/// Pulls keys from the initiator over Flight `DoAction("next_task")`.
#[derive(Debug)]
pub struct FlightTaskPuller {
    pool: PullConnectionPool,
}

impl FlightTaskPuller {
    pub fn new(initiator: &ClusterAddress, settings: &ScanSettings) -> Self {
        Self {
            pool: PullConnectionPool::new(initiator, settings),
        }
    }

    pub fn pool(&self) -> &PullConnectionPool {
        &self.pool
    }
}

#[async_trait]
impl NextTaskSource for FlightTaskPuller {
    async fn next_task(&self, query_id: &str) -> Result<Option<String>> {
        let mut pooled = match self.pool.acquire().await {
            Ok(pooled) => pooled,
            Err(e) => {
                crate::cluster_warn!("pull", "query {query_id}: {e}");
                return Err(e);
            }
        };

        let request = NextTaskRequest {
            query_id: query_id.to_string(),
        };
        let settings = &self.pool.settings;

        let outcome = match pooled.client.as_mut() {
            Some(client) => {
                client
                    .next_task(&request, settings.pull_send_timeout, settings.pull_receive_timeout)
                    .await
            }
            None => Err(ClusterError::Transport("pooled connection is missing".to_string())),
        };

        match outcome {
            Ok(reply) => {
                let key = reply.into_key();
                match &key {
                    Some(k) => crate::cluster_trace!("pull", "query {query_id}: received {k}"),
                    None => crate::cluster_debug!("pull", "query {query_id}: initiator has no more work"),
                }
                Ok(key)
            }
            Err(e) => {
                pooled.discard();
                crate::cluster_warn!("pull", "query {query_id}: pull from {} failed: {e}", self.pool.endpoint);
                Err(e)
            }
        }
    }
}
