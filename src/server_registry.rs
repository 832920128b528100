use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::oneshot;

use crate::error::{ClusterError, Result};

pub type ServerThreadResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub struct ServerHandle {
    pub thread_handle: Option<JoinHandle<ServerThreadResult>>,
    pub shutdown_tx: oneshot::Sender<()>,
    pub start_time: std::time::SystemTime,
}

/// Node servers running in this process, keyed by `host:port`.
pub struct ServerRegistry {
    servers: Arc<Mutex<HashMap<String, ServerHandle>>>,
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self {
            servers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn instance() -> &'static ServerRegistry {
        static INSTANCE: std::sync::OnceLock<ServerRegistry> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(ServerRegistry::new)
    }

    fn server_key(host: &str, port: u16) -> String {
        format!("{}:{}", host, port)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ServerHandle>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically check availability and reserve a slot before spawning.
    pub fn reserve(&self, host: &str, port: u16, shutdown_tx: oneshot::Sender<()>) -> Result<()> {
        let mut servers = self.lock();
        let key = Self::server_key(host, port);

        if servers.contains_key(&key) {
            return Err(ClusterError::Config(format!(
                "server already running on {}:{}",
                host, port
            )));
        }

        servers.insert(
            key,
            ServerHandle {
                thread_handle: None,
                shutdown_tx,
                start_time: std::time::SystemTime::now(),
            },
        );
        Ok(())
    }

    /// Attach the spawned thread handle to a reserved slot.
    pub fn set_thread_handle(&self, host: &str, port: u16, handle: JoinHandle<ServerThreadResult>) {
        let mut servers = self.lock();
        if let Some(entry) = servers.get_mut(&Self::server_key(host, port)) {
            entry.thread_handle = Some(handle);
        }
    }

    /// Remove a reserved slot (e.g. when thread spawn fails).
    pub fn deregister(&self, host: &str, port: u16) {
        self.lock().remove(&Self::server_key(host, port));
    }

    pub fn stop_server(&self, host: &str, port: u16) -> Result<String> {
        let handle = self.lock().remove(&Self::server_key(host, port));

        match handle {
            Some(handle) => {
                let _ = handle.shutdown_tx.send(());
                if let Some(th) = handle.thread_handle {
                    let _ = th.join();
                }
                Ok(format!("Server {}:{} stopped", host, port))
            }
            None => Err(ClusterError::Config(format!(
                "no server running on {}:{}",
                host, port
            ))),
        }
    }

    /// `(host, port, uptime in seconds)` of every registered server.
    pub fn servers_info(&self) -> Vec<(String, u16, u64)> {
        let servers = self.lock();
        let mut info: Vec<(String, u16, u64)> = servers
            .iter()
            .filter_map(|(key, handle)| {
                let (host, port) = key.rsplit_once(':')?;
                let uptime_secs = handle
                    .start_time
                    .elapsed()
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                Some((host.to_string(), port.parse().ok()?, uptime_secs))
            })
            .collect();
        info.sort();
        info
    }
}
