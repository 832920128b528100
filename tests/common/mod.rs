#![allow(dead_code)]

use std::sync::Arc;

use s3_cluster::{
    serve, ClusterAddress, ClusterNode, ClusterTopology, MemoryObjectStore, ScanSettings,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const CLUSTER: &str = "lake";
pub const STRUCTURE: &str = "id Int64, name String";

/// Initialize logging once for the test binary.
pub fn init_test_env() {
    s3_cluster::logging::init();
}

/// Nodes serving Flight on ephemeral loopback ports, all reading one shared
/// in-memory object store.
pub struct TestCluster {
    pub nodes: Vec<ClusterNode>,
    pub store: MemoryObjectStore,
    pub secret: String,
    shutdown: CancellationToken,
    servers: Vec<JoinHandle<s3_cluster::Result<()>>>,
}

impl TestCluster {
    pub async fn start(size: usize) -> Self {
        Self::start_with_secret(size, "").await
    }

    pub async fn start_with_secret(size: usize, secret: &str) -> Self {
        init_test_env();

        let mut listeners = Vec::with_capacity(size);
        for _ in 0..size {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port"));
        }
        let ports: Vec<u16> = listeners
            .iter()
            .map(|l| l.local_addr().expect("local addr").port())
            .collect();

        let mut topology = ClusterTopology::new();
        topology.insert(
            CLUSTER,
            ports
                .iter()
                .map(|port| ClusterAddress::new("127.0.0.1", *port, "default", "", CLUSTER, secret, true))
                .collect(),
        );

        let store = MemoryObjectStore::new();
        let shutdown = CancellationToken::new();
        let mut nodes = Vec::with_capacity(size);
        let mut servers = Vec::with_capacity(size);

        for (listener, port) in listeners.into_iter().zip(ports) {
            let node = ClusterNode::new(
                topology.clone(),
                port,
                ScanSettings::default(),
                Arc::new(store.clone()),
                Arc::new(store.clone()),
            );
            let token = shutdown.clone();
            servers.push(tokio::spawn(serve(node.clone(), listener, async move {
                token.cancelled().await
            })));
            nodes.push(node);
        }

        Self {
            nodes,
            store,
            secret: secret.to_string(),
            shutdown,
            servers,
        }
    }

    pub fn initiator(&self) -> &ClusterNode {
        &self.nodes[0]
    }

    pub fn endpoint(&self, index: usize) -> String {
        format!("http://127.0.0.1:{}", self.nodes[index].local_port())
    }

    /// Store one CSV object per name under `s3://lake/data/`, each holding
    /// `rows_per_object` rows.
    pub fn put_objects(&self, names: &[&str], rows_per_object: usize) {
        for (n, name) in names.iter().enumerate() {
            let body: String = (0..rows_per_object)
                .map(|i| format!("{},{}-{}\n", n * 100 + i, name, i))
                .collect();
            self.store
                .put(&format!("s3://lake/data/{name}.csv"), body)
                .expect("put object");
        }
    }

    pub fn scan_sql(&self, columns: &str) -> String {
        format!(
            "SELECT {columns} FROM s3_cluster('{CLUSTER}', 's3://lake/data/*.csv', 'CSV', '{STRUCTURE}')"
        )
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for server in &self.servers {
            server.abort();
        }
    }
}
