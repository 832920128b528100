//! Distributed S3 scans over a cluster of query nodes.
//!
//! A query that calls `s3_cluster(cluster, url, ...)` lists the matching
//! object keys on the node that received it (the initiator) and sends a
//! rewritten query to every replica of the cluster. Each replica pulls keys
//! one at a time from the initiator over Arrow Flight until none are left,
//! so every key is read exactly once no matter how fast each worker is.

pub mod logging;
pub mod error;
pub mod config;
pub mod topology;
pub mod rewrite;
pub mod protocol;
pub mod task_registry;
pub mod s3_uri;
pub mod reader;
pub mod flight_client;
pub mod pull_channel;
pub mod worker_source;
pub mod worker_exec;
pub mod fan_out;
pub mod table_function;
pub mod node;
pub mod flight_server;
pub mod server_registry;

pub use config::{NodeConfig, ScanSettings};
pub use error::{ClusterError, Result};
pub use flight_server::{serve, start_flight_server, stop_flight_server, ScanFlightService};
pub use node::{ClusterNode, QueryScope};
pub use reader::{KeyLister, MemoryObjectStore, ObjectReader, ObjectReaderFactory};
pub use task_registry::{TaskRegistration, TaskRegistry};
pub use topology::{ClusterAddress, ClusterTopology};
