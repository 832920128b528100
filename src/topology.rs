//! Cluster topology and address identity resolution.
//!
//! Nodes never exchange `host:port` to name each other: hosts may not be
//! mutually routable and ports may be remapped. Instead every address carries
//! an identity hash derived from its topology entry, which every node computes
//! the same way from the same configuration.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;

use siphasher::sip::SipHasher13;

use crate::error::{ClusterError, Result};

/// One replica of a cluster as seen from the local node.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterAddress {
    host: String,
    port: u16,
    user: String,
    password: String,
    cluster: String,
    cluster_secret: String,
    identity_hash: String,
    is_local: bool,
}

impl ClusterAddress {
    pub fn new(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        cluster: &str,
        cluster_secret: &str,
        is_local: bool,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            password: password.to_string(),
            cluster: cluster.to_string(),
            cluster_secret: cluster_secret.to_string(),
            identity_hash: identity_hash(host, port, user, password),
            is_local,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn cluster_secret(&self) -> &str {
        &self.cluster_secret
    }

    pub fn identity_hash(&self) -> &str {
        &self.identity_hash
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    /// gRPC endpoint of the node's Flight service.
    pub fn flight_endpoint(&self) -> String {
        if self.host.contains(':') {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

// Password is left out on purpose.
impl fmt::Debug for ClusterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterAddress")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("cluster", &self.cluster)
            .field("identity_hash", &self.identity_hash)
            .field("is_local", &self.is_local)
            .finish()
    }
}

/// Compute the identity hash of a topology entry.
///
/// SipHash-1-3 with zero keys over host, port, user and password, each
/// followed by a `0xff` separator, rendered in decimal. Every node computes
/// the same value regardless of toolchain. The local flag is not part of the
/// hash: the same entry is local on one node and remote on all others.
pub fn identity_hash(host: &str, port: u16, user: &str, password: &str) -> String {
    let port = port.to_string();
    let mut hasher = SipHasher13::new();
    for part in [host, port.as_str(), user, password] {
        hasher.write(part.as_bytes());
        hasher.write(&[0xff]);
    }
    hasher.finish().to_string()
}

/// Immutable snapshot of every configured cluster, keyed by cluster name.
///
/// Each shard has exactly one replica, so a cluster is a flat address list.
#[derive(Debug, Clone, Default)]
pub struct ClusterTopology {
    clusters: HashMap<String, Vec<ClusterAddress>>,
}

impl ClusterTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cluster: &str, addresses: Vec<ClusterAddress>) {
        self.clusters.insert(cluster.to_string(), addresses);
    }

    pub fn cluster(&self, name: &str) -> Option<&[ClusterAddress]> {
        self.clusters.get(name).map(|v| v.as_slice())
    }

    /// Like [`ClusterTopology::cluster`] but an unknown name is an error.
    pub fn require(&self, name: &str) -> Result<&[ClusterAddress]> {
        self.cluster(name)
            .ok_or_else(|| ClusterError::Config(format!("cluster '{name}' is not configured")))
    }

    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Find the identity hash of the local node inside `cluster`.
///
/// The local node is the first entry that is local and listens on
/// `local_port`. Absence means the topology is misconfigured; the query must
/// fail before anything goes over the network.
pub fn resolve_self_hash(topology: &ClusterTopology, cluster: &str, local_port: u16) -> Result<String> {
    topology
        .require(cluster)?
        .iter()
        .find(|a| a.is_local() && a.port() == local_port)
        .map(|a| a.identity_hash().to_string())
        .ok_or_else(|| ClusterError::SelfNotFound {
            cluster: cluster.to_string(),
            port: local_port,
        })
}

/// Find the address whose identity hash is `received_hash`.
///
/// Exactly one address must match.
pub fn resolve_initiator<'a>(
    topology: &'a ClusterTopology,
    cluster: &str,
    received_hash: &str,
) -> Result<&'a ClusterAddress> {
    let matches: Vec<&ClusterAddress> = topology
        .require(cluster)?
        .iter()
        .filter(|a| a.identity_hash() == received_hash)
        .collect();

    match matches.as_slice() {
        [single] => Ok(single),
        [] => Err(ClusterError::InitiatorNotFound {
            cluster: cluster.to_string(),
            hash: received_hash.to_string(),
        }),
        many => Err(ClusterError::AmbiguousInitiator {
            cluster: cluster.to_string(),
            hash: received_hash.to_string(),
            count: many.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(host: &str, port: u16, local: bool) -> ClusterAddress {
        ClusterAddress::new(host, port, "default", "", "lake", "", local)
    }

    fn topology(addresses: Vec<ClusterAddress>) -> ClusterTopology {
        let mut t = ClusterTopology::new();
        t.insert("lake", addresses);
        t
    }

    #[test]
    fn identity_hash_is_stable_and_ignores_locality() {
        let a = addr("10.0.0.1", 9000, true);
        let b = addr("10.0.0.1", 9000, false);
        assert_eq!(a.identity_hash(), b.identity_hash());
        assert_eq!(a.identity_hash(), identity_hash("10.0.0.1", 9000, "default", ""));
        assert!(a.identity_hash().chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn identity_hash_values_are_pinned() {
        assert_eq!(identity_hash("10.0.0.1", 9000, "default", ""), "12697492880976234619");
        assert_eq!(identity_hash("127.0.0.1", 9100, "default", ""), "10052602422485075622");
    }

    #[test]
    fn identity_hash_differs_per_entry() {
        assert_ne!(
            addr("10.0.0.1", 9000, false).identity_hash(),
            addr("10.0.0.1", 9001, false).identity_hash()
        );
        assert_ne!(
            identity_hash("h", 1, "u", "a"),
            identity_hash("h", 1, "u", "b")
        );
    }

    #[test]
    fn self_hash_requires_local_and_matching_port() {
        let t = topology(vec![
            addr("10.0.0.2", 9000, false),
            addr("127.0.0.1", 9001, true),
            addr("127.0.0.1", 9002, true),
        ]);
        let hash = resolve_self_hash(&t, "lake", 9002).unwrap();
        assert_eq!(hash, addr("127.0.0.1", 9002, true).identity_hash());
    }

    #[test]
    fn self_hash_not_found_is_an_error() {
        let t = topology(vec![addr("10.0.0.2", 9000, false)]);
        let err = resolve_self_hash(&t, "lake", 9000).unwrap_err();
        assert!(matches!(err, ClusterError::SelfNotFound { port: 9000, .. }));
    }

    #[test]
    fn unknown_cluster_is_a_config_error() {
        let t = topology(vec![]);
        assert!(matches!(
            resolve_self_hash(&t, "missing", 1),
            Err(ClusterError::Config(_))
        ));
    }

    #[test]
    fn initiator_resolves_unique_hash() {
        let target = addr("10.0.0.3", 9000, false);
        let t = topology(vec![addr("10.0.0.2", 9000, false), target.clone()]);
        let found = resolve_initiator(&t, "lake", target.identity_hash()).unwrap();
        assert_eq!(found, &target);
    }

    #[test]
    fn initiator_resolves_literal_hash() {
        let mut h123 = addr("10.0.0.4", 9000, false);
        h123.identity_hash = "H123".to_string();
        let t = topology(vec![addr("10.0.0.2", 9000, false), h123.clone()]);
        assert_eq!(resolve_initiator(&t, "lake", "H123").unwrap().host(), "10.0.0.4");

        let t = topology(vec![h123.clone(), h123]);
        assert!(resolve_initiator(&t, "lake", "H123").is_err());
    }

    #[test]
    fn initiator_missing_or_ambiguous_fails() {
        let t = topology(vec![addr("10.0.0.2", 9000, false)]);
        assert!(matches!(
            resolve_initiator(&t, "lake", "H123"),
            Err(ClusterError::InitiatorNotFound { .. })
        ));

        let dup = addr("10.0.0.2", 9000, false);
        let t = topology(vec![dup.clone(), dup.clone()]);
        assert!(matches!(
            resolve_initiator(&t, "lake", dup.identity_hash()),
            Err(ClusterError::AmbiguousInitiator { count: 2, .. })
        ));
    }

    #[test]
    fn debug_output_hides_password() {
        let a = ClusterAddress::new("h", 1, "u", "hunter2", "c", "", false);
        assert!(!format!("{a:?}").contains("hunter2"));
    }

    #[test]
    fn flight_endpoint_brackets_ipv6() {
        assert_eq!(addr("10.0.0.1", 9000, false).flight_endpoint(), "http://10.0.0.1:9000");
        assert_eq!(addr("::1", 9000, true).flight_endpoint(), "http://[::1]:9000");
    }
}
