//! Wire messages exchanged between nodes.
//!
//! Both the pull channel and the fan-out ride on Arrow Flight and carry JSON
//! bodies, the same convention the ticket format `{"query": ...}` uses.

use serde::{Deserialize, Serialize};
use tonic::metadata::MetadataMap;
use tonic::Status;

use crate::error::{ClusterError, Result};

/// Flight action type for a task pull.
pub const NEXT_TASK_ACTION: &str = "next_task";

/// Metadata key carrying the cluster secret on every inter-node request.
pub const CLUSTER_SECRET_HEADER: &str = "x-cluster-secret";

/// Worker → initiator: "give me the next key of this query".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextTaskRequest {
    pub query_id: String,
}

/// Initiator → worker. An empty `next_task` means there is no more work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextTaskReply {
    pub next_task: String,
}

impl NextTaskReply {
    pub fn from_key(key: Option<String>) -> Self {
        Self {
            next_task: key.unwrap_or_default(),
        }
    }

    /// `None` once the initiator's key sequence is exhausted.
    pub fn into_key(self) -> Option<String> {
        if self.next_task.is_empty() {
            None
        } else {
            Some(self.next_task)
        }
    }
}

/// Initiator → worker `DoGet` ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTicket {
    pub query: String,
    pub initial_query_id: String,
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(ClusterError::from)
}

/// Attach the cluster secret to an outgoing request. Empty secrets are not
/// sent.
pub fn attach_secret<T>(request: &mut tonic::Request<T>, secret: &str) -> Result<()> {
    if secret.is_empty() {
        return Ok(());
    }
    let value = secret
        .parse()
        .map_err(|_| ClusterError::Config("cluster secret is not valid header text".to_string()))?;
    request.metadata_mut().insert(CLUSTER_SECRET_HEADER, value);
    Ok(())
}

/// Check an incoming request against the secrets this node accepts. A
/// request without the header presents the empty secret.
pub fn verify_secret<'a>(
    metadata: &MetadataMap,
    accepted: impl IntoIterator<Item = &'a str>,
) -> std::result::Result<(), Status> {
    let received = match metadata.get(CLUSTER_SECRET_HEADER) {
        Some(value) => value
            .to_str()
            .map_err(|_| Status::unauthenticated("cluster secret is not valid header text"))?,
        None => "",
    };
    if accepted.into_iter().any(|secret| secret == received) {
        Ok(())
    } else {
        Err(Status::unauthenticated("cluster secret mismatch"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_task_wire_format() {
        let body = encode(&NextTaskRequest {
            query_id: "q-1".to_string(),
        })
        .unwrap();
        assert_eq!(body, br#"{"query_id":"q-1"}"#);

        let reply: NextTaskReply = decode(br#"{"next_task":"s3://b/k"}"#).unwrap();
        assert_eq!(reply.into_key().as_deref(), Some("s3://b/k"));
    }

    #[test]
    fn empty_reply_means_exhausted() {
        let reply: NextTaskReply = decode(br#"{"next_task":""}"#).unwrap();
        assert_eq!(reply.into_key(), None);
        assert_eq!(NextTaskReply::from_key(None).next_task, "");
    }

    #[test]
    fn malformed_body_is_json_error() {
        let err = decode::<NextTaskRequest>(b"{}").unwrap_err();
        assert!(matches!(err, ClusterError::Json(_)));
    }

    #[test]
    fn ticket_carries_initial_query_id() {
        let ticket = WorkerTicket {
            query: "SELECT 1".to_string(),
            initial_query_id: "q-7".to_string(),
        };
        let decoded: WorkerTicket = decode(&encode(&ticket).unwrap()).unwrap();
        assert_eq!(decoded, ticket);
    }

    #[test]
    fn secret_check() {
        let mut request = tonic::Request::new(());
        attach_secret(&mut request, "s3cr3t").unwrap();
        assert!(verify_secret(request.metadata(), ["s3cr3t"]).is_ok());
        assert!(verify_secret(request.metadata(), ["", "s3cr3t"]).is_ok());

        let status = verify_secret(request.metadata(), ["other"]).unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);

        let bare = tonic::Request::new(());
        assert!(verify_secret(bare.metadata(), [""]).is_ok());
        assert!(verify_secret(bare.metadata(), ["s3cr3t"]).is_err());
    }
}
