use std::time::Duration;

use arrow_flight::decode::FlightRecordBatchStream;
use arrow_flight::flight_service_client::FlightServiceClient;
use arrow_flight::{Action, HandshakeRequest, Ticket};
use futures::{stream, TryStreamExt};
use tonic::transport::{Channel, Endpoint};

use crate::error::{ClusterError, Result};
use crate::protocol::{self, NextTaskReply, NextTaskRequest, WorkerTicket, NEXT_TASK_ACTION};

// ---------------------------------------------------------------------------
// FlightClient
// ---------------------------------------------------------------------------

/// A thin wrapper around an Arrow Flight gRPC client connected to one cluster
/// node.
///
/// The channel is established once in [`FlightClient::connect`] and reused for
/// every request. Every request carries the cluster secret.
#[derive(Debug)]
pub struct FlightClient {
    endpoint: String,
    secret: String,
    client: FlightServiceClient<Channel>,
}

impl FlightClient {
    /// Open a gRPC channel to `endpoint` (e.g. `"http://10.0.0.1:9100"`).
    pub async fn connect(endpoint: &str, secret: &str, connect_timeout: Duration) -> Result<Self> {
        crate::cluster_debug!("flight-client", "Connecting to Flight server at {endpoint}");

        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| {
                ClusterError::Transport(format!("failed to connect to {endpoint}: invalid URI: {e}"))
            })?
            .connect_timeout(connect_timeout)
            .connect()
            .await
            .map_err(|e| ClusterError::Transport(format!("failed to connect to {endpoint}: {e}")))?;

        crate::cluster_debug!("flight-client", "Connected to Flight server at {endpoint}");

        Ok(Self {
            endpoint: endpoint.to_string(),
            secret: secret.to_string(),
            client: FlightServiceClient::new(channel),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request<T>(&self, message: T) -> Result<tonic::Request<T>> {
        let mut request = tonic::Request::new(message);
        protocol::attach_secret(&mut request, &self.secret)?;
        Ok(request)
    }

    /// Ask the node for its identity hash within `cluster`.
    pub async fn handshake(&mut self, cluster: &str) -> Result<String> {
        let hello = HandshakeRequest {
            protocol_version: 1,
            payload: cluster.as_bytes().to_vec().into(),
        };
        let request = self.request(stream::iter(vec![hello]))?;

        let mut responses = self
            .client
            .handshake(request)
            .await
            .map_err(|e| ClusterError::Transport(format!("handshake with {} failed: {e}", self.endpoint)))?
            .into_inner();

        let response = responses
            .message()
            .await
            .map_err(|e| ClusterError::Transport(format!("handshake with {} failed: {e}", self.endpoint)))?
            .ok_or_else(|| {
                ClusterError::Transport(format!("handshake with {} returned no response", self.endpoint))
            })?;

        String::from_utf8(response.payload.to_vec()).map_err(|e| {
            ClusterError::Transport(format!("handshake with {} returned invalid UTF-8: {e}", self.endpoint))
        })
    }

    /// One pull: send `next_task` and wait for its single reply.
    ///
    /// `send_timeout` bounds the call until the server accepts it,
    /// `receive_timeout` bounds waiting for the reply body.
    pub async fn next_task(
        &mut self,
        request: &NextTaskRequest,
        send_timeout: Duration,
        receive_timeout: Duration,
    ) -> Result<NextTaskReply> {
        let action = Action::new(NEXT_TASK_ACTION, protocol::encode(request)?);
        let action = self.request(action)?;
        let endpoint = self.endpoint.clone();

        let response = tokio::time::timeout(send_timeout, self.client.do_action(action))
            .await
            .map_err(|_| ClusterError::Transport(format!("send to {endpoint} timed out after {send_timeout:?}")))?
            .map_err(|e| ClusterError::Transport(format!("next_task on {endpoint} failed: {e}")))?;

        let mut results = response.into_inner();
        let result = tokio::time::timeout(receive_timeout, results.message())
            .await
            .map_err(|_| {
                ClusterError::Transport(format!("receive from {endpoint} timed out after {receive_timeout:?}"))
            })?
            .map_err(|e| ClusterError::Transport(format!("next_task on {endpoint} failed: {e}")))?
            .ok_or_else(|| ClusterError::Transport(format!("next_task on {endpoint} returned no reply")))?;

        protocol::decode(&result.body)
    }

    /// Submit a worker query via DoGet and return its record batch stream.
    ///
    /// The ticket is JSON: `{"query": "<sql>", "initial_query_id": "..."}`.
    pub async fn execute_query(&mut self, ticket: &WorkerTicket) -> Result<FlightRecordBatchStream> {
        crate::cluster_debug!(
            "flight-client",
            "Executing query on {} for {}: {}",
            self.endpoint,
            ticket.initial_query_id,
            ticket.query
        );

        let request = self.request(Ticket::new(protocol::encode(ticket)?))?;
        let response = self
            .client
            .do_get(request)
            .await
            .map_err(|e| ClusterError::Transport(format!("Flight query failed on {}: {e}", self.endpoint)))?;

        Ok(FlightRecordBatchStream::new_from_flight_data(
            response
                .into_inner()
                .map_err(|e| arrow_flight::error::FlightError::Tonic(Box::new(e))),
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_to_invalid_endpoint_fails() {
        let err = FlightClient::connect("http://127.0.0.1:1", "", Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("failed to connect to http://127.0.0.1:1"),
            "unexpected error: {err}"
        );
        assert!(matches!(err, ClusterError::Transport(_)));
    }

    #[tokio::test]
    async fn connect_to_malformed_uri_fails() {
        let err = FlightClient::connect("not a uri", "", Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid URI"), "unexpected error: {err}");
    }
}
