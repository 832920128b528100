use std::future::Future;
use std::thread;

use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::error::FlightError;
use arrow_flight::flight_service_server::{FlightService, FlightServiceServer};
use arrow_flight::{
    Action, ActionType, Criteria, Empty, FlightData, FlightDescriptor, FlightInfo,
    HandshakeRequest, HandshakeResponse, PollInfo, PutResult, SchemaResult, Ticket,
};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use crate::error::{ClusterError, Result};
use crate::logging::{self, LogLevel};
use crate::node::ClusterNode;
use crate::protocol::{self, NextTaskReply, NextTaskRequest, WorkerTicket, NEXT_TASK_ACTION};
use crate::server_registry::{ServerRegistry, ServerThreadResult};

/// Arrow Flight service of one cluster node.
///
/// Serves worker queries submitted by initiators (`DoGet`) and task pulls
/// from workers (`DoAction("next_task")`).
#[derive(Clone)]
pub struct ScanFlightService {
    node: ClusterNode,
}

impl ScanFlightService {
    pub fn new(node: ClusterNode) -> Self {
        Self { node }
    }

    fn check_secret<T>(&self, request: &Request<T>) -> std::result::Result<(), Status> {
        let accepted = self.node.accepted_secrets();
        protocol::verify_secret(request.metadata(), accepted.iter().map(String::as_str))
    }

    /// Take the next key of a query and encode the reply.
    fn serve_pull(&self, body: &[u8]) -> Result<arrow_flight::Result> {
        let request: NextTaskRequest = protocol::decode(body)?;
        let key = self.node.registry().next_task(&request.query_id)?;
        let reply = NextTaskReply::from_key(key);
        Ok(arrow_flight::Result {
            body: protocol::encode(&reply)?.into(),
        })
    }
}

#[tonic::async_trait]
impl FlightService for ScanFlightService {
    type HandshakeStream = BoxStream<'static, std::result::Result<HandshakeResponse, Status>>;
    type ListFlightsStream = BoxStream<'static, std::result::Result<FlightInfo, Status>>;
    type DoGetStream = BoxStream<'static, std::result::Result<FlightData, Status>>;
    type DoPutStream = BoxStream<'static, std::result::Result<PutResult, Status>>;
    type DoActionStream = BoxStream<'static, std::result::Result<arrow_flight::Result, Status>>;
    type ListActionsStream = BoxStream<'static, std::result::Result<ActionType, Status>>;
    type DoExchangeStream = BoxStream<'static, std::result::Result<FlightData, Status>>;

    /// Reply with this node's identity hash in the cluster named by the
    /// request payload.
    async fn handshake(
        &self,
        request: Request<Streaming<HandshakeRequest>>,
    ) -> std::result::Result<Response<Self::HandshakeStream>, Status> {
        self.check_secret(&request)?;

        let hello = request
            .into_inner()
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty handshake"))?;
        let cluster = std::str::from_utf8(&hello.payload)
            .map_err(|e| Status::invalid_argument(format!("invalid cluster name: {e}")))?;

        let hash = self
            .node
            .self_hash(cluster)
            .map_err(|e| Status::not_found(e.to_string()))?;
        crate::cluster_debug!("handshake", "Handshake for cluster '{cluster}', identity={hash}");

        let response = HandshakeResponse {
            protocol_version: 1,
            payload: hash.into_bytes().into(),
        };
        Ok(Response::new(stream::once(async { Ok(response) }).boxed()))
    }

    async fn list_flights(
        &self,
        _request: Request<Criteria>,
    ) -> std::result::Result<Response<Self::ListFlightsStream>, Status> {
        Err(Status::unimplemented("ListFlights is not supported"))
    }

    async fn get_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> std::result::Result<Response<FlightInfo>, Status> {
        Err(Status::unimplemented("GetFlightInfo is not supported"))
    }

    async fn poll_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> std::result::Result<Response<PollInfo>, Status> {
        Err(Status::unimplemented("PollFlightInfo is not supported"))
    }

    async fn get_schema(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> std::result::Result<Response<SchemaResult>, Status> {
        Err(Status::unimplemented("GetSchema is not supported"))
    }

    /// Execute a worker query from the ticket and stream its rows.
    async fn do_get(
        &self,
        request: Request<Ticket>,
    ) -> std::result::Result<Response<Self::DoGetStream>, Status> {
        self.check_secret(&request)?;

        let ticket: WorkerTicket = protocol::decode(&request.into_inner().ticket)?;
        let port = self.node.local_port().to_string();
        logging::log_with_context(
            LogLevel::Info,
            "do_get",
            &[("query", ticket.initial_query_id.as_str()), ("port", port.as_str())],
            "Executing worker query",
        );
        crate::cluster_debug!("do_get", "SQL: {}", ticket.query);

        let batches = self
            .node
            .execute_worker_query(&ticket.query, &ticket.initial_query_id)
            .await?;
        let schema = batches.schema();

        let flight_data_stream = FlightDataEncoderBuilder::new()
            .with_schema(schema)
            .build(batches.map_err(|e| FlightError::ExternalError(Box::new(e))))
            .map_err(|e| Status::internal(format!("Flight encoding error: {e}")));

        Ok(Response::new(flight_data_stream.boxed()))
    }

    async fn do_put(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> std::result::Result<Response<Self::DoPutStream>, Status> {
        Err(Status::unimplemented("DoPut is not supported"))
    }

    /// Serve one task pull.
    async fn do_action(
        &self,
        request: Request<Action>,
    ) -> std::result::Result<Response<Self::DoActionStream>, Status> {
        self.check_secret(&request)?;
        let action = request.into_inner();

        match action.r#type.as_str() {
            NEXT_TASK_ACTION => {
                let result = self.serve_pull(&action.body).map_err(|e| {
                    crate::cluster_warn!("do_action", "next_task failed: {e}");
                    Status::from(e)
                })?;
                Ok(Response::new(stream::once(async { Ok(result) }).boxed()))
            }
            other => Err(Status::invalid_argument(format!(
                "Unknown action type: {}",
                other
            ))),
        }
    }

    async fn list_actions(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<Self::ListActionsStream>, Status> {
        let actions = vec![ActionType {
            r#type: NEXT_TASK_ACTION.to_string(),
            description: "Take the next object key of a distributed scan".to_string(),
        }];

        Ok(Response::new(stream::iter(actions.into_iter().map(Ok)).boxed()))
    }

    async fn do_exchange(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> std::result::Result<Response<Self::DoExchangeStream>, Status> {
        Err(Status::unimplemented("DoExchange is not supported"))
    }
}

/// Serve `node` on `listener` until `shutdown` resolves.
pub async fn serve<F>(node: ClusterNode, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let local = listener
        .local_addr()
        .map_err(|e| ClusterError::Transport(format!("listener has no local address: {e}")))?;
    crate::cluster_info!("server", "Flight server listening on {local}");

    Server::builder()
        .add_service(FlightServiceServer::new(ScanFlightService::new(node)))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
        .map_err(|e| ClusterError::Transport(format!("Flight server on {local} failed: {e}")))
}

/// Start the node's Flight server on a dedicated thread, listening on
/// `host` and the node's local port.
pub fn start_flight_server(node: ClusterNode, host: &str) -> Result<String> {
    let port = node.local_port();
    crate::cluster_info!("server", "Starting flight server on {host}:{port}");

    // Bind up front so address errors reach the caller.
    let std_listener = std::net::TcpListener::bind((host, port))
        .map_err(|e| ClusterError::Config(format!("cannot listen on {host}:{port}: {e}")))?;
    std_listener
        .set_nonblocking(true)
        .map_err(|e| ClusterError::Config(format!("cannot listen on {host}:{port}: {e}")))?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    ServerRegistry::instance().reserve(host, port, shutdown_tx)?;

    let thread_result = thread::Builder::new()
        .name(format!("flight-server-{}:{}", host, port))
        .spawn(move || -> ServerThreadResult {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;

            rt.block_on(async move {
                let listener = TcpListener::from_std(std_listener)?;
                serve(node, listener, async {
                    let _ = shutdown_rx.await;
                })
                .await?;
                Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
            })
        });

    match thread_result {
        Ok(handle) => {
            ServerRegistry::instance().set_thread_handle(host, port, handle);
        }
        Err(e) => {
            ServerRegistry::instance().deregister(host, port);
            return Err(ClusterError::Config(format!("failed to spawn server thread: {e}")));
        }
    }

    crate::cluster_info!("server", "Flight server started successfully on {host}:{port}");
    Ok(format!("Started flight server on {}:{}", host, port))
}

/// Stop a running Flight server and deregister it.
pub fn stop_flight_server(host: &str, port: u16) -> Result<String> {
    crate::cluster_info!("server", "Stopping flight server on {host}:{port}");
    let result = ServerRegistry::instance().stop_server(host, port);
    if result.is_ok() {
        crate::cluster_info!("server", "Flight server stopped on {host}:{port}");
    }
    result
}
