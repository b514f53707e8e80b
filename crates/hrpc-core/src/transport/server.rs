//! Receive server: the server side of the transport.
//!
//! Accepts connections, decodes request frames, runs the matching method of
//! the local [`ServiceTable`] and writes the response back on the same
//! connection with the same request id. Requests on one connection are
//! dispatched concurrently, so responses may leave in a different order than
//! the requests arrived.
//!
//! Failures inside service code, panics included, are answered as remote
//! faults. Only I/O and framing problems end a connection.

use super::frame::{read_frame, write_frame, Frame};
use crate::config::{RpcConfig, TransportLimits};
use crate::error::{Result, RpcError};
use crate::message::{fault_kind, RemoteFault, RpcResponse};
use crate::registry::ServiceRegistry;
use crate::serialization::Serializer;
use crate::service::ServiceTable;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// What a receive server needs from its runtime context.
#[derive(Clone)]
pub struct ServerContext {
    pub serializer: Arc<dyn Serializer>,
    pub registry: Arc<ServiceRegistry>,
    pub services: Arc<ServiceTable>,
}

/// Lifecycle of a server that answers remote calls.
#[async_trait]
pub trait ReceiveServer: Send + Sync {
    /// Hand the server the serializer, registry and services it dispatches
    /// with. Must be called before [`start`](Self::start).
    fn set_context(&mut self, context: ServerContext);

    /// Start accepting connections and register every hosted service.
    async fn start(&mut self) -> Result<SocketAddr>;

    /// Stop accepting connections and close the open ones.
    async fn stop(&mut self);

    /// Bound address while running.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Handle to a running accept loop. Dropping shuts the server down.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the accept loop and signal every connection handler to close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// TCP implementation of [`ReceiveServer`].
pub struct TcpReceiveServer {
    bind_address: String,
    advertise_address: Option<String>,
    context: Option<ServerContext>,
    handle: Option<ServerHandle>,
}

impl TcpReceiveServer {
    pub fn new(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            advertise_address: None,
            context: None,
            handle: None,
        }
    }

    /// Server for `config.server_address`, or `None` when serving is off.
    pub fn from_config(config: &RpcConfig) -> Option<Self> {
        let server = Self::new(config.server_address.clone()?);
        Some(match &config.advertise_address {
            Some(advertise) => server.with_advertise_address(advertise.clone()),
            None => server,
        })
    }

    /// Publish `address` in the registry instead of the bound address.
    pub fn with_advertise_address(mut self, address: impl Into<String>) -> Self {
        self.advertise_address = Some(address.into());
        self
    }

    fn advertised(&self, bound: SocketAddr) -> String {
        if let Some(address) = &self.advertise_address {
            return address.clone();
        }
        if bound.ip().is_unspecified() {
            let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port());
            warn!(
                "Server bound to {}; advertising {} (set advertise_address for remote callers)",
                bound, loopback
            );
            return loopback.to_string();
        }
        bound.to_string()
    }

    async fn accept_loop(
        listener: TcpListener,
        context: ServerContext,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Receive server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= TransportLimits::MAX_SERVER_CONNECTIONS {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    TransportLimits::MAX_SERVER_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let context = context.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, context, &mut conn_shutdown).await {
                                    debug!("Connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        context: ServerContext,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));
        // Dropping the set aborts calls still running for this connection.
        let mut in_flight = JoinSet::new();

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(frame) => frame,
                        None => return Ok(()),
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            };
            while in_flight.try_join_next().is_some() {}

            let context = context.clone();
            let writer = Arc::clone(&writer);
            in_flight.spawn(async move {
                let request_id = frame.request_id;
                let response = Self::process_request(&context, frame).await;
                let payload = match context.serializer.encode_response(&response) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Failed to encode response {}: {}", request_id, e);
                        let fault = RpcResponse::fault(
                            request_id,
                            RemoteFault::new(fault_kind::SERIALIZATION, e.to_string()),
                        );
                        match context.serializer.encode_response(&fault) {
                            Ok(payload) => payload,
                            Err(_) => return,
                        }
                    }
                };

                let mut writer = writer.lock().await;
                if let Err(e) = write_frame(&mut *writer, request_id, &payload).await {
                    debug!("Failed to write response {}: {}", request_id, e);
                }
            });
        }
    }

    async fn process_request(context: &ServerContext, frame: Frame) -> RpcResponse {
        let request = match context.serializer.decode_request(&frame.payload) {
            Ok(request) => request,
            Err(e) => {
                return RpcResponse::fault(
                    frame.request_id,
                    RemoteFault::new(fault_kind::BAD_REQUEST, e.to_string()),
                );
            }
        };

        if request.request_id() != frame.request_id {
            return RpcResponse::fault(
                frame.request_id,
                RemoteFault::new(
                    fault_kind::BAD_REQUEST,
                    format!(
                        "frame id {} does not match request id {}",
                        frame.request_id,
                        request.request_id()
                    ),
                ),
            );
        }

        let request_id = request.request_id();
        let service = request.service_name().to_string();
        let method = request.method_name().to_string();
        debug!("Dispatching request {} to {}.{}", request_id, service, method);

        let services = Arc::clone(&context.services);
        let arguments = request.into_arguments();
        let invocation = AssertUnwindSafe(async move {
            services.invoke(&service, &method, arguments).await
        })
        .catch_unwind()
        .await;

        match invocation {
            Ok(Ok(value)) => RpcResponse::success(request_id, value),
            Ok(Err(fault)) => {
                debug!("Request {} raised {}", request_id, fault);
                RpcResponse::fault(request_id, fault)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Request {} panicked: {}", request_id, message);
                RpcResponse::fault(request_id, RemoteFault::new(fault_kind::PANIC, message))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "service panicked".to_string()
    }
}

#[async_trait]
impl ReceiveServer for TcpReceiveServer {
    fn set_context(&mut self, context: ServerContext) {
        self.context = Some(context);
    }

    async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(handle) = &self.handle {
            return Ok(handle.addr());
        }
        let context = self.context.clone().ok_or_else(|| RpcError::Config {
            message: "receive server started without a context".to_string(),
        })?;

        let listener = TcpListener::bind(&self.bind_address).await?;
        let addr = listener.local_addr()?;
        info!("Receive server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            context.clone(),
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        // Dropped, and so stopped, if registration fails below.
        let handle = ServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        };

        let advertised = self.advertised(addr);
        for service in context.services.service_names() {
            context.registry.register(&service, &advertised).await?;
        }

        self.handle = Some(handle);
        Ok(addr)
    }

    async fn stop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.shutdown();
            info!("Receive server on {} stopped", handle.addr());
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.as_ref().map(ServerHandle::addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryEnsemble;
    use crate::message::RpcRequest;
    use crate::serialization::JsonSerializer;
    use crate::service::ServiceDefinition;
    use serde_json::json;

    fn echo_service() -> ServiceDefinition {
        ServiceDefinition::new("EchoService")
            .method("echo", |(text,): (String,)| async move {
                Ok::<_, RemoteFault>(text)
            })
            .method("fail", |(): ()| async {
                Err::<String, _>(RemoteFault::application("test failure"))
            })
            .method("explode", |(): ()| async { explode() })
    }

    fn explode() -> std::result::Result<String, RemoteFault> {
        panic!("kaboom")
    }

    fn server_with_context(ensemble: &MemoryEnsemble) -> TcpReceiveServer {
        let mut server = TcpReceiveServer::new("127.0.0.1:0");
        server.set_context(ServerContext {
            serializer: Arc::new(JsonSerializer),
            registry: Arc::new(ServiceRegistry::with_root(
                Arc::new(ensemble.connect()),
                "/registry",
                Vec::new(),
            )),
            services: Arc::new(ServiceTable::new().with(echo_service())),
        });
        server
    }

    async fn call(stream: &mut TcpStream, request: &RpcRequest) -> RpcResponse {
        let payload = JsonSerializer.encode_request(request).unwrap();
        write_frame(stream, request.request_id(), &payload).await.unwrap();
        let frame = read_frame(stream).await.unwrap().unwrap();
        assert_eq!(frame.request_id, request.request_id());
        JsonSerializer.decode_response(&frame.payload).unwrap()
    }

    #[tokio::test]
    async fn test_server_start_registers_services() {
        let ensemble = MemoryEnsemble::new();
        let mut server = server_with_context(&ensemble);
        let addr = server.start().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));

        let consumer =
            ServiceRegistry::with_root(Arc::new(ensemble.connect()), "/registry", Vec::new());
        assert_eq!(consumer.lookup("EchoService").await, Some(addr.to_string()));

        server.stop().await;
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_server_echo_roundtrip() {
        let ensemble = MemoryEnsemble::new();
        let mut server = server_with_context(&ensemble);
        let addr = server.start().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request =
            RpcRequest::from_args(1, "EchoService", "echo", ("hello".to_string(),)).unwrap();
        let response = call(&mut stream, &request).await;

        assert_eq!(response.into_result().unwrap(), json!("hello"));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_server_application_error_is_fault() {
        let ensemble = MemoryEnsemble::new();
        let mut server = server_with_context(&ensemble);
        let addr = server.start().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = RpcRequest::from_args(2, "EchoService", "fail", ()).unwrap();
        let fault = call(&mut stream, &request).await.into_result().unwrap_err();

        assert_eq!(fault.kind, fault_kind::APPLICATION);
        assert!(fault.message.contains("test failure"));
    }

    #[tokio::test]
    async fn test_server_panic_is_fault_and_connection_survives() {
        let ensemble = MemoryEnsemble::new();
        let mut server = server_with_context(&ensemble);
        let addr = server.start().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = RpcRequest::from_args(3, "EchoService", "explode", ()).unwrap();
        let fault = call(&mut stream, &request).await.into_result().unwrap_err();
        assert_eq!(fault.kind, fault_kind::PANIC);
        assert!(fault.message.contains("kaboom"));

        let request =
            RpcRequest::from_args(4, "EchoService", "echo", ("still here".to_string(),)).unwrap();
        let response = call(&mut stream, &request).await;
        assert_eq!(response.into_result().unwrap(), json!("still here"));
    }

    #[tokio::test]
    async fn test_server_unknown_service_and_method() {
        let ensemble = MemoryEnsemble::new();
        let mut server = server_with_context(&ensemble);
        let addr = server.start().await.unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let request = RpcRequest::from_args(5, "MissingService", "echo", ()).unwrap();
        let fault = call(&mut stream, &request).await.into_result().unwrap_err();
        assert_eq!(fault.kind, fault_kind::SERVICE_NOT_FOUND);

        let request = RpcRequest::from_args(6, "EchoService", "shout", ()).unwrap();
        let fault = call(&mut stream, &request).await.into_result().unwrap_err();
        assert_eq!(fault.kind, fault_kind::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_server_garbage_payload_returns_bad_request() {
        let ensemble = MemoryEnsemble::new();
        let mut server = server_with_context(&ensemble);
        let addr = server.start().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, 77, b"not valid json").await.unwrap();

        let frame = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(frame.request_id, 77);
        let response = JsonSerializer.decode_response(&frame.payload).unwrap();
        assert_eq!(response.request_id(), 77);
        assert_eq!(
            response.into_result().unwrap_err().kind,
            fault_kind::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_server_requires_context() {
        let mut server = TcpReceiveServer::new("127.0.0.1:0");
        assert!(matches!(
            server.start().await,
            Err(RpcError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_closes_open_connections() {
        let ensemble = MemoryEnsemble::new();
        let mut server = server_with_context(&ensemble);
        let addr = server.start().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request =
            RpcRequest::from_args(8, "EchoService", "echo", ("warmup".to_string(),)).unwrap();
        call(&mut stream, &request).await;

        server.stop().await;
        let next = tokio::time::timeout(std::time::Duration::from_secs(5), read_frame(&mut stream))
            .await
            .unwrap();
        assert!(matches!(next, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn test_advertise_address_overrides_bound_address() {
        let ensemble = MemoryEnsemble::new();
        let mut server = server_with_context(&ensemble).with_advertise_address("10.1.2.3:7000");
        server.start().await.unwrap();

        let consumer =
            ServiceRegistry::with_root(Arc::new(ensemble.connect()), "/registry", Vec::new());
        assert_eq!(
            consumer.lookup("EchoService").await.as_deref(),
            Some("10.1.2.3:7000")
        );
    }

    #[test]
    fn test_from_config_requires_server_address() {
        assert!(TcpReceiveServer::from_config(&RpcConfig::default()).is_none());
        let config = RpcConfig::default().with_server_address("127.0.0.1:0");
        assert!(TcpReceiveServer::from_config(&config).is_some());
    }
}
