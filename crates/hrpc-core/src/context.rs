//! Runtime context: wires serializer, registry, correlator and server.

use crate::config::RpcConfig;
use crate::coordination::{Coordinator, MemoryEnsemble};
use crate::error::Result;
use crate::proxy::CallProxy;
use crate::registry::ServiceRegistry;
use crate::serialization::{serializer_by_name, Serializer};
use crate::service::{ServiceDefinition, ServiceTable};
use crate::transport::{Correlator, ReceiveServer, ServerContext, TcpReceiveServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Builder for [`RpcContext`].
///
/// # Example
///
/// ```rust,ignore
/// let context = RpcContext::builder(RpcConfig::default().with_server_address("127.0.0.1:0"))
///     .coordinator(Arc::new(ensemble.connect()))
///     .service(hello_service())
///     .build()?;
/// context.start().await?;
/// ```
pub struct RpcContextBuilder {
    config: RpcConfig,
    coordinator: Option<Arc<dyn Coordinator>>,
    serializer: Option<Arc<dyn Serializer>>,
    server: Option<Box<dyn ReceiveServer>>,
    services: ServiceTable,
}

impl RpcContextBuilder {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            config,
            coordinator: None,
            serializer: None,
            server: None,
            services: ServiceTable::new(),
        }
    }

    /// Coordination session used for registration and discovery.
    ///
    /// Default: a session on a fresh in-process ensemble, which only sees
    /// services registered through it.
    pub fn coordinator(mut self, coordinator: Arc<dyn Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Payload serializer.
    ///
    /// Default: the serializer named by `RpcConfig::serializer`.
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Receive server for the hosted services.
    ///
    /// Default: a TCP server on `RpcConfig::server_address` when it is set.
    pub fn server(mut self, server: impl ReceiveServer + 'static) -> Self {
        self.server = Some(Box::new(server));
        self
    }

    /// Host `definition` on this context's receive server.
    pub fn service(mut self, definition: ServiceDefinition) -> Self {
        self.services.insert(definition);
        self
    }

    /// Build the context. Nothing is started yet.
    pub fn build(self) -> Result<RpcContext> {
        let config = self.config;
        config.validate()?;

        let serializer = match self.serializer {
            Some(serializer) => serializer,
            None => serializer_by_name(&config.serializer)?,
        };

        let coordinator = match self.coordinator {
            Some(coordinator) => coordinator,
            None => {
                warn!(
                    "No coordinator supplied for {}; using an in-process ensemble",
                    config.coordination_address
                );
                let session: Arc<dyn Coordinator> = Arc::new(MemoryEnsemble::new().connect());
                session
            }
        };

        let registry = Arc::new(ServiceRegistry::new(coordinator, &config));
        let correlator = Correlator::new(Arc::clone(&serializer), &config);
        let services = Arc::new(self.services);

        let mut server = match self.server {
            Some(server) => Some(server),
            None => TcpReceiveServer::from_config(&config)
                .map(|server| Box::new(server) as Box<dyn ReceiveServer>),
        };
        match server.as_mut() {
            Some(server) => server.set_context(ServerContext {
                serializer: Arc::clone(&serializer),
                registry: Arc::clone(&registry),
                services: Arc::clone(&services),
            }),
            None if !services.is_empty() => warn!(
                "{} service(s) defined but no server_address configured; they will not be served",
                services.len()
            ),
            None => {}
        }

        Ok(RpcContext {
            config,
            serializer,
            registry,
            correlator,
            services,
            server: Mutex::new(server),
        })
    }
}

/// One process's RPC runtime.
pub struct RpcContext {
    config: RpcConfig,
    serializer: Arc<dyn Serializer>,
    registry: Arc<ServiceRegistry>,
    correlator: Correlator,
    services: Arc<ServiceTable>,
    server: Mutex<Option<Box<dyn ReceiveServer>>>,
}

impl RpcContext {
    pub fn builder(config: RpcConfig) -> RpcContextBuilder {
        RpcContextBuilder::new(config)
    }

    /// Context with every default and no hosted services.
    pub fn new(config: RpcConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start the receive server, if any, and register the hosted services.
    ///
    /// Returns the bound address, or `None` for a client-only context.
    pub async fn start(&self) -> Result<Option<SocketAddr>> {
        let mut server = self.server.lock().await;
        match server.as_mut() {
            Some(server) => {
                let addr = server.start().await?;
                info!(
                    "RPC context serving {} service(s) on {}",
                    self.services.len(),
                    addr
                );
                Ok(Some(addr))
            }
            None => Ok(None),
        }
    }

    /// Stop the receive server and fail every outstanding call.
    pub async fn stop(&self) {
        if let Some(server) = self.server.lock().await.as_mut() {
            server.stop().await;
        }
        self.correlator.shutdown().await;
    }

    /// Address the receive server is bound to while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server
            .lock()
            .await
            .as_ref()
            .and_then(|server| server.local_addr())
    }

    /// Proxy for calling `service_name`.
    pub fn proxy(&self, service_name: &str) -> CallProxy {
        CallProxy::new(
            service_name,
            Arc::clone(&self.registry),
            self.correlator.clone(),
        )
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn services(&self) -> &Arc<ServiceTable> {
        &self.services
    }
}
