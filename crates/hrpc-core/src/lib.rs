//! hrpc - service discovery and remote procedure calls over TCP.
//!
//! Providers host [`ServiceDefinition`]s on a receive server and register
//! their address with a coordination service. Consumers discover addresses
//! through a [`ServiceRegistry`], pick one at random, and call it through a
//! [`CallProxy`] or a client declared with [`rpc_client!`].
//!
//! # Example
//!
//! ```rust,ignore
//! use hrpc_core::{RemoteFault, RpcConfig, RpcContext, ServiceDefinition};
//!
//! hrpc_core::rpc_client! {
//!     pub struct HelloClient for "HelloService" {
//!         fn hello(name: String) -> String;
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> hrpc_core::Result<()> {
//!     let provider = RpcContext::builder(RpcConfig::default().with_server_address("127.0.0.1:0"))
//!         .coordinator(coordinator.clone())
//!         .service(ServiceDefinition::new("HelloService").method(
//!             "hello",
//!             |(name,): (String,)| async move { Ok::<_, RemoteFault>(format!("Hello! {}", name)) },
//!         ))
//!         .build()?;
//!     provider.start().await?;
//!
//!     let consumer = RpcContext::builder(RpcConfig::default())
//!         .coordinator(coordinator)
//!         .build()?;
//!     let client = HelloClient::connect(&consumer);
//!     println!("{}", client.hello("World".into()).await?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod coordination;
pub mod error;
pub mod message;
pub mod proxy;
pub mod registry;
pub mod serialization;
pub mod service;
pub mod transport;

// Re-export commonly used types
pub use config::{RpcConfig, TransportLimits};
pub use context::{RpcContext, RpcContextBuilder};
pub use coordination::{Coordinator, MemoryCoordinator, MemoryEnsemble};
pub use error::{Result, RpcError};
pub use message::{fault_kind, CallArgs, RemoteFault, RpcRequest, RpcResponse, Value};
pub use proxy::{CallProxy, MethodStub};
pub use registry::{InitState, ServiceRegistry};
pub use serialization::{JsonSerializer, MsgpackSerializer, Serializer};
pub use service::{ServiceDefinition, ServiceTable};
pub use transport::{Correlator, ReceiveServer, TcpReceiveServer};
