//! Client-side call proxies.
//!
//! A [`CallProxy`] is bound to one service name. Each call builds a request
//! with a fresh id, looks up an address, sends the request through the
//! correlator and waits for the outcome within the proxy's deadline. There is
//! no retry and no failover to another address.
//!
//! [`rpc_client!`](crate::rpc_client) declares a typed client whose methods
//! mirror the remote interface:
//!
//! ```ignore
//! hrpc_core::rpc_client! {
//!     pub struct HelloClient for "HelloService" {
//!         fn hello(name: String) -> String;
//!     }
//! }
//!
//! let client = HelloClient::connect(&context);
//! assert_eq!(client.hello("World".into()).await?, "Hello! World");
//! ```

use crate::error::{Result, RpcError};
use crate::message::{CallArgs, RpcRequest};
use crate::registry::ServiceRegistry;
use crate::transport::Correlator;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Invokes methods of one remote service.
#[derive(Clone)]
pub struct CallProxy {
    service_name: Arc<str>,
    registry: Arc<ServiceRegistry>,
    correlator: Correlator,
    timeout: Duration,
}

impl CallProxy {
    pub fn new(
        service_name: impl Into<Arc<str>>,
        registry: Arc<ServiceRegistry>,
        correlator: Correlator,
    ) -> Self {
        let timeout = correlator.request_timeout();
        Self {
            service_name: service_name.into(),
            registry,
            correlator,
            timeout,
        }
    }

    /// Name of the service this proxy calls.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Deadline applied to each call.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Use `timeout` as the deadline of every call made through this proxy.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bind a typed stub for `method`.
    pub fn method<A, R>(&self, method: &str) -> MethodStub<A, R>
    where
        A: CallArgs,
        R: DeserializeOwned,
    {
        MethodStub {
            proxy: self.clone(),
            method: Arc::from(method),
            _signature: PhantomData,
        }
    }

    /// Call `method` with `args` and decode the result as `R`.
    pub async fn call<A, R>(&self, method: &str, args: A) -> Result<R>
    where
        A: CallArgs,
        R: DeserializeOwned,
    {
        let request = RpcRequest::from_args(
            self.correlator.next_request_id(),
            &*self.service_name,
            method,
            args,
        )?;

        let Some(address) = self.registry.lookup(&self.service_name).await else {
            debug!("No address for {}; call to {} not sent", self.service_name, method);
            return Err(RpcError::ServiceUnavailable {
                service: self.service_name.to_string(),
            });
        };

        let response = self
            .correlator
            .send_with_timeout(&address, request, self.timeout)
            .await?
            .wait()
            .await?;

        let value = response.into_result()?;
        Ok(serde_json::from_value(value)?)
    }
}

/// A remote method with a fixed signature.
pub struct MethodStub<A, R> {
    proxy: CallProxy,
    method: Arc<str>,
    _signature: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for MethodStub<A, R> {
    fn clone(&self) -> Self {
        Self {
            proxy: self.proxy.clone(),
            method: Arc::clone(&self.method),
            _signature: PhantomData,
        }
    }
}

impl<A, R> MethodStub<A, R>
where
    A: CallArgs,
    R: DeserializeOwned,
{
    pub fn name(&self) -> &str {
        &self.method
    }

    pub async fn invoke(&self, args: A) -> Result<R> {
        self.proxy.call(&self.method, args).await
    }
}

/// Declare a typed client for a remote service.
///
/// Every `fn` line becomes an async method returning
/// `hrpc_core::Result<Ret>`; arguments are sent positionally in the declared
/// order.
#[macro_export]
macro_rules! rpc_client {
    (
        $(#[$meta:meta])*
        $vis:vis struct $client:ident for $service:literal {
            $(
                $(#[$method_meta:meta])*
                fn $method:ident($($arg:ident: $arg_ty:ty),* $(,)?) -> $ret:ty;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone)]
        $vis struct $client {
            proxy: $crate::proxy::CallProxy,
            $($method: $crate::proxy::MethodStub<($($arg_ty,)*), $ret>,)*
        }

        impl $client {
            pub const SERVICE_NAME: &'static str = $service;

            /// Build the client on an existing proxy for the service.
            pub fn new(proxy: &$crate::proxy::CallProxy) -> Self {
                Self {
                    proxy: proxy.clone(),
                    $($method: proxy.method(stringify!($method)),)*
                }
            }

            pub fn connect(context: &$crate::context::RpcContext) -> Self {
                Self::new(&context.proxy($service))
            }

            pub fn proxy(&self) -> &$crate::proxy::CallProxy {
                &self.proxy
            }

            $(
                $(#[$method_meta])*
                pub async fn $method(&self, $($arg: $arg_ty),*) -> $crate::Result<$ret> {
                    self.$method.invoke(($($arg,)*)).await
                }
            )*
        }
    };
}
