//! Server-side service definitions.
//!
//! A [`ServiceDefinition`] maps method names to typed async closures. Each
//! closure is erased once, when the method is added, into a handler taking
//! positional [`Value`]s; nothing is resolved per call beyond two map
//! lookups.
//!
//! ```ignore
//! let hello = ServiceDefinition::new("HelloService")
//!     .method("hello", |(name,): (String,)| async move {
//!         Ok::<_, RemoteFault>(format!("Hello! {}", name))
//!     });
//! ```

use crate::message::{fault_kind, CallArgs, RemoteFault, Value};
use futures::future::{self, BoxFuture, FutureExt};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Result of one method invocation.
pub type InvokeResult = Result<Value, RemoteFault>;

/// Type-erased method implementation.
pub type MethodHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, InvokeResult> + Send + Sync>;

/// The methods one named service exposes.
pub struct ServiceDefinition {
    name: String,
    methods: HashMap<String, MethodHandler>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a method. A later method with the same name replaces the earlier.
    ///
    /// The handler receives the decoded argument tuple; an `Err` it returns
    /// travels back to the caller as a remote fault.
    pub fn method<A, R, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: CallArgs,
        R: Serialize + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RemoteFault>> + Send + 'static,
    {
        let erased: MethodHandler = Arc::new(move |values: Vec<Value>| match A::from_values(values) {
            Ok(args) => handler(args)
                .map(|result| {
                    result.and_then(|value| {
                        serde_json::to_value(value).map_err(|e| {
                            RemoteFault::new(fault_kind::SERIALIZATION, e.to_string())
                        })
                    })
                })
                .boxed(),
            Err(fault) => future::ready(Err(fault)).boxed(),
        });

        let name = name.into();
        if self.methods.insert(name.clone(), erased).is_some() {
            warn!("Method {}.{} defined twice; keeping the last", self.name, name);
        }
        self
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn handler(&self, method: &str) -> Option<&MethodHandler> {
        self.methods.get(method)
    }
}

/// Every service hosted by one receive server.
#[derive(Default, Clone)]
pub struct ServiceTable {
    services: HashMap<String, Arc<ServiceDefinition>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service, replacing any earlier one with the same name.
    pub fn with(mut self, definition: ServiceDefinition) -> Self {
        self.insert(definition);
        self
    }

    pub fn insert(&mut self, definition: ServiceDefinition) {
        let name = definition.name().to_string();
        if self
            .services
            .insert(name.clone(), Arc::new(definition))
            .is_some()
        {
            warn!("Service {} defined twice; keeping the last", name);
        }
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Run `service.method` with positional `arguments`.
    pub fn invoke(
        &self,
        service: &str,
        method: &str,
        arguments: Vec<Value>,
    ) -> BoxFuture<'static, InvokeResult> {
        let Some(definition) = self.services.get(service) else {
            return future::ready(Err(RemoteFault::new(
                fault_kind::SERVICE_NOT_FOUND,
                format!("no service named {}", service),
            )))
            .boxed();
        };
        match definition.handler(method) {
            Some(handler) => handler(arguments),
            None => future::ready(Err(RemoteFault::new(
                fault_kind::METHOD_NOT_FOUND,
                format!("service {} has no method {}", service, method),
            )))
            .boxed(),
        }
    }
}
