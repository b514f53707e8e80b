//! The `HelloService` interface: server implementation and typed client.

use hrpc_core::{RemoteFault, ServiceDefinition};

pub const SERVICE_NAME: &str = "HelloService";

hrpc_core::rpc_client! {
    /// Typed client for `HelloService`.
    pub struct HelloClient for "HelloService" {
        fn hello(name: String) -> String;
        fn hello_many(names: Vec<String>) -> Vec<String>;
    }
}

/// Server side of `HelloService`.
pub fn hello_service() -> ServiceDefinition {
    ServiceDefinition::new(SERVICE_NAME)
        .method("hello", |(name,): (String,)| async move {
            Ok::<_, RemoteFault>(greet(&name))
        })
        .method("hello_many", |(names,): (Vec<String>,)| async move {
            if names.is_empty() {
                return Err(RemoteFault::application("no names given"));
            }
            Ok(names.iter().map(|name| greet(name)).collect::<Vec<_>>())
        })
}

fn greet(name: &str) -> String {
    format!("Hello! {}", name)
}
