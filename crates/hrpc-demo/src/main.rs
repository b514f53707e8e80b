//! hrpc demo - a provider and a consumer sharing one in-process ensemble.
//!
//! The provider hosts `HelloService` on a TCP receive server and registers
//! it; the consumer discovers the address and calls it through the typed
//! `HelloClient`.

mod hello;

use anyhow::Result;
use clap::Parser;
use hrpc_core::{MemoryEnsemble, RpcConfig, RpcContext, RpcError};
use hello::{hello_service, HelloClient};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "hrpc-demo")]
#[command(about = "Call HelloService through service discovery")]
struct Args {
    /// Port to serve on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Name to greet
    #[arg(short, long, default_value = "World")]
    name: String,

    /// Number of calls to make
    #[arg(short, long, default_value = "1")]
    calls: usize,

    /// Payload serializer (json or msgpack)
    #[arg(long, default_value = "json")]
    serializer: String,

    /// Per-call deadline in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Keep serving after the calls until Ctrl-C
    #[arg(long)]
    serve: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting hrpc demo");

    let base = RpcConfig::default()
        .with_serializer(args.serializer.clone())
        .with_request_timeout(Duration::from_millis(args.timeout_ms));
    let ensemble = MemoryEnsemble::new();

    let provider = RpcContext::builder(
        base.clone()
            .with_server_address(format!("{}:{}", args.host, args.port)),
    )
    .coordinator(Arc::new(ensemble.connect()))
    .service(hello_service())
    .build()?;
    let addr = provider.start().await?;
    if let Some(addr) = addr {
        info!("HelloService available on {}", addr);
    }

    let consumer = RpcContext::builder(base)
        .coordinator(Arc::new(ensemble.connect()))
        .build()?;
    let client = HelloClient::connect(&consumer);

    for i in 0..args.calls {
        match client.hello(args.name.clone()).await {
            Ok(greeting) => println!("{}", greeting),
            Err(RpcError::ServiceUnavailable { service }) => {
                warn!("Call {} skipped: {} is not registered", i + 1, service);
            }
            Err(e) => return Err(e.into()),
        }
    }

    let names = vec![args.name.clone(), "hrpc".to_string()];
    for greeting in client.hello_many(names).await? {
        println!("{}", greeting);
    }

    if args.serve {
        info!("Serving until Ctrl-C");
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received, exiting");
    }

    consumer.stop().await;
    provider.stop().await;
    Ok(())
}
