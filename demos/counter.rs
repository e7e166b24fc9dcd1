//! Counter - a command dispatched locally and over HTTP.
//!
//! This example demonstrates:
//! - Registering a handler and wrapping it in `LoggingMiddleware`
//! - Exposing the same message through `HttpMessageReceiver`
//! - Calling it through `HttpTransportClient`, with a retry middleware on the
//!   client pipeline and context flowing both ways
//!
//! The client talks to the receiver in memory; swap `with_sender` for
//! `HttpTransportClient::new` to go over the network.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example counter
//! ```

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conqueror::config::HttpTransportConfig;
use conqueror::middleware::{LoggingMiddleware, PayloadLogging, RetryMiddleware};
use conqueror::transport::http::{HttpMessage, HttpMessageReceiver, HttpTransportClient};
use conqueror::{Cancellation, ConquerorContext, Dispatcher, Message};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IncrementCounter {
    amount: i64,
}

impl Message for IncrementCounter {
    type Response = i64;
}

impl HttpMessage for IncrementCounter {
    const VERSION: Option<u32> = Some(1);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let counter = Arc::new(AtomicI64::new(10));

    let server = Dispatcher::builder()
        .handle_fn(move |msg: IncrementCounter, ctx| {
            let counter = Arc::clone(&counter);
            async move {
                if let Some(user) = ctx.context().downstream().get("user") {
                    tracing::info!("Increment requested by {}", user);
                }
                ctx.context().upstream().set("served-by", "counter-service");
                Ok(counter.fetch_add(msg.amount, Ordering::SeqCst) + msg.amount)
            }
        })
        .pipeline::<IncrementCounter, _>(|p| {
            let logging = LoggingMiddleware::new().response_payload(PayloadLogging::IndentedJson);
            p.use_middleware(logging)?;
            Ok(())
        })
        .build()?;

    // In process
    let value = server.dispatch(IncrementCounter { amount: 5 }).await?;
    println!("in-process: {value}");

    let receiver = HttpMessageReceiver::new(server).map::<IncrementCounter>()?;
    for (method, path) in receiver.routes() {
        println!("mapped {method} {path}");
    }

    let client = Dispatcher::builder()
        .transport(HttpTransportClient::<IncrementCounter, _>::with_sender(
            receiver,
            HttpTransportConfig::new("http://localhost:8080"),
        )?)
        .pipeline::<IncrementCounter, _>(|p| {
            let retry = RetryMiddleware::new().max_attempts(3).delay(Duration::from_millis(50));
            p.use_middleware(retry)?;
            Ok(())
        })
        .build()?;

    let context = ConquerorContext::new();
    context.downstream().set("user", "demo");

    let value = client
        .dispatch_with(IncrementCounter { amount: 5 }, context.clone(), Cancellation::new())
        .await?;
    println!(
        "over http: {value} (served by {})",
        context.upstream().get("served-by").unwrap_or_default()
    );

    Ok(())
}
