//! Notifications - one event, several subscribers.
//!
//! This example demonstrates:
//! - Registering observers with `observe` and `observe_with`
//! - A per-subscriber pipeline
//! - Publishing from inside a command handler, reusing its context
//!
//! ```sh
//! RUST_LOG=debug cargo run --example notifications
//! ```

use conqueror::handler::notification_handler_fn;
use conqueror::middleware::LoggingMiddleware;
use conqueror::{Dispatcher, Message, Notification};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct ResetCounter {
    name: String,
}

impl Message for ResetCounter {
    type Response = ();
}

#[derive(Debug, Clone, Serialize)]
struct CounterReset {
    name: String,
}

impl Notification for CounterReset {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dispatcher = Dispatcher::builder()
        .handle_fn(|msg: ResetCounter, ctx| async move {
            ctx.context().set("reset-by", "admin");
            ctx.publish(CounterReset { name: msg.name }).await
        })
        .observe(notification_handler_fn(|event: CounterReset, _ctx| async move {
            println!("cache: dropping entry for {}", event.name);
            Ok(())
        }))
        .observe_with(
            notification_handler_fn(|event: CounterReset, ctx| async move {
                let by = ctx.context().get("reset-by").unwrap_or_default();
                println!("audit: {} was reset by {by}", event.name);
                Ok(())
            }),
            |p| {
                p.use_middleware(LoggingMiddleware::new())?;
                Ok(())
            },
        )
        .build()?;

    dispatcher
        .dispatch(ResetCounter {
            name: "visits".to_string(),
        })
        .await?;

    // No subscriber is not an error.
    #[derive(Clone)]
    struct Unobserved;
    impl Notification for Unobserved {}
    dispatcher.publish(Unobserved).await?;

    Ok(())
}
