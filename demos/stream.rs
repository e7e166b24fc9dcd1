//! Stream - a streaming request over the framed transport on TCP.
//!
//! This example demonstrates:
//! - Serving routes with `FramedReceiver` on a `TcpListener`
//! - Connecting with `FramedConnection` and registering transport clients
//! - Consuming a remote response stream item by item
//! - Aborting a stream early by dropping it
//!
//! ```sh
//! RUST_LOG=debug cargo run --example stream
//! ```

use std::time::Duration;

use conqueror::config::FramedConfig;
use conqueror::transport::framed::{
    FramedConnection, FramedReceiver, FramedStreamClient, FramedTransportClient,
};
use conqueror::{ConquerorError, Dispatcher, Message, StreamingRequest};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct Countdown {
    from: u32,
}

impl StreamingRequest for Countdown {
    type Item = u32;
}

#[derive(Debug, Serialize, Deserialize)]
struct Ping;

impl Message for Ping {
    type Response = String;
}

async fn start_server() -> Result<String, Box<dyn std::error::Error>> {
    let dispatcher = Dispatcher::builder()
        .handle_fn(|_: Ping, _ctx| async { Ok("pong".to_string()) })
        .handle_stream(conqueror::handler::stream_handler_fn(|req: Countdown, _ctx| async move {
            Ok(futures::stream::iter((0..=req.from).rev()).then(|n| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<u32, ConquerorError>(n)
            }))
        }))
        .build()?;

    let receiver = FramedReceiver::new(dispatcher)
        .map::<Ping>()?
        .map_stream::<Countdown>()?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?.to_string();

    tokio::spawn(async move {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("accept failed: {}", e);
                    return;
                }
            };
            tracing::info!("Accepted connection from {}", peer);
            let receiver = receiver.clone();
            tokio::spawn(async move { receiver.serve(socket).await });
        }
    });

    Ok(address)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let address = start_server().await?;

    let socket = TcpStream::connect(&address).await?;
    let connection = FramedConnection::connect(socket, &FramedConfig::default());

    let client = Dispatcher::builder()
        .transport(FramedTransportClient::<Ping>::new(connection.clone()))
        .stream_transport(FramedStreamClient::<Countdown>::new(connection.clone()))
        .build()?;

    println!("ping: {}", client.dispatch(Ping).await?);

    let mut countdown = client.dispatch_stream(Countdown { from: 3 }).await?;
    while let Some(n) = countdown.next().await {
        println!("countdown: {}", n?);
    }

    // Dropping the stream early sends ABORT to the server.
    let mut long = client.dispatch_stream(Countdown { from: 100 }).await?;
    if let Some(first) = long.next().await {
        println!("long countdown started at {}", first?);
    }
    drop(long);

    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("requests in flight: {}", connection.in_flight());

    Ok(())
}
