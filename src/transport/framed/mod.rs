//! MessagePack over length-prefixed frames.
//!
//! Works on any ordered byte stream (`tokio::net::TcpStream`, a Unix socket,
//! child process pipes, `tokio::io::duplex`). Each connection multiplexes any
//! number of concurrent requests, told apart by request ID.
//!
//! Every frame is a 9-byte header followed by its payload:
//!
//! | Frame               | Flags                                  | Payload             |
//! |---------------------|----------------------------------------|---------------------|
//! | unary request       | `0`                                    | [`RequestEnvelope`] |
//! | streaming request   | `STREAM`                               | [`RequestEnvelope`] |
//! | unary response      | `RESPONSE`                             | [`ResponseEnvelope`]|
//! | error response      | `RESPONSE \| ERROR`                    | [`ErrorEnvelope`]   |
//! | stream item         | `RESPONSE \| STREAM`                   | encoded item        |
//! | stream end          | `RESPONSE \| STREAM \| STREAM_END`     | [`ResponseEnvelope`]|
//! | stream error        | `RESPONSE \| STREAM \| STREAM_END \| ERROR` | [`ErrorEnvelope`] |
//! | abort               | `ABORT`                                | empty               |
//!
//! The client sends ABORT when a request is cancelled or its future (or
//! response stream) is dropped; the receiver then cancels the handler.
//!
//! # Example
//!
//! ```no_run
//! use conqueror::config::FramedConfig;
//! use conqueror::transport::framed::{FramedConnection, FramedTransportClient};
//! use conqueror::{Dispatcher, Message};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Ping;
//!
//! impl Message for Ping {
//!     type Response = String;
//! }
//!
//! # async fn run() -> conqueror::error::Result<()> {
//! let socket = tokio::net::TcpStream::connect("127.0.0.1:7000").await?;
//! let connection = FramedConnection::connect(socket, &FramedConfig::default());
//!
//! let dispatcher = Dispatcher::builder()
//!     .transport(FramedTransportClient::<Ping>::new(connection))
//!     .build()?;
//!
//! let pong = dispatcher.dispatch(Ping).await?;
//! # Ok(())
//! # }
//! ```

mod connection;
mod envelope;
mod frame;
mod frame_buffer;
mod receiver;
mod wire_format;
mod writer;

pub use connection::{FramedConnection, FramedStreamClient, FramedTransportClient};
pub use envelope::{ErrorEnvelope, ErrorKind, RequestEnvelope, ResponseEnvelope};
pub use frame::Frame;
pub use frame_buffer::FrameBuffer;
pub use receiver::FramedReceiver;
pub use wire_format::{flags, Header, HEADER_SIZE, RESERVED_REQUEST_ID};
pub use writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Name of the framed transport.
pub const FRAMED: &str = "framed";
