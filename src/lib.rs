//! # conqueror
//!
//! Message dispatch core for commands, queries, streaming requests and
//! notifications.
//!
//! Every message type has exactly one handler, either local or a transport
//! client that forwards the message to a remote process. Dispatch runs the
//! message through a per-type middleware pipeline before it reaches the
//! handler. Notifications fan out to any number of subscribers.
//!
//! ## Architecture
//!
//! - **Registry**: one route per message type, resolved by `TypeId`
//! - **Pipeline**: ordered middleware chain, frozen on first dispatch
//! - **Context**: key/value data shared across one call tree, with directional
//!   propagation over transports
//! - **Transports**: HTTP ([`transport::http`]) and length-prefixed frames over
//!   any async byte stream ([`transport::framed`])
//!
//! ## Example
//!
//! ```
//! use conqueror::handler::handler_fn;
//! use conqueror::middleware::LoggingMiddleware;
//! use conqueror::{Dispatcher, Message};
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct IncrementCounter {
//!     amount: i64,
//! }
//!
//! impl Message for IncrementCounter {
//!     type Response = i64;
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> conqueror::Result<()> {
//! let dispatcher = Dispatcher::builder()
//!     .handle(handler_fn(|msg: IncrementCounter, _ctx| async move { Ok(10 + msg.amount) }))
//!     .pipeline::<IncrementCounter, _>(|p| {
//!         p.use_middleware(LoggingMiddleware::new())?;
//!         Ok(())
//!     })
//!     .build()?;
//!
//! assert_eq!(dispatcher.dispatch(IncrementCounter { amount: 5 }).await?, 15);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod cancellation;
pub mod codec;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod message;
pub mod middleware;
pub mod pipeline;
pub mod transport;

pub use builder::ConquerorBuilder;
pub use cancellation::Cancellation;
pub use context::{ConquerorContext, ContextScope, DataScope, Direction, Principal};
pub use dispatcher::Dispatcher;
pub use error::{ConquerorError, Result};
pub use handler::RequestContext;
pub use message::{Message, Notification, ResponseStream, StreamingRequest};
pub use transport::TransportType;
