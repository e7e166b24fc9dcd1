//! Pipeline module - ordered middleware chains.
//!
//! Every route owns a pipeline that is built from configuration closures and
//! frozen on the first dispatch. The frozen chain is shared by all later
//! dispatches of that route.
//!
//! ```text
//! caller -> m1 -> m2 -> m3 -> handler
//! caller <- m1 <- m2 <- m3 <-
//! ```
//!
//! # Example
//!
//! ```
//! use conqueror::handler::{BoxFuture, RequestContext};
//! use conqueror::pipeline::{Middleware, Next, Pipeline};
//! use conqueror::Result;
//!
//! struct Double;
//!
//! impl Middleware<i64, i64> for Double {
//!     fn handle(
//!         &self,
//!         message: i64,
//!         ctx: RequestContext,
//!         next: Next<i64, i64>,
//!     ) -> BoxFuture<'static, Result<i64>> {
//!         Box::pin(async move { Ok(next.run(message, ctx).await? * 2) })
//!     }
//! }
//!
//! let mut pipeline = Pipeline::<i64, i64>::new();
//! pipeline.use_middleware(Double).unwrap();
//! assert_eq!(pipeline.names(), vec!["Double"]);
//! ```

mod builder;
mod middleware;

pub use builder::{Configurator, FrozenPipeline, Pipeline};
pub use middleware::{
    middleware_fn, AnyMiddleware, Middleware, MiddlewareFn, Next, NextPolicy, RepeatableNext,
};

pub(crate) use builder::PipelineSlot;
pub(crate) use middleware::Terminal;

use crate::message::{Message, ResponseStream, StreamingRequest};

/// Pipeline of a unary message.
pub type MessagePipeline<M> = Pipeline<M, <M as Message>::Response>;

/// Pipeline of a streaming request.
pub type StreamPipeline<M> = Pipeline<M, ResponseStream<<M as StreamingRequest>::Item>>;

/// Pipeline of one notification subscriber.
pub type NotificationPipeline<N> = Pipeline<N, ()>;
