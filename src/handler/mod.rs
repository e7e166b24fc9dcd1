//! Handler module - business logic bound to message types.
//!
//! Provides:
//! - [`MessageHandler`] - unary command/query handler (exactly one per type)
//! - [`StreamHandler`] - produces a lazy stream of items
//! - [`NotificationHandler`] - one of zero or more subscribers
//! - [`HandlerRegistry`] - maps message types to their routes
//! - [`RequestContext`] - per-dispatch view passed to handlers and middleware
//!
//! Closures can be registered through [`handler_fn`], [`stream_handler_fn`]
//! and [`notification_handler_fn`].
//!
//! # Example
//!
//! ```
//! use conqueror::handler::{handler_fn, MessageHandler};
//! use conqueror::Message;
//!
//! struct Add(i64, i64);
//!
//! impl Message for Add {
//!     type Response = i64;
//! }
//!
//! let handler = handler_fn(|msg: Add, _ctx| async move { Ok(msg.0 + msg.1) });
//! # fn assert_handler<H: MessageHandler<Add>>(_: &H) {}
//! # assert_handler(&handler);
//! ```

mod context;
mod registry;

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use futures::{Stream, StreamExt};

use crate::error::Result;
use crate::message::{Message, Notification, ResponseStream, StreamingRequest};

pub use context::RequestContext;
pub use registry::{HandlerRegistry, MessageRoute, ObserverRoute, StreamRoute};

/// Boxed future returned by handlers, middleware and transports.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handles one message type and produces its response.
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    /// Handle a message.
    fn handle(&self, message: M, ctx: RequestContext) -> BoxFuture<'static, Result<M::Response>>;
}

/// Handles a streaming request by producing a lazy sequence of items.
pub trait StreamHandler<M: StreamingRequest>: Send + Sync + 'static {
    /// Open the response stream for a request.
    fn handle(
        &self,
        request: M,
        ctx: RequestContext,
    ) -> BoxFuture<'static, Result<ResponseStream<M::Item>>>;
}

/// Subscriber for one notification type.
pub trait NotificationHandler<N: Notification>: Send + Sync + 'static {
    /// Handle a notification.
    fn handle(&self, notification: N, ctx: RequestContext) -> BoxFuture<'static, Result<()>>;
}

/// Closure adapter for [`MessageHandler`].
pub struct HandlerFn<F, M, Fut> {
    handler: F,
    _phantom: PhantomData<fn(M) -> Fut>,
}

/// Wrap a closure `(message, ctx) -> Future<Output = Result<Response>>`.
pub fn handler_fn<M, F, Fut>(handler: F) -> HandlerFn<F, M, Fut>
where
    M: Message,
    F: Fn(M, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<M::Response>> + Send + 'static,
{
    HandlerFn {
        handler,
        _phantom: PhantomData,
    }
}

impl<M, F, Fut> MessageHandler<M> for HandlerFn<F, M, Fut>
where
    M: Message,
    F: Fn(M, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<M::Response>> + Send + 'static,
{
    fn handle(&self, message: M, ctx: RequestContext) -> BoxFuture<'static, Result<M::Response>> {
        Box::pin((self.handler)(message, ctx))
    }
}

/// Closure adapter for [`StreamHandler`].
pub struct StreamHandlerFn<F, M, Fut> {
    handler: F,
    _phantom: PhantomData<fn(M) -> Fut>,
}

/// Wrap a closure `(request, ctx) -> Future<Output = Result<impl Stream>>`.
pub fn stream_handler_fn<M, F, Fut, S>(handler: F) -> StreamHandlerFn<F, M, Fut>
where
    M: StreamingRequest,
    F: Fn(M, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<S>> + Send + 'static,
    S: Stream<Item = Result<M::Item>> + Send + 'static,
{
    StreamHandlerFn {
        handler,
        _phantom: PhantomData,
    }
}

impl<M, F, Fut, S> StreamHandler<M> for StreamHandlerFn<F, M, Fut>
where
    M: StreamingRequest,
    F: Fn(M, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<S>> + Send + 'static,
    S: Stream<Item = Result<M::Item>> + Send + 'static,
{
    fn handle(
        &self,
        request: M,
        ctx: RequestContext,
    ) -> BoxFuture<'static, Result<ResponseStream<M::Item>>> {
        let fut = (self.handler)(request, ctx);
        Box::pin(async move { Ok(fut.await?.boxed()) })
    }
}

/// Closure adapter for [`NotificationHandler`].
pub struct NotificationHandlerFn<F, N, Fut> {
    handler: F,
    _phantom: PhantomData<fn(N) -> Fut>,
}

/// Wrap a closure `(notification, ctx) -> Future<Output = Result<()>>`.
pub fn notification_handler_fn<N, F, Fut>(handler: F) -> NotificationHandlerFn<F, N, Fut>
where
    N: Notification,
    F: Fn(N, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    NotificationHandlerFn {
        handler,
        _phantom: PhantomData,
    }
}

impl<N, F, Fut> NotificationHandler<N> for NotificationHandlerFn<F, N, Fut>
where
    N: Notification,
    F: Fn(N, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, notification: N, ctx: RequestContext) -> BoxFuture<'static, Result<()>> {
        Box::pin((self.handler)(notification, ctx))
    }
}
