//! Request context for handlers and middleware.
//!
//! A [`RequestContext`] is created for every dispatch and handed down the
//! middleware chain to the handler (or transport client). It bundles:
//! - the shared [`ConquerorContext`] of the call tree
//! - the [`Cancellation`] token of the dispatch
//! - the [`TransportType`] the message is travelling over
//! - a unique message ID
//! - a [`Dispatcher`] handle for nested dispatches
//!
//! # Example
//!
//! ```ignore
//! async fn place_order(cmd: PlaceOrder, ctx: RequestContext) -> Result<OrderId> {
//!     ctx.context().set("order", cmd.id.to_string());
//!     // Nested dispatch shares context and cancellation
//!     ctx.publish(OrderPlaced { id: cmd.id }).await?;
//!     Ok(cmd.id)
//! }
//! ```

use ulid::Ulid;

use crate::cancellation::Cancellation;
use crate::context::ConquerorContext;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::message::{Message, Notification, ResponseStream, StreamingRequest};
use crate::transport::TransportType;

/// Per-dispatch context passed to middleware and handlers.
///
/// `RequestContext` is `Clone`; clones share the same context data and
/// cancellation token.
#[derive(Clone)]
pub struct RequestContext {
    dispatcher: Dispatcher,
    context: ConquerorContext,
    cancellation: Cancellation,
    transport: TransportType,
    message_id: String,
}

impl RequestContext {
    /// Create a context with a fresh message ID.
    pub fn new(
        dispatcher: Dispatcher,
        context: ConquerorContext,
        cancellation: Cancellation,
        transport: TransportType,
    ) -> Self {
        Self {
            dispatcher,
            context,
            cancellation,
            transport,
            message_id: generate_message_id(),
        }
    }

    /// Shared context data of this call tree.
    #[inline]
    pub fn context(&self) -> &ConquerorContext {
        &self.context
    }

    /// Cancellation token of this dispatch.
    #[inline]
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// Shorthand for `self.cancellation().is_cancelled()`.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Transport this message is travelling over.
    #[inline]
    pub fn transport_type(&self) -> TransportType {
        self.transport
    }

    /// Unique ID of this message.
    #[inline]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Trace ID of the call tree.
    pub fn trace_id(&self) -> String {
        self.context.trace_id()
    }

    /// Dispatcher that is executing this message.
    #[inline]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Dispatch a nested message sharing this context and cancellation.
    pub async fn dispatch<N: Message>(&self, message: N) -> Result<N::Response> {
        self.dispatcher
            .dispatch_with(message, self.context.clone(), self.cancellation.clone())
            .await
    }

    /// Dispatch a nested streaming request sharing this context and cancellation.
    pub async fn dispatch_stream<N: StreamingRequest>(
        &self,
        request: N,
    ) -> Result<ResponseStream<N::Item>> {
        self.dispatcher
            .dispatch_stream_with(request, self.context.clone(), self.cancellation.clone())
            .await
    }

    /// Publish a nested notification sharing this context and cancellation.
    pub async fn publish<N: Notification>(&self, notification: N) -> Result<()> {
        self.dispatcher
            .publish_with(notification, self.context.clone(), self.cancellation.clone())
            .await
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("message_id", &self.message_id)
            .field("transport", &self.transport)
            .field("cancelled", &self.is_cancelled())
            .field("context", &self.context)
            .finish()
    }
}

/// Generate a unique, lexicographically sortable message ID.
pub(crate) fn generate_message_id() -> String {
    Ulid::new().to_string()
}
