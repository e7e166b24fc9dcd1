//! Message shapes dispatched through the core.
//!
//! A message type declares its response through an associated type, so the
//! compiler ties every dispatch to exactly one response type:
//!
//! ```
//! use conqueror::Message;
//!
//! struct IncrementCounter {
//!     amount: i64,
//! }
//!
//! impl Message for IncrementCounter {
//!     type Response = i64;
//! }
//!
//! assert_eq!(IncrementCounter::name(), "IncrementCounter");
//! ```
//!
//! Messages without a response use `()`.

use futures::stream::BoxStream;

use crate::error::Result;

/// A command or query with exactly one handler.
pub trait Message: Send + 'static {
    /// Response produced by the handler (`()` for fire-and-forget commands).
    type Response: Send + 'static;

    /// Stable name used for logging and as a routing key.
    ///
    /// Defaults to the unqualified type name.
    fn name() -> &'static str {
        short_type_name::<Self>()
    }
}

/// A request answered with a lazy, finite sequence of items.
pub trait StreamingRequest: Send + 'static {
    /// Item type of the response stream.
    type Item: Send + 'static;

    /// Stable name used for logging and as a routing key.
    fn name() -> &'static str {
        short_type_name::<Self>()
    }
}

/// An event delivered to zero or more subscribers.
///
/// Notifications are cloned once per subscriber.
pub trait Notification: Clone + Send + Sync + 'static {
    /// Stable name used for logging.
    fn name() -> &'static str {
        short_type_name::<Self>()
    }
}

/// Lazy sequence of items produced by a streaming handler.
pub type ResponseStream<T> = BoxStream<'static, Result<T>>;

/// Last path segment of a type name, without generic arguments.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
