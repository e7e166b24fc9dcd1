//! Built-in middleware.
//!
//! - [`LoggingMiddleware`] - structured `tracing` events around execution
//! - [`RetryMiddleware`] - re-invokes the rest of the chain on failure
//! - [`AuthorizationMiddleware`] - rejects calls the current principal may not make

mod authorization;
mod logging;
mod retry;

pub use authorization::AuthorizationMiddleware;
pub use logging::{LoggingMiddleware, PayloadLogging};
pub use retry::RetryMiddleware;
