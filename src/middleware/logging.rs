//! Structured logging around message execution.
//!
//! Emits one `tracing` event before execution and one after it (or one on
//! failure). Every event carries `message_id`, `trace_id`, `message_type` and
//! `transport`; post-execution and failure events also carry `elapsed_ms`.
//! Payloads are rendered as JSON according to [`PayloadLogging`].
//!
//! # Example
//!
//! ```
//! use conqueror::middleware::{LoggingMiddleware, PayloadLogging};
//! use tracing::Level;
//!
//! let logging = LoggingMiddleware::new()
//!     .pre_execution_level(Level::DEBUG)
//!     .message_payload(PayloadLogging::IndentedJson)
//!     .response_payload(PayloadLogging::Omit);
//! # let _ = logging;
//! ```

use std::time::Instant;

use serde::Serialize;
use tracing::level_filters::LevelFilter;
use tracing::Level;

use crate::error::Result;
use crate::handler::{BoxFuture, RequestContext};
use crate::message::short_type_name;
use crate::pipeline::{Middleware, Next};

/// How a payload is rendered into a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadLogging {
    /// Payload is not logged.
    Omit,
    /// Compact single-line JSON.
    #[default]
    MinimalJson,
    /// Pretty-printed JSON.
    IndentedJson,
}

/// Logs message execution with configurable levels and payload rendering.
#[derive(Debug, Clone)]
pub struct LoggingMiddleware {
    /// Level of the event emitted before execution.
    pub pre_execution_level: Level,
    /// Level of the event emitted after successful execution.
    pub post_execution_level: Level,
    /// Level of the event emitted when execution fails.
    pub error_level: Level,
    /// Rendering of the message payload.
    pub message_payload: PayloadLogging,
    /// Rendering of the response payload.
    pub response_payload: PayloadLogging,
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self {
            pre_execution_level: Level::INFO,
            post_execution_level: Level::INFO,
            error_level: Level::ERROR,
            message_payload: PayloadLogging::MinimalJson,
            response_payload: PayloadLogging::MinimalJson,
        }
    }
}

impl LoggingMiddleware {
    /// Create a logging middleware with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pre-execution level.
    pub fn pre_execution_level(mut self, level: Level) -> Self {
        self.pre_execution_level = level;
        self
    }

    /// Set the post-execution level.
    pub fn post_execution_level(mut self, level: Level) -> Self {
        self.post_execution_level = level;
        self
    }

    /// Set the failure level.
    pub fn error_level(mut self, level: Level) -> Self {
        self.error_level = level;
        self
    }

    /// Set the message payload rendering.
    pub fn message_payload(mut self, strategy: PayloadLogging) -> Self {
        self.message_payload = strategy;
        self
    }

    /// Set the response payload rendering.
    pub fn response_payload(mut self, strategy: PayloadLogging) -> Self {
        self.response_payload = strategy;
        self
    }
}

macro_rules! event_at {
    ($level:expr, $($args:tt)+) => {{
        let level = $level;
        if level == Level::ERROR {
            tracing::error!($($args)+);
        } else if level == Level::WARN {
            tracing::warn!($($args)+);
        } else if level == Level::INFO {
            tracing::info!($($args)+);
        } else if level == Level::DEBUG {
            tracing::debug!($($args)+);
        } else {
            tracing::trace!($($args)+);
        }
    }};
}

fn enabled(level: Level) -> bool {
    level <= LevelFilter::current()
}

/// Render `value`, or `None` if it is omitted or has no content.
fn render<T: Serialize>(value: &T, strategy: PayloadLogging) -> Option<String> {
    if std::mem::size_of::<T>() == 0 {
        return None;
    }
    let rendered = match strategy {
        PayloadLogging::Omit => return None,
        PayloadLogging::MinimalJson => serde_json::to_string(value),
        PayloadLogging::IndentedJson => serde_json::to_string_pretty(value),
    };
    Some(rendered.unwrap_or_else(|e| format!("<unserializable: {e}>")))
}

impl<M, R> Middleware<M, R> for LoggingMiddleware
where
    M: Serialize + Send + 'static,
    R: Serialize + Send + 'static,
{
    fn handle(
        &self,
        message: M,
        ctx: RequestContext,
        next: Next<M, R>,
    ) -> BoxFuture<'static, Result<R>> {
        let config = self.clone();
        Box::pin(async move {
            let message_type = short_type_name::<M>();
            let message_id = ctx.message_id().to_string();
            let trace_id = ctx.trace_id();
            let transport = ctx.transport_type();

            if enabled(config.pre_execution_level) {
                match render(&message, config.message_payload) {
                    Some(payload) => event_at!(
                        config.pre_execution_level,
                        message_id = %message_id,
                        trace_id = %trace_id,
                        message_type,
                        transport = %transport,
                        payload = %payload,
                        "Handling message"
                    ),
                    None => event_at!(
                        config.pre_execution_level,
                        message_id = %message_id,
                        trace_id = %trace_id,
                        message_type,
                        transport = %transport,
                        "Handling message"
                    ),
                }
            }

            let start = Instant::now();
            let result = next.run(message, ctx).await;
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

            match &result {
                Ok(response) if enabled(config.post_execution_level) => {
                    match render(response, config.response_payload) {
                        Some(payload) => event_at!(
                            config.post_execution_level,
                            message_id = %message_id,
                            trace_id = %trace_id,
                            message_type,
                            transport = %transport,
                            elapsed_ms,
                            payload = %payload,
                            "Handled message"
                        ),
                        None => event_at!(
                            config.post_execution_level,
                            message_id = %message_id,
                            trace_id = %trace_id,
                            message_type,
                            transport = %transport,
                            elapsed_ms,
                            "Handled message"
                        ),
                    }
                }
                Ok(_) => {}
                Err(error) => event_at!(
                    config.error_level,
                    message_id = %message_id,
                    trace_id = %trace_id,
                    message_type,
                    transport = %transport,
                    elapsed_ms,
                    error = %error,
                    "Message failed"
                ),
            }

            result
        })
    }
}
