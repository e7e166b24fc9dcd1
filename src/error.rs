//! Error types for conqueror.

use thiserror::Error;

/// Boxed business error raised by a handler or middleware.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for all dispatch and transport operations.
#[derive(Debug, Error)]
pub enum ConquerorError {
    /// No handler or transport client is registered for the message type.
    #[error("no handler registered for message type `{0}`")]
    HandlerNotFound(&'static str),

    /// A second handler was registered for a message type that allows only one.
    #[error("a handler is already registered for message type `{0}`")]
    DuplicateRegistration(&'static str),

    /// The pipeline was mutated after it was frozen by the first dispatch.
    #[error("pipeline for `{0}` is frozen and cannot be reconfigured")]
    PipelineFrozen(&'static str),

    /// A pipeline operation referenced a middleware type that is not present.
    #[error("middleware `{0}` is not part of the pipeline")]
    MiddlewareNotFound(&'static str),

    /// A middleware invoked the next step in violation of its contract.
    #[error("middleware contract violation: {0}")]
    MiddlewareContractViolation(String),

    /// Network, protocol or remote failure reported by a transport.
    #[error(
        "transport `{transport}` failed{}: {message}",
        .status.map(|s| format!(" with status {s}")).unwrap_or_default()
    )]
    TransportFailure {
        /// Name of the transport that failed.
        transport: String,
        /// Remote status code, if the transport has one.
        status: Option<u16>,
        /// Human readable failure description.
        message: String,
    },

    /// The operation requires an authenticated principal and none was present.
    #[error("`{0}` requires an authenticated principal")]
    Unauthenticated(&'static str),

    /// The principal may not execute the operation.
    #[error(
        "principal `{principal}` is not authorized to execute `{operation}`: {}",
        .reasons.join("; ")
    )]
    Unauthorized {
        /// Type name of the rejected operation.
        operation: &'static str,
        /// Name of the rejected principal.
        principal: String,
        /// One entry per failed check.
        reasons: Vec<String>,
    },

    /// The dispatch was cancelled cooperatively.
    #[error("dispatch was cancelled")]
    Cancelled,

    /// Formatted context data could not be decoded.
    #[error("invalid formatted context data: {0}")]
    InvalidContextData(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// I/O error on a stream transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol violation (invalid frame, oversized payload, ...).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Error raised by handler or middleware business logic.
    #[error("{0}")]
    Handler(#[source] BoxError),

    /// One or more notification subscribers failed.
    #[error("{} notification subscriber(s) failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<ConquerorError>),
}

impl ConquerorError {
    /// Wrap a business error raised by a handler.
    pub fn handler<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Handler(error.into())
    }

    /// Build a transport failure.
    pub fn transport(
        transport: impl Into<String>,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self::TransportFailure {
            transport: transport.into(),
            status,
            message: message.into(),
        }
    }

    /// Whether this error is a cancellation outcome rather than a failure.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error was reported by a transport.
    #[inline]
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::TransportFailure { .. })
    }

    /// Whether the caller was rejected by an authorization check.
    #[inline]
    pub fn is_authorization_failure(&self) -> bool {
        matches!(self, Self::Unauthenticated(_) | Self::Unauthorized { .. })
    }

    /// Whether the error stems from malformed input on the wire.
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            Self::InvalidContextData(_) | Self::Json(_) | Self::MsgPackDecode(_)
        )
    }
}

fn join_errors(errors: &[ConquerorError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias using ConquerorError.
pub type Result<T> = std::result::Result<T, ConquerorError>;
