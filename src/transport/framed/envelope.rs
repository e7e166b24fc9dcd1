//! MessagePack payloads carried inside frames.

use serde::{Deserialize, Serialize};

use crate::error::ConquerorError;

use super::FRAMED;

/// Payload of a request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Message name the receiver routes on.
    pub route: String,
    /// Formatted downstream context, if any.
    pub context: Option<String>,
    /// Trace ID of the caller.
    pub trace_id: String,
    /// Encoded message.
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

/// Payload of a successful unary response or of a stream end frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResponseEnvelope {
    /// Formatted upstream context, if any.
    pub context: Option<String>,
    /// Encoded response (empty for stream ends).
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

/// Failure category reported by a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Undecodable message or context.
    BadRequest,
    /// No handler or route for the message.
    NotFound,
    /// The operation requires an authenticated principal.
    Unauthenticated,
    /// The principal may not execute the operation.
    Forbidden,
    /// The request was cancelled on the receiver.
    Cancelled,
    /// A transport further down the line failed.
    Transport,
    /// The receiver is at its concurrency limit.
    Overloaded,
    /// Handler or middleware failure.
    Handler,
}

impl ErrorKind {
    /// HTTP-style status code of this kind.
    pub fn status(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::Unauthenticated => 401,
            Self::Forbidden => 403,
            Self::Cancelled => 499,
            Self::Transport => 502,
            Self::Overloaded => 503,
            Self::Handler => 500,
        }
    }
}

/// Payload of an error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify a receiver-side error.
    pub fn from_error(error: &ConquerorError) -> Self {
        let kind = match error {
            e if e.is_bad_request() => ErrorKind::BadRequest,
            ConquerorError::HandlerNotFound(_) => ErrorKind::NotFound,
            ConquerorError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            ConquerorError::Unauthorized { .. } => ErrorKind::Forbidden,
            ConquerorError::Cancelled => ErrorKind::Cancelled,
            ConquerorError::TransportFailure { .. } => ErrorKind::Transport,
            _ => ErrorKind::Handler,
        };
        Self::new(kind, error.to_string())
    }

    /// Client-side error for this envelope.
    pub fn into_error(self) -> ConquerorError {
        ConquerorError::transport(FRAMED, Some(self.kind.status()), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MsgPackCodec, WireCodec};

    #[test]
    fn test_request_envelope_body_is_binary() {
        let envelope = RequestEnvelope {
            route: "IncrementCounter".to_string(),
            context: Some("d|a:1".to_string()),
            trace_id: "0123".to_string(),
            body: vec![0x81, 0xa1, 0x61, 0x01],
        };

        let encoded = MsgPackCodec::encode(&envelope).unwrap();
        // bin8 marker followed by the body length
        assert!(encoded.windows(2).any(|w| w == [0xc4, 0x04]));

        let decoded: RequestEnvelope = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_error_classification() {
        let cases = [
            (ConquerorError::HandlerNotFound("Ping"), ErrorKind::NotFound),
            (ConquerorError::Cancelled, ErrorKind::Cancelled),
            (ConquerorError::Unauthenticated("Ping"), ErrorKind::Unauthenticated),
            (
                ConquerorError::Unauthorized {
                    operation: "Ping",
                    principal: "bob".to_string(),
                    reasons: Vec::new(),
                },
                ErrorKind::Forbidden,
            ),
            (ConquerorError::InvalidContextData("x".into()), ErrorKind::BadRequest),
            (ConquerorError::transport("http", Some(503), "down"), ErrorKind::Transport),
            (ConquerorError::handler("boom"), ErrorKind::Handler),
        ];

        for (error, kind) in cases {
            assert_eq!(ErrorEnvelope::from_error(&error).kind, kind);
        }
    }

    #[test]
    fn test_into_error_carries_status() {
        let err = ErrorEnvelope::new(ErrorKind::NotFound, "no handler").into_error();
        match err {
            ConquerorError::TransportFailure {
                transport,
                status,
                message,
            } => {
                assert_eq!(transport, FRAMED);
                assert_eq!(status, Some(404));
                assert_eq!(message, "no handler");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
