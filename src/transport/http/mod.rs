//! HTTP transport - JSON messages over HTTP requests.
//!
//! A message type opts in by implementing [`HttpMessage`], which derives the
//! request method and path. The client side is [`HttpTransportClient`]; the
//! server side is [`HttpMessageReceiver`], which maps incoming requests onto
//! a dispatcher.
//!
//! # Headers
//!
//! | Header              | Content                                      |
//! |---------------------|----------------------------------------------|
//! | `conqueror-context` | formatted context data (downstream/upstream) |
//! | `traceparent`       | `00-{trace_id}-{span_id}-01`                  |
//! | `content-type`      | `application/json`                           |
//!
//! Unit responses travel with an empty body. Failures are reported through
//! the status code and surface on the client as
//! [`ConquerorError::TransportFailure`](crate::ConquerorError::TransportFailure).

mod client;
mod message;
mod query;
mod server;

use ulid::Ulid;

pub use client::{HttpSender, HttpTransportClient, ReqwestSender};
pub use message::{derive_path, HttpMessage};
pub use server::HttpMessageReceiver;

/// Transport name reported in [`TransportType`](crate::TransportType).
pub const HTTP: &str = "http";

/// Build a W3C `traceparent` value for a trace ID with a fresh span ID.
pub fn format_traceparent(trace_id: &str) -> String {
    let span_id = Ulid::new().0 as u64;
    format!("00-{trace_id}-{span_id:016x}-01")
}

/// Extract the trace ID from a `traceparent` value.
///
/// Returns `None` unless the value has four dash-separated parts and a
/// 32-digit hex trace ID.
pub fn parse_traceparent(value: &str) -> Option<&str> {
    let mut parts = value.trim().split('-');
    let _version = parts.next()?;
    let trace_id = parts.next()?;
    let _span_id = parts.next()?;
    let _flags = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let valid = trace_id.len() == 32 && trace_id.bytes().all(|b| b.is_ascii_hexdigit());
    valid.then_some(trace_id)
}
