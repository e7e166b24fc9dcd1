//! HTTP metadata of a message type.

use http::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::message::Message;

/// A message that can travel over the HTTP transport.
///
/// Every item has a default; most messages only need an empty impl:
///
/// ```
/// use conqueror::transport::http::HttpMessage;
/// use conqueror::Message;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct IncrementCounterMessage {
///     amount: i64,
/// }
///
/// impl Message for IncrementCounterMessage {
///     type Response = i64;
/// }
///
/// impl HttpMessage for IncrementCounterMessage {
///     const VERSION: Option<u32> = Some(2);
/// }
///
/// assert_eq!(IncrementCounterMessage::full_path(), "/api/v2/incrementCounter");
/// ```
pub trait HttpMessage: Message + Serialize + DeserializeOwned {
    /// Request method. `GET` messages are sent in the query string.
    const METHOD: Method = Method::POST;

    /// Leading path segment(s).
    const PATH_PREFIX: &'static str = "/api";

    /// API version, rendered as a `/v{n}` segment after the prefix.
    const VERSION: Option<u32> = None;

    /// Path segment of this message. Derived from the type name if unset.
    const PATH: Option<&'static str> = None;

    /// Complete path, overriding prefix, version and path.
    const FULL_PATH: Option<&'static str> = None;

    /// Status code of a successful response.
    const SUCCESS_STATUS: StatusCode = StatusCode::OK;

    /// Request path of this message.
    fn full_path() -> String {
        match Self::FULL_PATH {
            Some(path) => path.to_string(),
            None => derive_path(Self::name(), Self::PATH_PREFIX, Self::VERSION, Self::PATH),
        }
    }
}

/// Compose `{prefix}[/v{version}]/{path}`.
///
/// Without an explicit path, the message name is used with a trailing
/// `Message` suffix removed and the first letter lowercased.
pub fn derive_path(name: &str, prefix: &str, version: Option<u32>, path: Option<&str>) -> String {
    let mut out = String::new();

    let prefix = prefix.trim_matches('/');
    if !prefix.is_empty() {
        out.push('/');
        out.push_str(prefix);
    }

    if let Some(version) = version {
        out.push_str(&format!("/v{version}"));
    }

    out.push('/');
    match path {
        Some(path) => out.push_str(path.trim_start_matches('/')),
        None => out.push_str(&default_segment(name)),
    }
    out
}

fn default_segment(name: &str) -> String {
    let base = match name.strip_suffix("Message") {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => name,
    };

    let mut chars = base.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
