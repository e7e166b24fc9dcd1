//! Codec module - serialization of messages and responses on the wire.
//!
//! - [`JsonCodec`] - JSON using `serde_json` (HTTP binding)
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (framed binding)
//!
//! # Design
//!
//! Codecs are marker structs implementing [`WireCodec`] with associated
//! functions rather than trait objects, so transports select their codec at
//! compile time.
//!
//! # Example
//!
//! ```
//! use conqueror::codec::{JsonCodec, MsgPackCodec, WireCodec};
//!
//! let encoded = JsonCodec::encode(&42i64).unwrap();
//! assert_eq!(&encoded[..], b"42");
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod json;
mod msgpack;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

/// Serialization used by a transport for message and response payloads.
pub trait WireCodec: Send + Sync + 'static {
    /// MIME type of the encoded form.
    const CONTENT_TYPE: &'static str;

    /// Encode a value.
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes>;

    /// Decode a value.
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}
