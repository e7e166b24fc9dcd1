//! JSON codec using `serde_json`.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::WireCodec;
use crate::error::Result;

/// JSON codec for HTTP payloads.
///
/// An empty input decodes as JSON `null`, so unit responses may travel with
/// an empty body.
pub struct JsonCodec;

impl WireCodec for JsonCodec {
    const CONTENT_TYPE: &'static str = "application/json";

    #[inline]
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::from_value(serde_json::Value::Null)?);
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}
