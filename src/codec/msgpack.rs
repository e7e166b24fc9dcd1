//! MsgPack codec using `rmp-serde`.
//!
//! Structs are always written with `to_vec_named` (struct-as-map), so
//! envelopes stay readable by peers that do not share the Rust field order.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::WireCodec;
use crate::error::Result;

/// MessagePack codec for framed payloads.
pub struct MsgPackCodec;

impl WireCodec for MsgPackCodec {
    const CONTENT_TYPE: &'static str = "application/msgpack";

    #[inline]
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
        // to_vec_named, NOT to_vec
        Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
    }

    #[inline]
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
