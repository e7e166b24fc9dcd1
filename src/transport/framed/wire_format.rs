//! Wire format encoding and decoding.
//!
//! Implements the 9-byte header format:
//! ```text
//! ┌───────┬──────────┬──────────┐
//! │ Flags │ Req ID   │ Length   │
//! │ 1 byte│ 4 bytes  │ 4 bytes  │
//! │       │ uint32 BE│ uint32 BE│
//! └───────┴──────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use crate::error::{ConquerorError, Result};

/// Header size in bytes (fixed, exactly 9).
pub const HEADER_SIZE: usize = 9;

/// Reserved request ID (never use).
pub const RESERVED_REQUEST_ID: u32 = 0;

/// Flag constants for the protocol.
pub mod flags {
    /// Message type: response (1) or request (0).
    pub const RESPONSE: u8 = 0b0000_0001;
    /// Error flag: payload is an error envelope.
    pub const ERROR: u8 = 0b0000_0010;
    /// Stream flag: streaming request or stream item.
    pub const STREAM: u8 = 0b0000_0100;
    /// Stream end flag: final frame of a stream.
    pub const STREAM_END: u8 = 0b0000_1000;
    /// Abort flag: the sender gave up on the request.
    pub const ABORT: u8 = 0b0001_0000;

    /// Reserved bits mask (bits 5-7).
    pub const RESERVED_MASK: u8 = 0b1110_0000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }

    /// Unary error response: response + error = 0x03
    pub const ERROR_RESPONSE: u8 = RESPONSE | ERROR;
    /// Stream item: response + stream = 0x05
    pub const STREAM_ITEM: u8 = RESPONSE | STREAM;
    /// Successful end of stream: response + stream + stream_end = 0x0D
    pub const STREAM_END_RESPONSE: u8 = RESPONSE | STREAM | STREAM_END;
    /// Failed end of stream: response + error + stream + stream_end = 0x0F
    pub const STREAM_ERROR: u8 = RESPONSE | ERROR | STREAM | STREAM_END;
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Request identifier, unique per connection while in flight.
    pub request_id: u32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(flags: u8, request_id: u32, payload_length: u32) -> Self {
        Self {
            flags,
            request_id,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use conqueror::transport::framed::{flags, Header};
    ///
    /// let header = Header::new(flags::RESPONSE, 42, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes, [0x01, 0, 0, 0, 42, 0, 0, 0, 100]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.flags;
        buf[1..5].copy_from_slice(&self.request_id.to_be_bytes());
        buf[5..9].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            flags: buf[0],
            request_id: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
            payload_length: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Request ID is not 0 (reserved)
    /// - Payload length doesn't exceed max
    /// - Reserved flag bits are 0
    pub fn validate(&self, max_payload_size: usize) -> Result<()> {
        if self.request_id == RESERVED_REQUEST_ID {
            return Err(ConquerorError::Protocol(
                "Request ID 0 is reserved".to_string(),
            ));
        }

        if self.payload_length as usize > max_payload_size {
            return Err(ConquerorError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(ConquerorError::Protocol(
                "Reserved flag bits must be 0".to_string(),
            ));
        }

        Ok(())
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        flags::has_flag(self.flags, flags::RESPONSE)
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.flags, flags::ERROR)
    }

    #[inline]
    pub fn is_stream(&self) -> bool {
        flags::has_flag(self.flags, flags::STREAM)
    }

    #[inline]
    pub fn is_stream_end(&self) -> bool {
        flags::has_flag(self.flags, flags::STREAM_END)
    }

    #[inline]
    pub fn is_abort(&self) -> bool {
        flags::has_flag(self.flags, flags::ABORT)
    }

    /// Whether no further frames follow for this request ID.
    #[inline]
    pub fn is_final(&self) -> bool {
        !self.is_stream() || self.is_stream_end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(flags::STREAM_ITEM, 42, 100);
        let decoded = Header::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let bytes = Header::new(0x03, 0x04050607, 0x08090A0B).encode();
        assert_eq!(bytes, [0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(Header::decode(&[0u8; 8]).is_none());
    }

    #[test]
    fn test_validate_request_id_zero_rejected() {
        let err = Header::new(0, 0, 0).validate(1024).unwrap_err();
        assert!(err.to_string().contains("Request ID 0 is reserved"));
    }

    #[test]
    fn test_validate_payload_too_large() {
        let err = Header::new(0, 1, 1_000_000).validate(100).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_reserved_bits_must_be_zero() {
        let err = Header::new(0b1000_0000, 1, 0).validate(1024).unwrap_err();
        assert!(err.to_string().contains("Reserved flag bits"));
    }

    #[test]
    fn test_flag_combinations() {
        assert_eq!(flags::ERROR_RESPONSE, 0x03);
        assert_eq!(flags::STREAM_ITEM, 0x05);
        assert_eq!(flags::STREAM_END_RESPONSE, 0x0D);
        assert_eq!(flags::STREAM_ERROR, 0x0F);
    }

    #[test]
    fn test_header_accessors() {
        let end = Header::new(flags::STREAM_END_RESPONSE, 7, 0);
        assert!(end.is_response());
        assert!(end.is_stream());
        assert!(end.is_stream_end());
        assert!(end.is_final());
        assert!(!end.is_error());
        assert!(!end.is_abort());

        let item = Header::new(flags::STREAM_ITEM, 7, 3);
        assert!(!item.is_final());

        let unary = Header::new(flags::RESPONSE, 7, 3);
        assert!(unary.is_final());

        assert!(Header::new(flags::ABORT, 7, 0).is_abort());
    }
}
