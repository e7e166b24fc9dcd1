//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.

use bytes::Bytes;

use super::wire_format::Header;

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn request_id(&self) -> u32 {
        self.header.request_id
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.header.flags
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.header.is_response()
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.header.is_error()
    }

    #[inline]
    pub fn is_stream(&self) -> bool {
        self.header.is_stream()
    }

    #[inline]
    pub fn is_stream_end(&self) -> bool {
        self.header.is_stream_end()
    }

    #[inline]
    pub fn is_abort(&self) -> bool {
        self.header.is_abort()
    }
}
