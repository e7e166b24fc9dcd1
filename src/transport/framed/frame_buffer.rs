//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 9 bytes
//! - `WaitingForPayload`: Header parsed, need N more payload bytes

use bytes::{Bytes, BytesMut};

use super::frame::Frame;
use super::wire_format::{Header, HEADER_SIZE};
use crate::config::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::error::Result;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    WaitingForHeader,
    WaitingForPayload { header: Header, remaining: u32 },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_payload_size: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default payload limit.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if a header is invalid or announces a payload
    /// larger than the limit. The buffer is unusable afterwards.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        match &self.state {
            State::WaitingForHeader => {
                let header = match Header::decode(&self.buffer) {
                    Some(header) => header,
                    None => return Ok(None),
                };
                header.validate(self.max_payload_size)?;

                let _ = self.buffer.split_to(HEADER_SIZE);

                if header.payload_length == 0 {
                    return Ok(Some(Frame::new(header, Bytes::new())));
                }

                self.state = State::WaitingForPayload {
                    header,
                    remaining: header.payload_length,
                };
                self.try_extract_one()
            }

            State::WaitingForPayload { header, remaining } => {
                let remaining = *remaining as usize;
                if self.buffer.len() < remaining {
                    return Ok(None);
                }

                let payload = self.buffer.split_to(remaining).freeze();
                let header = *header;
                self.state = State::WaitingForHeader;

                Ok(Some(Frame::new(header, payload)))
            }
        }
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
