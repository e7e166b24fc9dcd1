//! Dedicated writer task for outbound frames.
//!
//! Every frame of a connection goes through one mpsc channel to a single
//! writer task, which batches ready frames into vectored writes.
//!
//! ```text
//! Request 1 ─┐
//! Request 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Stream
//! Abort     ─┘
//! ```

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::wire_format::{Header, HEADER_SIZE};
use crate::error::{ConquerorError, Result};

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header.
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (empty for ABORT and STREAM_END).
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Build a frame, checking that the payload fits the length field and the limit.
    pub fn new(
        flags: u8,
        request_id: u32,
        payload: Bytes,
        max_payload_size: usize,
    ) -> Result<Self> {
        if payload.len() > max_payload_size {
            return Err(ConquerorError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                payload.len(),
                max_payload_size
            )));
        }
        let length = u32::try_from(payload.len()).map_err(|_| {
            ConquerorError::Protocol(format!("Payload size {} overflows u32", payload.len()))
        })?;

        Ok(Self {
            header: Header::new(flags, request_id, length).encode(),
            payload,
        })
    }

    /// Build a frame with an empty payload.
    #[inline]
    pub fn empty(flags: u8, request_id: u32) -> Self {
        Self {
            header: Header::new(flags, request_id, 0).encode(),
            payload: Bytes::new(),
        }
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Handle for sending frames to the writer task.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
}

impl WriterHandle {
    /// Queue a frame, waiting for channel capacity.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| ConquerorError::ConnectionClosed)
    }

    /// Queue a frame without waiting. Used where awaiting is impossible (drop).
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ConquerorError::Protocol("outbound frame queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => ConquerorError::ConnectionClosed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends, shutting the writer down, once every handle is dropped.
pub fn spawn_writer_task<W>(
    writer: W,
    channel_capacity: usize,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(channel_capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundFrame>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::error!("Frame writer failed: {}", e);
            return Err(e);
        }
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(ConquerorError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data after `skip_bytes`.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        let header_end = offset + HEADER_SIZE;
        if skip_bytes < header_end {
            slices.push(IoSlice::new(&frame.header[skip_bytes.saturating_sub(offset)..]));
        }
        offset = header_end;

        if !frame.payload.is_empty() {
            let payload_end = offset + frame.payload.len();
            if skip_bytes < payload_end {
                slices.push(IoSlice::new(&frame.payload[skip_bytes.saturating_sub(offset)..]));
            }
            offset = payload_end;
        }
    }

    slices
}
