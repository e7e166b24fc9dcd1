//! Client side of the framed transport.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use super::envelope::{ErrorEnvelope, RequestEnvelope, ResponseEnvelope};
use super::frame::Frame;
use super::frame_buffer::FrameBuffer;
use super::wire_format::flags;
use super::writer::{spawn_writer_task, OutboundFrame, WriterHandle};
use super::FRAMED;
use crate::codec::{MsgPackCodec, WireCodec};
use crate::config::FramedConfig;
use crate::context::ConquerorContext;
use crate::error::{ConquerorError, Result};
use crate::handler::{BoxFuture, RequestContext};
use crate::message::{Message, ResponseStream, StreamingRequest};
use crate::transport::{StreamTransportClient, TransportClient, TransportType};

enum Pending {
    Unary(oneshot::Sender<Frame>),
    Stream(mpsc::UnboundedSender<Frame>),
}

#[derive(Default)]
struct PendingTable {
    requests: Mutex<HashMap<u32, Pending>>,
    closed: AtomicBool,
}

impl PendingTable {
    fn insert(&self, id: u32, pending: Pending) -> Result<()> {
        let mut requests = self.requests.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(ConquerorError::ConnectionClosed);
        }
        requests.insert(id, pending);
        Ok(())
    }

    fn remove(&self, id: u32) -> bool {
        self.requests.lock().remove(&id).is_some()
    }

    /// Route a response frame to its waiter.
    fn deliver(&self, frame: Frame) {
        let id = frame.request_id();
        let mut requests = self.requests.lock();

        let waiter = if frame.header.is_final() {
            requests.remove(&id)
        } else {
            match requests.get(&id) {
                Some(Pending::Stream(tx)) => {
                    if tx.send(frame).is_err() {
                        requests.remove(&id);
                    }
                    return;
                }
                _ => requests.remove(&id),
            }
        };

        match waiter {
            Some(Pending::Unary(tx)) => {
                let _ = tx.send(frame);
            }
            Some(Pending::Stream(tx)) => {
                let _ = tx.send(frame);
            }
            None => tracing::debug!("Dropping frame for unknown request {}", id),
        }
    }

    /// Fail every waiter; later requests are rejected.
    fn close(&self) {
        let drained = {
            let mut requests = self.requests.lock();
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut *requests)
        };
        if !drained.is_empty() {
            tracing::warn!("Connection closed with {} request(s) in flight", drained.len());
        }
    }
}

/// Sends ABORT for a request unless disarmed.
struct AbortGuard {
    pending: Arc<PendingTable>,
    writer: WriterHandle,
    id: u32,
    armed: bool,
}

impl AbortGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.pending.remove(self.id) {
            tracing::debug!("Aborting request {}", self.id);
            if let Err(e) = self.writer.try_send(OutboundFrame::empty(flags::ABORT, self.id)) {
                tracing::warn!("Could not send ABORT for request {}: {}", self.id, e);
            }
        }
    }
}

/// Client end of a framed connection.
///
/// Multiplexes any number of concurrent requests over one byte stream.
/// Cloning is cheap; clones share the connection. The connection closes
/// once every clone is dropped or the peer closes the stream.
#[derive(Clone)]
pub struct FramedConnection {
    writer: WriterHandle,
    pending: Arc<PendingTable>,
    next_id: Arc<AtomicU32>,
    max_payload_size: usize,
}

impl FramedConnection {
    /// Start the reader and writer tasks over `stream`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn connect<S>(stream: S, config: &FramedConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (writer, _writer_task) = spawn_writer_task(writer, config.channel_capacity);
        let pending = Arc::new(PendingTable::default());

        tokio::spawn(read_loop(reader, Arc::clone(&pending), config.max_payload_size));

        Self {
            writer,
            pending,
            next_id: Arc::new(AtomicU32::new(1)),
            max_payload_size: config.max_payload_size,
        }
    }

    /// Whether the peer closed the connection.
    pub fn is_closed(&self) -> bool {
        self.pending.closed.load(Ordering::Acquire)
    }

    /// Number of requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.pending.requests.lock().len()
    }

    fn next_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn request_frame(
        &self,
        id: u32,
        stream: bool,
        route: &str,
        body: Bytes,
        context: &ConquerorContext,
    ) -> Result<OutboundFrame> {
        let envelope = RequestEnvelope {
            route: route.to_string(),
            context: context.encode_downstream(),
            trace_id: context.trace_id(),
            body: body.to_vec(),
        };
        let request_flags = if stream { flags::STREAM } else { 0 };
        let payload = MsgPackCodec::encode(&envelope)?;
        OutboundFrame::new(request_flags, id, payload, self.max_payload_size)
    }

    async fn start(&self, id: u32, pending: Pending, frame: OutboundFrame) -> Result<AbortGuard> {
        self.pending.insert(id, pending)?;
        let guard = AbortGuard {
            pending: Arc::clone(&self.pending),
            writer: self.writer.clone(),
            id,
            armed: true,
        };
        self.writer.send(frame).await?;
        Ok(guard)
    }

    /// Send a unary request and await the encoded response.
    ///
    /// Upstream context in the response is merged into the caller's context.
    pub async fn call(&self, route: &str, body: Bytes, ctx: &RequestContext) -> Result<Bytes> {
        let id = self.next_id();
        let frame = self.request_frame(id, false, route, body, ctx.context())?;
        let (tx, rx) = oneshot::channel();

        let response = ctx
            .cancellation()
            .run(async {
                let guard = self.start(id, Pending::Unary(tx), frame).await?;
                let frame = rx.await.map_err(|_| ConquerorError::ConnectionClosed)?;
                guard.disarm();
                Ok(frame)
            })
            .await?;

        if response.is_error() {
            let envelope: ErrorEnvelope = MsgPackCodec::decode(response.payload())?;
            return Err(envelope.into_error());
        }

        let envelope: ResponseEnvelope = MsgPackCodec::decode(response.payload())?;
        if let Some(encoded) = &envelope.context {
            ctx.context().decode(encoded)?;
        }
        Ok(Bytes::from(envelope.body))
    }

    /// Send a streaming request and open its item stream.
    ///
    /// Resolves on the first frame from the receiver: an item, the end of
    /// the stream or a rejection. Dropping the returned stream before it
    /// ends aborts the request.
    pub async fn open_stream<T>(
        &self,
        route: &str,
        body: Bytes,
        ctx: &RequestContext,
    ) -> Result<ResponseStream<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let id = self.next_id();
        let frame = self.request_frame(id, true, route, body, ctx.context())?;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (guard, first) = ctx
            .cancellation()
            .run(async {
                let guard = self.start(id, Pending::Stream(tx), frame).await?;
                let first = rx.recv().await.ok_or(ConquerorError::ConnectionClosed)?;
                Ok((guard, first))
            })
            .await?;

        if first.is_error() {
            guard.disarm();
            let envelope: ErrorEnvelope = MsgPackCodec::decode(first.payload())?;
            return Err(envelope.into_error());
        }

        let state = StreamState {
            rx,
            guard: Some(guard),
            next: Some(first),
            context: ctx.context().clone(),
        };
        Ok(Box::pin(stream::unfold(state, next_item::<T>)))
    }
}

struct StreamState {
    rx: mpsc::UnboundedReceiver<Frame>,
    guard: Option<AbortGuard>,
    next: Option<Frame>,
    context: ConquerorContext,
}

async fn next_item<T: DeserializeOwned>(
    mut state: StreamState,
) -> Option<(Result<T>, StreamState)> {
    let guard = state.guard.take()?;

    let frame = match state.next.take() {
        Some(frame) => frame,
        None => match state.rx.recv().await {
            Some(frame) => frame,
            None => {
                guard.disarm();
                return Some((Err(ConquerorError::ConnectionClosed), state));
            }
        },
    };

    if frame.is_error() {
        guard.disarm();
        let error = match MsgPackCodec::decode::<ErrorEnvelope>(frame.payload()) {
            Ok(envelope) => envelope.into_error(),
            Err(e) => e,
        };
        return Some((Err(error), state));
    }

    if frame.is_stream_end() {
        guard.disarm();
        if let Ok(envelope) = MsgPackCodec::decode::<ResponseEnvelope>(frame.payload()) {
            if let Some(encoded) = &envelope.context {
                if let Err(e) = state.context.decode(encoded) {
                    return Some((Err(e), state));
                }
            }
        }
        return None;
    }

    let item = MsgPackCodec::decode(frame.payload());
    state.guard = Some(guard);
    Some((item, state))
}

async fn read_loop<R>(mut reader: R, pending: Arc<PendingTable>, max_payload_size: usize)
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_payload(max_payload_size);
    let mut buf = vec![0u8; 64 * 1024];

    let result: Result<()> = async {
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }

            for frame in frame_buffer.push(&buf[..n])? {
                if !frame.is_response() {
                    let id = frame.request_id();
                    tracing::warn!("Ignoring non-response frame for request {}", id);
                    continue;
                }
                pending.deliver(frame);
            }
        }
    }
    .await;

    if let Err(e) = result {
        tracing::error!("Framed connection read loop failed: {}", e);
    }
    pending.close();
}

/// Sends messages of type `M` over a [`FramedConnection`].
///
/// The receiver routes on [`Message::name`].
pub struct FramedTransportClient<M> {
    connection: FramedConnection,
    _message: PhantomData<fn() -> M>,
}

impl<M> FramedTransportClient<M> {
    pub fn new(connection: FramedConnection) -> Self {
        Self {
            connection,
            _message: PhantomData,
        }
    }
}

impl<M> TransportClient<M> for FramedTransportClient<M>
where
    M: Message + Serialize,
    M::Response: DeserializeOwned,
{
    fn transport_type(&self) -> TransportType {
        TransportType::client(FRAMED)
    }

    fn send(&self, message: M, ctx: RequestContext) -> BoxFuture<'static, Result<M::Response>> {
        let connection = self.connection.clone();
        let body = MsgPackCodec::encode(&message);
        Box::pin(async move {
            let response = connection.call(M::name(), body?, &ctx).await?;
            MsgPackCodec::decode(&response)
        })
    }
}

/// Opens remote response streams for requests of type `M`.
pub struct FramedStreamClient<M> {
    connection: FramedConnection,
    _message: PhantomData<fn() -> M>,
}

impl<M> FramedStreamClient<M> {
    pub fn new(connection: FramedConnection) -> Self {
        Self {
            connection,
            _message: PhantomData,
        }
    }
}

impl<M> StreamTransportClient<M> for FramedStreamClient<M>
where
    M: StreamingRequest + Serialize,
    M::Item: DeserializeOwned,
{
    fn transport_type(&self) -> TransportType {
        TransportType::client(FRAMED)
    }

    fn open(
        &self,
        request: M,
        ctx: RequestContext,
    ) -> BoxFuture<'static, Result<ResponseStream<M::Item>>> {
        let connection = self.connection.clone();
        let body = MsgPackCodec::encode(&request);
        Box::pin(async move { connection.open_stream(M::name(), body?, &ctx).await })
    }
}

impl std::fmt::Debug for FramedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedConnection")
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish()
    }
}
