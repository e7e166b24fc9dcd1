//! Server side of the framed transport.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::Semaphore;

use super::envelope::{ErrorEnvelope, ErrorKind, RequestEnvelope, ResponseEnvelope};
use super::frame::Frame;
use super::frame_buffer::FrameBuffer;
use super::wire_format::flags;
use super::writer::{spawn_writer_task, OutboundFrame, WriterHandle};
use super::FRAMED;
use crate::cancellation::Cancellation;
use crate::codec::{MsgPackCodec, WireCodec};
use crate::config::FramedConfig;
use crate::context::ConquerorContext;
use crate::dispatcher::Dispatcher;
use crate::error::{ConquerorError, Result};
use crate::handler::BoxFuture;
use crate::message::{Message, ResponseStream, StreamingRequest};
use crate::transport::TransportType;

type RouteHandler = Arc<
    dyn Fn(Dispatcher, RequestEnvelope, Cancellation, Responder) -> BoxFuture<'static, ()>
        + Send
        + Sync,
>;

#[derive(Clone)]
struct Route {
    streaming: bool,
    handler: RouteHandler,
}

type InFlight = Arc<Mutex<HashMap<u32, Cancellation>>>;

/// Serves dispatcher routes over framed connections.
///
/// Requests are routed on [`Message::name`] / [`StreamingRequest::name`], so
/// both ends must agree on message names. Each request runs in its own task;
/// an ABORT frame from the client cancels it.
///
/// ```no_run
/// use conqueror::transport::framed::FramedReceiver;
/// use conqueror::{Dispatcher, Message};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Ping;
///
/// impl Message for Ping {
///     type Response = String;
/// }
///
/// # async fn run() -> conqueror::error::Result<()> {
/// let dispatcher = Dispatcher::builder()
///     .handle_fn(|_: Ping, _ctx| async { Ok("pong".to_string()) })
///     .build()?;
///
/// let receiver = FramedReceiver::new(dispatcher).map::<Ping>()?;
/// let listener = tokio::net::TcpListener::bind("127.0.0.1:7000").await?;
/// loop {
///     let (socket, _) = listener.accept().await?;
///     let receiver = receiver.clone();
///     tokio::spawn(async move { receiver.serve(socket).await });
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct FramedReceiver {
    dispatcher: Dispatcher,
    config: FramedConfig,
    routes: Arc<HashMap<&'static str, Route>>,
}

impl FramedReceiver {
    /// Create a receiver with no routes and the default configuration.
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            config: FramedConfig::default(),
            routes: Arc::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: FramedConfig) -> Self {
        self.config = config;
        self
    }

    /// Accept unary messages of type `M`.
    pub fn map<M>(self) -> Result<Self>
    where
        M: Message + DeserializeOwned,
        M::Response: Serialize,
    {
        let handler: RouteHandler = Arc::new(
            |dispatcher: Dispatcher,
             envelope: RequestEnvelope,
             cancellation: Cancellation,
             responder: Responder| {
                let served = serve_unary::<M>(dispatcher, envelope, cancellation, responder);
                Box::pin(served) as BoxFuture<'static, ()>
            },
        );
        self.add_route(M::name(), false, handler)
    }

    /// Accept streaming requests of type `M`.
    pub fn map_stream<M>(self) -> Result<Self>
    where
        M: StreamingRequest + DeserializeOwned,
        M::Item: Serialize,
    {
        let handler: RouteHandler = Arc::new(
            |dispatcher: Dispatcher,
             envelope: RequestEnvelope,
             cancellation: Cancellation,
             responder: Responder| {
                let served = serve_stream::<M>(dispatcher, envelope, cancellation, responder);
                Box::pin(served) as BoxFuture<'static, ()>
            },
        );
        self.add_route(M::name(), true, handler)
    }

    fn add_route(
        mut self,
        name: &'static str,
        streaming: bool,
        handler: RouteHandler,
    ) -> Result<Self> {
        if self.routes.contains_key(name) {
            return Err(ConquerorError::DuplicateRegistration(name));
        }
        tracing::debug!("Mapped framed route {}", name);
        Arc::make_mut(&mut self.routes).insert(name, Route { streaming, handler });
        Ok(self)
    }

    /// Mapped route names, sorted.
    pub fn routes(&self) -> Vec<&'static str> {
        let mut routes: Vec<_> = self.routes.keys().copied().collect();
        routes.sort_unstable();
        routes
    }

    /// Serve requests arriving on `stream` until the peer closes it.
    ///
    /// Requests still running when the peer disconnects are cancelled.
    /// Returns once every response has been written.
    pub async fn serve<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(writer, self.config.channel_capacity);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_requests.max(1)));
        let in_flight: InFlight = Arc::default();

        let mut frame_buffer = FrameBuffer::with_max_payload(self.config.max_payload_size);
        let mut buf = vec![0u8; 64 * 1024];

        let result = loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(ConquerorError::Io(e)),
            };

            let frames = match frame_buffer.push(&buf[..n]) {
                Ok(frames) => frames,
                Err(e) => break Err(e),
            };

            for frame in frames {
                self.dispatch_frame(frame, &writer, &semaphore, &in_flight).await;
            }
        };

        for (_, cancellation) in in_flight.lock().drain() {
            cancellation.cancel();
        }
        drop(writer);

        match writer_task.await {
            Ok(Err(e)) => tracing::warn!("Framed writer ended with error: {}", e),
            Err(e) => tracing::warn!("Framed writer task failed: {}", e),
            Ok(Ok(())) => {}
        }

        if let Err(e) = &result {
            tracing::error!("Framed connection failed: {}", e);
        }
        result
    }

    async fn dispatch_frame(
        &self,
        frame: Frame,
        writer: &WriterHandle,
        semaphore: &Arc<Semaphore>,
        in_flight: &InFlight,
    ) {
        let request_id = frame.request_id();

        if frame.is_abort() {
            if let Some(cancellation) = in_flight.lock().remove(&request_id) {
                tracing::debug!("Received ABORT for request {}", request_id);
                cancellation.cancel();
            }
            return;
        }

        if frame.is_response() {
            tracing::warn!("Ignoring response frame for request {}", request_id);
            return;
        }

        let responder = Responder {
            writer: writer.clone(),
            request_id,
            stream: frame.is_stream(),
            max_payload_size: self.config.max_payload_size,
        };

        let envelope: RequestEnvelope = match MsgPackCodec::decode(frame.payload()) {
            Ok(envelope) => envelope,
            Err(e) => return responder.fail(&e).await,
        };

        let route = match self.routes.get(envelope.route.as_str()) {
            Some(route) => route,
            None => {
                let message = format!("No framed route for {}", envelope.route);
                return responder.reject(ErrorEnvelope::new(ErrorKind::NotFound, message)).await;
            }
        };

        if route.streaming != responder.stream {
            let message = if route.streaming {
                format!("{} expects a streaming request", envelope.route)
            } else {
                format!("{} does not accept streaming requests", envelope.route)
            };
            return responder.reject(ErrorEnvelope::new(ErrorKind::BadRequest, message)).await;
        }

        let permit = match Arc::clone(semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(
                    "Request capacity reached, rejecting request {} for {}",
                    request_id,
                    envelope.route
                );
                let limit = self.config.max_concurrent_requests;
                let message = format!("Receiver is handling {limit} requests");
                return responder.reject(ErrorEnvelope::new(ErrorKind::Overloaded, message)).await;
            }
        };

        let cancellation = Cancellation::new();
        in_flight.lock().insert(request_id, cancellation.clone());

        let handler = Arc::clone(&route.handler);
        let dispatcher = self.dispatcher.clone();
        let in_flight = Arc::clone(in_flight);

        tokio::spawn(async move {
            let _permit = permit;
            handler(dispatcher, envelope, cancellation, responder).await;
            in_flight.lock().remove(&request_id);
        });
    }
}

/// Writes the response frames of one request.
struct Responder {
    writer: WriterHandle,
    request_id: u32,
    stream: bool,
    max_payload_size: usize,
}

impl Responder {
    fn error_flags(&self) -> u8 {
        if self.stream {
            flags::STREAM_ERROR
        } else {
            flags::ERROR_RESPONSE
        }
    }

    /// Send a frame. If the payload cannot be framed, an error frame is sent instead.
    async fn send(&self, frame_flags: u8, payload: Result<Bytes>) -> Result<()> {
        let (id, limit) = (self.request_id, self.max_payload_size);
        let frame = payload.and_then(|p| OutboundFrame::new(frame_flags, id, p, limit));
        match frame {
            Ok(frame) => self.writer.send(frame).await,
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn fail(&self, error: &ConquerorError) {
        self.reject(ErrorEnvelope::from_error(error)).await
    }

    async fn reject(&self, envelope: ErrorEnvelope) {
        tracing::debug!(
            request_id = self.request_id,
            kind = ?envelope.kind,
            "Request failed: {}",
            envelope.message
        );

        let id = self.request_id;
        let frame = MsgPackCodec::encode(&envelope)
            .and_then(|p| OutboundFrame::new(self.error_flags(), id, p, self.max_payload_size));
        match frame {
            Ok(frame) => {
                if self.writer.send(frame).await.is_err() {
                    tracing::debug!("Connection closed before error for request {} was sent", id);
                }
            }
            Err(e) => tracing::error!("Could not encode error for request {}: {}", id, e),
        }
    }
}

fn request_context(envelope: &RequestEnvelope) -> Result<ConquerorContext> {
    let context = if envelope.trace_id.is_empty() {
        ConquerorContext::new()
    } else {
        ConquerorContext::with_trace_id(envelope.trace_id.clone())
    };
    if let Some(encoded) = &envelope.context {
        context.decode(encoded)?;
    }
    Ok(context)
}

async fn serve_unary<M>(
    dispatcher: Dispatcher,
    envelope: RequestEnvelope,
    cancellation: Cancellation,
    responder: Responder,
) where
    M: Message + DeserializeOwned,
    M::Response: Serialize,
{
    let result: Result<ResponseEnvelope> = async {
        let context = request_context(&envelope)?;
        let message: M = MsgPackCodec::decode(&envelope.body)?;
        let transport = TransportType::server(FRAMED);
        let response = dispatcher
            .dispatch_from_transport(message, context.clone(), cancellation, transport)
            .await?;
        Ok(ResponseEnvelope {
            context: context.encode_upstream(),
            body: MsgPackCodec::encode(&response)?.to_vec(),
        })
    }
    .await;

    match result {
        Ok(envelope) => {
            let _ = responder.send(flags::RESPONSE, MsgPackCodec::encode(&envelope)).await;
        }
        Err(e) => responder.fail(&e).await,
    }
}

async fn serve_stream<M>(
    dispatcher: Dispatcher,
    envelope: RequestEnvelope,
    cancellation: Cancellation,
    responder: Responder,
) where
    M: StreamingRequest + DeserializeOwned,
    M::Item: Serialize,
{
    let opened: Result<(ConquerorContext, ResponseStream<M::Item>)> = async {
        let context = request_context(&envelope)?;
        let request: M = MsgPackCodec::decode(&envelope.body)?;
        let transport = TransportType::server(FRAMED);
        let stream = dispatcher
            .dispatch_stream_from_transport(request, context.clone(), cancellation, transport)
            .await?;
        Ok((context, stream))
    }
    .await;

    let (context, mut stream) = match opened {
        Ok(opened) => opened,
        Err(e) => return responder.fail(&e).await,
    };

    while let Some(item) = stream.next().await {
        match item {
            Ok(item) => {
                if responder.send(flags::STREAM_ITEM, MsgPackCodec::encode(&item)).await.is_err() {
                    return;
                }
            }
            Err(e) => return responder.fail(&e).await,
        }
    }

    let end = ResponseEnvelope {
        context: context.encode_upstream(),
        body: Vec::new(),
    };
    let _ = responder.send(flags::STREAM_END_RESPONSE, MsgPackCodec::encode(&end)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, stream_handler_fn};
    use crate::transport::framed::{FramedConnection, FramedStreamClient, FramedTransportClient};
    use futures::TryStreamExt;
    use serde::Deserialize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[derive(Debug, Serialize, Deserialize)]
    struct IncrementCounter {
        amount: i64,
    }

    impl Message for IncrementCounter {
        type Response = i64;
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct CountTo {
        limit: u32,
    }

    impl StreamingRequest for CountTo {
        type Item = u32;
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Unmapped;

    impl Message for Unmapped {
        type Response = ();
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Hang;

    impl Message for Hang {
        type Response = ();
    }

    fn server_dispatcher(dropped: Arc<Mutex<Option<oneshot::Sender<()>>>>) -> Dispatcher {
        Dispatcher::builder()
            .handle(handler_fn(|msg: IncrementCounter, ctx| async move {
                assert_eq!(ctx.transport_type(), TransportType::server(FRAMED));
                ctx.context().upstream().set("served-by", "counter");
                let base = ctx
                    .context()
                    .downstream()
                    .get("base")
                    .and_then(|b| b.parse::<i64>().ok())
                    .unwrap_or(10);
                Ok(base + msg.amount)
            }))
            .handle_stream(stream_handler_fn(|req: CountTo, _ctx| async move {
                Ok(futures::stream::iter((1..=req.limit).map(Ok::<u32, ConquerorError>)))
            }))
            .handle(handler_fn(move |_: Hang, _ctx| {
                let dropped = Arc::clone(&dropped);
                async move {
                    let _guard = dropped.lock().take();
                    futures::future::pending::<()>().await;
                    Ok(())
                }
            }))
            .build()
            .unwrap()
    }

    fn connect(dropped: Arc<Mutex<Option<oneshot::Sender<()>>>>) -> FramedConnection {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let receiver = FramedReceiver::new(server_dispatcher(dropped))
            .map::<IncrementCounter>()
            .unwrap()
            .map_stream::<CountTo>()
            .unwrap()
            .map::<Hang>()
            .unwrap();
        tokio::spawn(async move { receiver.serve(server_io).await });
        FramedConnection::connect(client_io, &FramedConfig::default())
    }

    fn client_dispatcher(connection: &FramedConnection) -> Dispatcher {
        Dispatcher::builder()
            .transport(FramedTransportClient::<IncrementCounter>::new(connection.clone()))
            .stream_transport(FramedStreamClient::<CountTo>::new(connection.clone()))
            .transport(FramedTransportClient::<Unmapped>::new(connection.clone()))
            .transport(FramedTransportClient::<Hang>::new(connection.clone()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_unary_round_trip_with_context() {
        let connection = connect(Arc::default());
        let dispatcher = client_dispatcher(&connection);

        assert_eq!(dispatcher.dispatch(IncrementCounter { amount: 5 }).await.unwrap(), 15);

        let context = ConquerorContext::new();
        context.downstream().set("base", "100");
        let result = dispatcher
            .dispatch_with(IncrementCounter { amount: 5 }, context.clone(), Cancellation::new())
            .await
            .unwrap();

        assert_eq!(result, 105);
        assert_eq!(context.upstream().get("served-by").as_deref(), Some("counter"));
        assert_eq!(connection.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_multiplexed() {
        let connection = connect(Arc::default());
        let dispatcher = client_dispatcher(&connection);

        let calls = (0..20).map(|i| dispatcher.dispatch(IncrementCounter { amount: i }));
        let results = futures::future::try_join_all(calls).await.unwrap();

        assert_eq!(results, (0..20).map(|i| 10 + i).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let connection = connect(Arc::default());
        let dispatcher = client_dispatcher(&connection);

        let items: Vec<u32> = dispatcher
            .dispatch_stream(CountTo { limit: 4 })
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(items, vec![1, 2, 3, 4]);

        let empty: Vec<u32> = dispatcher
            .dispatch_stream(CountTo { limit: 0 })
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_unmapped_route_is_not_found() {
        let connection = connect(Arc::default());
        let dispatcher = client_dispatcher(&connection);

        match dispatcher.dispatch(Unmapped).await.unwrap_err() {
            ConquerorError::TransportFailure { transport, status, message } => {
                assert_eq!(transport, FRAMED);
                assert_eq!(status, Some(404));
                assert!(message.contains("Unmapped"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_aborts_remote_handler() {
        let (tx, rx) = oneshot::channel();
        let connection = connect(Arc::new(Mutex::new(Some(tx))));
        let dispatcher = client_dispatcher(&connection);

        let cancellation = Cancellation::new();
        let call = {
            let dispatcher = dispatcher.clone();
            let cancellation = cancellation.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch_with(Hang, ConquerorContext::new(), cancellation)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancellation.cancel();

        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());

        // The handler future is dropped once the ABORT arrives.
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("remote handler was not cancelled")
            .unwrap_err();
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let dispatcher = Dispatcher::builder().build().unwrap();
        let err = FramedReceiver::new(dispatcher)
            .map::<IncrementCounter>()
            .unwrap()
            .map::<IncrementCounter>()
            .err()
            .unwrap();
        assert!(matches!(err, ConquerorError::DuplicateRegistration("IncrementCounter")));
    }

    #[test]
    fn test_routes_are_sorted() {
        let dispatcher = Dispatcher::builder().build().unwrap();
        let receiver = FramedReceiver::new(dispatcher)
            .map::<IncrementCounter>()
            .unwrap()
            .map_stream::<CountTo>()
            .unwrap();
        assert_eq!(receiver.routes(), vec!["CountTo", "IncrementCounter"]);
    }
}
