//! Server side of the HTTP transport.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::client::HttpSender;
use super::message::HttpMessage;
use super::{parse_traceparent, query, HTTP};
use crate::cancellation::Cancellation;
use crate::codec::{JsonCodec, WireCodec};
use crate::context::{ConquerorContext, CONTEXT_HEADER, TRACE_PARENT_HEADER};
use crate::dispatcher::Dispatcher;
use crate::error::{ConquerorError, Result};
use crate::handler::BoxFuture;
use crate::transport::TransportType;

/// Status reported when a dispatch was cancelled ("client closed request").
pub const STATUS_CANCELLED: u16 = 499;

type RouteHandler = Arc<
    dyn Fn(Dispatcher, Request<Bytes>, Cancellation) -> BoxFuture<'static, Response<Bytes>>
        + Send
        + Sync,
>;

/// Maps HTTP requests onto a dispatcher.
///
/// Framework agnostic: feed it `http::Request<Bytes>` from any server and
/// write back the returned `http::Response<Bytes>`. It also implements
/// [`HttpSender`], so an [`HttpTransportClient`](super::HttpTransportClient)
/// can call it directly without a network in between.
///
/// ```
/// use conqueror::handler::handler_fn;
/// use conqueror::transport::http::{HttpMessage, HttpMessageReceiver};
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
/// impl HttpMessage for Ping {}
///
/// # fn main() -> conqueror::Result<()> {
/// let dispatcher = Dispatcher::builder()
///     .handle(handler_fn(|_: Ping, _ctx| async { Ok("pong".to_string()) }))
///     .build()?;
///
/// let receiver = HttpMessageReceiver::new(dispatcher).map::<Ping>()?;
/// assert_eq!(receiver.routes(), vec![(http::Method::POST, "/api/ping".to_string())]);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HttpMessageReceiver {
    dispatcher: Dispatcher,
    routes: Arc<HashMap<(Method, String), RouteHandler>>,
}

impl HttpMessageReceiver {
    /// Create a receiver with no routes.
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            routes: Arc::new(HashMap::new()),
        }
    }

    /// Expose message type `M` at `(M::METHOD, M::full_path())`.
    ///
    /// Fails with `DuplicateRegistration` if the route is already taken.
    pub fn map<M>(mut self) -> Result<Self>
    where
        M: HttpMessage,
        M::Response: Serialize + DeserializeOwned,
    {
        let key = (M::METHOD, M::full_path());
        if self.routes.contains_key(&key) {
            return Err(ConquerorError::DuplicateRegistration(M::name()));
        }

        tracing::debug!("Mapped {} to {} {}", M::name(), key.0, key.1);
        let handler: RouteHandler = Arc::new(
            |dispatcher: Dispatcher, request: Request<Bytes>, cancellation: Cancellation| {
                let served = serve::<M>(dispatcher, request, cancellation);
                Box::pin(served) as BoxFuture<'static, Response<Bytes>>
            },
        );
        Arc::make_mut(&mut self.routes).insert(key, handler);
        Ok(self)
    }

    /// Mapped routes, sorted by path.
    pub fn routes(&self) -> Vec<(Method, String)> {
        let mut routes: Vec<_> = self.routes.keys().cloned().collect();
        routes.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.as_str().cmp(b.0.as_str())));
        routes
    }

    /// Handle one request.
    pub async fn handle(&self, request: Request<Bytes>) -> Response<Bytes> {
        self.handle_with(request, Cancellation::new()).await
    }

    /// Handle one request; `cancellation` fires when the caller goes away.
    pub async fn handle_with(
        &self,
        request: Request<Bytes>,
        cancellation: Cancellation,
    ) -> Response<Bytes> {
        let key = (request.method().clone(), request.uri().path().to_string());
        match self.routes.get(&key) {
            Some(handler) => handler(self.dispatcher.clone(), request, cancellation).await,
            None => {
                tracing::warn!("No route for {} {}", key.0, key.1);
                text_response(
                    StatusCode::NOT_FOUND,
                    format!("no message mapped to {} {}", key.0, key.1),
                )
            }
        }
    }
}

impl HttpSender for HttpMessageReceiver {
    fn send(&self, request: Request<Bytes>) -> BoxFuture<'static, Result<Response<Bytes>>> {
        let receiver = self.clone();
        Box::pin(async move { Ok(receiver.handle(request).await) })
    }
}

impl std::fmt::Debug for HttpMessageReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMessageReceiver")
            .field("routes", &self.routes())
            .finish_non_exhaustive()
    }
}

async fn serve<M>(
    dispatcher: Dispatcher,
    request: Request<Bytes>,
    cancellation: Cancellation,
) -> Response<Bytes>
where
    M: HttpMessage,
    M::Response: Serialize + DeserializeOwned,
{
    let context = ConquerorContext::new();
    let result = match decode_request::<M>(&context, request) {
        Ok(message) => dispatcher
            .dispatch_from_transport(
                message,
                context.clone(),
                cancellation,
                TransportType::server(HTTP),
            )
            .await
            .and_then(|response| encode_response::<M>(&response)),
        Err(e) => Err(e),
    };

    let mut response = match result {
        Ok(body) => {
            let mut response = Response::new(body);
            *response.status_mut() = M::SUCCESS_STATUS;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(JsonCodec::CONTENT_TYPE));
            response
        }
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                tracing::error!("{} failed: {}", M::name(), e);
            } else {
                tracing::debug!("{} rejected with {}: {}", M::name(), status, e);
            }
            text_response(status, e.to_string())
        }
    };

    if let Some(encoded) = context.encode_upstream() {
        match HeaderValue::try_from(encoded) {
            Ok(value) => {
                response.headers_mut().insert(CONTEXT_HEADER, value);
            }
            Err(e) => tracing::warn!("Dropping upstream context of {}: {}", M::name(), e),
        }
    }
    response
}

fn decode_request<M: HttpMessage>(
    context: &ConquerorContext,
    request: Request<Bytes>,
) -> Result<M> {
    let (parts, body) = request.into_parts();

    if let Some(trace_id) = parts
        .headers
        .get(TRACE_PARENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_traceparent)
    {
        context.set_trace_id(trace_id);
    }

    let mut encoded = Vec::new();
    for value in parts.headers.get_all(CONTEXT_HEADER) {
        let value = value
            .to_str()
            .map_err(|e| ConquerorError::InvalidContextData(e.to_string()))?;
        encoded.push(value);
    }
    context.decode_all(encoded)?;

    if M::METHOD == Method::GET {
        query::decode(parts.uri.query().unwrap_or(""))
    } else {
        JsonCodec::decode(&body)
    }
}

fn encode_response<M>(response: &M::Response) -> Result<Bytes>
where
    M: HttpMessage,
    M::Response: Serialize,
{
    if TypeId::of::<M::Response>() == TypeId::of::<()>() {
        return Ok(Bytes::new());
    }
    JsonCodec::encode(response)
}

/// Status code reported for a failed dispatch.
pub(crate) fn status_for(error: &ConquerorError) -> StatusCode {
    match error {
        e if e.is_bad_request() => StatusCode::BAD_REQUEST,
        ConquerorError::HandlerNotFound(_) => StatusCode::NOT_FOUND,
        ConquerorError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        ConquerorError::Unauthorized { .. } => StatusCode::FORBIDDEN,
        ConquerorError::Cancelled => {
            StatusCode::from_u16(STATUS_CANCELLED).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
        ConquerorError::TransportFailure { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn text_response(status: StatusCode, body: String) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
