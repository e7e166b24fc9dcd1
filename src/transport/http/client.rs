//! Client side of the HTTP transport.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use super::message::HttpMessage;
use super::{format_traceparent, query, HTTP};
use crate::codec::{JsonCodec, WireCodec};
use crate::config::HttpTransportConfig;
use crate::context::{CONTEXT_HEADER, TRACE_PARENT_HEADER};
use crate::error::{ConquerorError, Result};
use crate::handler::{BoxFuture, RequestContext};
use crate::transport::{TransportClient, TransportType};

/// Executes HTTP requests for [`HttpTransportClient`].
///
/// Requests carry an absolute URI built from the configured base address.
pub trait HttpSender: Send + Sync + 'static {
    /// Send a request and return the complete response.
    fn send(&self, request: Request<Bytes>) -> BoxFuture<'static, Result<Response<Bytes>>>;
}

/// [`HttpSender`] backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestSender {
    client: reqwest::Client,
}

impl ReqwestSender {
    /// Create a sender using the timeout of `config`.
    pub fn new(config: &HttpTransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ConquerorError::transport(HTTP, None, e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing `reqwest` client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HttpSender for ReqwestSender {
    fn send(&self, request: Request<Bytes>) -> BoxFuture<'static, Result<Response<Bytes>>> {
        let client = self.client.clone();
        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let response = client
                .request(parts.method, parts.uri.to_string())
                .headers(parts.headers)
                .body(body)
                .send()
                .await
                .map_err(reqwest_failure)?;

            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(reqwest_failure)?;

            let mut out = Response::new(body);
            *out.status_mut() = status;
            *out.headers_mut() = headers;
            Ok(out)
        })
    }
}

fn reqwest_failure(error: reqwest::Error) -> ConquerorError {
    let status = error.status().map(|s| s.as_u16());
    ConquerorError::transport(HTTP, status, error.to_string())
}

/// Sends messages of type `M` over HTTP.
///
/// # Example
///
/// ```no_run
/// use conqueror::config::HttpTransportConfig;
/// use conqueror::transport::http::{HttpMessage, HttpTransportClient};
/// use conqueror::{Dispatcher, Message};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct IncrementCounter {
///     amount: i64,
/// }
///
/// impl Message for IncrementCounter {
///     type Response = i64;
/// }
///
/// impl HttpMessage for IncrementCounter {}
///
/// # fn main() -> conqueror::Result<()> {
/// let config = HttpTransportConfig::new("http://localhost:8080");
/// let dispatcher = Dispatcher::builder()
///     .transport(HttpTransportClient::<IncrementCounter>::new(config)?)
///     .build()?;
/// # let _ = dispatcher;
/// # Ok(())
/// # }
/// ```
pub struct HttpTransportClient<M, S = ReqwestSender> {
    sender: Arc<S>,
    base: Url,
    default_headers: Vec<(HeaderName, HeaderValue)>,
    _message: PhantomData<fn() -> M>,
}

impl<M> HttpTransportClient<M, ReqwestSender> {
    /// Create a client sending over the network.
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let sender = ReqwestSender::new(&config)?;
        Self::with_sender(sender, config)
    }
}

impl<M, S: HttpSender> HttpTransportClient<M, S> {
    /// Create a client with a custom sender (e.g. an in-memory receiver).
    pub fn with_sender(sender: S, config: HttpTransportConfig) -> Result<Self> {
        let base = Url::parse(&config.base_address).map_err(|e| {
            ConquerorError::transport(
                HTTP,
                None,
                format!("invalid base address `{}`: {e}", config.base_address),
            )
        })?;

        let default_headers = config
            .default_headers
            .iter()
            .map(|(name, value)| -> Result<(HeaderName, HeaderValue)> {
                let invalid = |what: &str, e: &dyn std::fmt::Display| {
                    ConquerorError::Protocol(format!("invalid header {what} for `{name}`: {e}"))
                };
                let header = HeaderName::try_from(name.as_str()).map_err(|e| invalid("name", &e))?;
                let value =
                    HeaderValue::try_from(value.as_str()).map_err(|e| invalid("value", &e))?;
                Ok((header, value))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            sender: Arc::new(sender),
            base,
            default_headers,
            _message: PhantomData,
        })
    }
}

impl<M, S> HttpTransportClient<M, S>
where
    M: HttpMessage,
    S: HttpSender,
{
    fn url(&self, query: Option<&str>) -> Url {
        let mut url = self.base.clone();
        let path = format!("{}{}", self.base.path().trim_end_matches('/'), M::full_path());
        url.set_path(&path);
        url.set_query(query.filter(|q| !q.is_empty()));
        url
    }

    fn build_request(&self, message: &M, ctx: &RequestContext) -> Result<Request<Bytes>> {
        let (url, body) = if M::METHOD == Method::GET {
            let query = query::encode(message)?;
            (self.url(Some(&query)), Bytes::new())
        } else {
            (self.url(None), JsonCodec::encode(message)?)
        };

        let mut builder = Request::builder()
            .method(M::METHOD)
            .uri(url.as_str())
            .header(CONTENT_TYPE, JsonCodec::CONTENT_TYPE)
            .header(TRACE_PARENT_HEADER, format_traceparent(&ctx.trace_id()));

        if let Some(encoded) = ctx.context().encode_downstream() {
            builder = builder.header(CONTEXT_HEADER, encoded);
        }
        for (name, value) in &self.default_headers {
            builder = builder.header(name, value);
        }

        builder.body(body).map_err(|e| {
            ConquerorError::Protocol(format!("invalid request for `{}`: {e}", M::name()))
        })
    }
}

impl<M, S> TransportClient<M> for HttpTransportClient<M, S>
where
    M: HttpMessage,
    M::Response: Serialize + DeserializeOwned,
    S: HttpSender,
{
    fn transport_type(&self) -> TransportType {
        TransportType::client(HTTP)
    }

    fn send(&self, message: M, ctx: RequestContext) -> BoxFuture<'static, Result<M::Response>> {
        let request = self.build_request(&message, &ctx);
        let sender = Arc::clone(&self.sender);
        Box::pin(async move {
            let request = request?;
            tracing::debug!(
                message_id = ctx.message_id(),
                "Sending {} to {} {}",
                M::name(),
                request.method(),
                request.uri()
            );

            let response = ctx.cancellation().run(sender.send(request)).await?;
            let (parts, body) = response.into_parts();

            if !parts.status.is_success() {
                let message = String::from_utf8_lossy(&body).into_owned();
                return Err(ConquerorError::transport(HTTP, Some(parts.status.as_u16()), message));
            }

            let upstream = parts
                .headers
                .get_all(CONTEXT_HEADER)
                .iter()
                .filter_map(|value| value.to_str().ok());
            ctx.context().decode_all(upstream)?;

            JsonCodec::decode(&body)
        })
    }
}

impl<M, S> std::fmt::Debug for HttpTransportClient<M, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransportClient")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}
