//! Transport module - the contract remote transports implement.
//!
//! A transport client replaces the terminal handler of a route: the full local
//! pipeline runs first, then the message is handed to
//! [`TransportClient::send`] instead of a local handler. Middleware above the
//! transport cannot tell a remote call from a local one.
//!
//! Provides:
//! - [`http`] - JSON over HTTP (`reqwest` client, in-memory receiver)
//! - [`framed`] - MessagePack over length-prefixed frames on any byte stream

pub mod framed;
pub mod http;

use std::fmt;

use crate::handler::{BoxFuture, RequestContext};
use crate::error::Result;
use crate::message::{Message, ResponseStream, StreamingRequest};

/// Name of the in-process transport.
pub const IN_PROCESS: &str = "in-process";

/// Side of a transport a message is being processed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportRole {
    /// Sending side: the message leaves this process.
    Client,
    /// Receiving side: the message is handled in this process.
    Server,
}

/// Transport a message is travelling over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportType {
    /// Transport name (`in-process`, `http`, `framed`, ...).
    pub name: &'static str,
    /// Side of the transport.
    pub role: TransportRole,
}

impl TransportType {
    /// Create a transport type.
    pub const fn new(name: &'static str, role: TransportRole) -> Self {
        Self { name, role }
    }

    /// In-process dispatch to a local handler.
    pub const fn in_process() -> Self {
        Self::new(IN_PROCESS, TransportRole::Server)
    }

    /// Sending side of the named transport.
    pub const fn client(name: &'static str) -> Self {
        Self::new(name, TransportRole::Client)
    }

    /// Receiving side of the named transport.
    pub const fn server(name: &'static str) -> Self {
        Self::new(name, TransportRole::Server)
    }

    /// Whether this is in-process dispatch.
    #[inline]
    pub fn is_in_process(&self) -> bool {
        self.name == IN_PROCESS
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            TransportRole::Client => "client",
            TransportRole::Server => "server",
        };
        write!(f, "{}/{}", self.name, role)
    }
}

/// Sends messages of type `M` to a remote handler.
///
/// Implementations must propagate the context (downstream data and trace ID)
/// and should abort in-flight requests when the cancellation fires or the
/// returned future is dropped.
pub trait TransportClient<M: Message>: Send + Sync + 'static {
    /// Transport type reported to middleware.
    fn transport_type(&self) -> TransportType;

    /// Send a message and await its response.
    fn send(&self, message: M, ctx: RequestContext) -> BoxFuture<'static, Result<M::Response>>;
}

/// Opens remote response streams for requests of type `M`.
pub trait StreamTransportClient<M: StreamingRequest>: Send + Sync + 'static {
    /// Transport type reported to middleware.
    fn transport_type(&self) -> TransportType;

    /// Send a request and open its response stream.
    fn open(
        &self,
        request: M,
        ctx: RequestContext,
    ) -> BoxFuture<'static, Result<ResponseStream<M::Item>>>;
}
