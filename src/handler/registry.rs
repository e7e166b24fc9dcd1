//! Handler registry mapping message types to routes.
//!
//! A route is the terminal step for one message type (a local handler or a
//! transport client) together with the pipeline configuration wrapped around
//! it. Unary messages and streaming requests have exactly one route per type;
//! notifications have any number of subscriber routes.
//!
//! The registry is populated during configuration and moved behind an `Arc`
//! when the dispatcher is built. From then on lookups are read-only.
//!
//! # Example
//!
//! ```
//! use conqueror::handler::{handler_fn, HandlerRegistry};
//! use conqueror::{ConquerorError, Message};
//!
//! struct Ping;
//!
//! impl Message for Ping {
//!     type Response = ();
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_handler(handler_fn(|_: Ping, _ctx| async { Ok(()) })).unwrap();
//!
//! let err = registry
//!     .register_handler(handler_fn(|_: Ping, _ctx| async { Ok(()) }))
//!     .unwrap_err();
//! assert!(matches!(err, ConquerorError::DuplicateRegistration("Ping")));
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use super::{MessageHandler, NotificationHandler, RequestContext, StreamHandler};
use crate::error::{ConquerorError, Result};
use crate::message::{Message, Notification, ResponseStream, StreamingRequest};
use crate::pipeline::{Configurator, FrozenPipeline, PipelineSlot, Terminal};
use crate::transport::{StreamTransportClient, TransportClient, TransportType};

/// Route of a unary message.
pub struct MessageRoute<M: Message> {
    transport: TransportType,
    terminal: Terminal<M, M::Response>,
    pipeline: PipelineSlot<M, M::Response>,
}

/// Route of a streaming request.
pub struct StreamRoute<M: StreamingRequest> {
    transport: TransportType,
    terminal: Terminal<M, ResponseStream<M::Item>>,
    pipeline: PipelineSlot<M, ResponseStream<M::Item>>,
}

/// Route of one notification subscriber.
pub struct ObserverRoute<N: Notification> {
    terminal: Terminal<N, ()>,
    pipeline: PipelineSlot<N, ()>,
}

macro_rules! route_accessors {
    ($route:ident, $bound:ident, $response:ty) => {
        impl<M: $bound> $route<M> {
            /// Whether the pipeline has been frozen by a dispatch.
            pub fn is_pipeline_frozen(&self) -> bool {
                self.pipeline.is_frozen()
            }

            pub(crate) fn configure(&self, configurator: Configurator<M, $response>) -> Result<()> {
                self.pipeline.configure(configurator)
            }

            pub(crate) fn frozen_pipeline(&self) -> Result<FrozenPipeline<M, $response>> {
                self.pipeline.frozen()
            }

            pub(crate) fn terminal(&self) -> Terminal<M, $response> {
                Arc::clone(&self.terminal)
            }
        }
    };
}

route_accessors!(MessageRoute, Message, M::Response);
route_accessors!(StreamRoute, StreamingRequest, ResponseStream<M::Item>);
route_accessors!(ObserverRoute, Notification, ());

impl<M: Message> MessageRoute<M> {
    /// Transport the terminal step runs on.
    pub fn transport_type(&self) -> TransportType {
        self.transport
    }

    /// Whether the terminal step is a local handler.
    pub fn is_local(&self) -> bool {
        self.transport.is_in_process()
    }
}

impl<M: StreamingRequest> StreamRoute<M> {
    /// Transport the terminal step runs on.
    pub fn transport_type(&self) -> TransportType {
        self.transport
    }

    /// Whether the terminal step is a local handler.
    pub fn is_local(&self) -> bool {
        self.transport.is_in_process()
    }
}

type RouteMap = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

/// Registry mapping message types to routes.
#[derive(Default)]
pub struct HandlerRegistry {
    messages: RouteMap,
    streams: RouteMap,
    observers: RouteMap,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the local handler of `M`.
    pub fn register_handler<M, H>(&mut self, handler: H) -> Result<()>
    where
        M: Message,
        H: MessageHandler<M>,
    {
        let handler = Arc::new(handler);
        let terminal: Terminal<M, M::Response> =
            Arc::new(move |message: M, ctx: RequestContext| handler.handle(message, ctx));
        self.insert_message(TransportType::in_process(), terminal)
    }

    /// Route `M` to a remote handler through a transport client.
    pub fn register_transport<M, C>(&mut self, client: C) -> Result<()>
    where
        M: Message,
        C: TransportClient<M>,
    {
        let transport = client.transport_type();
        let client = Arc::new(client);
        let terminal: Terminal<M, M::Response> =
            Arc::new(move |message: M, ctx: RequestContext| client.send(message, ctx));
        self.insert_message(transport, terminal)
    }

    /// Register the local handler of streaming request `M`.
    pub fn register_stream_handler<M, H>(&mut self, handler: H) -> Result<()>
    where
        M: StreamingRequest,
        H: StreamHandler<M>,
    {
        let handler = Arc::new(handler);
        let terminal: Terminal<M, ResponseStream<M::Item>> =
            Arc::new(move |request: M, ctx: RequestContext| handler.handle(request, ctx));
        self.insert_stream(TransportType::in_process(), terminal)
    }

    /// Route streaming request `M` through a transport client.
    pub fn register_stream_transport<M, C>(&mut self, client: C) -> Result<()>
    where
        M: StreamingRequest,
        C: StreamTransportClient<M>,
    {
        let transport = client.transport_type();
        let client = Arc::new(client);
        let terminal: Terminal<M, ResponseStream<M::Item>> =
            Arc::new(move |request: M, ctx: RequestContext| client.open(request, ctx));
        self.insert_stream(transport, terminal)
    }

    /// Add a subscriber for notification `N`.
    ///
    /// Any number of subscribers may be registered.
    pub fn register_observer<N, H>(&mut self, handler: H) -> Arc<ObserverRoute<N>>
    where
        N: Notification,
        H: NotificationHandler<N>,
    {
        let handler = Arc::new(handler);
        let route = Arc::new(ObserverRoute {
            terminal: Arc::new(move |notification: N, ctx: RequestContext| {
                handler.handle(notification, ctx)
            }),
            pipeline: PipelineSlot::new(),
        });

        let entry = self
            .observers
            .entry(TypeId::of::<N>())
            .or_insert_with(|| Box::new(Vec::<Arc<ObserverRoute<N>>>::new()));
        if let Some(routes) = entry.downcast_mut::<Vec<Arc<ObserverRoute<N>>>>() {
            routes.push(Arc::clone(&route));
            tracing::debug!(
                "Registered subscriber #{} for notification {}",
                routes.len(),
                N::name()
            );
        }
        route
    }

    /// Resolve the route of `M`.
    ///
    /// Returns the same route on every call.
    pub fn resolve<M: Message>(&self) -> Result<Arc<MessageRoute<M>>> {
        self.messages
            .get(&TypeId::of::<M>())
            .and_then(|route| route.downcast_ref::<Arc<MessageRoute<M>>>())
            .cloned()
            .ok_or(ConquerorError::HandlerNotFound(M::name()))
    }

    /// Resolve the route of streaming request `M`.
    pub fn resolve_stream<M: StreamingRequest>(&self) -> Result<Arc<StreamRoute<M>>> {
        self.streams
            .get(&TypeId::of::<M>())
            .and_then(|route| route.downcast_ref::<Arc<StreamRoute<M>>>())
            .cloned()
            .ok_or(ConquerorError::HandlerNotFound(M::name()))
    }

    /// Subscribers of notification `N` in registration order.
    pub fn observers<N: Notification>(&self) -> Vec<Arc<ObserverRoute<N>>> {
        self.observers
            .get(&TypeId::of::<N>())
            .and_then(|routes| routes.downcast_ref::<Vec<Arc<ObserverRoute<N>>>>())
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `M` has a route.
    pub fn contains<M: Message>(&self) -> bool {
        self.messages.contains_key(&TypeId::of::<M>())
    }

    /// Number of unary and streaming routes.
    pub fn len(&self) -> usize {
        self.messages.len() + self.streams.len()
    }

    /// Whether no unary or streaming route is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_message<M: Message>(
        &mut self,
        transport: TransportType,
        terminal: Terminal<M, M::Response>,
    ) -> Result<()> {
        let id = TypeId::of::<M>();
        if self.messages.contains_key(&id) {
            return Err(ConquerorError::DuplicateRegistration(M::name()));
        }

        let route = Arc::new(MessageRoute {
            transport,
            terminal,
            pipeline: PipelineSlot::new(),
        });
        self.messages.insert(id, Box::new(route));
        tracing::debug!("Registered {} route for message {}", transport, M::name());
        Ok(())
    }

    fn insert_stream<M: StreamingRequest>(
        &mut self,
        transport: TransportType,
        terminal: Terminal<M, ResponseStream<M::Item>>,
    ) -> Result<()> {
        let id = TypeId::of::<M>();
        if self.streams.contains_key(&id) {
            return Err(ConquerorError::DuplicateRegistration(M::name()));
        }

        let route = Arc::new(StreamRoute {
            transport,
            terminal,
            pipeline: PipelineSlot::new(),
        });
        self.streams.insert(id, Box::new(route));
        tracing::debug!("Registered {} route for streaming request {}", transport, M::name());
        Ok(())
    }
}
