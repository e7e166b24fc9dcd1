//! Fluent registration API.
//!
//! The [`ConquerorBuilder`] collects handlers, transport clients,
//! subscribers and pipeline configuration, then builds a [`Dispatcher`].
//! Registration errors do not interrupt the chain; the first one is returned
//! by [`ConquerorBuilder::build`].
//!
//! # Example
//!
//! ```
//! use conqueror::handler::{handler_fn, notification_handler_fn};
//! use conqueror::middleware::LoggingMiddleware;
//! use conqueror::{Dispatcher, Message, Notification};
//!
//! #[derive(serde::Serialize)]
//! struct Greet(String);
//!
//! impl Message for Greet {
//!     type Response = String;
//! }
//!
//! #[derive(Clone)]
//! struct Greeted;
//!
//! impl Notification for Greeted {}
//!
//! let dispatcher = Dispatcher::builder()
//!     .handle(handler_fn(|msg: Greet, _ctx| async move { Ok(format!("hello {}", msg.0)) }))
//!     .pipeline::<Greet, _>(|p| {
//!         p.use_middleware(LoggingMiddleware::new())?;
//!         Ok(())
//!     })
//!     .observe(notification_handler_fn(|_: Greeted, _ctx| async { Ok(()) }))
//!     .build()
//!     .unwrap();
//! # let _ = dispatcher;
//! ```

use std::future::Future;
use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::error::{ConquerorError, Result};
use crate::handler::{
    handler_fn, HandlerRegistry, MessageHandler, NotificationHandler, RequestContext,
    StreamHandler,
};
use crate::message::{Message, Notification, StreamingRequest};
use crate::pipeline::{MessagePipeline, NotificationPipeline, StreamPipeline};
use crate::transport::{StreamTransportClient, TransportClient};

type Deferred = Box<dyn FnOnce(&HandlerRegistry) -> Result<()> + Send>;

/// Builder for configuring and creating a [`Dispatcher`].
pub struct ConquerorBuilder {
    registry: HandlerRegistry,
    pipelines: Vec<Deferred>,
    error: Option<ConquerorError>,
}

impl ConquerorBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            pipelines: Vec::new(),
            error: None,
        }
    }

    /// Register the local handler of `M`.
    pub fn handle<M, H>(mut self, handler: H) -> Self
    where
        M: Message,
        H: MessageHandler<M>,
    {
        let result = self.registry.register_handler(handler);
        self.record(result);
        self
    }

    /// Register a closure as the local handler of `M`.
    pub fn handle_fn<M, F, Fut>(self, handler: F) -> Self
    where
        M: Message,
        F: Fn(M, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<M::Response>> + Send + 'static,
    {
        self.handle(handler_fn(handler))
    }

    /// Register the local handler of streaming request `M`.
    pub fn handle_stream<M, H>(mut self, handler: H) -> Self
    where
        M: StreamingRequest,
        H: StreamHandler<M>,
    {
        let result = self.registry.register_stream_handler(handler);
        self.record(result);
        self
    }

    /// Add a subscriber for notification `N`.
    pub fn observe<N, H>(mut self, handler: H) -> Self
    where
        N: Notification,
        H: NotificationHandler<N>,
    {
        self.registry.register_observer(handler);
        self
    }

    /// Add a subscriber for notification `N` with its own pipeline.
    pub fn observe_with<N, H, F>(mut self, handler: H, configure: F) -> Self
    where
        N: Notification,
        H: NotificationHandler<N>,
        F: Fn(&mut NotificationPipeline<N>) -> Result<()> + Send + Sync + 'static,
    {
        let route = self.registry.register_observer(handler);
        let result = route.configure(Arc::new(configure));
        self.record(result);
        self
    }

    /// Route `M` to a remote handler through a transport client.
    pub fn transport<M, C>(mut self, client: C) -> Self
    where
        M: Message,
        C: TransportClient<M>,
    {
        let result = self.registry.register_transport(client);
        self.record(result);
        self
    }

    /// Route streaming request `M` through a transport client.
    pub fn stream_transport<M, C>(mut self, client: C) -> Self
    where
        M: StreamingRequest,
        C: StreamTransportClient<M>,
    {
        let result = self.registry.register_stream_transport(client);
        self.record(result);
        self
    }

    /// Add pipeline configuration for `M`.
    ///
    /// Applied at build time, after all routes are registered.
    pub fn pipeline<M, F>(mut self, configure: F) -> Self
    where
        M: Message,
        F: Fn(&mut MessagePipeline<M>) -> Result<()> + Send + Sync + 'static,
    {
        self.pipelines.push(Box::new(move |registry: &HandlerRegistry| {
            registry.resolve::<M>()?.configure(Arc::new(configure))
        }));
        self
    }

    /// Add pipeline configuration for streaming request `M`.
    pub fn stream_pipeline<M, F>(mut self, configure: F) -> Self
    where
        M: StreamingRequest,
        F: Fn(&mut StreamPipeline<M>) -> Result<()> + Send + Sync + 'static,
    {
        self.pipelines.push(Box::new(move |registry: &HandlerRegistry| {
            registry.resolve_stream::<M>()?.configure(Arc::new(configure))
        }));
        self
    }

    /// Build the dispatcher.
    ///
    /// Fails with the first registration or configuration error.
    pub fn build(self) -> Result<Dispatcher> {
        if let Some(error) = self.error {
            return Err(error);
        }

        for configure in self.pipelines {
            configure(&self.registry)?;
        }

        tracing::debug!("Built dispatcher with {} route(s)", self.registry.len());
        Ok(Dispatcher::new(self.registry))
    }

    fn record(&mut self, result: Result<()>) {
        if let Err(e) = result {
            tracing::warn!("Registration failed: {}", e);
            self.error.get_or_insert(e);
        }
    }
}

impl Default for ConquerorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::notification_handler_fn;

    struct Ping;

    impl Message for Ping {
        type Response = &'static str;
    }

    #[derive(Clone)]
    struct Pinged;

    impl Notification for Pinged {}

    #[test]
    fn test_builder_default() {
        let dispatcher = ConquerorBuilder::default().build().unwrap();
        assert!(dispatcher.registry().is_empty());
    }

    #[test]
    fn test_builder_method_chaining() {
        let dispatcher = ConquerorBuilder::new()
            .handle_fn(|_: Ping, _ctx| async { Ok("pong") })
            .observe(notification_handler_fn(|_: Pinged, _ctx| async { Ok(()) }))
            .observe(notification_handler_fn(|_: Pinged, _ctx| async { Ok(()) }))
            .build()
            .unwrap();

        assert!(dispatcher.registry().contains::<Ping>());
        assert_eq!(dispatcher.registry().observers::<Pinged>().len(), 2);
    }

    #[test]
    fn test_duplicate_registration_fails_build() {
        let result = ConquerorBuilder::new()
            .handle_fn(|_: Ping, _ctx| async { Ok("one") })
            .handle_fn(|_: Ping, _ctx| async { Ok("two") })
            .build();

        assert!(matches!(
            result.unwrap_err(),
            ConquerorError::DuplicateRegistration("Ping")
        ));
    }

    #[test]
    fn test_pipeline_for_unregistered_message_fails_build() {
        let result = ConquerorBuilder::new()
            .pipeline::<Ping, _>(|_| Ok(()))
            .build();

        assert!(matches!(
            result.unwrap_err(),
            ConquerorError::HandlerNotFound("Ping")
        ));
    }

    #[test]
    fn test_pipeline_may_precede_registration() {
        let dispatcher = ConquerorBuilder::new()
            .pipeline::<Ping, _>(|_| Ok(()))
            .handle_fn(|_: Ping, _ctx| async { Ok("pong") })
            .build()
            .unwrap();

        assert!(!dispatcher.registry().resolve::<Ping>().unwrap().is_pipeline_frozen());
    }
}
