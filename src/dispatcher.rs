//! Dispatcher - the entry point for sending messages.
//!
//! For every dispatch the [`Dispatcher`]:
//! 1. checks the cancellation token
//! 2. resolves the route of the message type
//! 3. fetches the frozen pipeline (freezing it on first use)
//! 4. runs the middleware chain around the terminal step, racing it against
//!    the cancellation token
//!
//! The dispatcher never swallows errors: whatever the chain returns is
//! returned to the caller unchanged.
//!
//! # Example
//!
//! ```
//! use conqueror::handler::handler_fn;
//! use conqueror::{Dispatcher, Message};
//!
//! struct Add(i64, i64);
//!
//! impl Message for Add {
//!     type Response = i64;
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> conqueror::Result<()> {
//! let dispatcher = Dispatcher::builder()
//!     .handle(handler_fn(|msg: Add, _ctx| async move { Ok(msg.0 + msg.1) }))
//!     .build()?;
//!
//! assert_eq!(dispatcher.dispatch(Add(2, 3)).await?, 5);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{self, StreamExt};

use crate::builder::ConquerorBuilder;
use crate::cancellation::Cancellation;
use crate::context::ConquerorContext;
use crate::error::{ConquerorError, Result};
use crate::handler::{HandlerRegistry, ObserverRoute, RequestContext};
use crate::message::{Message, Notification, ResponseStream, StreamingRequest};
use crate::pipeline::{MessagePipeline, NotificationPipeline, StreamPipeline};
use crate::transport::TransportType;

/// Dispatches messages through their pipelines.
///
/// `Dispatcher` is cheap to clone; clones share the registry and the frozen
/// pipelines.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    /// Create a new builder.
    pub fn builder() -> ConquerorBuilder {
        ConquerorBuilder::new()
    }

    /// Create a dispatcher over a populated registry.
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// Registry this dispatcher resolves routes from.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Dispatch a message with a fresh context and no cancellation.
    pub async fn dispatch<M: Message>(&self, message: M) -> Result<M::Response> {
        self.dispatch_with(message, ConquerorContext::new(), Cancellation::new()).await
    }

    /// Dispatch a message reusing the caller's context.
    ///
    /// Nested dispatches that pass the same context share its data.
    pub async fn dispatch_with<M: Message>(
        &self,
        message: M,
        context: ConquerorContext,
        cancellation: Cancellation,
    ) -> Result<M::Response> {
        self.run_message(message, context, cancellation, None).await
    }

    /// Run the pipeline of `M` for a message received over a transport.
    ///
    /// Used by transport receivers; `transport` is reported to middleware and
    /// handler instead of the route's own transport type.
    pub async fn dispatch_from_transport<M: Message>(
        &self,
        message: M,
        context: ConquerorContext,
        cancellation: Cancellation,
        transport: TransportType,
    ) -> Result<M::Response> {
        self.run_message(message, context, cancellation, Some(transport)).await
    }

    async fn run_message<M: Message>(
        &self,
        message: M,
        context: ConquerorContext,
        cancellation: Cancellation,
        transport: Option<TransportType>,
    ) -> Result<M::Response> {
        cancellation.check()?;
        let route = self.registry.resolve::<M>()?;
        let transport = transport.unwrap_or_else(|| route.transport_type());
        let pipeline = route.frozen_pipeline()?;
        let ctx = RequestContext::new(self.clone(), context, cancellation.clone(), transport);

        tracing::debug!(
            message_id = ctx.message_id(),
            "Dispatching {} via {}",
            M::name(),
            transport
        );

        cancellation
            .run(pipeline.execute(message, ctx, route.terminal()))
            .await
    }

    /// Open the response stream of a streaming request with a fresh context.
    pub async fn dispatch_stream<M: StreamingRequest>(
        &self,
        request: M,
    ) -> Result<ResponseStream<M::Item>> {
        self.dispatch_stream_with(request, ConquerorContext::new(), Cancellation::new()).await
    }

    /// Open the response stream of a streaming request reusing the caller's context.
    ///
    /// If the cancellation fires while the stream is consumed, the stream
    /// yields `Err(Cancelled)` and ends.
    pub async fn dispatch_stream_with<M: StreamingRequest>(
        &self,
        request: M,
        context: ConquerorContext,
        cancellation: Cancellation,
    ) -> Result<ResponseStream<M::Item>> {
        self.run_stream(request, context, cancellation, None).await
    }

    /// Run the stream pipeline of `M` for a request received over a transport.
    pub async fn dispatch_stream_from_transport<M: StreamingRequest>(
        &self,
        request: M,
        context: ConquerorContext,
        cancellation: Cancellation,
        transport: TransportType,
    ) -> Result<ResponseStream<M::Item>> {
        self.run_stream(request, context, cancellation, Some(transport)).await
    }

    async fn run_stream<M: StreamingRequest>(
        &self,
        request: M,
        context: ConquerorContext,
        cancellation: Cancellation,
        transport: Option<TransportType>,
    ) -> Result<ResponseStream<M::Item>> {
        cancellation.check()?;
        let route = self.registry.resolve_stream::<M>()?;
        let transport = transport.unwrap_or_else(|| route.transport_type());
        let pipeline = route.frozen_pipeline()?;
        let ctx = RequestContext::new(self.clone(), context, cancellation.clone(), transport);

        tracing::debug!(
            message_id = ctx.message_id(),
            "Opening stream {} via {}",
            M::name(),
            transport
        );

        let stream = cancellation
            .run(pipeline.execute(request, ctx, route.terminal()))
            .await?;
        Ok(guard_stream(stream, cancellation))
    }

    /// Publish a notification with a fresh context and no cancellation.
    pub async fn publish<N: Notification>(&self, notification: N) -> Result<()> {
        self.publish_with(notification, ConquerorContext::new(), Cancellation::new()).await
    }

    /// Publish a notification to every subscriber.
    ///
    /// Subscribers run concurrently in no particular order. Every subscriber
    /// runs even if others fail; failures are returned together as
    /// `Aggregate`. Publishing without subscribers succeeds.
    pub async fn publish_with<N: Notification>(
        &self,
        notification: N,
        context: ConquerorContext,
        cancellation: Cancellation,
    ) -> Result<()> {
        cancellation.check()?;
        let observers = self.registry.observers::<N>();
        if observers.is_empty() {
            tracing::debug!("No subscribers for notification {}", N::name());
            return Ok(());
        }

        tracing::debug!(
            "Publishing {} to {} subscriber(s)",
            N::name(),
            observers.len()
        );

        let deliveries = observers.into_iter().map(|route| {
            self.run_observer(
                route,
                notification.clone(),
                context.clone(),
                cancellation.clone(),
            )
        });
        let errors: Vec<ConquerorError> = join_all(deliveries)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        if errors.is_empty() {
            Ok(())
        } else if cancellation.is_cancelled() {
            Err(ConquerorError::Cancelled)
        } else {
            Err(ConquerorError::Aggregate(errors))
        }
    }

    async fn run_observer<N: Notification>(
        &self,
        route: Arc<ObserverRoute<N>>,
        notification: N,
        context: ConquerorContext,
        cancellation: Cancellation,
    ) -> Result<()> {
        let pipeline = route.frozen_pipeline()?;
        let ctx = RequestContext::new(
            self.clone(),
            context,
            cancellation.clone(),
            TransportType::in_process(),
        );
        cancellation
            .run(pipeline.execute(notification, ctx, route.terminal()))
            .await
    }

    /// Append a pipeline configuration for `M`.
    ///
    /// Fails with `PipelineFrozen` once `M` has been dispatched.
    pub fn configure_pipeline<M, F>(&self, configure: F) -> Result<()>
    where
        M: Message,
        F: Fn(&mut MessagePipeline<M>) -> Result<()> + Send + Sync + 'static,
    {
        self.registry.resolve::<M>()?.configure(Arc::new(configure))
    }

    /// Append a pipeline configuration for streaming request `M`.
    pub fn configure_stream_pipeline<M, F>(&self, configure: F) -> Result<()>
    where
        M: StreamingRequest,
        F: Fn(&mut StreamPipeline<M>) -> Result<()> + Send + Sync + 'static,
    {
        self.registry
            .resolve_stream::<M>()?
            .configure(Arc::new(configure))
    }

    /// Append a pipeline configuration to every current subscriber of `N`.
    pub fn configure_notification_pipeline<N, F>(&self, configure: F) -> Result<()>
    where
        N: Notification,
        F: Fn(&mut NotificationPipeline<N>) -> Result<()> + Send + Sync + 'static,
    {
        let configure = Arc::new(configure);
        for route in self.registry.observers::<N>() {
            route.configure(configure.clone())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.registry.len())
            .finish()
    }
}

/// End `stream` with `Err(Cancelled)` once `cancellation` fires.
fn guard_stream<T: Send + 'static>(
    stream: ResponseStream<T>,
    cancellation: Cancellation,
) -> ResponseStream<T> {
    stream::unfold(Some(stream), move |state| {
        let cancellation = cancellation.clone();
        async move {
            let mut stream = state?;
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => Some((Err(ConquerorError::Cancelled), None)),
                item = stream.next() => item.map(|item| (item, Some(stream))),
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, notification_handler_fn, stream_handler_fn};
    use futures::TryStreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Echo(String);

    impl Message for Echo {
        type Response = String;
    }

    struct Count(u32);

    impl StreamingRequest for Count {
        type Item = u32;
    }

    #[derive(Clone)]
    struct Tick;

    impl Notification for Tick {}

    #[tokio::test]
    async fn test_dispatch_to_local_handler() {
        let dispatcher = Dispatcher::builder()
            .handle(handler_fn(|msg: Echo, ctx| async move {
                assert!(ctx.transport_type().is_in_process());
                Ok(msg.0)
            }))
            .build()
            .unwrap();

        let response = dispatcher.dispatch(Echo("hi".into())).await.unwrap();
        assert_eq!(response, "hi");
    }

    #[tokio::test]
    async fn test_dispatch_unregistered_fails() {
        let dispatcher = Dispatcher::builder().build().unwrap();
        let err = dispatcher.dispatch(Echo("hi".into())).await.unwrap_err();
        assert!(matches!(err, ConquerorError::HandlerNotFound("Echo")));
    }

    #[tokio::test]
    async fn test_dispatch_with_cancelled_token_fails_fast() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let dispatcher = Dispatcher::builder()
            .handle(handler_fn(move |msg: Echo, _ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(msg.0) }
            }))
            .build()
            .unwrap();

        let cancellation = Cancellation::new();
        cancellation.cancel();
        let err = dispatcher
            .dispatch_with(Echo("x".into()), ConquerorContext::new(), cancellation)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_nested_dispatch_shares_context() {
        struct Outer;

        impl Message for Outer {
            type Response = String;
        }

        let dispatcher = Dispatcher::builder()
            .handle(handler_fn(|_: Outer, ctx: RequestContext| async move {
                ctx.context().set("from-outer", "1");
                ctx.dispatch(Echo("inner".into())).await
            }))
            .handle(handler_fn(|msg: Echo, ctx: RequestContext| async move {
                let seen = ctx.context().get("from-outer").unwrap_or_default();
                Ok(format!("{}:{}", msg.0, seen))
            }))
            .build()
            .unwrap();

        assert_eq!(dispatcher.dispatch(Outer).await.unwrap(), "inner:1");
    }

    #[tokio::test]
    async fn test_dispatch_stream() {
        let dispatcher = Dispatcher::builder()
            .handle_stream(stream_handler_fn(|req: Count, _ctx| async move {
                Ok(stream::iter((0..req.0).map(Ok::<u32, ConquerorError>)))
            }))
            .build()
            .unwrap();

        let items: Vec<u32> = dispatcher
            .dispatch_stream(Count(3))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(items, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_stream_ends_with_cancelled_when_token_fires() {
        let dispatcher = Dispatcher::builder()
            .handle_stream(stream_handler_fn(|_: Count, _ctx| async move {
                Ok(stream::unfold(0u32, |n| async move {
                    if n > 0 {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                    Some((Ok::<u32, ConquerorError>(n), n + 1))
                }))
            }))
            .build()
            .unwrap();

        let cancellation = Cancellation::new();
        let mut stream = dispatcher
            .dispatch_stream_with(Count(0), ConquerorContext::new(), cancellation.clone())
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), 0);
        cancellation.cancel();
        assert!(matches!(
            stream.next().await,
            Some(Err(ConquerorError::Cancelled))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let dispatcher = Dispatcher::builder().build().unwrap();
        dispatcher.publish(Tick).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_collects_failures_after_all_subscribers_ran() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (a, b) = (calls.clone(), calls.clone());

        let dispatcher = Dispatcher::builder()
            .observe(notification_handler_fn(move |_: Tick, _ctx| {
                a.fetch_add(1, Ordering::SeqCst);
                async { Err(ConquerorError::handler("first failed")) }
            }))
            .observe(notification_handler_fn(move |_: Tick, _ctx| {
                b.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }))
            .build()
            .unwrap();

        let err = dispatcher.publish(Tick).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match err {
            ConquerorError::Aggregate(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].to_string(), "first failed");
            }
            other => panic!("expected aggregate, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_configure_pipeline_after_dispatch_is_rejected() {
        let dispatcher = Dispatcher::builder()
            .handle(handler_fn(|msg: Echo, _ctx| async move { Ok(msg.0) }))
            .build()
            .unwrap();

        dispatcher
            .configure_pipeline::<Echo, _>(|_pipeline| Ok(()))
            .unwrap();
        dispatcher.dispatch(Echo("x".into())).await.unwrap();

        let err = dispatcher
            .configure_pipeline::<Echo, _>(|_pipeline| Ok(()))
            .unwrap_err();
        assert!(matches!(err, ConquerorError::PipelineFrozen("Echo")));
    }
}
