//! Retry of failed executions.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConquerorError, Result};
use crate::handler::{BoxFuture, RequestContext};
use crate::message::short_type_name;
use crate::pipeline::{Middleware, Next, NextPolicy};

type RetryPredicate = Arc<dyn Fn(&ConquerorError) -> bool + Send + Sync>;

/// Re-runs the rest of the pipeline when it fails with a retryable error.
///
/// By default transport failures are retried up to 3 attempts in total with
/// 100ms between attempts. Cancellation stops retrying immediately.
#[derive(Clone)]
pub struct RetryMiddleware {
    max_attempts: u32,
    delay: Duration,
    retry_if: RetryPredicate,
}

impl RetryMiddleware {
    /// Retry transport failures, 3 attempts in total, 100ms apart.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of attempts, including the first one. Clamped to at least 1.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Pause between attempts.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Decide which errors are retried.
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ConquerorError) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Arc::new(predicate);
        self
    }
}

impl Default for RetryMiddleware {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
            retry_if: Arc::new(ConquerorError::is_transport_failure),
        }
    }
}

impl std::fmt::Debug for RetryMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryMiddleware")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl<M, R> Middleware<M, R> for RetryMiddleware
where
    M: Clone + Send + 'static,
    R: Send + 'static,
{
    fn handle(
        &self,
        message: M,
        ctx: RequestContext,
        next: Next<M, R>,
    ) -> BoxFuture<'static, Result<R>> {
        let config = self.clone();
        Box::pin(async move {
            let next = next.repeatable()?;
            let mut attempt = 1;
            loop {
                let error = match next.run(message.clone(), ctx.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(e) => e,
                };

                let exhausted = attempt >= config.max_attempts;
                if exhausted || error.is_cancelled() || !(config.retry_if)(&error) {
                    return Err(error);
                }

                tracing::warn!(
                    message_id = %ctx.message_id(),
                    message_type = short_type_name::<M>(),
                    attempt,
                    max_attempts = config.max_attempts,
                    "Retrying after failure: {}",
                    error
                );

                ctx.cancellation().sleep(config.delay).await?;
                attempt += 1;
            }
        })
    }

    fn next_policy(&self) -> NextPolicy {
        NextPolicy::Repeatable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::pipeline::middleware_fn;
    use crate::{Cancellation, Dispatcher, Message};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone)]
    struct Fetch;

    impl Message for Fetch {
        type Response = &'static str;
    }

    fn flaky(failures: u32, calls: Arc<AtomicU32>) -> Dispatcher {
        Dispatcher::builder()
            .handle(handler_fn(move |_: Fetch, _ctx| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < failures {
                        Err(ConquerorError::transport("http", Some(503), "unavailable"))
                    } else {
                        Ok("fetched")
                    }
                }
            }))
            .pipeline::<Fetch, _>(|p| {
                p.use_middleware(RetryMiddleware::new().delay(Duration::from_millis(1)))?;
                Ok(())
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_retries_transport_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = flaky(2, Arc::clone(&calls));

        assert_eq!(dispatcher.dispatch(Fetch).await.unwrap(), "fetched");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = flaky(10, Arc::clone(&calls));

        let err = dispatcher.dispatch(Fetch).await.unwrap_err();
        assert!(err.is_transport_failure());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_business_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let dispatcher = Dispatcher::builder()
            .handle(handler_fn(move |_: Fetch, _ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<&'static str, _>(ConquerorError::handler("not found")) }
            }))
            .pipeline::<Fetch, _>(|p| {
                p.use_middleware(RetryMiddleware::new())?;
                Ok(())
            })
            .build()
            .unwrap();

        assert!(dispatcher.dispatch(Fetch).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let dispatcher = Dispatcher::builder()
            .handle(handler_fn(move |_: Fetch, _ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<&'static str, _>(ConquerorError::transport("http", None, "reset")) }
            }))
            .pipeline::<Fetch, _>(|p| {
                p.use_middleware(RetryMiddleware::new().delay(Duration::from_secs(60)))?;
                Ok(())
            })
            .build()
            .unwrap();

        let cancellation = Cancellation::new();
        let trigger = cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = dispatcher
            .dispatch_with(Fetch, Default::default(), cancellation)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_repeatable_requires_declared_policy() {
        let dispatcher = Dispatcher::builder()
            .handle(handler_fn(|_: Fetch, _ctx| async { Ok("fetched") }))
            .pipeline::<Fetch, _>(|p| {
                p.use_middleware(middleware_fn(
                    |msg: Fetch, ctx: RequestContext, next: Next<Fetch, &'static str>| async move {
                        let next = next.repeatable()?;
                        next.run(msg, ctx).await
                    },
                ))?;
                Ok(())
            })
            .build()
            .unwrap();

        let err = dispatcher.dispatch(Fetch).await.unwrap_err();
        assert!(matches!(err, ConquerorError::MiddlewareContractViolation(_)));
    }
}
