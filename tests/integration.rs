//! Integration tests for conqueror.
//!
//! These tests exercise the dispatcher together with pipelines, context
//! propagation and both transports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conqueror::config::{FramedConfig, HttpTransportConfig};
use conqueror::handler::{handler_fn, notification_handler_fn, BoxFuture};
use conqueror::middleware::AuthorizationMiddleware;
use conqueror::pipeline::{middleware_fn, Middleware, Next};
use conqueror::transport::framed::{FramedConnection, FramedReceiver, FramedTransportClient};
use conqueror::transport::http::{HttpMessage, HttpMessageReceiver, HttpTransportClient};
use conqueror::{
    Cancellation, ConquerorContext, ConquerorError, Dispatcher, Message, Notification, Principal,
    RequestContext, Result,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IncrementCounter {
    amount: i64,
}

impl Message for IncrementCounter {
    type Response = i64;
}

impl HttpMessage for IncrementCounter {}

#[derive(Debug, Clone)]
struct Echo(String);

impl Message for Echo {
    type Response = String;
}

#[derive(Debug)]
struct Unregistered;

impl Message for Unregistered {
    type Response = ();
}

#[derive(Debug)]
struct Slow;

impl Message for Slow {
    type Response = ();
}

#[derive(Debug, Clone)]
struct CounterReset;

impl Notification for CounterReset {}

/// Records entry and exit of the chain under its label.
struct Record {
    label: &'static str,
    log: Log,
}

impl<M: Send + 'static, R: Send + 'static> Middleware<M, R> for Record {
    fn handle(
        &self,
        message: M,
        ctx: RequestContext,
        next: Next<M, R>,
    ) -> BoxFuture<'static, Result<R>> {
        let label = self.label;
        let log = Arc::clone(&self.log);
        Box::pin(async move {
            log.lock().push(format!("{label}:before"));
            let result = next.run(message, ctx).await;
            log.lock().push(format!("{label}:after"));
            result
        })
    }

    fn name(&self) -> &'static str {
        self.label
    }
}

/// Counter handler shared by the in-process and remote setups.
async fn increment(msg: IncrementCounter, _ctx: RequestContext) -> Result<i64> {
    Ok(10 + msg.amount)
}

fn counter_dispatcher() -> Dispatcher {
    Dispatcher::builder()
        .handle(handler_fn(increment))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_middleware_wraps_in_registration_order() {
    let log: Log = Arc::default();
    let pipeline_log = Arc::clone(&log);

    let dispatcher = Dispatcher::builder()
        .handle(handler_fn({
            let log = Arc::clone(&log);
            move |msg: Echo, _ctx| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().push("handler".to_string());
                    Ok(msg.0)
                }
            }
        }))
        .pipeline::<Echo, _>(move |p| {
            for label in ["m1", "m2", "m3"] {
                p.use_middleware(Record {
                    label,
                    log: Arc::clone(&pipeline_log),
                })?;
            }
            Ok(())
        })
        .build()
        .unwrap();

    let response = dispatcher.dispatch(Echo("hi".to_string())).await.unwrap();
    assert_eq!(response, "hi");

    assert_eq!(
        *log.lock(),
        vec![
            "m1:before",
            "m2:before",
            "m3:before",
            "handler",
            "m3:after",
            "m2:after",
            "m1:after",
        ]
    );
}

#[tokio::test]
async fn test_unregistered_message_fails() {
    let dispatcher = counter_dispatcher();

    let err = dispatcher.dispatch(Unregistered).await.unwrap_err();
    assert!(matches!(err, ConquerorError::HandlerNotFound("Unregistered")));
}

#[test]
fn test_duplicate_handler_fails_build() {
    let err = Dispatcher::builder()
        .handle(handler_fn(increment))
        .handle(handler_fn(increment))
        .build()
        .unwrap_err();

    assert!(matches!(err, ConquerorError::DuplicateRegistration("IncrementCounter")));
}

#[tokio::test]
async fn test_every_observer_receives_notification() {
    let calls = Arc::new(AtomicUsize::new(0));
    let observer = |calls: Arc<AtomicUsize>| {
        notification_handler_fn(move |_: CounterReset, _ctx| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };

    let dispatcher = Dispatcher::builder()
        .observe(observer(Arc::clone(&calls)))
        .observe(observer(Arc::clone(&calls)))
        .build()
        .unwrap();

    dispatcher.publish(CounterReset).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_publish_without_observers_succeeds() {
    let dispatcher = counter_dispatcher();
    dispatcher.publish(CounterReset).await.unwrap();
}

#[tokio::test]
async fn test_context_flows_through_pipeline() {
    let dispatcher = Dispatcher::builder()
        .handle(handler_fn(|_: Echo, ctx: RequestContext| async move {
            Ok(format!(
                "{}/{}",
                ctx.context().get("stage").unwrap_or_default(),
                ctx.context().get("seen").unwrap_or_default()
            ))
        }))
        .pipeline::<Echo, _>(|p| {
            p.use_middleware(middleware_fn(
                |msg: Echo, ctx: RequestContext, next: Next<Echo, String>| async move {
                    ctx.context().set("stage", "first");
                    next.run(msg, ctx).await
                },
            ))?;
            p.use_middleware(middleware_fn(
                |msg: Echo, ctx: RequestContext, next: Next<Echo, String>| async move {
                    let stage = ctx.context().get("stage").unwrap_or_default();
                    ctx.context().set("seen", format!("after-{stage}"));
                    next.run(msg, ctx).await
                },
            ))?;
            Ok(())
        })
        .build()
        .unwrap();

    let context = ConquerorContext::new();
    let response = dispatcher
        .dispatch_with(Echo(String::new()), context.clone(), Cancellation::new())
        .await
        .unwrap();

    assert_eq!(response, "first/after-first");
    assert_eq!(context.get("stage").as_deref(), Some("first"));
}

#[tokio::test]
async fn test_concurrent_dispatches_do_not_share_context() {
    let dispatcher = Dispatcher::builder()
        .handle(handler_fn(|msg: Echo, ctx: RequestContext| async move {
            ctx.context().set("owner", msg.0.clone());
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(ctx.context().get("owner").unwrap_or_default())
        }))
        .handle(handler_fn(|msg: IncrementCounter, ctx: RequestContext| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(ctx.context().get("owner"), None);
            ctx.context().set("owner", "counter");
            Ok(msg.amount)
        }))
        .build()
        .unwrap();

    let (echo, counter) = tokio::join!(
        dispatcher.dispatch(Echo("echo".to_string())),
        dispatcher.dispatch(IncrementCounter { amount: 1 }),
    );

    assert_eq!(echo.unwrap(), "echo");
    assert_eq!(counter.unwrap(), 1);
}

#[tokio::test]
async fn test_remote_round_trips_match_in_process() {
    let local = counter_dispatcher()
        .dispatch(IncrementCounter { amount: 5 })
        .await
        .unwrap();

    let http_receiver = HttpMessageReceiver::new(counter_dispatcher())
        .map::<IncrementCounter>()
        .unwrap();
    let http_client = Dispatcher::builder()
        .transport(
            HttpTransportClient::<IncrementCounter, _>::with_sender(
                http_receiver,
                HttpTransportConfig::new("http://localhost:8080"),
            )
            .unwrap(),
        )
        .build()
        .unwrap();

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let framed_receiver = FramedReceiver::new(counter_dispatcher())
        .map::<IncrementCounter>()
        .unwrap();
    tokio::spawn(async move { framed_receiver.serve(server_io).await });
    let connection = FramedConnection::connect(client_io, &FramedConfig::default());
    let framed_client = Dispatcher::builder()
        .transport(FramedTransportClient::<IncrementCounter>::new(connection))
        .build()
        .unwrap();

    let over_http = http_client.dispatch(IncrementCounter { amount: 5 }).await.unwrap();
    let over_framed = framed_client.dispatch(IncrementCounter { amount: 5 }).await.unwrap();

    assert_eq!(local, 15);
    assert_eq!(over_http, 15);
    assert_eq!(over_framed, 15);
}

#[tokio::test]
async fn test_cancelled_dispatch_reports_cancelled() {
    let dispatcher = Dispatcher::builder()
        .handle(handler_fn(|_: Slow, _ctx| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }))
        .build()
        .unwrap();

    let cancellation = Cancellation::new();
    let call = {
        let dispatcher = dispatcher.clone();
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            dispatcher
                .dispatch_with(Slow, ConquerorContext::new(), cancellation)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancellation.cancel();

    let err = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_pipeline_frozen_after_first_dispatch() {
    let log: Log = Arc::default();
    let dispatcher = Dispatcher::builder()
        .handle_fn(|msg: Echo, _ctx| async move { Ok(msg.0) })
        .build()
        .unwrap();

    let first_log = Arc::clone(&log);
    dispatcher
        .configure_pipeline::<Echo, _>(move |p| {
            p.use_middleware(Record {
                label: "early",
                log: Arc::clone(&first_log),
            })?;
            Ok(())
        })
        .unwrap();

    dispatcher.dispatch(Echo("a".to_string())).await.unwrap();
    assert_eq!(*log.lock(), vec!["early:before", "early:after"]);

    let late_log = Arc::clone(&log);
    let err = dispatcher
        .configure_pipeline::<Echo, _>(move |p| {
            p.use_middleware(Record {
                label: "late",
                log: Arc::clone(&late_log),
            })?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, ConquerorError::PipelineFrozen("Echo")));

    let err = dispatcher
        .configure_pipeline::<Echo, _>(|p| {
            p.without::<Record>()?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, ConquerorError::PipelineFrozen(_)));

    dispatcher.dispatch(Echo("b".to_string())).await.unwrap();
    assert_eq!(log.lock().len(), 4);
}

#[tokio::test]
async fn test_next_run_after_dispatch_completed_is_rejected() {
    type Stash = Arc<Mutex<Option<(Next<Echo, String>, RequestContext)>>>;
    let stash: Stash = Arc::default();

    let kept = Arc::clone(&stash);
    let dispatcher = Dispatcher::builder()
        .handle_fn(|msg: Echo, _ctx| async move { Ok(msg.0) })
        .pipeline::<Echo, _>(move |p| {
            let kept = Arc::clone(&kept);
            p.use_middleware(
                middleware_fn(move |_: Echo, ctx: RequestContext, next: Next<Echo, String>| {
                    *kept.lock() = Some((next, ctx));
                    async { Ok("cached".to_string()) }
                })
                .named("Stash"),
            )?;
            Ok(())
        })
        .build()
        .unwrap();

    let response = dispatcher.dispatch(Echo("live".to_string())).await.unwrap();
    assert_eq!(response, "cached");

    let (next, ctx) = stash.lock().take().unwrap();
    let err = next.run(Echo("late".to_string()), ctx).await.unwrap_err();
    match err {
        ConquerorError::MiddlewareContractViolation(message) => {
            assert!(message.contains("`Stash`"), "{message}");
            assert!(message.contains("after the dispatch completed"), "{message}");
        }
        other => panic!("expected a contract violation, got {other}"),
    }
}

#[tokio::test]
async fn test_rejected_principal_maps_to_forbidden_over_http() {
    let server = Dispatcher::builder()
        .handle(handler_fn(increment))
        .pipeline::<IncrementCounter, _>(|p| {
            p.use_middleware(middleware_fn(
                |msg: IncrementCounter, ctx: RequestContext, next: Next<IncrementCounter, i64>| {
                    if let Some(user) = ctx.context().downstream().get("user") {
                        let mut principal = Principal::new(user.as_str());
                        if user == "alice" {
                            principal = principal.with_role("admin");
                        }
                        ctx.context().set_principal(principal);
                    }
                    next.run(msg, ctx)
                },
            ))?
            .use_middleware(
                AuthorizationMiddleware::<IncrementCounter>::new()
                    .require_principal()
                    .operation_check(|principal, _| principal.has_role("admin")),
            )?;
            Ok(())
        })
        .build()
        .unwrap();

    let receiver = HttpMessageReceiver::new(server).map::<IncrementCounter>().unwrap();
    let client = Dispatcher::builder()
        .transport(
            HttpTransportClient::<IncrementCounter, _>::with_sender(
                receiver,
                HttpTransportConfig::new("http://localhost:8080"),
            )
            .unwrap(),
        )
        .build()
        .unwrap();

    let as_user = |name: Option<&str>| {
        let context = ConquerorContext::new();
        if let Some(name) = name {
            context.downstream().set("user", name);
        }
        context
    };
    let status = |err: ConquerorError| match err {
        ConquerorError::TransportFailure { status, .. } => status,
        other => panic!("expected a transport failure, got {other}"),
    };

    let allowed = client
        .dispatch_with(IncrementCounter { amount: 5 }, as_user(Some("alice")), Cancellation::new())
        .await
        .unwrap();
    assert_eq!(allowed, 15);

    let denied = client
        .dispatch_with(IncrementCounter { amount: 5 }, as_user(Some("bob")), Cancellation::new())
        .await
        .unwrap_err();
    assert_eq!(status(denied), Some(403));

    let anonymous = client
        .dispatch_with(IncrementCounter { amount: 5 }, as_user(None), Cancellation::new())
        .await
        .unwrap_err();
    assert_eq!(status(anonymous), Some(401));
}
