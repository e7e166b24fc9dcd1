//! Middleware trait and the continuation that drives the chain.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ConquerorError, Result};
use crate::handler::{BoxFuture, RequestContext};
use crate::message::short_type_name;

/// How often a middleware may invoke the rest of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NextPolicy {
    /// Zero or one invocation. Enforced by [`Next::run`] taking `self`.
    #[default]
    AtMostOnce,
    /// Any number of invocations through [`Next::repeatable`].
    Repeatable,
}

/// A pipeline stage around a message of type `M` producing `R`.
///
/// A middleware may pass the message through, transform the message or the
/// response, short-circuit by not calling `next`, or translate errors.
pub trait Middleware<M, R>: Send + Sync + 'static {
    /// Run this stage.
    fn handle(
        &self,
        message: M,
        ctx: RequestContext,
        next: Next<M, R>,
    ) -> BoxFuture<'static, Result<R>>;

    /// Declares whether `next` may be invoked more than once.
    fn next_policy(&self) -> NextPolicy {
        NextPolicy::AtMostOnce
    }

    /// Name used in diagnostics.
    fn name(&self) -> &'static str {
        short_type_name::<Self>()
    }
}

/// [`Middleware`] with downcasting support, used by pipeline configuration.
pub trait AnyMiddleware<M, R>: Middleware<M, R> {
    #[doc(hidden)]
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<M, R, T> AnyMiddleware<M, R> for T
where
    T: Middleware<M, R>,
{
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Terminal step of a chain (local handler or transport client).
pub(crate) type Terminal<M, R> =
    Arc<dyn Fn(M, RequestContext) -> BoxFuture<'static, Result<R>> + Send + Sync>;

pub(crate) type Chain<M, R> = Arc<[Arc<dyn AnyMiddleware<M, R>>]>;

/// Continuation handed to a middleware: the rest of the chain.
pub struct Next<M, R> {
    chain: Chain<M, R>,
    index: usize,
    terminal: Terminal<M, R>,
    finalized: Arc<AtomicBool>,
    owner: &'static str,
    policy: NextPolicy,
}

impl<M, R> Next<M, R>
where
    M: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn start(
        chain: Chain<M, R>,
        terminal: Terminal<M, R>,
        finalized: Arc<AtomicBool>,
    ) -> Self {
        Self {
            chain,
            index: 0,
            terminal,
            finalized,
            owner: "dispatcher",
            policy: NextPolicy::AtMostOnce,
        }
    }

    /// Invoke the rest of the chain.
    ///
    /// Fails with `MiddlewareContractViolation` if the dispatch that created
    /// this continuation has already completed.
    pub fn run(self, message: M, ctx: RequestContext) -> BoxFuture<'static, Result<R>> {
        self.invoke(message, ctx)
    }

    /// Convert into a continuation that may be invoked several times.
    ///
    /// Only middleware declaring [`NextPolicy::Repeatable`] may do this.
    pub fn repeatable(self) -> Result<RepeatableNext<M, R>> {
        match self.policy {
            NextPolicy::Repeatable => Ok(RepeatableNext { next: self }),
            NextPolicy::AtMostOnce => Err(ConquerorError::MiddlewareContractViolation(format!(
                "middleware `{}` requested a repeatable next step without declaring \
                 NextPolicy::Repeatable",
                self.owner
            ))),
        }
    }

    fn invoke(&self, message: M, ctx: RequestContext) -> BoxFuture<'static, Result<R>> {
        if self.finalized.load(Ordering::Acquire) {
            let owner = self.owner;
            return Box::pin(async move {
                Err(ConquerorError::MiddlewareContractViolation(format!(
                    "middleware `{owner}` invoked its next step after the dispatch completed"
                )))
            });
        }

        match self.chain.get(self.index) {
            Some(middleware) => {
                let next = Next {
                    chain: Arc::clone(&self.chain),
                    index: self.index + 1,
                    terminal: Arc::clone(&self.terminal),
                    finalized: Arc::clone(&self.finalized),
                    owner: middleware.name(),
                    policy: middleware.next_policy(),
                };
                middleware.handle(message, ctx, next)
            }
            None => (self.terminal)(message, ctx),
        }
    }
}

impl<M, R> std::fmt::Debug for Next<M, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("remaining", &(self.chain.len().saturating_sub(self.index)))
            .field("policy", &self.policy)
            .finish()
    }
}

/// Continuation that may be invoked any number of times.
///
/// Obtained through [`Next::repeatable`].
pub struct RepeatableNext<M, R> {
    next: Next<M, R>,
}

impl<M, R> RepeatableNext<M, R>
where
    M: Send + 'static,
    R: Send + 'static,
{
    /// Invoke the rest of the chain.
    pub fn run(&self, message: M, ctx: RequestContext) -> BoxFuture<'static, Result<R>> {
        self.next.invoke(message, ctx)
    }
}

impl<M, R> Clone for RepeatableNext<M, R> {
    fn clone(&self) -> Self {
        Self {
            next: Next {
                chain: Arc::clone(&self.next.chain),
                index: self.next.index,
                terminal: Arc::clone(&self.next.terminal),
                finalized: Arc::clone(&self.next.finalized),
                owner: self.next.owner,
                policy: self.next.policy,
            },
        }
    }
}

/// Closure adapter for [`Middleware`].
pub struct MiddlewareFn<F, M, R, Fut> {
    f: F,
    name: &'static str,
    _phantom: PhantomData<fn(M) -> (R, Fut)>,
}

impl<F, M, R, Fut> MiddlewareFn<F, M, R, Fut> {
    /// Override the diagnostic name, which defaults to the closure's
    /// enclosing function.
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

/// Wrap a closure `(message, ctx, next) -> Future<Output = Result<R>>`.
///
/// The resulting middleware has [`NextPolicy::AtMostOnce`].
pub fn middleware_fn<M, R, F, Fut>(f: F) -> MiddlewareFn<F, M, R, Fut>
where
    F: Fn(M, RequestContext, Next<M, R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    MiddlewareFn {
        f,
        name: closure_name::<F>(),
        _phantom: PhantomData,
    }
}

/// `crate::module::setup::{{closure}}` becomes `setup::{{closure}}`.
fn closure_name<F>() -> &'static str {
    let full = std::any::type_name::<F>();
    let base = full.split('<').next().unwrap_or(full);
    let owner = base.trim_end_matches("::{{closure}}");
    match owner.rfind("::") {
        Some(at) => &base[at + 2..],
        None => base,
    }
}

impl<M, R, F, Fut> Middleware<M, R> for MiddlewareFn<F, M, R, Fut>
where
    M: 'static,
    R: 'static,
    F: Fn(M, RequestContext, Next<M, R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn handle(
        &self,
        message: M,
        ctx: RequestContext,
        next: Next<M, R>,
    ) -> BoxFuture<'static, Result<R>> {
        Box::pin((self.f)(message, ctx, next))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
