//! Authorization of the current principal.
//!
//! [`AuthorizationMiddleware`] reads the [`Principal`] attached to the
//! dispatch context and short-circuits with
//! [`ConquerorError::Unauthenticated`] or [`ConquerorError::Unauthorized`]
//! before the rest of the chain runs. Two kinds of checks are supported:
//!
//! - operation checks see the principal and the message type name
//! - payload checks see the principal and the message itself
//!
//! Without a principal the checks are skipped, so operations that allow
//! anonymous callers can share a pipeline with protected ones. Use
//! [`AuthorizationMiddleware::require_principal`] to reject anonymous calls.
//!
//! # Example
//!
//! ```
//! use conqueror::middleware::AuthorizationMiddleware;
//!
//! struct DeleteCounter {
//!     name: String,
//! }
//!
//! let authorization = AuthorizationMiddleware::<DeleteCounter>::new()
//!     .require_principal()
//!     .operation_check(|principal, _operation| principal.has_role("admin"))
//!     .payload_check(|_principal, msg| match msg.name.as_str() {
//!         "system" => Err("system counters cannot be deleted".to_string()),
//!         _ => Ok(()),
//!     });
//! # let _ = authorization;
//! ```

use std::sync::Arc;

use crate::context::Principal;
use crate::error::{ConquerorError, Result};
use crate::handler::{BoxFuture, RequestContext};
use crate::message::short_type_name;
use crate::pipeline::{Middleware, Next};

type OperationCheck = Arc<dyn Fn(&Principal, &'static str) -> bool + Send + Sync>;
type PayloadCheck<M> = Arc<dyn Fn(&Principal, &M) -> std::result::Result<(), String> + Send + Sync>;

/// Rejects messages the current principal may not execute.
pub struct AuthorizationMiddleware<M> {
    require_principal: bool,
    operation_checks: Vec<OperationCheck>,
    payload_checks: Vec<PayloadCheck<M>>,
}

impl<M> AuthorizationMiddleware<M> {
    /// A middleware without checks; every call passes.
    pub fn new() -> Self {
        Self {
            require_principal: false,
            operation_checks: Vec::new(),
            payload_checks: Vec::new(),
        }
    }

    /// Fail with `Unauthenticated` when no principal is attached.
    pub fn require_principal(mut self) -> Self {
        self.require_principal = true;
        self
    }

    /// Add a check on the message type. `false` rejects the call.
    pub fn operation_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&Principal, &'static str) -> bool + Send + Sync + 'static,
    {
        self.operation_checks.push(Arc::new(check));
        self
    }

    /// Add a check on the message. `Err(reason)` rejects the call.
    ///
    /// Every payload check runs; the reasons of all failures are reported
    /// together.
    pub fn payload_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&Principal, &M) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.payload_checks.push(Arc::new(check));
        self
    }

    fn authorize(&self, principal: Option<&Principal>, message: &M) -> Result<()> {
        let operation = short_type_name::<M>();
        let Some(principal) = principal else {
            return if self.require_principal {
                Err(ConquerorError::Unauthenticated(operation))
            } else {
                Ok(())
            };
        };

        if self.operation_checks.iter().any(|check| !check(principal, operation)) {
            return Err(ConquerorError::Unauthorized {
                operation,
                principal: principal.name().to_string(),
                reasons: vec![format!("operation `{operation}` is not permitted")],
            });
        }

        let reasons: Vec<String> = self
            .payload_checks
            .iter()
            .filter_map(|check| check(principal, message).err())
            .collect();
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConquerorError::Unauthorized {
                operation,
                principal: principal.name().to_string(),
                reasons,
            })
        }
    }
}

impl<M> Clone for AuthorizationMiddleware<M> {
    fn clone(&self) -> Self {
        Self {
            require_principal: self.require_principal,
            operation_checks: self.operation_checks.clone(),
            payload_checks: self.payload_checks.clone(),
        }
    }
}

impl<M> Default for AuthorizationMiddleware<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> std::fmt::Debug for AuthorizationMiddleware<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationMiddleware")
            .field("require_principal", &self.require_principal)
            .field("operation_checks", &self.operation_checks.len())
            .field("payload_checks", &self.payload_checks.len())
            .finish()
    }
}

impl<M, R> Middleware<M, R> for AuthorizationMiddleware<M>
where
    M: Send + 'static,
    R: Send + 'static,
{
    fn handle(
        &self,
        message: M,
        ctx: RequestContext,
        next: Next<M, R>,
    ) -> BoxFuture<'static, Result<R>> {
        let principal = ctx.context().principal();
        if let Err(e) = self.authorize(principal.as_ref(), &message) {
            tracing::warn!(
                message_id = %ctx.message_id(),
                message_type = short_type_name::<M>(),
                principal = principal.as_ref().map(Principal::name),
                "Rejected message: {}",
                e
            );
            return Box::pin(async move { Err(e) });
        }
        next.run(message, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::{Cancellation, ConquerorContext, Dispatcher, Message};

    #[derive(Debug)]
    struct ResetCounter {
        name: String,
    }

    impl Message for ResetCounter {
        type Response = &'static str;
    }

    fn reset(name: &str) -> ResetCounter {
        ResetCounter {
            name: name.to_string(),
        }
    }

    fn counter_dispatcher(authorization: AuthorizationMiddleware<ResetCounter>) -> Dispatcher {
        Dispatcher::builder()
            .handle(handler_fn(|_: ResetCounter, _ctx| async { Ok("reset") }))
            .pipeline::<ResetCounter, _>(move |p| {
                p.use_middleware(authorization.clone())?;
                Ok(())
            })
            .build()
            .unwrap()
    }

    fn as_user(principal: Principal) -> ConquerorContext {
        let context = ConquerorContext::new();
        context.set_principal(principal);
        context
    }

    fn admin_only() -> AuthorizationMiddleware<ResetCounter> {
        AuthorizationMiddleware::new()
            .operation_check(|principal, _| principal.has_role("admin"))
            .payload_check(|_, msg: &ResetCounter| match msg.name.as_str() {
                "system" => Err("system counters are read-only".to_string()),
                _ => Ok(()),
            })
    }

    #[tokio::test]
    async fn test_without_checks_every_call_passes() {
        let dispatcher = counter_dispatcher(AuthorizationMiddleware::new());
        assert_eq!(dispatcher.dispatch(reset("visits")).await.unwrap(), "reset");
    }

    #[tokio::test]
    async fn test_authorized_principal_passes() {
        let dispatcher = counter_dispatcher(admin_only());
        let context = as_user(Principal::new("alice").with_role("admin"));

        let response = dispatcher
            .dispatch_with(reset("visits"), context, Cancellation::new())
            .await
            .unwrap();
        assert_eq!(response, "reset");
    }

    #[tokio::test]
    async fn test_operation_check_rejects_principal() {
        let dispatcher = counter_dispatcher(admin_only());
        let context = as_user(Principal::new("bob"));

        let err = dispatcher
            .dispatch_with(reset("visits"), context, Cancellation::new())
            .await
            .unwrap_err();
        match err {
            ConquerorError::Unauthorized {
                operation,
                principal,
                ..
            } => {
                assert_eq!(operation, "ResetCounter");
                assert_eq!(principal, "bob");
            }
            other => panic!("expected Unauthorized, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_payload_checks_report_every_reason() {
        let dispatcher = counter_dispatcher(
            admin_only().payload_check(|principal, _| Err(format!("{} is away", principal.name()))),
        );
        let context = as_user(Principal::new("alice").with_role("admin"));

        let err = dispatcher
            .dispatch_with(reset("system"), context, Cancellation::new())
            .await
            .unwrap_err();
        match err {
            ConquerorError::Unauthorized { reasons, .. } => {
                assert_eq!(reasons, vec!["system counters are read-only", "alice is away"]);
            }
            other => panic!("expected Unauthorized, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_anonymous_calls_skip_checks_unless_required() {
        let dispatcher = counter_dispatcher(admin_only());
        assert_eq!(dispatcher.dispatch(reset("system")).await.unwrap(), "reset");

        let dispatcher = counter_dispatcher(admin_only().require_principal());
        let err = dispatcher.dispatch(reset("visits")).await.unwrap_err();
        assert!(matches!(err, ConquerorError::Unauthenticated("ResetCounter")));
    }
}
