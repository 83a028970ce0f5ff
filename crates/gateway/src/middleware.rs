use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use crate::audit::{AuditLogger, AuditScope};
use crate::error::GatewayError;
use crate::pipeline::{Call, CallContext, Middleware, Next, Reply};
use crate::rate_limit::RateLimiter;
use crate::session::{SessionManager, SessionStatus};
use crate::validation::sanitize_text;

/// Writes the audit trail for the call. Must be the outermost layer so that
/// every rejection below it is recorded.
pub struct AuditLayer {
    logger: AuditLogger,
    operation: &'static str,
}

impl AuditLayer {
    pub fn new(logger: AuditLogger, operation: &'static str) -> Self {
        Self { logger, operation }
    }
}

#[async_trait]
impl Middleware for AuditLayer {
    fn name(&self) -> &'static str {
        "audit"
    }

    async fn handle(
        &self,
        call: Call,
        ctx: &CallContext,
        next: Next<'_>,
    ) -> Result<Reply, GatewayError> {
        let scope = self.logger.scope(ctx.request_id(), self.operation);
        if !ctx.attach_audit(scope.clone()) {
            tracing::warn!("audit scope already attached");
        }

        let guard = OpenScope {
            scope: scope.clone(),
            ctx,
            session_id: call.session_id.clone(),
        };

        let result = match AssertUnwindSafe(next.run(call, ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let err = GatewayError::from_panic(payload.as_ref());
                tracing::error!(code = err.code(), "gateway call panicked");
                Err(err)
            }
        };

        match &result {
            Ok(reply) => scope.finished(Some(reply.session_id.as_str())),
            Err(err) if ctx.is_admitted() => scope.failed(guard.session_id.as_deref(), err),
            Err(err) => scope.rejected(guard.session_id.as_deref(), err),
        }

        result
    }
}

/// Closes an admitted call's audit record when the call future is dropped
/// before it produced a result.
struct OpenScope<'a> {
    scope: AuditScope,
    ctx: &'a CallContext,
    session_id: Option<String>,
}

impl Drop for OpenScope<'_> {
    fn drop(&mut self) {
        if self.ctx.is_admitted() && !self.scope.is_closed() {
            self.scope
                .failed(self.session_id.as_deref(), &GatewayError::Cancelled);
        }
    }
}

/// Rejects input that fails the text allow-list and forwards the trimmed text.
pub struct ValidateLayer {
    max_input_length: usize,
}

impl ValidateLayer {
    pub fn new(max_input_length: usize) -> Self {
        Self { max_input_length }
    }
}

#[async_trait]
impl Middleware for ValidateLayer {
    fn name(&self) -> &'static str {
        "validate"
    }

    async fn handle(
        &self,
        mut call: Call,
        ctx: &CallContext,
        next: Next<'_>,
    ) -> Result<Reply, GatewayError> {
        call.input = sanitize_text(&call.input, self.max_input_length)?;
        next.run(call, ctx).await
    }
}

/// Resolves the call's session, creating one when the caller supplied none.
pub struct SessionLayer {
    sessions: SessionManager,
}

impl SessionLayer {
    pub fn new(sessions: SessionManager) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Middleware for SessionLayer {
    fn name(&self) -> &'static str {
        "session"
    }

    async fn handle(
        &self,
        mut call: Call,
        ctx: &CallContext,
        next: Next<'_>,
    ) -> Result<Reply, GatewayError> {
        let status = call
            .session_id
            .as_deref()
            .map(|session_id| self.sessions.check(session_id));

        match status {
            None => {
                let session = self.sessions.create_session();
                call.session_id = Some(session.id);
            }
            Some(SessionStatus::Valid) => {}
            Some(SessionStatus::Expired) => return Err(GatewayError::SessionExpired),
            Some(SessionStatus::NotFound) => return Err(GatewayError::SessionNotFound),
        }

        next.run(call, ctx).await
    }
}

/// Applies the per-session sliding-window limit. Runs after the session is
/// resolved.
pub struct RateLimitLayer {
    limiter: RateLimiter,
    max_calls: u32,
    window: Duration,
}

impl RateLimitLayer {
    pub fn new(limiter: RateLimiter, max_calls: u32, window: Duration) -> Self {
        Self {
            limiter,
            max_calls,
            window,
        }
    }
}

#[async_trait]
impl Middleware for RateLimitLayer {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn handle(
        &self,
        call: Call,
        ctx: &CallContext,
        next: Next<'_>,
    ) -> Result<Reply, GatewayError> {
        let Some(session_id) = call.session_id.as_deref() else {
            return Err(GatewayError::Internal(
                "rate limit reached without a resolved session".to_string(),
            ));
        };

        self.limiter
            .admit(session_id, self.max_calls, self.window)?;
        next.run(call, ctx).await
    }
}
