use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use advisor_contracts::{AskRequest, AskResponse};
use async_trait::async_trait;
use futures::FutureExt;

use crate::agent::{AgentClient, AgentInvocation};
use crate::aggregator::aggregate;
use crate::audit::AuditLogger;
use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::middleware::{AuditLayer, RateLimitLayer, SessionLayer, ValidateLayer};
use crate::pipeline::{Call, CallContext, Handler, Pipeline, Reply};
use crate::rate_limit::RateLimiter;
use crate::session::{SessionManager, SessionStore};

pub const ASK_OPERATION: &str = "ask";

/// Core handler: invokes the agent and folds its fragment stream. The timeout
/// covers both the invocation and the whole aggregation.
pub struct AgentHandler {
    agent: Arc<dyn AgentClient>,
    upstream_timeout: Duration,
}

impl AgentHandler {
    pub fn new(agent: Arc<dyn AgentClient>, upstream_timeout: Duration) -> Self {
        Self {
            agent,
            upstream_timeout,
        }
    }
}

#[async_trait]
impl Handler for AgentHandler {
    async fn call(&self, call: Call, ctx: &CallContext) -> Result<Reply, GatewayError> {
        let session_id = call.session_id.ok_or_else(|| {
            GatewayError::Internal("agent call without a resolved session".to_string())
        })?;

        let invocation = AgentInvocation {
            input: call.input,
            session_id: session_id.clone(),
        };

        let started = Instant::now();
        let result = tokio::time::timeout(self.upstream_timeout, async {
            let stream = self.agent.invoke(invocation).await?;
            aggregate(stream, ctx.cancel_token())
                .await
                .map_err(GatewayError::from)
        })
        .await
        .unwrap_or(Err(GatewayError::UpstreamTimeout));

        let outcome = match &result {
            Ok(_) => "ok",
            Err(GatewayError::UpstreamTimeout) => "timeout",
            Err(GatewayError::Cancelled) => "cancelled",
            Err(GatewayError::EmptyResponse) => "empty",
            Err(_) => "error",
        };
        crate::metrics::observe_upstream_call(outcome, started.elapsed());

        Ok(Reply {
            session_id,
            response: result?,
        })
    }
}

/// Everything needed to serve gateway calls: the ordered pipeline plus the
/// session manager it shares with the session routes.
#[derive(Clone)]
pub struct Gateway {
    pipeline: Pipeline,
    sessions: SessionManager,
    audit: AuditLogger,
}

impl Gateway {
    /// Builds the default pipeline: audit, validate, session, rate limit, then
    /// the agent handler.
    pub fn new(
        config: &GatewayConfig,
        agent: Arc<dyn AgentClient>,
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        audit: AuditLogger,
    ) -> Self {
        let sessions = SessionManager::new(store.clone(), clock.clone(), config.session_policy());
        let handler = AgentHandler::new(agent, config.upstream_timeout());

        let pipeline = Pipeline::builder(Arc::new(handler))
            .layer(AuditLayer::new(audit.clone(), ASK_OPERATION))
            .layer(ValidateLayer::new(config.max_input_length))
            .layer(SessionLayer::new(sessions.clone()))
            .layer(RateLimitLayer::new(
                RateLimiter::new(store, clock),
                config.rate_limit_max_calls,
                config.rate_limit_window(),
            ))
            .build();

        Self {
            pipeline,
            sessions,
            audit,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Audits a request that was refused before it could enter the pipeline,
    /// such as a body that does not decode.
    pub fn reject(&self, request_id: &str, err: &GatewayError) {
        self.audit.scope(request_id, ASK_OPERATION).rejected(None, err);
    }

    /// Runs one call through the pipeline. Panics anywhere below are caught
    /// and surface as [`GatewayError::Internal`].
    pub async fn ask(
        &self,
        request: AskRequest,
        ctx: &CallContext,
    ) -> Result<AskResponse, GatewayError> {
        let call = Call {
            input: request.query,
            session_id: request.session_id,
        };
        let claimed_session = call.session_id.clone();

        let reply = match AssertUnwindSafe(self.pipeline.run(call, ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result?,
            Err(payload) => {
                let err = GatewayError::from_panic(payload.as_ref());
                tracing::error!(code = err.code(), "gateway call panicked");
                if let Some(scope) = ctx.audit_scope() {
                    scope.failed(claimed_session.as_deref(), &err);
                }
                return Err(err);
            }
        };

        let source = reply.response.numbered_sources();
        Ok(AskResponse {
            answer: reply.response.text,
            source,
            session_id: reply.session_id,
            generated_query: reply.response.generated_query,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;
    use tokio_util::sync::CancellationToken;

    use crate::aggregator::{Fragment, FragmentStream, UpstreamFailure};
    use crate::audit::{AuditEvent, MemoryAuditSink};
    use crate::clock::ManualClock;
    use crate::session::InMemorySessionStore;

    enum Script {
        Fragments(Vec<Result<Fragment, UpstreamFailure>>),
        Refuse(UpstreamFailure),
        Hang,
        Panic,
    }

    struct ScriptedAgent {
        script: Script,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentClient for ScriptedAgent {
        async fn invoke(
            &self,
            _invocation: AgentInvocation,
        ) -> Result<FragmentStream, UpstreamFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Fragments(items) => Ok(futures::stream::iter(items.clone()).boxed()),
                Script::Refuse(failure) => Err(failure.clone()),
                Script::Hang => Ok(futures::stream::pending().boxed()),
                Script::Panic => panic!("agent client bug"),
            }
        }
    }

    fn gateway(
        script: Script,
        timeout_ms: &str,
    ) -> (Gateway, Arc<ScriptedAgent>, MemoryAuditSink) {
        let config = GatewayConfig::from_kv(&HashMap::from([
            (
                "ADVISOR_AGENT_URL".to_string(),
                "http://127.0.0.1:9/invoke".to_string(),
            ),
            (
                "ADVISOR_UPSTREAM_TIMEOUT_MS".to_string(),
                timeout_ms.to_string(),
            ),
        ]))
        .expect("config should parse");

        let agent = Arc::new(ScriptedAgent {
            script,
            calls: AtomicUsize::new(0),
        });
        let sink = MemoryAuditSink::new();
        let gateway = Gateway::new(
            &config,
            agent.clone(),
            Arc::new(InMemorySessionStore::new()),
            Arc::new(ManualClock::starting_at(1_700_000_000_000)),
            AuditLogger::new(Arc::new(sink.clone())),
        );
        (gateway, agent, sink)
    }

    fn ask(query: &str) -> AskRequest {
        AskRequest {
            query: query.to_string(),
            session_id: None,
        }
    }

    #[test]
    fn default_pipeline_order() {
        let (gateway, _, _) = gateway(Script::Hang, "1000");
        assert_eq!(
            gateway.pipeline().layer_names(),
            vec!["audit", "validate", "session", "rate_limit"]
        );
    }

    #[tokio::test]
    async fn successful_call_renders_answer_and_sources() {
        let (gateway, agent, sink) = gateway(
            Script::Fragments(vec![
                Ok(Fragment::Text("A".to_string())),
                Ok(Fragment::Citation {
                    source: "src1".to_string(),
                    quote: "q1".to_string(),
                }),
                Ok(Fragment::Text("B".to_string())),
                Ok(Fragment::Citation {
                    source: "src1".to_string(),
                    quote: "q2".to_string(),
                }),
                Ok(Fragment::Citation {
                    source: "src2".to_string(),
                    quote: "q3".to_string(),
                }),
            ]),
            "1000",
        );

        let ctx = CallContext::new("req-ok", CancellationToken::new());
        let response = gateway
            .ask(ask("how do I rotate keys?"), &ctx)
            .await
            .expect("call should succeed");

        assert_eq!(response.answer, "AB");
        assert_eq!(response.source, "[1] src1\n[2] src2");
        assert!(gateway.sessions().get(&response.session_id).is_some());
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            sink.events_for("req-ok"),
            vec![AuditEvent::Start, AuditEvent::End]
        );
    }

    #[tokio::test]
    async fn empty_stream_is_an_internal_error() {
        let (gateway, _, sink) = gateway(Script::Fragments(Vec::new()), "1000");
        let ctx = CallContext::new("req-empty", CancellationToken::new());

        let err = gateway.ask(ask("anything"), &ctx).await.unwrap_err();
        assert_eq!(err, GatewayError::EmptyResponse);
        assert_eq!(
            sink.events_for("req-empty"),
            vec![AuditEvent::Start, AuditEvent::Error]
        );
    }

    #[tokio::test]
    async fn refused_invocation_is_an_upstream_error() {
        let (gateway, _, _) = gateway(Script::Refuse(UpstreamFailure::Status(502)), "1000");
        let ctx = CallContext::new("req-502", CancellationToken::new());

        let err = gateway.ask(ask("anything"), &ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamError(_)));
    }

    #[tokio::test]
    async fn hung_stream_times_out() {
        let (gateway, _, sink) = gateway(Script::Hang, "50");
        let ctx = CallContext::new("req-hang", CancellationToken::new());

        let err = gateway.ask(ask("anything"), &ctx).await.unwrap_err();
        assert_eq!(err, GatewayError::UpstreamTimeout);
        assert_eq!(
            sink.events_for("req-hang"),
            vec![AuditEvent::Start, AuditEvent::Error]
        );
    }

    #[tokio::test]
    async fn cancelled_call_stops_waiting_for_the_agent() {
        let (gateway, _, _) = gateway(Script::Hang, "60000");
        let cancel = CancellationToken::new();
        let ctx = CallContext::new("req-cancel", cancel.clone());
        cancel.cancel();

        let err = gateway.ask(ask("anything"), &ctx).await.unwrap_err();
        assert_eq!(err, GatewayError::Cancelled);
    }

    #[tokio::test]
    async fn dropped_call_still_closes_its_audit_record() {
        let (gateway, agent, sink) = gateway(Script::Hang, "60000");
        let ctx = CallContext::new("req-dropped", CancellationToken::new());

        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            gateway.ask(ask("anything"), &ctx),
        )
        .await;
        assert!(outcome.is_err(), "hung call should not complete");
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);

        assert_eq!(
            sink.events_for("req-dropped"),
            vec![AuditEvent::Start, AuditEvent::Error]
        );
        let records = sink.records();
        assert_eq!(records[1].code, Some("ERR_CANCELLED"));
    }

    #[test]
    fn rejected_body_is_audited_without_a_call() {
        let (gateway, agent, sink) = gateway(Script::Hang, "1000");

        gateway.reject(
            "req-body",
            &GatewayError::Validation("invalid JSON body".to_string()),
        );

        assert_eq!(sink.events_for("req-body"), vec![AuditEvent::Rejected]);
        assert_eq!(sink.records()[0].code, Some("ERR_VALIDATION"));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panics_are_normalized_and_audited() {
        let (gateway, _, sink) = gateway(Script::Panic, "1000");
        let ctx = CallContext::new("req-panic", CancellationToken::new());

        let err = gateway.ask(ask("anything"), &ctx).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::Internal("panic: agent client bug".to_string())
        );
        assert_eq!(
            sink.events_for("req-panic"),
            vec![AuditEvent::Start, AuditEvent::Error]
        );
    }
}
