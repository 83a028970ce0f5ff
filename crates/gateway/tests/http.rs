use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use advisor_contracts::{AgentRequest, AskResponse, CreateSessionResponse, ErrorResponse};
use advisor_gateway::agent::{AgentClient, AgentInvocation, HttpAgentClient};
use advisor_gateway::aggregator::{Fragment, FragmentStream, UpstreamFailure};
use advisor_gateway::audit::{AuditLogger, RedactionPolicy, TracingAuditSink};
use advisor_gateway::clock::SystemClock;
use advisor_gateway::config::GatewayConfig;
use advisor_gateway::gateway::Gateway;
use advisor_gateway::http::{AppState, router};
use advisor_gateway::session::InMemorySessionStore;
use async_trait::async_trait;
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use reqwest::StatusCode;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const LEAKY_DETAIL: &str = "connect to 10.9.8.7:443 refused";

enum Reply {
    Answer,
    Refuse,
}

struct FakeAgent {
    reply: Reply,
    calls: AtomicUsize,
}

impl FakeAgent {
    fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reply,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<FragmentStream, UpstreamFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.reply {
            Reply::Answer => Ok(futures::stream::iter(vec![
                Ok(Fragment::Text(format!("answer to: {}", invocation.input))),
                Ok(Fragment::Citation {
                    source: "kb/advisory-7.json".to_string(),
                    quote: "apply the vendor patch".to_string(),
                }),
            ])
            .boxed()),
            Reply::Refuse => Err(UpstreamFailure::Transport(LEAKY_DETAIL.to_string())),
        }
    }
}

async fn start_gateway(
    agent: Arc<dyn AgentClient>,
    overrides: &[(&str, &str)],
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let mut kv = HashMap::from([(
        "ADVISOR_AGENT_URL".to_string(),
        "http://127.0.0.1:9/unused".to_string(),
    )]);
    for (key, value) in overrides {
        kv.insert((*key).to_string(), (*value).to_string());
    }
    let config = GatewayConfig::from_kv(&kv).expect("gateway config should be valid");

    let gateway = Gateway::new(
        &config,
        agent,
        Arc::new(InMemorySessionStore::new()),
        Arc::new(SystemClock),
        AuditLogger::new(Arc::new(TracingAuditSink::new(RedactionPolicy::Redact))),
    );

    spawn_server(router(AppState::new(
        config,
        gateway,
        CancellationToken::new(),
    )))
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_query_is_rejected_before_the_agent_is_called() {
    let log_buf = init_test_tracing();
    let agent = FakeAgent::new(Reply::Answer);
    let (addr, shutdown, task) = start_gateway(agent.clone(), &[]).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/ask", addr))
        .header("x-request-id", "req-oversized-1")
        .json(&serde_json::json!({ "query": "a".repeat(1001) }))
        .send()
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("req-oversized-1")
    );
    assert_eq!(
        response
            .headers()
            .get("x-frame-options")
            .and_then(|v| v.to_str().ok()),
        Some("DENY")
    );
    assert_eq!(
        response
            .headers()
            .get("x-content-type-options")
            .and_then(|v| v.to_str().ok()),
        Some("nosniff")
    );

    let body: ErrorResponse = response.json().await.expect("error body should parse");
    assert_eq!(body.error, "Invalid input");
    assert_eq!(body.status, 400);
    assert!(body.details.is_some());
    assert_eq!(agent.calls(), 0);

    let logs = captured_lines(&log_buf, "request_id=req-oversized-1");
    assert!(
        logs.iter().any(|line| line.contains("rejected")),
        "expected a rejected audit record, got {:?}",
        logs
    );
    assert!(!logs.iter().any(|line| line.contains("aaaaaaaaaa")));

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_lifecycle_over_http() {
    let agent = FakeAgent::new(Reply::Answer);
    let (addr, shutdown, task) = start_gateway(agent.clone(), &[]).await;
    let client = reqwest::Client::new();

    let created: CreateSessionResponse = client
        .post(format!("http://{}/v1/sessions", addr))
        .send()
        .await
        .expect("request should succeed")
        .json()
        .await
        .expect("session body should parse");
    assert_eq!(created.expires_in_secs, 3600);

    let response = client
        .post(format!("http://{}/v1/ask", addr))
        .json(&serde_json::json!({
            "query": "  how do I mitigate CVE-2024-3094?  ",
            "session_id": created.session_id,
        }))
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-request-id").is_some());

    let answer: AskResponse = response.json().await.expect("answer should parse");
    assert_eq!(answer.answer, "answer to: how do I mitigate CVE-2024-3094?");
    assert_eq!(answer.source, "[1] kb/advisory-7.json");
    assert_eq!(answer.session_id, created.session_id);
    assert_eq!(agent.calls(), 1);

    let ended = client
        .delete(format!("http://{}/v1/sessions/{}", addr, created.session_id))
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(ended.status(), StatusCode::NO_CONTENT);

    let response = client
        .post(format!("http://{}/v1/ask", addr))
        .json(&serde_json::json!({
            "query": "follow-up",
            "session_id": created.session_id,
        }))
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorResponse = response.json().await.expect("error body should parse");
    assert_eq!(body.error, "Session not found");
    assert_eq!(agent.calls(), 1);

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ask_without_session_creates_one() {
    let agent = FakeAgent::new(Reply::Answer);
    let (addr, shutdown, task) = start_gateway(agent.clone(), &[]).await;
    let client = reqwest::Client::new();

    let first: AskResponse = client
        .post(format!("http://{}/v1/ask", addr))
        .json(&serde_json::json!({ "query": "what is xss?" }))
        .send()
        .await
        .expect("request should succeed")
        .json()
        .await
        .expect("answer should parse");
    assert_eq!(first.session_id.len(), 43);

    let second: AskResponse = client
        .post(format!("http://{}/v1/ask", addr))
        .json(&serde_json::json!({ "query": "and csrf?", "session_id": first.session_id }))
        .send()
        .await
        .expect("request should succeed")
        .json()
        .await
        .expect("answer should parse");
    assert_eq!(second.session_id, first.session_id);

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn calls_over_the_limit_get_429_with_retry_after() {
    let agent = FakeAgent::new(Reply::Answer);
    let (addr, shutdown, task) =
        start_gateway(agent.clone(), &[("ADVISOR_RATE_LIMIT_MAX_CALLS", "2")]).await;
    let client = reqwest::Client::new();

    let created: CreateSessionResponse = client
        .post(format!("http://{}/v1/sessions", addr))
        .send()
        .await
        .expect("request should succeed")
        .json()
        .await
        .expect("session body should parse");

    let mut statuses = Vec::new();
    let mut retry_after = None;
    for _ in 0..3 {
        let response = client
            .post(format!("http://{}/v1/ask", addr))
            .json(&serde_json::json!({
                "query": "status?",
                "session_id": created.session_id,
            }))
            .send()
            .await
            .expect("request should succeed");
        statuses.push(response.status());
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body: ErrorResponse = response.json().await.expect("error body should parse");
            assert_eq!(body.error, "Rate limit exceeded");
            assert_eq!(body.status, 429);
        }
    }

    assert_eq!(
        statuses,
        vec![
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::TOO_MANY_REQUESTS
        ]
    );
    let retry_after = retry_after.expect("429 should carry Retry-After");
    assert!((1..=60).contains(&retry_after));
    assert_eq!(agent.calls(), 2);

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_failure_is_generic_to_clients_and_redacted_in_audit() {
    let log_buf = init_test_tracing();
    let agent = FakeAgent::new(Reply::Refuse);
    let (addr, shutdown, task) = start_gateway(agent.clone(), &[]).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/ask", addr))
        .header("x-request-id", "req-upstream-down")
        .json(&serde_json::json!({ "query": "is the feed up?" }))
        .send()
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = response.text().await.expect("body should be readable");
    assert!(!body.contains(LEAKY_DETAIL));
    let body: ErrorResponse = serde_json::from_str(&body).expect("error body should parse");
    assert_eq!(body.error, "An internal error occurred");
    assert_eq!(body.details, None);
    assert_eq!(agent.calls(), 1);

    let logs = captured_lines(&log_buf, "request_id=req-upstream-down");
    assert!(logs.iter().any(|line| line.contains("start")));
    assert!(logs.iter().any(|line| line.contains("ERR_UPSTREAM")));
    assert!(!logs.iter().any(|line| line.contains(LEAKY_DETAIL)));

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_body_is_invalid_input() {
    let log_buf = init_test_tracing();
    let agent = FakeAgent::new(Reply::Answer);
    let (addr, shutdown, task) = start_gateway(agent.clone(), &[]).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/ask", addr))
        .header("x-request-id", "req-malformed-1")
        .json(&serde_json::json!({ "query": "hi", "admin": true }))
        .send()
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ErrorResponse = response.json().await.expect("error body should parse");
    assert_eq!(body.error, "Invalid input");
    assert_eq!(agent.calls(), 0);

    let logs = captured_lines(&log_buf, "request_id=req-malformed-1");
    assert!(
        logs.iter()
            .any(|line| line.contains("rejected") && line.contains("ERR_VALIDATION")),
        "expected a rejected audit record, got {:?}",
        logs
    );

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn healthz_and_metrics_are_served() {
    let agent = FakeAgent::new(Reply::Answer);
    let (addr, shutdown, task) = start_gateway(agent, &[]).await;
    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://{}/healthz", addr))
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(health.status(), StatusCode::OK);
    assert!(health.headers().get("strict-transport-security").is_some());
    assert_eq!(health.text().await.expect("body"), "ok");

    let metrics = client
        .get(format!("http://{}/metrics", addr))
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(metrics.status(), StatusCode::OK);
    let body = metrics.text().await.expect("body");
    assert!(body.contains("advisor_gateway_active_sessions"));

    let _ = shutdown.send(());
    let _ = task.await;
}

async fn fake_agent_service(Json(req): Json<AgentRequest>) -> String {
    [
        serde_json::json!({ "type": "text", "text": "Affected: " }),
        serde_json::json!({ "type": "text", "text": req.input }),
        serde_json::json!({
            "type": "citation",
            "source": "kb/cve-2024-3094.json",
            "quote": "xz 5.6.0 and 5.6.1",
        }),
        serde_json::json!({
            "type": "tool_payload",
            "payload": "SELECT package FROM advisories WHERE cve = 'CVE-2024-3094'\nReturned information: 1 row",
        }),
    ]
    .iter()
    .map(|line| format!("{}\n", line))
    .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_agent_client_streams_ndjson_end_to_end() {
    let agent_app = Router::new().route("/invoke", post(fake_agent_service));
    let (agent_addr, agent_shutdown, agent_task) = spawn_server(agent_app).await;

    let agent = HttpAgentClient::new(
        format!("http://{}/invoke", agent_addr),
        Duration::from_secs(1),
    )
    .expect("agent client should build");
    let (addr, shutdown, task) = start_gateway(Arc::new(agent), &[]).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/ask", addr))
        .json(&serde_json::json!({ "query": "which xz versions?" }))
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), StatusCode::OK);

    let answer: AskResponse = response.json().await.expect("answer should parse");
    assert_eq!(answer.answer, "Affected: which xz versions?");
    assert_eq!(answer.source, "[1] kb/cve-2024-3094.json");
    assert_eq!(
        answer.generated_query.as_deref(),
        Some("SELECT package FROM advisories WHERE cve = 'CVE-2024-3094'")
    );

    let _ = shutdown.send(());
    let _ = task.await;
    let _ = agent_shutdown.send(());
    let _ = agent_task.await;
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    (addr, shutdown_tx, handle)
}

fn captured_lines(buf: &Arc<Mutex<Vec<u8>>>, needle: &str) -> Vec<String> {
    let bytes = buf.lock().expect("log lock should be available").clone();
    String::from_utf8_lossy(&bytes)
        .lines()
        .filter(|line| line.contains(needle))
        .map(str::to_string)
        .collect()
}

#[derive(Clone)]
struct TestWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut lock = self
            .buf
            .lock()
            .map_err(|_| std::io::Error::other("log mutex poisoned"))?;
        lock.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn init_test_tracing() -> Arc<Mutex<Vec<u8>>> {
    static LOG_BUF: OnceLock<Arc<Mutex<Vec<u8>>>> = OnceLock::new();

    LOG_BUF
        .get_or_init(|| {
            let buf = Arc::new(Mutex::new(Vec::new()));
            let make_writer = {
                let buf = buf.clone();
                move || TestWriter { buf: buf.clone() }
            };

            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
                .with_ansi(false)
                .with_writer(make_writer)
                .finish();

            tracing::subscriber::set_global_default(subscriber)
                .expect("global tracing subscriber should be set once");

            buf
        })
        .clone()
}
