use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static AUDIT_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static RATE_LIMIT_DENIED_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static UPSTREAM_CALLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static UPSTREAM_CALL_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "advisor_gateway_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create advisor_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "advisor_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create advisor_gateway_http_request_duration_seconds"),
        )
    })
}

fn audit_events_total() -> &'static IntCounterVec {
    AUDIT_EVENTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "advisor_gateway_audit_events_total",
                    "Audit records emitted, by event kind.",
                ),
                &["event"],
            )
            .expect("create advisor_gateway_audit_events_total"),
        )
    })
}

fn rate_limit_denied_total() -> &'static IntCounter {
    RATE_LIMIT_DENIED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "advisor_gateway_rate_limit_denied_total",
                "Calls rejected by the per-session rate limiter.",
            )
            .expect("create advisor_gateway_rate_limit_denied_total"),
        )
    })
}

fn upstream_calls_total() -> &'static IntCounterVec {
    UPSTREAM_CALLS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "advisor_gateway_upstream_calls_total",
                    "Agent service invocations, by outcome.",
                ),
                &["outcome"],
            )
            .expect("create advisor_gateway_upstream_calls_total"),
        )
    })
}

fn upstream_call_duration_seconds() -> &'static HistogramVec {
    UPSTREAM_CALL_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "advisor_gateway_upstream_call_duration_seconds",
                    "Agent service invocation duration in seconds, including aggregation.",
                )
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
                &["outcome"],
            )
            .expect("create advisor_gateway_upstream_call_duration_seconds"),
        )
    })
}

fn active_sessions() -> &'static IntGauge {
    ACTIVE_SESSIONS.get_or_init(|| {
        register_collector(
            IntGauge::new(
                "advisor_gateway_active_sessions",
                "Sessions currently held in the session store.",
            )
            .expect("create advisor_gateway_active_sessions"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_audit_event(event: &str) {
    audit_events_total().with_label_values(&[event]).inc();
}

pub fn inc_rate_limit_denied() {
    rate_limit_denied_total().inc();
}

pub fn observe_upstream_call(outcome: &str, duration: Duration) {
    upstream_calls_total().with_label_values(&[outcome]).inc();
    upstream_call_duration_seconds()
        .with_label_values(&[outcome])
        .observe(duration.as_secs_f64());
}

pub fn set_active_sessions(count: usize) {
    active_sessions().set(i64::try_from(count).unwrap_or(i64::MAX));
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = rate_limit_denied_total();
    let _ = active_sessions();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
