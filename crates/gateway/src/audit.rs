use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::GatewayError;

pub const AUDIT_TARGET: &str = "advisor_gateway::audit";
const REDACTED: &str = "[redacted]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    Start,
    End,
    Error,
    Rejected,
}

impl AuditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEvent::Start => "start",
            AuditEvent::End => "end",
            AuditEvent::Error => "error",
            AuditEvent::Rejected => "rejected",
        }
    }
}

/// Wraps a value that must not reach logs unless the sink's policy allows it.
/// `Debug` never prints the inner value.
#[derive(Clone, PartialEq, Eq)]
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> std::fmt::Debug for Sensitive<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(REDACTED)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedactionPolicy {
    #[default]
    Redact,
    Verbose,
}

impl RedactionPolicy {
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose {
            RedactionPolicy::Verbose
        } else {
            RedactionPolicy::Redact
        }
    }

    pub fn render<'a>(&self, value: Option<&'a Sensitive<String>>) -> &'a str {
        match (self, value) {
            (_, None) => "-",
            (RedactionPolicy::Verbose, Some(value)) => value.expose().as_str(),
            (RedactionPolicy::Redact, Some(_)) => REDACTED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub event: AuditEvent,
    pub request_id: String,
    pub operation: &'static str,
    pub session_id: Option<Sensitive<String>>,
    pub input: Option<Sensitive<String>>,
    pub detail: Option<Sensitive<String>>,
    pub code: Option<&'static str>,
    pub latency_ms: Option<u64>,
}

pub trait AuditSink: Send + Sync {
    fn write(&self, record: &AuditRecord);
}

/// Emits one structured event per record under the audit target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink {
    policy: RedactionPolicy,
}

impl TracingAuditSink {
    pub fn new(policy: RedactionPolicy) -> Self {
        Self { policy }
    }
}

impl AuditSink for TracingAuditSink {
    fn write(&self, record: &AuditRecord) {
        let session_id = self.policy.render(record.session_id.as_ref());
        let input = self.policy.render(record.input.as_ref());
        let detail = self.policy.render(record.detail.as_ref());
        let code = record.code.unwrap_or("-");
        let latency_ms = record.latency_ms.unwrap_or(0);

        match record.event {
            AuditEvent::Start | AuditEvent::End => tracing::info!(
                target: AUDIT_TARGET,
                event = record.event.as_str(),
                request_id = %record.request_id,
                operation = record.operation,
                session_id,
                input,
                latency_ms,
                "audit"
            ),
            AuditEvent::Error | AuditEvent::Rejected => tracing::warn!(
                target: AUDIT_TARGET,
                event = record.event.as_str(),
                request_id = %record.request_id,
                operation = record.operation,
                session_id,
                code,
                detail,
                latency_ms,
                "audit"
            ),
        }
    }
}

/// Keeps every record in memory. Intended for tests and diagnostics.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn events_for(&self, request_id: &str) -> Vec<AuditEvent> {
        self.records()
            .into_iter()
            .filter(|record| record.request_id == request_id)
            .map(|record| record.event)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn write(&self, record: &AuditRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
    }
}

#[derive(Clone)]
pub struct AuditLogger {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sinks: vec![sink] }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn record(&self, record: AuditRecord) {
        crate::metrics::observe_audit_event(record.event.as_str());
        for sink in &self.sinks {
            sink.write(&record);
        }
    }

    pub fn scope(&self, request_id: impl Into<String>, operation: &'static str) -> AuditScope {
        AuditScope {
            logger: self.clone(),
            request_id: request_id.into(),
            operation,
            started: Instant::now(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Audit records for a single call. `started` is written once the call is
/// admitted; the first of `finished`, `failed` or `rejected` closes it and
/// later closing calls are ignored. Clones share the closed state.
#[derive(Clone)]
pub struct AuditScope {
    logger: AuditLogger,
    request_id: String,
    operation: &'static str,
    started: Instant,
    closed: Arc<AtomicBool>,
}

impl AuditScope {
    pub fn started(&self, session_id: Option<&str>, input: &str) {
        self.emit(
            AuditEvent::Start,
            session_id,
            Some(input),
            None,
            None,
            None,
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn finished(&self, session_id: Option<&str>) {
        if !self.close() {
            return;
        }
        let latency_ms = self.elapsed_ms();
        self.emit(
            AuditEvent::End,
            session_id,
            None,
            None,
            None,
            Some(latency_ms),
        );
    }

    pub fn failed(&self, session_id: Option<&str>, err: &GatewayError) {
        if !self.close() {
            return;
        }
        let latency_ms = self.elapsed_ms();
        let detail = err.to_string();
        self.emit(
            AuditEvent::Error,
            session_id,
            None,
            Some(detail),
            Some(err.code()),
            Some(latency_ms),
        );
    }

    pub fn rejected(&self, session_id: Option<&str>, err: &GatewayError) {
        if !self.close() {
            return;
        }
        let latency_ms = self.elapsed_ms();
        let detail = err.to_string();
        self.emit(
            AuditEvent::Rejected,
            session_id,
            None,
            Some(detail),
            Some(err.code()),
            Some(latency_ms),
        );
    }

    fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis().min(u64::MAX as u128) as u64
    }

    fn emit(
        &self,
        event: AuditEvent,
        session_id: Option<&str>,
        input: Option<&str>,
        detail: Option<String>,
        code: Option<&'static str>,
        latency_ms: Option<u64>,
    ) {
        self.logger.record(AuditRecord {
            event,
            request_id: self.request_id.clone(),
            operation: self.operation,
            session_id: session_id.map(|id| Sensitive::new(id.to_string())),
            input: input.map(|value| Sensitive::new(value.to_string())),
            detail: detail.map(Sensitive::new),
            code,
            latency_ms,
        });
    }
}
