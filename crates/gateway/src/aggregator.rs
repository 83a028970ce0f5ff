use futures::StreamExt;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::validation::extract_generated_query;

/// One event emitted by the agent service while it answers a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Text(String),
    Citation { source: String, quote: String },
    ToolPayload(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFailure {
    Transport(String),
    Status(u16),
    Protocol(String),
    Agent(String),
}

impl std::fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamFailure::Transport(detail) => write!(f, "transport failure: {}", detail),
            UpstreamFailure::Status(status) => write!(f, "agent returned status {}", status),
            UpstreamFailure::Protocol(detail) => write!(f, "protocol violation: {}", detail),
            UpstreamFailure::Agent(message) => write!(f, "agent reported error: {}", message),
        }
    }
}

impl std::error::Error for UpstreamFailure {}

pub type FragmentStream = BoxStream<'static, Result<Fragment, UpstreamFailure>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    AwaitingFirstFragment,
    Accumulating,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
    Empty,
    Malformed(String),
    Upstream(UpstreamFailure),
    Cancelled,
    /// A fragment or `finish` arrived after the aggregator reached a terminal state.
    Terminated,
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregateError::Empty => write!(f, "stream completed without fragments"),
            AggregateError::Malformed(reason) => write!(f, "malformed fragment: {}", reason),
            AggregateError::Upstream(failure) => write!(f, "{}", failure),
            AggregateError::Cancelled => write!(f, "aggregation cancelled"),
            AggregateError::Terminated => write!(f, "aggregator already completed"),
        }
    }
}

impl std::error::Error for AggregateError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedResponse {
    pub text: String,
    /// Citation quotes in arrival order, newline separated.
    pub references: String,
    /// Distinct citation sources in first-seen order.
    pub sources: Vec<String>,
    pub generated_query: Option<String>,
}

impl AggregatedResponse {
    /// Sources rendered as `[n] source` lines, numbered from 1.
    pub fn numbered_sources(&self) -> String {
        self.sources
            .iter()
            .enumerate()
            .map(|(idx, source)| format!("[{}] {}", idx + 1, source))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Folds a fragment sequence into one response. Text is concatenated in
/// arrival order; citations and tool payloads are collected alongside.
#[derive(Debug)]
pub struct ResponseAggregator {
    state: AggregatorState,
    text: String,
    quotes: Vec<String>,
    sources: Vec<String>,
    tool_payloads: Vec<String>,
}

impl Default for ResponseAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseAggregator {
    pub fn new() -> Self {
        Self {
            state: AggregatorState::AwaitingFirstFragment,
            text: String::new(),
            quotes: Vec::new(),
            sources: Vec::new(),
            tool_payloads: Vec::new(),
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    pub fn push(&mut self, fragment: Fragment) -> Result<(), AggregateError> {
        if matches!(self.state, AggregatorState::Done | AggregatorState::Failed) {
            return Err(AggregateError::Terminated);
        }

        match fragment {
            Fragment::Text(text) => self.text.push_str(&text),
            Fragment::Citation { source, quote } => {
                let source = source.trim();
                if source.is_empty() {
                    return Err(self.fail(AggregateError::Malformed(
                        "citation without source".to_string(),
                    )));
                }
                if !self.sources.iter().any(|seen| seen == source) {
                    self.sources.push(source.to_string());
                }
                self.quotes.push(quote);
            }
            Fragment::ToolPayload(payload) => self.tool_payloads.push(payload),
        }

        self.state = AggregatorState::Accumulating;
        Ok(())
    }

    pub fn fail(&mut self, err: AggregateError) -> AggregateError {
        self.state = AggregatorState::Failed;
        err
    }

    pub fn finish(&mut self) -> Result<AggregatedResponse, AggregateError> {
        match self.state {
            AggregatorState::AwaitingFirstFragment => Err(self.fail(AggregateError::Empty)),
            AggregatorState::Done | AggregatorState::Failed => Err(AggregateError::Terminated),
            AggregatorState::Accumulating => {
                self.state = AggregatorState::Done;
                let generated_query = self
                    .tool_payloads
                    .iter()
                    .find_map(|payload| extract_generated_query(payload));

                Ok(AggregatedResponse {
                    text: std::mem::take(&mut self.text),
                    references: std::mem::take(&mut self.quotes).join("\n"),
                    sources: std::mem::take(&mut self.sources),
                    generated_query,
                })
            }
        }
    }
}

/// Drains `stream` into a single response. Stops reading as soon as `cancel`
/// fires or the stream yields an error; the stream is dropped either way.
pub async fn aggregate(
    mut stream: FragmentStream,
    cancel: &CancellationToken,
) -> Result<AggregatedResponse, AggregateError> {
    let mut aggregator = ResponseAggregator::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(aggregator.fail(AggregateError::Cancelled));
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(fragment)) => aggregator.push(fragment)?,
            Some(Err(failure)) => {
                return Err(aggregator.fail(AggregateError::Upstream(failure)));
            }
            None => return aggregator.finish(),
        }
    }
}
