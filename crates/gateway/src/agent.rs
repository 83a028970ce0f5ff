use std::pin::Pin;
use std::time::Duration;

use advisor_contracts::{AgentRequest, WireFragment};
use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::aggregator::{Fragment, FragmentStream, UpstreamFailure};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    pub input: String,
    pub session_id: String,
}

/// The downstream agent service. A successful `invoke` hands back the
/// fragment stream; dropping the stream abandons the call.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<FragmentStream, UpstreamFailure>;
}

#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    http: reqwest::Client,
    url: String,
}

impl HttpAgentClient {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn invoke(&self, invocation: AgentInvocation) -> Result<FragmentStream, UpstreamFailure> {
        let response = self
            .http
            .post(self.url.as_str())
            .header(reqwest::header::ACCEPT, "application/x-ndjson")
            .json(&AgentRequest {
                input: invocation.input,
                session_id: invocation.session_id,
            })
            .send()
            .await
            .map_err(|err| UpstreamFailure::Transport(err.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamFailure::Status(status.as_u16()));
        }

        Ok(ndjson_fragments(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|err| err.without_url())),
        ))
    }
}

/// Longest fragment line accepted from the agent.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

struct LineDecoder<S> {
    chunks: Pin<Box<S>>,
    buffer: Vec<u8>,
    exhausted: bool,
}

impl<S> LineDecoder<S> {
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.buffer.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
        line.pop();
        Some(line)
    }
}

/// Decodes newline-delimited [`WireFragment`] records from a chunked body.
/// Lines may span chunk boundaries; blank lines are skipped. An `error`
/// record, an undecodable line or a line longer than [`MAX_LINE_BYTES`] ends
/// the stream with a failure.
pub fn ndjson_fragments<S, B, E>(chunks: S) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let decoder = LineDecoder {
        chunks: Box::pin(chunks),
        buffer: Vec::new(),
        exhausted: false,
    };

    futures::stream::unfold(decoder, |mut decoder| async move {
        loop {
            let line = match decoder.take_line() {
                Some(line) => line,
                None if decoder.exhausted => {
                    if decoder.buffer.is_empty() {
                        return None;
                    }
                    std::mem::take(&mut decoder.buffer)
                }
                None if decoder.buffer.len() > MAX_LINE_BYTES => {
                    decoder.exhausted = true;
                    decoder.buffer.clear();
                    return Some((
                        Err(UpstreamFailure::Protocol(format!(
                            "fragment line exceeds {} bytes",
                            MAX_LINE_BYTES
                        ))),
                        decoder,
                    ));
                }
                None => {
                    match decoder.chunks.next().await {
                        Some(Ok(chunk)) => decoder.buffer.extend_from_slice(chunk.as_ref()),
                        Some(Err(err)) => {
                            decoder.exhausted = true;
                            decoder.buffer.clear();
                            return Some((
                                Err(UpstreamFailure::Transport(err.to_string())),
                                decoder,
                            ));
                        }
                        None => decoder.exhausted = true,
                    }
                    continue;
                }
            };

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let item = decode_line(&line);
            if item.is_err() {
                decoder.exhausted = true;
                decoder.buffer.clear();
            }
            return Some((item, decoder));
        }
    })
    .boxed()
}

fn decode_line(line: &[u8]) -> Result<Fragment, UpstreamFailure> {
    let wire: WireFragment = serde_json::from_slice(line)
        .map_err(|err| UpstreamFailure::Protocol(format!("undecodable fragment: {}", err)))?;

    match wire {
        WireFragment::Text { text } => Ok(Fragment::Text(text)),
        WireFragment::Citation { source, quote } => Ok(Fragment::Citation { source, quote }),
        WireFragment::ToolPayload { payload } => Ok(Fragment::ToolPayload(payload)),
        WireFragment::Error { message } => Err(UpstreamFailure::Agent(message)),
    }
}
