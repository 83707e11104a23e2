//! Transport contract and the default HTTP implementation.
//!
//! A [`Transport`] moves a [`ProviderRequest`] to a provider and hands back
//! either a complete JSON body or a stream of raw frames.  Frames are the
//! payloads of SSE `data:` lines; interpreting them is the adapter's job.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::provider::ProviderRequest;

/// Raw frames of one streamed response.
pub type FrameStream = BoxStream<'static, Result<String>>;

/// Sends provider requests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and return the complete response body.
    async fn send(&self, request: &ProviderRequest) -> Result<Value>;

    /// Send a request and return its response as a stream of raw frames.
    async fn open_stream(&self, request: &ProviderRequest) -> Result<FrameStream>;
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// POSTs JSON request bodies to a single endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    endpoint: String,
    headers: HeaderMap,
    http: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport for the given endpoint URL.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| EngineError::Transport {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self {
            endpoint: endpoint.into(),
            headers,
            http,
        })
    }

    /// Add a header sent with every request.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| EngineError::Config {
            reason: format!("invalid header name `{name}`: {e}"),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| EngineError::Config {
            reason: format!("invalid value for header `{name}`: {e}"),
        })?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Authenticate with `Authorization: Bearer <token>`.
    pub fn with_bearer_token(self, token: &str) -> Result<Self> {
        self.with_header(AUTHORIZATION.as_str(), &format!("Bearer {token}"))
    }

    /// The configured endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, request: &ProviderRequest) -> Result<reqwest::Response> {
        tracing::debug!(
            url = %self.endpoint,
            stream = request.stream,
            "sending provider request"
        );

        let resp = self
            .http
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .json(&request.body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::Transport {
                reason: format!("provider returned {status}: {text}"),
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ProviderRequest) -> Result<Value> {
        let resp = self.post(request).await?;
        let text = resp.text().await.map_err(|e| EngineError::Transport {
            reason: format!("failed to read response body: {e}"),
        })?;
        serde_json::from_str(&text).map_err(|e| EngineError::ProviderParse {
            reason: format!("invalid JSON response: {e}"),
        })
    }

    async fn open_stream(&self, request: &ProviderRequest) -> Result<FrameStream> {
        let resp = self.post(request).await?;
        let bytes = resp.bytes_stream().boxed();

        let frames = futures::stream::unfold(
            (bytes, FrameSplitter::new(), VecDeque::new(), false),
            |(mut bytes, mut splitter, mut pending, mut finished)| async move {
                loop {
                    if let Some(frame) = pending.pop_front() {
                        return Some((Ok(frame), (bytes, splitter, pending, finished)));
                    }
                    if finished {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            let result = splitter.push(&chunk);
                            finished = splitter.is_done();
                            match result {
                                Ok(frames) => pending.extend(frames),
                                Err(e) => {
                                    finished = true;
                                    return Some((Err(e), (bytes, splitter, pending, finished)));
                                }
                            }
                        }
                        Some(Err(e)) => {
                            finished = true;
                            let err = EngineError::Transport {
                                reason: format!("stream read error: {e}"),
                            };
                            return Some((Err(err), (bytes, splitter, pending, finished)));
                        }
                        None => {
                            finished = true;
                            match splitter.finish() {
                                Ok(frames) => pending.extend(frames),
                                Err(e) => {
                                    return Some((Err(e), (bytes, splitter, pending, finished)));
                                }
                            }
                        }
                    }
                }
            },
        );

        Ok(frames.boxed())
    }
}

// ---------------------------------------------------------------------------
// SSE framing
// ---------------------------------------------------------------------------

/// Longest SSE line accepted before the stream is rejected.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Splits a streamed SSE body into `data:` payloads.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences split across chunks decode correctly.  Comments and non-data
/// fields are dropped; a `[DONE]` payload ends the stream.
#[derive(Debug)]
pub struct FrameSplitter {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already searched for a newline.
    scanned: usize,
    max_line_bytes: usize,
    done: bool,
}

impl Default for FrameSplitter {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line_bytes: MAX_LINE_BYTES,
            done: false,
        }
    }
}

enum Line {
    Data(String),
    Done,
    Skip,
}

impl FrameSplitter {
    /// Create an empty splitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject lines longer than `max` bytes.
    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }

    /// Whether the `[DONE]` sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a chunk, returning every complete frame it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        if self.done {
            return Ok(Vec::new());
        }
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut line_start = 0;
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let line_end = self.scanned + offset;
            self.scanned = line_end + 1;
            self.check_length(line_end - line_start)?;

            match parse_line(&self.buffer[line_start..line_end])? {
                Line::Data(frame) => frames.push(frame),
                Line::Done => {
                    self.done = true;
                    self.buffer.clear();
                    self.scanned = 0;
                    return Ok(frames);
                }
                Line::Skip => {}
            }
            line_start = line_end + 1;
        }

        self.buffer.drain(..line_start);
        self.scanned = self.buffer.len();
        self.check_length(self.buffer.len())?;
        Ok(frames)
    }

    /// Flush a trailing line that had no newline.
    pub fn finish(&mut self) -> Result<Vec<String>> {
        if self.done || self.buffer.is_empty() {
            return Ok(Vec::new());
        }
        let line = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        match parse_line(&line)? {
            Line::Data(frame) => Ok(vec![frame]),
            Line::Done => {
                self.done = true;
                Ok(Vec::new())
            }
            Line::Skip => Ok(Vec::new()),
        }
    }

    fn check_length(&self, len: usize) -> Result<()> {
        if len > self.max_line_bytes {
            return Err(EngineError::Transport {
                reason: format!(
                    "stream line exceeds {} bytes without a newline",
                    self.max_line_bytes
                ),
            });
        }
        Ok(())
    }
}

fn parse_line(line: &[u8]) -> Result<Line> {
    let line = std::str::from_utf8(line).map_err(|e| EngineError::Transport {
        reason: format!("invalid UTF-8 in stream: {e}"),
    })?;
    let line = line.trim_end_matches('\r');

    if line.is_empty() || line.starts_with(':') {
        return Ok(Line::Skip);
    }

    let Some(data) = line.strip_prefix("data:") else {
        tracing::trace!(line, "ignoring non-data SSE line");
        return Ok(Line::Skip);
    };
    let data = data.strip_prefix(' ').unwrap_or(data);

    if data.trim() == "[DONE]" {
        return Ok(Line::Done);
    }
    Ok(Line::Data(data.to_owned()))
}
