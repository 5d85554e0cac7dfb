//! Server-Sent Events (SSE) and newline-delimited JSON stream framing.
//!
//! This module provides generic line framing that can be shared across
//! different LLM providers.
//!
//! SSE format:
//! ```text
//! event: message
//! data: {"key": "value"}
//!
//! data: {"another": "event"}
//!
//! data: [DONE]
//! ```
//!
//! NDJSON (used by Ollama) is simply one JSON document per line.

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};

use crate::client::ClientError;

/// Extension trait for `reqwest::Response` to enable line-framed streaming.
///
/// # Example
/// ```ignore
/// use unai_gateway::sse::SSEResponseExt;
///
/// let response = client.get("https://api.example.com/stream").send().await?;
///
/// let mut stream = response.sse();
/// while let Some(result) = stream.next().await {
///     let line = result?;
///     println!("SSE data: {}", line);
/// }
/// ```
pub trait SSEResponseExt {
    /// Convert the response into a stream of raw SSE data payloads.
    ///
    /// Yields the content after the `data:` prefix for each SSE line.
    /// Stops when the `[DONE]` marker is encountered or the body ends.
    fn sse(self) -> impl Stream<Item = Result<String, ClientError>> + Send + 'static;

    /// Convert the response into a stream of non-empty NDJSON lines.
    fn json_lines(self) -> impl Stream<Item = Result<String, ClientError>> + Send + 'static;
}

impl SSEResponseExt for reqwest::Response {
    fn sse(self) -> impl Stream<Item = Result<String, ClientError>> + Send + 'static {
        sse_payloads(self.bytes_stream())
    }

    fn json_lines(self) -> impl Stream<Item = Result<String, ClientError>> + Send + 'static {
        lines(self.bytes_stream()).filter_map(|line| async move {
            match line {
                Ok(line) if line.is_empty() => None,
                other => Some(other),
            }
        })
    }
}

/// Split a byte stream into trimmed text lines.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences split across chunks decode correctly. A trailing line without a
/// newline is emitted when the body ends.
pub fn lines<S, E>(bytes: S) -> impl Stream<Item = Result<String, ClientError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<ClientError> + Send + 'static,
{
    async_stream::stream! {
        futures::pin_mut!(bytes);
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => buffer.extend_from_slice(&chunk),
                Err(e) => {
                    let error: ClientError = e.into();
                    yield Err(error);
                    return;
                }
            }

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                yield Ok(String::from_utf8_lossy(&line).trim().to_string());
            }
        }

        if !buffer.is_empty() {
            yield Ok(String::from_utf8_lossy(&buffer).trim().to_string());
        }
    }
}

/// Extract SSE `data:` payloads from a byte stream, stopping at `[DONE]`.
pub fn sse_payloads<S, E>(bytes: S) -> impl Stream<Item = Result<String, ClientError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<ClientError> + Send + 'static,
{
    let lines = lines(bytes);
    async_stream::stream! {
        futures::pin_mut!(lines);
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    if let Some(data) = parse_sse_line(&line) {
                        if is_done_marker(data) {
                            return;
                        }
                        if !data.is_empty() {
                            yield Ok(data.to_string());
                        }
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    }
}

/// Parse an SSE line to extract the data portion.
///
/// SSE lines are in the format: `data: <content>` (the space is optional).
///
/// # Example
/// ```
/// use unai_gateway::sse::parse_sse_line;
///
/// let line = "data: {\"key\": \"value\"}";
/// assert_eq!(parse_sse_line(line), Some("{\"key\": \"value\"}"));
///
/// let line = "event: ping";
/// assert_eq!(parse_sse_line(line), None);
/// ```
pub fn parse_sse_line(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(|s| s.trim())
}

/// Check if an SSE data line indicates the stream is done.
///
/// # Example
/// ```
/// use unai_gateway::sse::is_done_marker;
///
/// assert!(is_done_marker("[DONE]"));
/// assert!(!is_done_marker(""));
/// assert!(!is_done_marker("{\"data\": \"value\"}"));
/// ```
pub fn is_done_marker(data: &str) -> bool {
    data == "[DONE]"
}
