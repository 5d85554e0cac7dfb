//! Streaming normalizer.
//!
//! Every backend turns its native stream events into backend-agnostic
//! [`Chunk`]s through a [`StreamDecoder`]. [`normalize`] then drives the
//! shared state machine that produces the canonical [`StreamEvent`] sequence:
//! zero or more intermediate events followed by exactly one `Complete` or
//! `Error`, after which nothing else is emitted.

use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{ClientError, EventStream};
use crate::model::{FinishReason, Request, Source, Usage};

/// Canonical streaming event.
#[derive(Debug)]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    ReasoningDelta {
        text: String,
    },
    Source(Source),
    ToolCall {
        tool_call_id: Option<String>,
        tool_name: String,
        input: Value,
    },
    ToolInputStart {
        tool_call_id: Option<String>,
        tool_name: String,
    },
    ToolInputDelta {
        tool_call_id: Option<String>,
        tool_name: String,
        delta: String,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        input: Value,
        output: Value,
    },
    /// End of one generation step; `usage` covers that step only.
    StepFinished {
        finish_reason: FinishReason,
        usage: Usage,
    },
    /// Successful end of the stream.
    Complete {
        usage: Usage,
        finish_reason: FinishReason,
        duration_ms: u64,
    },
    /// Failed end of the stream.
    Error {
        error: ClientError,
        duration_ms: u64,
    },
    /// A native event this crate has no mapping for.
    Unsupported {
        raw: Value,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }
}

/// Backend-agnostic unit produced by a [`StreamDecoder`].
#[derive(Debug)]
pub enum Chunk {
    TextDelta(String),
    ReasoningDelta(String),
    Source(Source),
    ToolInputStart {
        id: Option<String>,
        tool_name: String,
    },
    ToolInputDelta {
        id: Option<String>,
        tool_name: String,
        delta: String,
    },
    ToolCall {
        id: Option<String>,
        tool_name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        tool_name: String,
        input: Value,
        output: Value,
    },
    StepFinish {
        finish_reason: FinishReason,
        usage: Usage,
    },
    /// Native end-of-stream marker. `usage`, when present, is the total for
    /// the whole stream and replaces the accumulated step usage.
    Finish {
        finish_reason: Option<FinishReason>,
        usage: Option<Usage>,
    },
    /// Error reported inside the stream.
    Error(ClientError),
    Unsupported(Value),
}

/// Maps one backend's native stream events to [`Chunk`]s.
///
/// Decoders hold whatever per-stream state the protocol needs (tool-call
/// buffers, pending finish reasons) and never touch the network, so they are
/// tested by feeding them parsed native events directly.
pub trait StreamDecoder: Send {
    type Event: serde::de::DeserializeOwned + Send;

    fn decode(&mut self, event: Self::Event) -> Vec<Chunk>;

    /// Called once when the native source ends cleanly.
    fn flush(&mut self) -> Vec<Chunk> {
        Vec::new()
    }
}

/// Parse raw JSON payloads with `decoder`, keeping transport errors in band.
///
/// Payloads that do not deserialize are reported as `Unsupported` rather than
/// aborting the stream.
pub fn decode_payloads<S, D>(payloads: S, mut decoder: D) -> impl Stream<Item = Result<Chunk, ClientError>> + Send
where
    S: Stream<Item = Result<String, ClientError>> + Send + 'static,
    D: StreamDecoder + 'static,
{
    async_stream::stream! {
        futures::pin_mut!(payloads);
        while let Some(item) = payloads.next().await {
            match item {
                Ok(payload) => match serde_json::from_str::<D::Event>(&payload) {
                    Ok(event) => {
                        for chunk in decoder.decode(event) {
                            yield Ok(chunk);
                        }
                    }
                    Err(e) => {
                        debug!("Undecodable stream payload: {}", e);
                        let raw = serde_json::from_str(&payload).unwrap_or(Value::String(payload));
                        yield Ok(Chunk::Unsupported(raw));
                    }
                },
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        for chunk in decoder.flush() {
            yield Ok(chunk);
        }
    }
}

/// Limits and identity for one normalized stream.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub provider: String,
    pub model: String,
    pub started: Instant,
    pub abort: Option<CancellationToken>,
    pub step_timeout: Option<Duration>,
    pub total_timeout: Option<Duration>,
}

impl StreamOptions {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            started: Instant::now(),
            abort: None,
            step_timeout: None,
            total_timeout: None,
        }
    }

    /// Options carrying the request's abort token and timeouts.
    pub fn for_request(provider: impl Into<String>, request: &Request) -> Self {
        let output = request.output();
        Self {
            abort: request.abort.clone(),
            step_timeout: output.step_timeout(),
            total_timeout: output.total_timeout(),
            ..Self::new(provider, request.model.clone())
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

enum Next {
    Item(Option<Result<Chunk, ClientError>>),
    Cancelled,
    TimedOut(Duration),
}

/// Drain `chunks` into the canonical event sequence.
pub fn normalize<S>(chunks: S, options: StreamOptions) -> EventStream
where
    S: Stream<Item = Result<Chunk, ClientError>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        futures::pin_mut!(chunks);
        let abort = options.abort.clone().unwrap_or_default();
        let deadline = options.total_timeout.map(|limit| (tokio::time::Instant::now() + limit, limit));

        let mut total_usage = Usage::default();
        let mut last_finish: Option<FinishReason> = None;

        loop {
            let next = async {
                match options.step_timeout {
                    Some(step) => match tokio::time::timeout(step, chunks.next()).await {
                        Ok(item) => Next::Item(item),
                        Err(_) => Next::TimedOut(step),
                    },
                    None => Next::Item(chunks.next().await),
                }
            };
            let overall = async {
                match deadline {
                    Some((at, limit)) => {
                        tokio::time::sleep_until(at).await;
                        limit
                    }
                    None => std::future::pending().await,
                }
            };

            let next = tokio::select! {
                biased;
                _ = abort.cancelled() => Next::Cancelled,
                limit = overall => Next::TimedOut(limit),
                next = next => next,
            };

            let chunk = match next {
                Next::Item(Some(Ok(chunk))) => chunk,
                Next::Item(Some(Err(error))) => {
                    warn!("{} stream failed: {}", options.provider, error);
                    yield StreamEvent::Error { error, duration_ms: options.elapsed_ms() };
                    return;
                }
                Next::Item(None) => {
                    match last_finish {
                        Some(finish_reason) => yield StreamEvent::Complete {
                            usage: total_usage,
                            finish_reason,
                            duration_ms: options.elapsed_ms(),
                        },
                        None => yield StreamEvent::Error {
                            error: ClientError::upstream(
                                options.provider.clone(),
                                options.model.clone(),
                                None,
                                "stream ended before a finish event",
                            ),
                            duration_ms: options.elapsed_ms(),
                        },
                    }
                    return;
                }
                Next::Cancelled => {
                    debug!("{} stream cancelled", options.provider);
                    yield StreamEvent::Error {
                        error: ClientError::StreamCancelled,
                        duration_ms: options.elapsed_ms(),
                    };
                    return;
                }
                Next::TimedOut(limit) => {
                    yield StreamEvent::Error {
                        error: ClientError::Timeout(limit),
                        duration_ms: options.elapsed_ms(),
                    };
                    return;
                }
            };

            match chunk {
                Chunk::TextDelta(text) => yield StreamEvent::TextDelta { text },
                Chunk::ReasoningDelta(text) => yield StreamEvent::ReasoningDelta { text },
                Chunk::Source(source) => yield StreamEvent::Source(source),
                Chunk::ToolInputStart { id, tool_name } => {
                    yield StreamEvent::ToolInputStart { tool_call_id: id, tool_name }
                }
                Chunk::ToolInputDelta { id, tool_name, delta } => {
                    yield StreamEvent::ToolInputDelta { tool_call_id: id, tool_name, delta }
                }
                Chunk::ToolCall { id, tool_name, input } => {
                    yield StreamEvent::ToolCall { tool_call_id: id, tool_name, input }
                }
                Chunk::ToolResult { id, tool_name, input, output } => {
                    yield StreamEvent::ToolResult { tool_call_id: id, tool_name, input, output }
                }
                Chunk::StepFinish { finish_reason, usage } => {
                    total_usage += usage;
                    last_finish = Some(finish_reason);
                    yield StreamEvent::StepFinished { finish_reason, usage };
                }
                Chunk::Finish { finish_reason, usage } => {
                    yield StreamEvent::Complete {
                        usage: usage.unwrap_or(total_usage),
                        finish_reason: finish_reason.or(last_finish).unwrap_or(FinishReason::Stop),
                        duration_ms: options.elapsed_ms(),
                    };
                    return;
                }
                Chunk::Error(error) => {
                    warn!("{} reported a stream error: {}", options.provider, error);
                    yield StreamEvent::Error { error, duration_ms: options.elapsed_ms() };
                    return;
                }
                Chunk::Unsupported(raw) => yield StreamEvent::Unsupported { raw },
            }
        }
    })
}

/// Terminal error event for failures before the native source exists (bad
/// request, HTTP error status).
pub fn failed(error: ClientError, started: Instant) -> StreamEvent {
    StreamEvent::Error {
        error,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ErrorKind;
    use futures::stream;

    async fn run(chunks: Vec<Result<Chunk, ClientError>>) -> Vec<StreamEvent> {
        let options = StreamOptions::new("mock", "mock-model");
        normalize(stream::iter(chunks), options).collect().await
    }

    fn assert_single_terminal(events: &[StreamEvent]) {
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1, "events: {:?}", events);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_passes_events_through_in_order() {
        let options = StreamOptions::new("mock", "mock-model");
        let chunks = stream::iter(vec![
            Ok(Chunk::TextDelta("Hi".into())),
            Ok(Chunk::TextDelta(" there".into())),
            Ok(Chunk::StepFinish { finish_reason: FinishReason::Stop, usage: Usage::new(3, 2) }),
            Ok(Chunk::Finish { finish_reason: Some(FinishReason::Stop), usage: None }),
        ]);
        let events: Vec<StreamEvent> = normalize(chunks, options).collect().await;

        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], StreamEvent::TextDelta { text } if text == "Hi"));
        assert!(matches!(&events[1], StreamEvent::TextDelta { text } if text == " there"));
        assert!(matches!(&events[2], StreamEvent::StepFinished { finish_reason: FinishReason::Stop, .. }));
        match &events[3] {
            StreamEvent::Complete { usage, finish_reason, .. } => {
                assert_eq!(*finish_reason, FinishReason::Stop);
                assert_eq!(usage.total_tokens, Some(5));
            }
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exception_mid_stream_is_single_terminal() {
        let events = run(vec![
            Ok(Chunk::TextDelta("partial".into())),
            Err(ClientError::upstream("mock", "m", None, "connection reset")),
            Ok(Chunk::TextDelta("never seen".into())),
            Ok(Chunk::Finish { finish_reason: None, usage: None }),
        ]).await;
        assert_eq!(events.len(), 2);
        assert_single_terminal(&events);
        assert!(matches!(&events[1], StreamEvent::Error { error, .. } if error.kind() == ErrorKind::UpstreamError));
    }

    #[tokio::test]
    async fn test_error_chunk_stops_draining() {
        let events = run(vec![
            Ok(Chunk::Error(ClientError::upstream("mock", "m", None, "overloaded"))),
            Ok(Chunk::TextDelta("after".into())),
        ]).await;
        assert_eq!(events.len(), 1);
        assert_single_terminal(&events);
    }

    #[tokio::test]
    async fn test_terminal_exactly_once_for_assorted_sequences() {
        let sequences: Vec<Vec<Result<Chunk, ClientError>>> = vec![
            vec![],
            vec![Ok(Chunk::TextDelta("a".into()))],
            vec![Ok(Chunk::StepFinish { finish_reason: FinishReason::ToolCalls, usage: Usage::new(1, 1) })],
            vec![
                Ok(Chunk::Finish { finish_reason: None, usage: None }),
                Ok(Chunk::Finish { finish_reason: None, usage: None }),
            ],
            vec![Ok(Chunk::Unsupported(Value::Null)), Err(ClientError::StreamCancelled)],
            vec![
                Ok(Chunk::ReasoningDelta("r".into())),
                Ok(Chunk::Error(ClientError::StreamCancelled)),
                Err(ClientError::StreamCancelled),
            ],
        ];
        for chunks in sequences {
            assert_single_terminal(&run(chunks).await);
        }
    }

    #[tokio::test]
    async fn test_clean_end_without_finish_is_error() {
        let events = run(vec![Ok(Chunk::TextDelta("dangling".into()))]).await;
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_clean_end_after_step_completes_with_cumulative_usage() {
        let events = run(vec![
            Ok(Chunk::StepFinish { finish_reason: FinishReason::ToolCalls, usage: Usage::new(10, 2) }),
            Ok(Chunk::StepFinish { finish_reason: FinishReason::Stop, usage: Usage::new(15, 4) }),
        ]).await;
        match events.last() {
            Some(StreamEvent::Complete { usage, finish_reason, .. }) => {
                assert_eq!(*finish_reason, FinishReason::Stop);
                assert_eq!(usage.input_tokens, Some(25));
                assert_eq!(usage.total_tokens, Some(31));
            }
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_chunks_surface_as_unsupported() {
        let events = run(vec![
            Ok(Chunk::Unsupported(serde_json::json!({"type": "brand_new_event"}))),
            Ok(Chunk::Finish { finish_reason: None, usage: None }),
        ]).await;
        assert!(matches!(&events[0], StreamEvent::Unsupported { raw } if raw["type"] == "brand_new_event"));
    }

    #[tokio::test]
    async fn test_abort_terminates_pending_stream() {
        let token = CancellationToken::new();
        let mut options = StreamOptions::new("mock", "mock-model");
        options.abort = Some(token.clone());

        let chunks = stream::iter(vec![Ok(Chunk::TextDelta("first".into()))]).chain(stream::pending());
        let mut events = normalize(chunks, options);

        assert!(matches!(events.next().await, Some(StreamEvent::TextDelta { .. })));
        token.cancel();
        match events.next().await {
            Some(StreamEvent::Error { error, .. }) => assert_eq!(error.kind(), ErrorKind::Cancelled),
            other => panic!("expected cancellation, got {:?}", other),
        }
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let mut options = StreamOptions::new("mock", "mock-model");
        options.step_timeout = Some(Duration::from_millis(20));
        let events: Vec<StreamEvent> = normalize(stream::pending::<Result<Chunk, ClientError>>(), options).collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error { error, .. } if error.kind() == ErrorKind::Timeout));
    }

    struct Echo;

    impl StreamDecoder for Echo {
        type Event = String;

        fn decode(&mut self, event: String) -> Vec<Chunk> {
            vec![Chunk::TextDelta(event)]
        }

        fn flush(&mut self) -> Vec<Chunk> {
            vec![Chunk::Finish { finish_reason: Some(FinishReason::Stop), usage: None }]
        }
    }

    #[tokio::test]
    async fn test_decode_payloads_flags_garbage() {
        let payloads = stream::iter(vec![Ok("\"hello\"".to_string()), Ok("{\"odd\":1}".to_string())]);
        let chunks: Vec<_> = decode_payloads(payloads, Echo).collect().await;
        assert_eq!(chunks.len(), 3);
        assert!(matches!(&chunks[0], Ok(Chunk::TextDelta(t)) if t == "hello"));
        assert!(matches!(&chunks[1], Ok(Chunk::Unsupported(raw)) if raw["odd"] == 1));
        assert!(matches!(&chunks[2], Ok(Chunk::Finish { .. })));
    }
}
