//! Anthropic Messages API client.
//!
//! See: <https://docs.anthropic.com/en/api/messages>

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_with::skip_serializing_none;
use std::collections::{BTreeMap, HashMap};

use base64::prelude::*;

use crate::catalog::{caps, find_model, resolve_alias, KnownModel, ModelMetaData, ModelType, ProviderMetadata, TokenLimits};
use crate::client::{guarded, Client, ClientError, EventStream};
use crate::http::{add_extra_headers, build_http_client, check_status, RequestBuilderExt, ResponseExt};
use crate::model::{FinishReason, MediaSource, MessagePart, Request, Response, Role, ToolCall, ToolChoice, Usage};
use crate::options::ProviderConfig;
use crate::registry::{BuildContext, ProviderKind};
use crate::sse::SSEResponseExt;
use crate::stream::{decode_payloads, normalize, Chunk, StreamDecoder, StreamOptions};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_LIMITS: TokenLimits = TokenLimits::new(200_000, 4_096);

const fn claude(
    alias: &'static str,
    api_id: &'static str,
    display_name: &'static str,
    reasoning: bool,
    max_output: u32,
) -> KnownModel {
    KnownModel {
        alias,
        api_id,
        display_name,
        model_type: ModelType::Llm,
        capabilities: crate::catalog::Capabilities {
            pdf_input: true,
            ..caps(true, true, reasoning)
        },
        limits: TokenLimits::new(200_000, max_output),
    }
}

/// Aliases map to the dated ids the API expects.
const CLAUDE_MODELS: &[KnownModel] = &[
    claude("claude-opus-4-1", "claude-opus-4-1-20250805", "Claude Opus 4.1", true, 32_000),
    claude("claude-opus-4", "claude-opus-4-20250514", "Claude Opus 4", true, 32_000),
    claude("claude-sonnet-4-5", "claude-sonnet-4-5-20250929", "Claude Sonnet 4.5", true, 64_000),
    claude("claude-sonnet-4", "claude-sonnet-4-20250514", "Claude Sonnet 4", true, 64_000),
    claude("claude-3-7-sonnet", "claude-3-7-sonnet-20250219", "Claude Sonnet 3.7", true, 64_000),
    claude("claude-3-5-sonnet", "claude-3-5-sonnet-20241022", "Claude Sonnet 3.5", false, 8_192),
    claude("claude-3-5-haiku", "claude-3-5-haiku-20241022", "Claude Haiku 3.5", false, 8_192),
    claude("claude-3-haiku", "claude-3-haiku-20240307", "Claude Haiku 3", false, 4_096),
];

/// Anthropic client.
#[derive(Clone)]
pub struct ClaudeClient {
    http: reqwest::Client,
    headers: HeaderMap,
    base_url: String,
    extra_headers: Option<HashMap<String, String>>,
}

impl ClaudeClient {
    pub fn new(config: &ProviderConfig, context: &BuildContext) -> Result<Self, ClientError> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| ClientError::Config("API key is required".to_string()))?;

        let mut headers = HeaderMap::new();
        let mut key = HeaderValue::from_str(api_key.expose_secret())
            .map_err(|_| ClientError::Config("API key contains invalid characters".to_string()))?;
        key.set_sensitive(true);
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));

        Ok(Self {
            http: build_http_client(config, context.timeout)?,
            headers,
            base_url: config.base_url_or(DEFAULT_BASE_URL),
            extra_headers: config.extra_headers.clone(),
        })
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let request = self
            .http
            .post(format!("{}/{}", self.base_url, path))
            .headers(self.headers.clone());
        add_extra_headers(request, &self.extra_headers)
    }

    async fn send(&self, request: &Request, stream: bool) -> Result<(reqwest::Response, Value), ClientError> {
        let model = self.model_client(&request.model);
        let max_output = self.model_token_limits(&model).max_output_tokens;
        let body = serde_json::to_value(MessagesRequest::new(
            &model,
            max_output,
            supports_thinking(&model),
            request,
            stream,
        ))?;
        let response = self.post("messages").json_logged(&body).send().await?;
        let response = check_status(response, "claude", &request.model).await?;
        Ok((response, body))
    }

    async fn complete(&self, request: &Request) -> Result<Response, ClientError> {
        let (response, body) = self.send(request, false).await?;
        let message: MessagesResponse = response.json_logged().await?;
        Ok(message.into_response().with_request_body(body))
    }
}

#[async_trait]
impl Client for ClaudeClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            id: "claude".to_string(),
            name: "Anthropic".to_string(),
            default_base_url: DEFAULT_BASE_URL.to_string(),
            icon: "anthropic".to_string(),
        }
    }

    fn model_client(&self, model: &str) -> String {
        resolve_alias(CLAUDE_MODELS, model)
    }

    async fn request(&self, request: &Request) -> Result<Response, ClientError> {
        guarded(request, self.complete(request)).await
    }

    fn request_stream(&self, request: Request) -> EventStream {
        let client = self.clone();
        let options = StreamOptions::for_request("claude", &request);
        let chunks = async_stream::stream! {
            let response = match client.send(&request, true).await {
                Ok((response, _)) => response,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let decoded = decode_payloads(response.sse(), ClaudeStreamDecoder::new(&request.model));
            futures::pin_mut!(decoded);
            while let Some(chunk) = decoded.next().await {
                yield chunk;
            }
        };
        normalize(chunks, options)
    }

    async fn available_models(&self) -> Result<Vec<ModelMetaData>, ClientError> {
        Ok(CLAUDE_MODELS.iter().map(|m| m.to_metadata("anthropic")).collect())
    }

    fn model_token_limits(&self, model: &str) -> TokenLimits {
        find_model(CLAUDE_MODELS, model)
            .map(|m| m.limits)
            .unwrap_or(DEFAULT_LIMITS)
    }
}

fn finish_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::OutputTokens,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        "model_context_window_exceeded" => FinishReason::PromptTokens,
        _ => FinishReason::Other,
    }
}

// --- Request Types ---

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<ClaudeMessage>,
    max_tokens: u32,
    system: Option<String>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ClaudeTool>,
    tool_choice: Option<Value>,
    thinking: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ThinkingConfig {
    Enabled { budget_tokens: u32 },
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct ClaudeTool {
    name: String,
    description: Option<String>,
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct ClaudeMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: BlockSource,
    },
    Document {
        source: BlockSource,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: String,
    },
    RedactedThinking {
        data: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

impl BlockSource {
    fn from_media(source: &MediaSource, media_type: &str) -> Self {
        match source {
            MediaSource::Bytes(bytes) => BlockSource::Base64 {
                media_type: media_type.to_string(),
                data: BASE64_STANDARD.encode(bytes),
            },
            MediaSource::Url(url) => BlockSource::Url { url: url.clone() },
        }
    }
}

fn user_block(part: &MessagePart) -> ContentBlock {
    match part {
        MessagePart::Text { text } => ContentBlock::Text { text: text.clone() },
        MessagePart::Image { source, media_type } => ContentBlock::Image {
            source: BlockSource::from_media(source, media_type.as_deref().unwrap_or("image/png")),
        },
        MessagePart::File {
            source,
            media_type,
            filename,
        } if media_type == "application/pdf" => ContentBlock::Document {
            source: BlockSource::from_media(source, media_type),
            title: filename.clone(),
        },
        MessagePart::File {
            source: MediaSource::Bytes(bytes),
            media_type,
            ..
        } if media_type.starts_with("text/") => ContentBlock::Text {
            text: String::from_utf8_lossy(bytes).into_owned(),
        },
        MessagePart::ToolResult(result) => ContentBlock::ToolResult {
            tool_use_id: result.tool_call_id.clone(),
            content: match &result.output {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        },
        other => ContentBlock::Text {
            text: other.fallback_text(),
        },
    }
}

fn assistant_block(part: &MessagePart) -> Option<ContentBlock> {
    match part {
        MessagePart::Text { text } => Some(ContentBlock::Text { text: text.clone() }),
        MessagePart::ToolCall(call) => Some(ContentBlock::ToolUse {
            id: call.id.clone().unwrap_or_else(|| format!("toolu_{}", call.tool_name)),
            name: call.tool_name.clone(),
            input: call.input.clone(),
        }),
        // Thinking blocks are only accepted back with their signature.
        MessagePart::Reasoning {
            text,
            signature: Some(signature),
        } => Some(ContentBlock::Thinking {
            thinking: text.clone(),
            signature: signature.clone(),
        }),
        MessagePart::Reasoning { .. } => None,
        other => Some(ContentBlock::Text {
            text: other.fallback_text(),
        }),
    }
}

/// Models outside the table are assumed to be newer releases with extended thinking.
fn supports_thinking(model: &str) -> bool {
    find_model(CLAUDE_MODELS, model).map_or(true, |m| m.capabilities.reasoning)
}

impl MessagesRequest {
    fn new(model: &str, model_max_output: u32, thinking: bool, request: &Request, stream: bool) -> Self {
        let messages = request
            .conversation()
            .filter_map(|message| {
                let (role, content): (_, Vec<_>) = match message.role {
                    Role::Assistant => ("assistant", message.parts().filter_map(assistant_block).collect()),
                    _ => ("user", message.parts().map(user_block).collect()),
                };
                (!content.is_empty()).then_some(ClaudeMessage { role, content })
            })
            .collect();

        let tools: Vec<ClaudeTool> = request
            .tools
            .iter()
            .map(|t| ClaudeTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect();

        let tool_choice = match (&request.tool_choice, tools.is_empty()) {
            (_, true) | (None, _) => None,
            (Some(ToolChoice::Auto), _) => Some(json!({"type": "auto"})),
            (Some(ToolChoice::None), _) => Some(json!({"type": "none"})),
            (Some(ToolChoice::Required), _) => Some(json!({"type": "any"})),
            (Some(ToolChoice::Tool { name }), _) => Some(json!({"type": "tool", "name": name})),
        };

        let output = request.output();
        let budget = output
            .reasoning_effort
            .filter(|_| thinking)
            .map(|e| e.budget_tokens());
        let mut max_tokens = output
            .max_output_tokens
            .unwrap_or_else(|| model_max_output.min(DEFAULT_MAX_TOKENS));
        if let Some(budget) = budget {
            // The thinking budget counts against max_tokens and must be smaller.
            max_tokens = max_tokens.max(budget + DEFAULT_MAX_TOKENS);
        }

        MessagesRequest {
            model: model.to_string(),
            messages,
            max_tokens,
            system: request.system_prompt(),
            temperature: output.temperature.filter(|_| budget.is_none()),
            top_p: output.top_p.filter(|_| budget.is_none()),
            top_k: output.top_k.filter(|_| budget.is_none()),
            stream: stream.then_some(true),
            tools,
            tool_choice,
            thinking: budget.map(|budget_tokens| ThinkingConfig::Enabled { budget_tokens }),
        }
    }
}

// --- Response Types ---

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: ClaudeUsage,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct ClaudeUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    cache_read_input_tokens: Option<u32>,
}

impl From<ClaudeUsage> for Usage {
    fn from(u: ClaudeUsage) -> Self {
        Usage {
            cached_input_tokens: u.cache_read_input_tokens,
            ..Usage::new(u.input_tokens, u.output_tokens)
        }
    }
}

impl MessagesResponse {
    fn into_response(self) -> Response {
        let content = self
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(MessagePart::text(text)),
                ContentBlock::ToolUse { id, name, input } => Some(MessagePart::ToolCall(ToolCall {
                    id: Some(id),
                    tool_name: name,
                    input,
                })),
                ContentBlock::Thinking { thinking, signature } => Some(MessagePart::Reasoning {
                    text: thinking,
                    signature: Some(signature).filter(|s| !s.is_empty()),
                }),
                _ => None,
            })
            .collect();

        let finish = self
            .stop_reason
            .as_deref()
            .map(finish_reason)
            .unwrap_or(FinishReason::Stop);

        Response::from_content(content, finish, self.usage.into()).with_meta(self.id, self.model)
    }
}

// --- SSE Event Types ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeStreamEvent {
    MessageStart { message: MessagesResponse },
    ContentBlockStart { index: u32, content_block: ContentBlock },
    ContentBlockDelta { index: u32, delta: BlockDelta },
    ContentBlockStop { index: u32 },
    MessageDelta { delta: MessageDelta, #[serde(default)] usage: Option<ClaudeUsage> },
    MessageStop,
    Ping,
    Error { error: StreamError },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta {},
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(rename = "type", default)]
    error_type: String,
    message: String,
}

struct PendingToolUse {
    id: String,
    name: String,
    json: String,
}

/// Decodes Messages API stream events.
///
/// Input tokens arrive with `message_start`, output tokens and the stop
/// reason with `message_delta`; the step closes on `message_stop`.
struct ClaudeStreamDecoder {
    model: String,
    tools: BTreeMap<u32, PendingToolUse>,
    usage: ClaudeUsage,
    finish: Option<FinishReason>,
}

impl ClaudeStreamDecoder {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            tools: BTreeMap::new(),
            usage: ClaudeUsage::default(),
            finish: None,
        }
    }
}

impl StreamDecoder for ClaudeStreamDecoder {
    type Event = ClaudeStreamEvent;

    fn decode(&mut self, event: ClaudeStreamEvent) -> Vec<Chunk> {
        match event {
            ClaudeStreamEvent::MessageStart { message } => {
                self.usage = message.usage;
                Vec::new()
            }
            ClaudeStreamEvent::ContentBlockStart { index, content_block } => match content_block {
                ContentBlock::Text { text } if !text.is_empty() => vec![Chunk::TextDelta(text)],
                ContentBlock::Thinking { thinking, .. } if !thinking.is_empty() => {
                    vec![Chunk::ReasoningDelta(thinking)]
                }
                ContentBlock::ToolUse { id, name, .. } => {
                    let start = Chunk::ToolInputStart {
                        id: Some(id.clone()),
                        tool_name: name.clone(),
                    };
                    self.tools.insert(index, PendingToolUse { id, name, json: String::new() });
                    vec![start]
                }
                _ => Vec::new(),
            },
            ClaudeStreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => vec![Chunk::TextDelta(text)],
                BlockDelta::ThinkingDelta { thinking } => vec![Chunk::ReasoningDelta(thinking)],
                BlockDelta::SignatureDelta {} => Vec::new(),
                BlockDelta::InputJsonDelta { partial_json } => match self.tools.get_mut(&index) {
                    Some(pending) => {
                        pending.json.push_str(&partial_json);
                        vec![Chunk::ToolInputDelta {
                            id: Some(pending.id.clone()),
                            tool_name: pending.name.clone(),
                            delta: partial_json,
                        }]
                    }
                    None => vec![Chunk::Unsupported(json!({
                        "type": "input_json_delta",
                        "index": index,
                        "partial_json": partial_json,
                    }))],
                },
            },
            ClaudeStreamEvent::ContentBlockStop { index } => match self.tools.remove(&index) {
                Some(pending) => vec![Chunk::ToolCall {
                    id: Some(pending.id),
                    tool_name: pending.name,
                    input: if pending.json.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&pending.json).unwrap_or(Value::String(pending.json))
                    },
                }],
                None => Vec::new(),
            },
            ClaudeStreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.finish = Some(finish_reason(&reason));
                }
                if let Some(usage) = usage {
                    self.usage.output_tokens = usage.output_tokens;
                    if usage.input_tokens > 0 {
                        self.usage.input_tokens = usage.input_tokens;
                    }
                }
                Vec::new()
            }
            ClaudeStreamEvent::MessageStop => {
                let finish_reason = self.finish.unwrap_or(FinishReason::Stop);
                let usage = Usage::from(self.usage);
                vec![
                    Chunk::StepFinish { finish_reason, usage },
                    Chunk::Finish {
                        finish_reason: Some(finish_reason),
                        usage: Some(usage),
                    },
                ]
            }
            ClaudeStreamEvent::Ping => Vec::new(),
            ClaudeStreamEvent::Error { error } => vec![Chunk::Error(ClientError::upstream(
                "claude",
                self.model.clone(),
                None,
                format!("{}: {}", error.error_type, error.message),
            ))],
        }
    }
}
