//! Ollama client for locally served models.
//!
//! Streams newline-delimited JSON rather than SSE. No key is required; one is
//! sent as a bearer token when configured, for proxies that expect it.
//!
//! See: <https://github.com/ollama/ollama/blob/main/docs/api.md>

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_with::skip_serializing_none;
use std::collections::HashMap;

use crate::cache::{CacheKey, ModelCache};
use crate::catalog::{Capabilities, ModelMetaData, ModelType, ProviderMetadata, TokenLimits};
use crate::client::{guarded, Client, ClientError, EventStream};
use crate::http::{add_extra_headers, build_http_client, check_status, RequestBuilderExt, ResponseExt};
use crate::model::{FinishReason, MessagePart, Request, Response, Role, ToolCall, ToolChoice, Usage};
use crate::options::{ProviderConfig, SecretString};
use crate::registry::{BuildContext, ProviderKind};
use crate::sse::SSEResponseExt;
use crate::stream::{decode_payloads, normalize, Chunk, StreamDecoder, StreamOptions};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_LIMITS: TokenLimits = TokenLimits::new(8_192, 2_048);

/// Model families that accept `think`; the server rejects it for the rest.
const THINKING_MODELS: &[&str] = &["deepseek-r1", "deepseek-v3.1", "gpt-oss", "magistral", "qwen3", "qwq"];

/// Matches on the bare model name, without namespace or `:tag`.
fn supports_thinking(model: &str) -> bool {
    let bare = model.rsplit('/').next().unwrap_or(model);
    let name = bare.split(':').next().unwrap_or(bare);
    THINKING_MODELS.contains(&name)
}

#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    api_key: Option<SecretString>,
    base_url: String,
    extra_headers: Option<HashMap<String, String>>,
    keep_alive: Option<Value>,
    num_ctx: Option<u32>,
    cache: ModelCache,
    cache_key: CacheKey,
}

impl OllamaClient {
    pub fn new(config: &ProviderConfig, context: &BuildContext) -> Result<Self, ClientError> {
        let base_url = config.base_url_or(DEFAULT_BASE_URL);
        let num_ctx = match config.extra.get("num_ctx") {
            None => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| ClientError::Config("num_ctx must be a positive integer".to_string()))?,
            ),
        };
        Ok(Self {
            http: build_http_client(config, context.timeout)?,
            api_key: config.resolved_api_key(),
            cache_key: CacheKey::new(ProviderKind::Ollama, &base_url, config),
            base_url,
            extra_headers: config.extra_headers.clone(),
            keep_alive: config.extra.get("keep_alive").cloned(),
            num_ctx,
            cache: context.cache.clone(),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = match &self.api_key {
            Some(key) => request.bearer_auth(key.expose_secret()),
            None => request,
        };
        add_extra_headers(request, &self.extra_headers)
    }

    fn chat_request<'a>(&self, request: &'a Request, stream: bool) -> ChatRequest<'a> {
        let mut chat = ChatRequest::new(request, stream);
        chat.keep_alive = self.keep_alive.clone();
        if let Some(num_ctx) = self.num_ctx {
            chat.options.num_ctx = Some(num_ctx);
        }
        chat
    }

    async fn send(&self, request: &Request, stream: bool) -> Result<(reqwest::Response, Value), ClientError> {
        let body = serde_json::to_value(self.chat_request(request, stream))?;
        let url = format!("{}/api/chat", self.base_url);
        let response = self.authorized(self.http.post(url)).json_logged(&body).send().await?;
        let response = check_status(response, "ollama", &request.model).await?;
        Ok((response, body))
    }

    async fn complete(&self, request: &Request) -> Result<Response, ClientError> {
        let (response, body) = self.send(request, false).await?;
        let chat: ChatResponse = response.json_logged().await?;
        let usage = chat.usage();
        if let Some(error) = chat.error {
            return Err(ClientError::upstream("ollama", &request.model, None, error));
        }

        let message = chat.message.unwrap_or_default();
        let mut content = Vec::new();
        if let Some(thinking) = message.thinking.filter(|t| !t.is_empty()) {
            content.push(MessagePart::Reasoning {
                text: thinking,
                signature: None,
            });
        }
        if !message.content.is_empty() {
            content.push(MessagePart::text(message.content));
        }
        let called_tools = !message.tool_calls.is_empty();
        content.extend(message.tool_calls.into_iter().map(|call| {
            MessagePart::ToolCall(ToolCall {
                id: None,
                tool_name: call.function.name,
                input: call.function.arguments,
            })
        }));

        let finish = done_reason(chat.done_reason.as_deref(), called_tools);
        Ok(Response::from_content(content, finish, usage)
            .with_request_body(body)
            .with_meta(None, chat.model))
    }

    async fn fetch_models(&self) -> Result<Vec<ModelMetaData>, ClientError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.authorized(self.http.get(url)).send().await?;
        let response = check_status(response, "ollama", "").await?;
        let tags: TagList = response.json_logged().await?;
        Ok(tags.models.into_iter().map(|tag| tag.into_metadata(self.num_ctx)).collect())
    }
}

#[async_trait]
impl Client for OllamaClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            id: "ollama".to_string(),
            name: "Ollama".to_string(),
            default_base_url: DEFAULT_BASE_URL.to_string(),
            icon: "ollama".to_string(),
        }
    }

    async fn request(&self, request: &Request) -> Result<Response, ClientError> {
        guarded(request, self.complete(request)).await
    }

    fn request_stream(&self, request: Request) -> EventStream {
        let client = self.clone();
        let options = StreamOptions::for_request("ollama", &request);
        let chunks = async_stream::stream! {
            let response = match client.send(&request, true).await {
                Ok((response, _)) => response,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let decoded = decode_payloads(response.json_lines(), OllamaStreamDecoder::new(&request.model));
            futures::pin_mut!(decoded);
            while let Some(chunk) = decoded.next().await {
                yield chunk;
            }
        };
        normalize(chunks, options)
    }

    /// Models pulled on the server. A server that cannot be reached makes the
    /// backend unavailable; there is no static table to fall back on.
    async fn available_models(&self) -> Result<Vec<ModelMetaData>, ClientError> {
        if let Some(models) = self.cache.get(&self.cache_key) {
            return Ok(models);
        }
        let models = self.fetch_models().await.map_err(|e| ClientError::ProviderUnavailable {
            provider: "ollama".to_string(),
            reason: e.to_string(),
        })?;
        self.cache.set(self.cache_key.clone(), models.clone());
        Ok(models)
    }

    fn model_token_limits(&self, model: &str) -> TokenLimits {
        self.cache
            .get(&self.cache_key)
            .and_then(|models| models.into_iter().find(|m| m.id == model))
            .map(|m| m.token_limits)
            .unwrap_or_else(|| self.num_ctx.map(|ctx| TokenLimits::new(ctx, ctx / 4)).unwrap_or(DEFAULT_LIMITS))
    }

    async fn generate_embeddings(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, ClientError> {
        let url = format!("{}/api/embed", self.base_url);
        let body = json!({ "model": model, "input": texts });
        let response = self.authorized(self.http.post(url)).json_logged(&body).send().await?;
        let response = check_status(response, "ollama", model).await?;
        let embed: EmbedResponse = response.json_logged().await?;
        Ok(embed.embeddings)
    }
}

fn done_reason(reason: Option<&str>, called_tools: bool) -> FinishReason {
    match reason {
        Some("length") => FinishReason::OutputTokens,
        _ if called_tools => FinishReason::ToolCalls,
        Some("stop") | None => FinishReason::Stop,
        Some(_) => FinishReason::Other,
    }
}

// --- Request Types ---

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    think: Option<bool>,
    keep_alive: Option<Value>,
    options: ModelOptions,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<Value>,
    tool_name: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Default, Serialize)]
struct ModelOptions {
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
    num_predict: Option<u32>,
    num_ctx: Option<u32>,
    presence_penalty: Option<f32>,
    frequency_penalty: Option<f32>,
}

impl ChatMessage {
    fn plain(role: &'static str, content: String) -> Self {
        Self {
            role,
            content,
            images: Vec::new(),
            tool_calls: Vec::new(),
            tool_name: None,
        }
    }
}

impl<'a> ChatRequest<'a> {
    fn new(request: &'a Request, stream: bool) -> Self {
        let mut messages = Vec::new();
        if let Some(system) = request.system_prompt() {
            messages.push(ChatMessage::plain("system", system));
        }

        for message in request.conversation() {
            let role = match message.role {
                Role::Assistant => "assistant",
                _ => "user",
            };
            let mut current = ChatMessage::plain(role, String::new());
            for part in message.parts() {
                match part {
                    MessagePart::Text { text } => current.content.push_str(text),
                    MessagePart::Image { source, .. } => match source.base64() {
                        Some(data) => current.images.push(data),
                        None => current.content.push_str(&part.fallback_text()),
                    },
                    MessagePart::Reasoning { .. } if message.role == Role::Assistant => {}
                    MessagePart::ToolCall(call) if message.role == Role::Assistant => {
                        current.tool_calls.push(json!({
                            "function": { "name": call.tool_name, "arguments": call.input }
                        }));
                    }
                    MessagePart::ToolResult(result) => {
                        let output = match &result.output {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        let mut tool = ChatMessage::plain("tool", output);
                        tool.tool_name = Some(result.tool_name.clone());
                        messages.push(tool);
                    }
                    other => current.content.push_str(&other.fallback_text()),
                }
            }
            if !current.content.is_empty() || !current.images.is_empty() || !current.tool_calls.is_empty() {
                messages.push(current);
            }
        }

        let output = request.output();
        // Ollama has no way to force a specific tool; `none` drops the tools.
        let tools = match request.tool_choice {
            Some(ToolChoice::None) => Vec::new(),
            _ => request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description.clone().unwrap_or_default(),
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect(),
        };

        ChatRequest {
            model: &request.model,
            messages,
            stream,
            tools,
            think: output
                .reasoning_effort
                .filter(|_| supports_thinking(&request.model))
                .map(|_| true),
            keep_alive: None,
            options: ModelOptions {
                temperature: output.temperature,
                top_p: output.top_p,
                top_k: output.top_k,
                num_predict: output.max_output_tokens,
                num_ctx: None,
                presence_penalty: output.presence_penalty,
                frequency_penalty: output.frequency_penalty,
            },
        }
    }
}

// --- Response Types ---

/// One `/api/chat` object; the final streamed line has `done: true` and the
/// token counts.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    message: Option<ResponseMessage>,
    #[serde(default)]
    done: bool,
    done_reason: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
    error: Option<String>,
}

impl ChatResponse {
    fn usage(&self) -> Usage {
        Usage::new(self.prompt_eval_count.unwrap_or(0), self.eval_count.unwrap_or(0))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
    thinking: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    models: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
    #[serde(default)]
    details: TagDetails,
}

#[derive(Debug, Default, Deserialize)]
struct TagDetails {
    #[serde(default)]
    families: Option<Vec<String>>,
    parameter_size: Option<String>,
}

impl Tag {
    fn into_metadata(self, num_ctx: Option<u32>) -> ModelMetaData {
        let families = self.details.families.unwrap_or_default();
        let embeds = self.name.contains("embed") || families.iter().any(|f| f.contains("bert"));
        let vision = families.iter().any(|f| f == "clip" || f == "mllama") || self.name.contains("vision");
        let limits = num_ctx.map(|ctx| TokenLimits::new(ctx, ctx / 4)).unwrap_or(DEFAULT_LIMITS);
        let display_name = match self.details.parameter_size {
            Some(size) => format!("{} ({})", self.name, size),
            None => self.name.clone(),
        };
        ModelMetaData {
            id: self.name,
            display_name,
            icon: "ollama".to_string(),
            model_type: if embeds { ModelType::Embedding } else { ModelType::Llm },
            capabilities: Capabilities {
                vision,
                tool_calling: !embeds,
                max_context: Some(limits.max_total_tokens),
                ..Default::default()
            },
            token_limits: limits,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

struct OllamaStreamDecoder {
    model: String,
    called_tools: bool,
}

impl OllamaStreamDecoder {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            called_tools: false,
        }
    }
}

impl StreamDecoder for OllamaStreamDecoder {
    type Event = ChatResponse;

    fn decode(&mut self, event: ChatResponse) -> Vec<Chunk> {
        if let Some(error) = event.error {
            return vec![Chunk::Error(ClientError::upstream("ollama", self.model.clone(), None, error))];
        }

        let mut chunks = Vec::new();
        let usage = event.usage();
        if let Some(message) = event.message {
            if let Some(thinking) = message.thinking.filter(|t| !t.is_empty()) {
                chunks.push(Chunk::ReasoningDelta(thinking));
            }
            if !message.content.is_empty() {
                chunks.push(Chunk::TextDelta(message.content));
            }
            for call in message.tool_calls {
                self.called_tools = true;
                chunks.push(Chunk::ToolCall {
                    id: None,
                    tool_name: call.function.name,
                    input: call.function.arguments,
                });
            }
        }

        if event.done {
            let finish_reason = done_reason(event.done_reason.as_deref(), self.called_tools);
            chunks.push(Chunk::StepFinish { finish_reason, usage });
            chunks.push(Chunk::Finish {
                finish_reason: Some(finish_reason),
                usage: Some(usage),
            });
        }
        chunks
    }
}
