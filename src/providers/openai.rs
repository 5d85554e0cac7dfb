//! OpenAI Chat Completions client, shared by every OpenAI-compatible backend
//! (OpenAI itself, OpenRouter and Perplexity).
//!
//! See: <https://platform.openai.com/docs/api-reference/chat>

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_with::skip_serializing_none;
use std::collections::{BTreeMap, HashMap};

use crate::cache::{CacheKey, ModelCache};
use crate::catalog::{
    caps, find_model, resolve_alias, Capabilities, KnownModel, ModelMetaData, ModelType,
    ProviderMetadata, TokenLimits,
};
use crate::client::{guarded, Client, ClientError, EventStream};
use crate::http::{add_extra_headers, build_http_client, check_status, RequestBuilderExt, ResponseExt};
use crate::model::{
    FinishReason, MessagePart, Request, Response, Role, Source, ToolChoice, Usage,
};
use crate::options::{ProviderConfig, SecretString};
use crate::registry::{BuildContext, ProviderKind};
use crate::sse::SSEResponseExt;
use crate::stream::{decode_payloads, normalize, Chunk, StreamDecoder, StreamOptions};

/// Which OpenAI-compatible service a client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    OpenAi,
    OpenRouter,
    Perplexity,
}

impl Flavor {
    pub fn kind(self) -> ProviderKind {
        match self {
            Flavor::OpenAi => ProviderKind::OpenAi,
            Flavor::OpenRouter => ProviderKind::OpenRouter,
            Flavor::Perplexity => ProviderKind::Perplexity,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Flavor::OpenAi => "OpenAI",
            Flavor::OpenRouter => "OpenRouter",
            Flavor::Perplexity => "Perplexity",
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Flavor::OpenAi => "https://api.openai.com/v1",
            Flavor::OpenRouter => "https://openrouter.ai/api/v1",
            Flavor::Perplexity => "https://api.perplexity.ai",
        }
    }

    fn table(self) -> &'static [KnownModel] {
        match self {
            Flavor::OpenAi => OPENAI_MODELS,
            Flavor::OpenRouter => &[],
            Flavor::Perplexity => PERPLEXITY_MODELS,
        }
    }

    fn default_limits(self) -> TokenLimits {
        match self {
            Flavor::OpenAi => TokenLimits::new(128_000, 4_096),
            Flavor::OpenRouter => TokenLimits::new(32_768, 4_096),
            Flavor::Perplexity => TokenLimits::new(127_072, 8_192),
        }
    }

    /// Whether the service honors `stream_options.include_usage`.
    fn streams_usage_on_request(self) -> bool {
        !matches!(self, Flavor::Perplexity)
    }
}

const fn llm(
    alias: &'static str,
    display_name: &'static str,
    capabilities: Capabilities,
    limits: TokenLimits,
) -> KnownModel {
    KnownModel {
        alias,
        api_id: alias,
        display_name,
        model_type: ModelType::Llm,
        capabilities,
        limits,
    }
}

const OPENAI_MODELS: &[KnownModel] = &[
    llm("gpt-5", "GPT-5", caps(true, true, true), TokenLimits::split(272_000, 128_000)),
    llm("gpt-5-mini", "GPT-5 mini", caps(true, true, true), TokenLimits::split(272_000, 128_000)),
    llm("gpt-5-nano", "GPT-5 nano", caps(true, true, true), TokenLimits::split(272_000, 128_000)),
    llm("gpt-4.1", "GPT-4.1", caps(true, true, false), TokenLimits::new(1_047_576, 32_768)),
    llm("gpt-4.1-mini", "GPT-4.1 mini", caps(true, true, false), TokenLimits::new(1_047_576, 32_768)),
    llm("gpt-4.1-nano", "GPT-4.1 nano", caps(true, true, false), TokenLimits::new(1_047_576, 32_768)),
    llm("gpt-4o", "GPT-4o", caps(true, true, false), TokenLimits::new(128_000, 16_384)),
    llm("gpt-4o-mini", "GPT-4o mini", caps(true, true, false), TokenLimits::new(128_000, 16_384)),
    llm("gpt-4-turbo", "GPT-4 Turbo", caps(true, true, false), TokenLimits::new(128_000, 4_096)),
    llm("gpt-3.5-turbo", "GPT-3.5 Turbo", caps(false, true, false), TokenLimits::new(16_385, 4_096)),
    llm("o1", "o1", caps(true, true, true), TokenLimits::new(200_000, 100_000)),
    llm("o3", "o3", caps(true, true, true), TokenLimits::new(200_000, 100_000)),
    llm("o3-mini", "o3-mini", caps(false, true, true), TokenLimits::new(200_000, 100_000)),
    llm("o4-mini", "o4-mini", caps(true, true, true), TokenLimits::new(200_000, 100_000)),
    KnownModel {
        alias: "text-embedding-3-small",
        api_id: "text-embedding-3-small",
        display_name: "Text Embedding 3 Small",
        model_type: ModelType::Embedding,
        capabilities: caps(false, false, false),
        limits: TokenLimits::split(8_191, 0),
    },
    KnownModel {
        alias: "text-embedding-3-large",
        api_id: "text-embedding-3-large",
        display_name: "Text Embedding 3 Large",
        model_type: ModelType::Embedding,
        capabilities: caps(false, false, false),
        limits: TokenLimits::split(8_191, 0),
    },
];

const fn search(capabilities: Capabilities) -> Capabilities {
    Capabilities {
        web_search: true,
        ..capabilities
    }
}

const PERPLEXITY_MODELS: &[KnownModel] = &[
    llm("sonar", "Sonar", search(caps(false, false, false)), TokenLimits::new(127_072, 8_192)),
    llm("sonar-pro", "Sonar Pro", search(caps(false, false, false)), TokenLimits::new(200_000, 8_192)),
    llm(
        "sonar-reasoning",
        "Sonar Reasoning",
        search(caps(false, false, true)),
        TokenLimits::new(127_072, 8_192),
    ),
    llm(
        "sonar-reasoning-pro",
        "Sonar Reasoning Pro",
        search(caps(false, false, true)),
        TokenLimits::new(127_072, 8_192),
    ),
    llm(
        "sonar-deep-research",
        "Sonar Deep Research",
        search(caps(false, false, true)),
        TokenLimits::new(127_072, 8_192),
    ),
];

/// Client for OpenAI-compatible Chat Completions APIs.
#[derive(Clone)]
pub struct OpenAiClient {
    flavor: Flavor,
    http: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    extra_headers: Option<HashMap<String, String>>,
    organization: Option<String>,
    cache: ModelCache,
    cache_key: CacheKey,
}

impl OpenAiClient {
    pub fn new(flavor: Flavor, config: &ProviderConfig, context: &BuildContext) -> Result<Self, ClientError> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| ClientError::Config("API key is required".to_string()))?;
        let base_url = config.base_url_or(flavor.default_base_url());

        Ok(Self {
            flavor,
            http: build_http_client(config, context.timeout)?,
            api_key,
            cache_key: CacheKey::new(flavor.kind(), &base_url, config),
            base_url,
            extra_headers: config.extra_headers.clone(),
            organization: config
                .extra
                .get("organization")
                .and_then(Value::as_str)
                .map(str::to_string),
            cache: context.cache.clone(),
        })
    }

    fn provider(&self) -> &'static str {
        self.flavor.kind().as_str()
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request.bearer_auth(self.api_key.expose_secret());
        if let Some(organization) = &self.organization {
            request = request.header("OpenAI-Organization", organization);
        }
        add_extra_headers(request, &self.extra_headers)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authorized(self.http.post(format!("{}/{}", self.base_url, path)))
    }

    async fn send_chat(&self, request: &Request, stream: bool) -> Result<(reqwest::Response, Value), ClientError> {
        let body = ChatRequest::new(self.flavor, &self.model_client(&request.model), request, stream);
        let body = serde_json::to_value(&body)?;
        let response = self.post("chat/completions").json_logged(&body).send().await?;
        let response = check_status(response, self.provider(), &request.model).await?;
        Ok((response, body))
    }

    async fn complete(&self, request: &Request) -> Result<Response, ClientError> {
        let (response, body) = self.send_chat(request, false).await?;
        let chat: ChatResponse = response.json_logged().await?;
        chat.into_response(self.provider(), &request.model)
            .map(|response| response.with_request_body(body))
    }

    async fn fetch_models(&self) -> Result<Vec<ModelMetaData>, ClientError> {
        let url = format!("{}/models", self.base_url);
        let response = self.authorized(self.http.get(url)).send().await?;
        let response = check_status(response, self.provider(), "").await?;
        let list: ModelList = response.json_logged().await?;

        let icon = self.provider();
        let models = list
            .data
            .into_iter()
            .map(|entry| match self.flavor {
                Flavor::OpenRouter => entry.into_openrouter_metadata(icon, self.flavor.default_limits()),
                _ => match find_model(self.flavor.table(), &entry.id) {
                    Some(known) => ModelMetaData {
                        id: entry.id.clone(),
                        ..known.to_metadata(icon)
                    },
                    None => generic_metadata(&entry.id, icon, self.flavor.default_limits()),
                },
            })
            .collect();
        Ok(models)
    }

    fn static_models(&self) -> Vec<ModelMetaData> {
        self.flavor
            .table()
            .iter()
            .map(|m| m.to_metadata(self.provider()))
            .collect()
    }
}

#[async_trait]
impl Client for OpenAiClient {
    fn kind(&self) -> ProviderKind {
        self.flavor.kind()
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            id: self.provider().to_string(),
            name: self.flavor.name().to_string(),
            default_base_url: self.flavor.default_base_url().to_string(),
            icon: self.provider().to_string(),
        }
    }

    fn model_client(&self, model: &str) -> String {
        resolve_alias(self.flavor.table(), model)
    }

    async fn request(&self, request: &Request) -> Result<Response, ClientError> {
        guarded(request, self.complete(request)).await
    }

    fn request_stream(&self, request: Request) -> EventStream {
        let client = self.clone();
        let options = StreamOptions::for_request(self.provider(), &request);
        let chunks = async_stream::stream! {
            let response = match client.send_chat(&request, true).await {
                Ok((response, _)) => response,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let decoded = decode_payloads(response.sse(), ChatStreamDecoder::new(client.flavor, &request.model));
            futures::pin_mut!(decoded);
            while let Some(chunk) = decoded.next().await {
                yield chunk;
            }
        };
        normalize(chunks, options)
    }

    async fn available_models(&self) -> Result<Vec<ModelMetaData>, ClientError> {
        if self.flavor == Flavor::Perplexity {
            return Ok(self.static_models());
        }
        if let Some(models) = self.cache.get(&self.cache_key) {
            return Ok(models);
        }

        match self.fetch_models().await {
            Ok(models) => {
                self.cache.set(self.cache_key.clone(), models.clone());
                Ok(models)
            }
            Err(e) if self.flavor == Flavor::OpenRouter => Err(ClientError::ProviderUnavailable {
                provider: self.provider().to_string(),
                reason: e.to_string(),
            }),
            Err(e) => {
                tracing::warn!(provider = self.provider(), error = %e, "model listing failed, using static table");
                Ok(self.static_models())
            }
        }
    }

    fn model_token_limits(&self, model: &str) -> TokenLimits {
        let listed = self
            .cache
            .get(&self.cache_key)
            .and_then(|models| models.into_iter().find(|m| m.id == model))
            .map(|m| m.token_limits);
        listed
            .or_else(|| find_model(self.flavor.table(), model).map(|m| m.limits))
            .unwrap_or_else(|| self.flavor.default_limits())
    }

    async fn generate_embeddings(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, ClientError> {
        if self.flavor != Flavor::OpenAi {
            return Err(ClientError::unsupported(self.kind(), "embeddings"));
        }
        let body = json!({ "model": model, "input": texts });
        let response = self.post("embeddings").json_logged(&body).send().await?;
        let response = check_status(response, self.provider(), model).await?;
        let mut embeddings: EmbeddingResponse = response.json_logged().await?;
        embeddings.data.sort_by_key(|e| e.index);
        Ok(embeddings.data.into_iter().map(|e| e.embedding).collect())
    }
}

fn is_reasoning_model(model: &str) -> bool {
    ["o1", "o3", "o4", "gpt-5"]
        .iter()
        .any(|prefix| model == *prefix || model.starts_with(&format!("{}-", prefix)))
}

fn generic_metadata(id: &str, icon: &str, limits: TokenLimits) -> ModelMetaData {
    let model_type = if id.contains("embedding") {
        ModelType::Embedding
    } else if id.starts_with("dall-e") || id.contains("image") {
        ModelType::Image
    } else if id.contains("whisper") || id.contains("tts") || id.contains("audio") {
        ModelType::Audio
    } else {
        ModelType::Llm
    };
    ModelMetaData {
        id: id.to_string(),
        display_name: id.to_string(),
        icon: icon.to_string(),
        model_type,
        capabilities: Capabilities {
            max_context: Some(limits.max_total_tokens),
            ..Default::default()
        },
        token_limits: limits,
    }
}

pub(crate) fn finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::OutputTokens,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        "error" => FinishReason::Error,
        _ => FinishReason::Other,
    }
}

// --- Request Types ---

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: Option<u32>,
    max_completion_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
    frequency_penalty: Option<f32>,
    presence_penalty: Option<f32>,
    reasoning_effort: Option<&'static str>,
    verbosity: Option<&'static str>,
    stream: Option<bool>,
    stream_options: Option<StreamOptionsBody>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ChatTool>,
    tool_choice: Option<Value>,
}

#[derive(Debug, Serialize)]
struct StreamOptionsBody {
    include_usage: bool,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Option<ChatContent>,
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ChatToolCall>,
}

impl ChatMessage {
    fn text(role: &'static str, text: String) -> Self {
        Self {
            role,
            content: Some(ChatContent::Text(text)),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ChatContent {
    Text(String),
    Parts(Vec<ChatContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChatContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    File { file: FileContent },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct FileContent {
    file_data: Option<String>,
    filename: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ChatFunction,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct ChatFunction {
    name: String,
    description: Option<String>,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: ChatFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

impl ChatRequest {
    fn new(flavor: Flavor, model: &str, request: &Request, stream: bool) -> Self {
        let mut messages = Vec::new();

        if let Some(system) = request.system_prompt() {
            messages.push(ChatMessage::text("system", system));
        }

        for message in request.conversation() {
            let role = match message.role {
                Role::Assistant => "assistant",
                _ => "user",
            };

            let mut content = Vec::new();
            let mut tool_calls = Vec::new();
            let mut tool_results = Vec::new();

            for part in message.parts() {
                match part {
                    MessagePart::Text { text } => content.push(ChatContentPart::Text { text: text.clone() }),
                    MessagePart::Image { source, media_type } if role == "user" => {
                        content.push(ChatContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: source.to_url(media_type.as_deref().unwrap_or("image/png")),
                            },
                        })
                    }
                    MessagePart::File {
                        source,
                        media_type,
                        filename,
                    } if role == "user" && flavor == Flavor::OpenAi && media_type == "application/pdf" => {
                        content.push(ChatContentPart::File {
                            file: FileContent {
                                file_data: Some(source.to_url(media_type)),
                                filename: filename.clone(),
                            },
                        })
                    }
                    MessagePart::Reasoning { .. } if role == "assistant" => {}
                    MessagePart::ToolCall(call) if role == "assistant" => tool_calls.push(ChatToolCall {
                        id: call.id.clone().unwrap_or_else(|| format!("call_{}", call.tool_name)),
                        call_type: function_type(),
                        function: ChatFunctionCall {
                            name: call.tool_name.clone(),
                            arguments: call.input.to_string(),
                        },
                    }),
                    MessagePart::ToolResult(result) => tool_results.push(ChatMessage {
                        role: "tool",
                        content: Some(ChatContent::Text(match &result.output {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })),
                        tool_call_id: Some(result.tool_call_id.clone()),
                        tool_calls: Vec::new(),
                    }),
                    other => content.push(ChatContentPart::Text {
                        text: other.fallback_text(),
                    }),
                }
            }

            let content = match content.len() {
                0 if !tool_calls.is_empty() || !tool_results.is_empty() => None,
                0 => Some(ChatContent::Text(String::new())),
                1 if matches!(content[0], ChatContentPart::Text { .. }) => match content.pop() {
                    Some(ChatContentPart::Text { text }) => Some(ChatContent::Text(text)),
                    _ => None,
                },
                _ if role == "assistant" => Some(ChatContent::Text(
                    content
                        .into_iter()
                        .filter_map(|p| match p {
                            ChatContentPart::Text { text } => Some(text),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join(""),
                )),
                _ => Some(ChatContent::Parts(content)),
            };

            // Tool results answer the preceding assistant turn, so they go first.
            messages.extend(tool_results);
            if content.is_some() || !tool_calls.is_empty() {
                messages.push(ChatMessage {
                    role,
                    content,
                    tool_call_id: None,
                    tool_calls,
                });
            }
        }

        let tools = request
            .tools
            .iter()
            .map(|t| ChatTool {
                tool_type: "function",
                function: ChatFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect::<Vec<_>>();

        let tool_choice = match (&request.tool_choice, tools.is_empty()) {
            (_, true) | (None, _) => None,
            (Some(ToolChoice::Auto), _) => Some(json!("auto")),
            (Some(ToolChoice::None), _) => Some(json!("none")),
            (Some(ToolChoice::Required), _) => Some(json!("required")),
            (Some(ToolChoice::Tool { name }), _) => {
                Some(json!({ "type": "function", "function": { "name": name } }))
            }
        };

        let output = request.output();
        let reasoning = flavor == Flavor::OpenAi && is_reasoning_model(model);
        let (max_tokens, max_completion_tokens) = if reasoning {
            (None, output.max_output_tokens)
        } else {
            (output.max_output_tokens, None)
        };

        ChatRequest {
            model: model.to_string(),
            messages,
            max_tokens,
            max_completion_tokens,
            temperature: output.temperature.filter(|_| !reasoning),
            top_p: output.top_p.filter(|_| !reasoning),
            top_k: output.top_k.filter(|_| flavor != Flavor::OpenAi),
            frequency_penalty: output.frequency_penalty,
            presence_penalty: output.presence_penalty,
            reasoning_effort: output
                .reasoning_effort
                .filter(|_| reasoning || flavor == Flavor::Perplexity)
                .map(|e| e.as_str()),
            verbosity: output
                .verbosity
                .filter(|_| flavor == Flavor::OpenAi && model.starts_with("gpt-5"))
                .map(|v| v.as_str()),
            stream: stream.then_some(true),
            stream_options: (stream && flavor.streams_usage_on_request())
                .then_some(StreamOptionsBody { include_usage: true }),
            tools,
            tool_choice,
        }
    }
}

// --- Response Types ---

#[derive(Debug, Deserialize)]
struct ChatResponse {
    id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
    #[serde(default)]
    citations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
    #[serde(alias = "reasoning")]
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    total_tokens: Option<u32>,
    completion_tokens_details: Option<CompletionDetails>,
    prompt_tokens_details: Option<PromptDetails>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct CompletionDetails {
    reasoning_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct PromptDetails {
    cached_tokens: Option<u32>,
}

impl From<ChatUsage> for Usage {
    fn from(u: ChatUsage) -> Self {
        Usage {
            total_tokens: Some(u.total_tokens.unwrap_or(u.prompt_tokens.saturating_add(u.completion_tokens))),
            reasoning_tokens: u.completion_tokens_details.and_then(|d| d.reasoning_tokens),
            cached_input_tokens: u.prompt_tokens_details.and_then(|d| d.cached_tokens),
            ..Usage::new(u.prompt_tokens, u.completion_tokens)
        }
    }
}

fn citation_sources(citations: &[String]) -> Vec<Source> {
    citations
        .iter()
        .enumerate()
        .map(|(i, url)| Source {
            id: Some((i + 1).to_string()),
            url: url.clone(),
            title: None,
        })
        .collect()
}

impl ChatResponse {
    fn into_response(self, provider: &str, model: &str) -> Result<Response, ClientError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::upstream(provider, model, None, "response has no choices"))?;

        let mut content = Vec::new();
        if let Some(reasoning) = choice.message.reasoning_content.filter(|r| !r.is_empty()) {
            content.push(MessagePart::Reasoning {
                text: reasoning,
                signature: None,
            });
        }
        if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
            content.push(MessagePart::text(text));
        }
        for call in choice.message.tool_calls.unwrap_or_default() {
            content.push(MessagePart::ToolCall(crate::model::ToolCall {
                id: Some(call.id),
                tool_name: call.function.name,
                input: parse_arguments(&call.function.arguments),
            }));
        }

        let finish = choice
            .finish_reason
            .as_deref()
            .map(finish_reason)
            .unwrap_or(FinishReason::Stop);
        let usage = self.usage.map(Usage::from).unwrap_or_default();

        Ok(Response::from_content(content, finish, usage)
            .with_sources(citation_sources(&self.citations))
            .with_meta(self.id, self.model))
    }
}

fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    name: Option<String>,
    context_length: Option<u32>,
    top_provider: Option<TopProvider>,
    architecture: Option<Architecture>,
    #[serde(default)]
    supported_parameters: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TopProvider {
    max_completion_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct Architecture {
    #[serde(default)]
    input_modalities: Vec<String>,
}

impl ModelEntry {
    fn into_openrouter_metadata(self, icon: &str, default: TokenLimits) -> ModelMetaData {
        let context = self.context_length.unwrap_or(default.max_total_tokens);
        let max_output = self
            .top_provider
            .and_then(|p| p.max_completion_tokens)
            .unwrap_or(default.max_output_tokens)
            .min(context);
        let limits = TokenLimits::new(context, max_output);
        let modalities = self.architecture.map(|a| a.input_modalities).unwrap_or_default();
        let has = |name: &str| self.supported_parameters.iter().any(|p| p == name);

        ModelMetaData {
            display_name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            icon: icon.to_string(),
            model_type: ModelType::Llm,
            capabilities: Capabilities {
                vision: modalities.iter().any(|m| m == "image"),
                pdf_input: modalities.iter().any(|m| m == "file"),
                tool_calling: has("tools"),
                web_search: false,
                reasoning: has("reasoning"),
                max_context: Some(context),
            },
            token_limits: limits,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

// --- Stream Types ---

#[derive(Debug, Deserialize)]
pub struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
    usage: Option<ChatUsage>,
    #[serde(default)]
    citations: Vec<String>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChoice {
    delta: Option<ChatDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatDelta {
    content: Option<String>,
    #[serde(alias = "reasoning")]
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<ChatStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamToolCall {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<ChatStreamFunction>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Decodes Chat Completions stream chunks.
///
/// Tool-call fragments are buffered by index until the choice finishes. The
/// step is closed on `flush`, because with `include_usage` the usage arrives
/// in a trailing chunk after the finish reason.
pub struct ChatStreamDecoder {
    flavor: Flavor,
    model: String,
    tools: BTreeMap<u32, PendingToolCall>,
    finish: Option<FinishReason>,
    usage: Option<Usage>,
    cited: usize,
}

impl ChatStreamDecoder {
    pub fn new(flavor: Flavor, model: &str) -> Self {
        Self {
            flavor,
            model: model.to_string(),
            tools: BTreeMap::new(),
            finish: None,
            usage: None,
            cited: 0,
        }
    }

    fn complete_tool_calls(&mut self) -> Vec<Chunk> {
        std::mem::take(&mut self.tools)
            .into_values()
            .map(|call| Chunk::ToolCall {
                id: call.id,
                input: parse_arguments(&call.arguments),
                tool_name: call.name,
            })
            .collect()
    }
}

impl StreamDecoder for ChatStreamDecoder {
    type Event = ChatStreamChunk;

    fn decode(&mut self, event: ChatStreamChunk) -> Vec<Chunk> {
        let mut chunks = Vec::new();

        if let Some(error) = event.error {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            chunks.push(Chunk::Error(ClientError::upstream(
                self.flavor.kind().as_str(),
                self.model.clone(),
                None,
                message,
            )));
            return chunks;
        }

        // Perplexity repeats the full citation list on every chunk.
        if event.citations.len() > self.cited {
            chunks.extend(
                citation_sources(&event.citations)
                    .into_iter()
                    .skip(self.cited)
                    .map(Chunk::Source),
            );
            self.cited = event.citations.len();
        }

        for choice in event.choices {
            if let Some(delta) = choice.delta {
                if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
                    chunks.push(Chunk::ReasoningDelta(reasoning));
                }
                if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                    chunks.push(Chunk::TextDelta(text));
                }
                for call in delta.tool_calls.unwrap_or_default() {
                    let function = call.function.unwrap_or(ChatStreamFunction {
                        name: None,
                        arguments: None,
                    });
                    let started = self.tools.contains_key(&call.index);
                    let pending = self.tools.entry(call.index).or_default();
                    if let Some(id) = call.id {
                        pending.id = Some(id);
                    }
                    if let Some(name) = function.name {
                        pending.name.push_str(&name);
                    }
                    if !started {
                        chunks.push(Chunk::ToolInputStart {
                            id: pending.id.clone(),
                            tool_name: pending.name.clone(),
                        });
                    }
                    if let Some(arguments) = function.arguments.filter(|a| !a.is_empty()) {
                        pending.arguments.push_str(&arguments);
                        chunks.push(Chunk::ToolInputDelta {
                            id: pending.id.clone(),
                            tool_name: pending.name.clone(),
                            delta: arguments,
                        });
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish = Some(finish_reason(&reason));
                chunks.extend(self.complete_tool_calls());
            }
        }

        if let Some(usage) = event.usage {
            self.usage = Some(usage.into());
        }
        chunks
    }

    fn flush(&mut self) -> Vec<Chunk> {
        let mut chunks = self.complete_tool_calls();
        if !chunks.is_empty() && self.finish.is_none() {
            self.finish = Some(FinishReason::ToolCalls);
        }
        if let Some(finish_reason) = self.finish {
            let usage = self.usage.unwrap_or_default();
            chunks.push(Chunk::StepFinish { finish_reason, usage });
            chunks.push(Chunk::Finish {
                finish_reason: Some(finish_reason),
                usage: Some(usage),
            });
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MetadataCache;
    use crate::client::ErrorKind;
    use crate::model::{Message, ToolDefinition};
    use crate::options::OutputControl;
    use crate::stream::StreamEvent;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context() -> BuildContext {
        BuildContext {
            timeout: None,
            cache: Arc::new(MetadataCache::new()),
        }
    }

    fn client(flavor: Flavor, server: &MockServer) -> OpenAiClient {
        let config = ProviderConfig::new("sk-test").with_base_url(server.uri());
        OpenAiClient::new(flavor, &config, &context()).unwrap()
    }

    fn decode(decoder: &mut ChatStreamDecoder, json: Value) -> Vec<Chunk> {
        decoder.decode(serde_json::from_value(json).unwrap())
    }

    #[test]
    fn test_missing_key_fails_construction() {
        let err = OpenAiClient::new(Flavor::OpenAi, &ProviderConfig::default(), &context())
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_request_body_roles_and_merge() {
        let request = Request::new("openai", "gpt-4o")
            .with_message(Message::system("S"))
            .with_message(Message::user("U1"))
            .with_message(Message::assistant("A1"))
            .with_output_control(OutputControl {
                temperature: Some(0.25),
                max_output_tokens: Some(1024),
                ..Default::default()
            });

        let body = serde_json::to_value(ChatRequest::new(Flavor::OpenAi, "gpt-4o", &request, false)).unwrap();
        assert_eq!(
            body,
            json!({
                "model": "gpt-4o",
                "messages": [
                    { "role": "system", "content": "S" },
                    { "role": "user", "content": "U1" },
                    { "role": "assistant", "content": "A1" },
                ],
                "max_tokens": 1024,
                "temperature": 0.25,
            })
        );
    }

    #[test]
    fn test_reasoning_model_parameters() {
        let request = Request::new("openai", "o3-mini")
            .with_message(Message::user("hi"))
            .with_output_control(OutputControl {
                temperature: Some(0.5),
                max_output_tokens: Some(500),
                reasoning_effort: Some(crate::options::ReasoningEffort::High),
                ..Default::default()
            });
        let body = serde_json::to_value(ChatRequest::new(Flavor::OpenAi, "o3-mini", &request, true)).unwrap();
        assert_eq!(body["max_completion_tokens"], 500);
        assert_eq!(body["reasoning_effort"], "high");
        assert!(body.get("temperature").is_none());
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_tool_round_trip_messages() {
        let request = Request::new("openai", "gpt-4o")
            .with_message(Message::user("weather?"))
            .with_message(Message::new(
                Role::Assistant,
                vec![MessagePart::ToolCall(crate::model::ToolCall {
                    id: Some("call_1".into()),
                    tool_name: "weather".into(),
                    input: json!({"city": "Oslo"}),
                })],
            ))
            .with_message(Message::new(
                Role::User,
                vec![MessagePart::ToolResult(crate::model::ToolResult {
                    tool_call_id: "call_1".into(),
                    tool_name: "weather".into(),
                    output: json!({"temp": 3}),
                })],
            ))
            .with_tool(ToolDefinition {
                name: "weather".into(),
                description: Some("Current weather".into()),
                parameters: json!({"type": "object"}),
            })
            .with_tool_choice(ToolChoice::Tool { name: "weather".into() });

        let body = serde_json::to_value(ChatRequest::new(Flavor::OpenAi, "gpt-4o", &request, false)).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["tool_calls"][0]["function"]["arguments"], r#"{"city":"Oslo"}"#);
        assert!(messages[1].get("content").is_none());
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "call_1");
        assert_eq!(body["tool_choice"]["function"]["name"], "weather");
    }

    #[tokio::test]
    async fn test_block_chat_against_mock() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(bearer_token("sk-test"))
            .and(body_partial_json(json!({"model": "gpt-4o"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "model": "gpt-4o-2024-08-06",
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": "Hello! How can I help?" },
                    "finish_reason": "stop"
                }],
                "usage": { "prompt_tokens": 8, "completion_tokens": 6, "total_tokens": 14 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = Request::new("openai", "gpt-4o").with_message(Message::user("hello"));
        let response = client(Flavor::OpenAi, &server).request(&request).await.unwrap();

        assert_eq!(response.text, "Hello! How can I help?");
        assert!(response.usage.total_tokens.unwrap() > 0);
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.response.id.as_deref(), Some("chatcmpl-1"));
        assert_eq!(response.response.messages[0].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_upstream_error_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_json(json!({"error": {"message": "Rate limit reached", "type": "requests"}})),
            )
            .mount(&server)
            .await;

        let request = Request::new("openai", "gpt-4o").with_message(Message::user("hello"));
        let err = client(Flavor::OpenAi, &server).request(&request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamError);
        let message = err.to_string();
        assert!(message.contains("Rate limit reached"));
        assert!(!message.contains("sk-test"));
    }

    #[tokio::test]
    async fn test_stream_against_mock() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"Hi\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let request = Request::new("openai", "gpt-4o").with_message(Message::user("hello"));
        let events: Vec<StreamEvent> = client(Flavor::OpenAi, &server)
            .request_stream(request)
            .collect()
            .await;

        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], StreamEvent::TextDelta { text } if text == "Hi"));
        assert!(matches!(&events[1], StreamEvent::TextDelta { text } if text == " there"));
        assert!(matches!(events[2], StreamEvent::StepFinished { .. }));
        match &events[3] {
            StreamEvent::Complete { usage, finish_reason, .. } => {
                assert_eq!(usage.total_tokens, Some(5));
                assert_eq!(*finish_reason, FinishReason::Stop);
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_http_error_is_terminal_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": {"message": "bad key"}})))
            .mount(&server)
            .await;

        let request = Request::new("openai", "gpt-4o").with_message(Message::user("hello"));
        let events: Vec<StreamEvent> = client(Flavor::OpenAi, &server)
            .request_stream(request)
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Error { error, .. } => assert_eq!(error.kind(), ErrorKind::UpstreamError),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decoder_accumulates_tool_calls() {
        let mut decoder = ChatStreamDecoder::new(Flavor::OpenAi, "gpt-4o");
        let first = decode(
            &mut decoder,
            json!({"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"search","arguments":""}}]}}]}),
        );
        assert!(matches!(&first[..], [Chunk::ToolInputStart { tool_name, .. }] if tool_name == "search"));

        let second = decode(
            &mut decoder,
            json!({"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"q\":"}}]}}]}),
        );
        assert!(matches!(&second[..], [Chunk::ToolInputDelta { delta, .. }] if delta == "{\"q\":"));

        decode(
            &mut decoder,
            json!({"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"rust\"}"}}]}}]}),
        );
        let finished = decode(&mut decoder, json!({"choices":[{"delta":{},"finish_reason":"tool_calls"}]}));
        match &finished[..] {
            [Chunk::ToolCall { id, tool_name, input }] => {
                assert_eq!(id.as_deref(), Some("call_1"));
                assert_eq!(tool_name, "search");
                assert_eq!(input, &json!({"q": "rust"}));
            }
            other => panic!("unexpected chunks: {:?}", other),
        }

        let flushed = decoder.flush();
        assert!(matches!(
            &flushed[..],
            [
                Chunk::StepFinish { finish_reason: FinishReason::ToolCalls, .. },
                Chunk::Finish { .. }
            ]
        ));
    }

    #[test]
    fn test_decoder_emits_citations_once() {
        let mut decoder = ChatStreamDecoder::new(Flavor::Perplexity, "sonar");
        let chunk = json!({
            "citations": ["https://a.example", "https://b.example"],
            "choices": [{"delta": {"content": "Rust"}}]
        });
        let first = decode(&mut decoder, chunk.clone());
        assert_eq!(first.len(), 3);
        assert!(matches!(&first[0], Chunk::Source(s) if s.url == "https://a.example"));
        let second = decode(&mut decoder, chunk);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_decoder_error_names_model() {
        let mut decoder = ChatStreamDecoder::new(Flavor::OpenRouter, "anthropic/claude-sonnet-4");
        let chunks = decode(&mut decoder, json!({"error": {"message": "rate limited", "code": 429}}));
        assert_eq!(chunks.len(), 1);
        let Chunk::Error(err) = &chunks[0] else {
            panic!("expected error chunk, got {:?}", chunks[0]);
        };
        assert!(matches!(err, ClientError::Upstream { model, .. } if model == "anthropic/claude-sonnet-4"));
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn test_decoder_without_finish_flushes_nothing() {
        let mut decoder = ChatStreamDecoder::new(Flavor::OpenAi, "gpt-4o");
        decode(&mut decoder, json!({"choices":[{"delta":{"content":"partial"}}]}));
        assert!(decoder.flush().is_empty());
    }

    #[tokio::test]
    async fn test_embeddings_sorted_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"index": 1, "embedding": [0.3, 0.4]},
                    {"index": 0, "embedding": [0.1, 0.2]}
                ]
            })))
            .mount(&server)
            .await;

        let texts = vec!["a".to_string(), "b".to_string()];
        let embeddings = client(Flavor::OpenAi, &server)
            .generate_embeddings(&texts, "text-embedding-3-small")
            .await
            .unwrap();
        assert_eq!(embeddings, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);

        let err = client(Flavor::Perplexity, &server)
            .generate_embeddings(&texts, "x")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    }

    #[tokio::test]
    async fn test_models_live_then_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": "gpt-4o-2024-08-06", "object": "model"},
                    {"id": "text-embedding-3-small", "object": "model"},
                    {"id": "brand-new-model", "object": "model"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(Flavor::OpenAi, &server);
        let models = client.available_models().await.unwrap();
        assert_eq!(models.len(), 3);
        assert_eq!(models[0].display_name, "GPT-4o");
        assert_eq!(models[0].token_limits.max_output_tokens, 16_384);
        assert_eq!(models[1].model_type, ModelType::Embedding);
        assert_eq!(models[2].token_limits, Flavor::OpenAi.default_limits());

        // Served from the cache; the mock expects exactly one call.
        assert_eq!(client.available_models().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_models_fallback_and_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let openai = client(Flavor::OpenAi, &server).available_models().await.unwrap();
        assert_eq!(openai.len(), OPENAI_MODELS.len());

        let err = client(Flavor::OpenRouter, &server).available_models().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);
    }

    #[tokio::test]
    async fn test_openrouter_listing_feeds_token_limits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{
                    "id": "anthropic/claude-sonnet-4",
                    "name": "Anthropic: Claude Sonnet 4",
                    "context_length": 200000,
                    "top_provider": {"max_completion_tokens": 64000},
                    "architecture": {"input_modalities": ["text", "image"]},
                    "supported_parameters": ["tools", "reasoning"]
                }]
            })))
            .mount(&server)
            .await;

        let client = client(Flavor::OpenRouter, &server);
        let models = client.available_models().await.unwrap();
        assert!(models[0].capabilities.vision);
        assert!(models[0].capabilities.tool_calling);
        assert_eq!(
            client.model_token_limits("anthropic/claude-sonnet-4"),
            TokenLimits::new(200_000, 64_000)
        );
        assert_eq!(
            client.model_token_limits("unknown/model"),
            Flavor::OpenRouter.default_limits()
        );
    }

    #[test]
    fn test_token_limits_heuristic() {
        let config = ProviderConfig::new("k");
        let client = OpenAiClient::new(Flavor::OpenAi, &config, &context()).unwrap();
        assert_eq!(client.model_token_limits("gpt-4o-mini-2024-07-18").max_output_tokens, 16_384);
        assert_eq!(client.model_token_limits("o3-mini-high").max_total_tokens, 200_000);
        assert_eq!(client.model_token_limits("mystery"), Flavor::OpenAi.default_limits());
    }
}
