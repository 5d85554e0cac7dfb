//! Google Gemini API client.
//!
//! See: <https://ai.google.dev/api/generate-content>

use async_trait::async_trait;
use base64::prelude::*;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_with::skip_serializing_none;
use std::collections::{HashMap, HashSet};

use crate::cache::{CacheKey, ModelCache};
use crate::catalog::{
    caps, find_model, Capabilities, KnownModel, ModelMetaData, ModelType, ProviderMetadata, TokenLimits,
};
use crate::client::{guarded, Client, ClientError, EventStream};
use crate::http::{add_extra_headers, build_http_client, check_status, RequestBuilderExt, ResponseExt};
use crate::model::{
    FinishReason, GeneratedFile, MediaSource, MessagePart, Request, Response, Role, Source, ToolCall,
    ToolChoice, Usage,
};
use crate::options::ProviderConfig;
use crate::registry::{BuildContext, ProviderKind};
use crate::sse::SSEResponseExt;
use crate::stream::{decode_payloads, normalize, Chunk, StreamDecoder, StreamOptions};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_LIMITS: TokenLimits = TokenLimits::split(1_048_576, 8_192);

const fn gemini(
    alias: &'static str,
    display_name: &'static str,
    reasoning: bool,
    limits: TokenLimits,
) -> KnownModel {
    KnownModel {
        alias,
        api_id: alias,
        display_name,
        model_type: ModelType::Llm,
        capabilities: Capabilities {
            pdf_input: true,
            ..caps(true, true, reasoning)
        },
        limits,
    }
}

const fn embedding(alias: &'static str, display_name: &'static str) -> KnownModel {
    KnownModel {
        alias,
        api_id: alias,
        display_name,
        model_type: ModelType::Embedding,
        capabilities: caps(false, false, false),
        limits: TokenLimits::split(2_048, 0),
    }
}

const GEMINI_MODELS: &[KnownModel] = &[
    gemini("gemini-2.5-pro", "Gemini 2.5 Pro", true, TokenLimits::split(1_048_576, 65_536)),
    gemini("gemini-2.5-flash", "Gemini 2.5 Flash", true, TokenLimits::split(1_048_576, 65_536)),
    gemini("gemini-2.5-flash-lite", "Gemini 2.5 Flash-Lite", true, TokenLimits::split(1_048_576, 65_536)),
    gemini("gemini-2.0-flash", "Gemini 2.0 Flash", false, TokenLimits::split(1_048_576, 8_192)),
    gemini("gemini-2.0-flash-lite", "Gemini 2.0 Flash-Lite", false, TokenLimits::split(1_048_576, 8_192)),
    gemini("gemini-1.5-pro", "Gemini 1.5 Pro", false, TokenLimits::split(2_097_152, 8_192)),
    gemini("gemini-1.5-flash", "Gemini 1.5 Flash", false, TokenLimits::split(1_048_576, 8_192)),
    embedding("gemini-embedding-001", "Gemini Embedding"),
    embedding("text-embedding-004", "Text Embedding 004"),
];

/// Gemini client. The key travels in the `x-goog-api-key` header.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    headers: HeaderMap,
    base_url: String,
    extra_headers: Option<HashMap<String, String>>,
    cache: ModelCache,
    cache_key: CacheKey,
}

impl GeminiClient {
    pub fn new(config: &ProviderConfig, context: &BuildContext) -> Result<Self, ClientError> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| ClientError::Config("API key is required".to_string()))?;

        let mut headers = HeaderMap::new();
        let mut key = HeaderValue::from_str(api_key.expose_secret())
            .map_err(|_| ClientError::Config("API key contains invalid characters".to_string()))?;
        key.set_sensitive(true);
        headers.insert("x-goog-api-key", key);

        let base_url = config.base_url_or(DEFAULT_BASE_URL);
        Ok(Self {
            http: build_http_client(config, context.timeout)?,
            headers,
            cache_key: CacheKey::new(ProviderKind::Gemini, &base_url, config),
            base_url,
            extra_headers: config.extra_headers.clone(),
            cache: context.cache.clone(),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        add_extra_headers(request.headers(self.headers.clone()), &self.extra_headers)
    }

    fn model_path(model: &str) -> String {
        format!("models/{}", model.trim_start_matches("models/"))
    }

    async fn send(&self, request: &Request, stream: bool) -> Result<(reqwest::Response, Value), ClientError> {
        let model = self.model_client(&request.model);
        let method = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let url = format!("{}/{}:{}", self.base_url, Self::model_path(&model), method);
        let body = serde_json::to_value(GenerateRequest::new(&model, request))?;

        let response = self.authorized(self.http.post(url)).json_logged(&body).send().await?;
        let response = check_status(response, "gemini", &request.model).await?;
        Ok((response, body))
    }

    async fn complete(&self, request: &Request) -> Result<Response, ClientError> {
        let (response, body) = self.send(request, false).await?;
        let generated: GenerateResponse = response.json_logged().await?;
        generated
            .into_response(&request.model)
            .map(|response| response.with_request_body(body))
    }

    async fn fetch_models(&self) -> Result<Vec<ModelMetaData>, ClientError> {
        let url = format!("{}/models?pageSize=1000", self.base_url);
        let response = self.authorized(self.http.get(url)).send().await?;
        let response = check_status(response, "gemini", "").await?;
        let list: ModelList = response.json_logged().await?;
        Ok(list.models.into_iter().map(ModelEntry::into_metadata).collect())
    }
}

#[async_trait]
impl Client for GeminiClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            id: "gemini".to_string(),
            name: "Google Gemini".to_string(),
            default_base_url: DEFAULT_BASE_URL.to_string(),
            icon: "gemini".to_string(),
        }
    }

    fn model_client(&self, model: &str) -> String {
        model.trim_start_matches("models/").to_string()
    }

    async fn request(&self, request: &Request) -> Result<Response, ClientError> {
        guarded(request, self.complete(request)).await
    }

    fn request_stream(&self, request: Request) -> EventStream {
        let client = self.clone();
        let options = StreamOptions::for_request("gemini", &request);
        let chunks = async_stream::stream! {
            let response = match client.send(&request, true).await {
                Ok((response, _)) => response,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let decoded = decode_payloads(response.sse(), GeminiStreamDecoder::new(&request.model));
            futures::pin_mut!(decoded);
            while let Some(chunk) = decoded.next().await {
                yield chunk;
            }
        };
        normalize(chunks, options)
    }

    async fn available_models(&self) -> Result<Vec<ModelMetaData>, ClientError> {
        if let Some(models) = self.cache.get(&self.cache_key) {
            return Ok(models);
        }
        match self.fetch_models().await {
            Ok(models) => {
                self.cache.set(self.cache_key.clone(), models.clone());
                Ok(models)
            }
            Err(e) => {
                tracing::warn!(provider = "gemini", error = %e, "model listing failed, using static table");
                Ok(GEMINI_MODELS.iter().map(|m| m.to_metadata("gemini")).collect())
            }
        }
    }

    fn model_token_limits(&self, model: &str) -> TokenLimits {
        let model = self.model_client(model);
        let listed = self
            .cache
            .get(&self.cache_key)
            .and_then(|models| models.into_iter().find(|m| m.id == model))
            .map(|m| m.token_limits);
        listed
            .or_else(|| find_model(GEMINI_MODELS, &model).map(|m| m.limits))
            .unwrap_or(DEFAULT_LIMITS)
    }

    async fn generate_embeddings(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, ClientError> {
        let model_path = Self::model_path(model);
        let body = json!({
            "requests": texts
                .iter()
                .map(|text| json!({ "model": model_path, "content": { "parts": [{ "text": text }] } }))
                .collect::<Vec<_>>()
        });
        let url = format!("{}/{}:batchEmbedContents", self.base_url, model_path);
        let response = self.authorized(self.http.post(url)).json_logged(&body).send().await?;
        let response = check_status(response, "gemini", model).await?;
        let embeddings: EmbeddingResponse = response.json_logged().await?;
        Ok(embeddings.embeddings.into_iter().map(|e| e.values).collect())
    }
}

fn finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::OutputTokens,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" | "IMAGE_SAFETY" => {
            FinishReason::ContentFilter
        }
        "MALFORMED_FUNCTION_CALL" => FinishReason::Error,
        _ => FinishReason::Other,
    }
}

fn supports_thinking(model: &str) -> bool {
    model.starts_with("gemini-2.5") || model.starts_with("gemini-3")
}

// --- Request Types ---

#[skip_serializing_none]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<GeminiTool>,
    tool_config: Option<Value>,
    generation_config: GenerationConfig,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize)]
struct Content {
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
enum Part {
    FunctionCall {
        function_call: FunctionCall,
        thought_signature: Option<String>,
    },
    FunctionResponse {
        function_response: FunctionResponse,
    },
    InlineData {
        inline_data: Blob,
    },
    FileData {
        file_data: FileData,
    },
    Text {
        text: String,
        thought: Option<bool>,
        thought_signature: Option<String>,
    },
    /// Any part kind this client has no mapping for.
    Other(Value),
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileData {
    mime_type: String,
    file_uri: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    function_declarations: Vec<FunctionDeclaration>,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: Option<String>,
    parameters: Value,
}

#[skip_serializing_none]
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
    max_output_tokens: Option<u32>,
    presence_penalty: Option<f32>,
    frequency_penalty: Option<f32>,
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    include_thoughts: bool,
    thinking_budget: u32,
}

fn media_part(source: &MediaSource, media_type: &str) -> Part {
    match source {
        MediaSource::Bytes(bytes) => Part::InlineData {
            inline_data: Blob {
                mime_type: media_type.to_string(),
                data: BASE64_STANDARD.encode(bytes),
            },
        },
        MediaSource::Url(url) => Part::FileData {
            file_data: FileData {
                mime_type: media_type.to_string(),
                file_uri: url.clone(),
            },
        },
    }
}

fn text_part(text: String) -> Part {
    Part::Text {
        text,
        thought: None,
        thought_signature: None,
    }
}

fn to_part(part: &MessagePart, role: Role) -> Option<Part> {
    Some(match part {
        MessagePart::Text { text } => text_part(text.clone()),
        MessagePart::Image { source, media_type } => {
            media_part(source, media_type.as_deref().unwrap_or("image/png"))
        }
        MessagePart::File { source, media_type, .. } => media_part(source, media_type),
        // Past thoughts are not replayed to the model.
        MessagePart::Reasoning { .. } if role == Role::Assistant => return None,
        MessagePart::ToolCall(call) if role == Role::Assistant => Part::FunctionCall {
            function_call: FunctionCall {
                id: call.id.clone(),
                name: call.tool_name.clone(),
                args: call.input.clone(),
            },
            thought_signature: None,
        },
        MessagePart::ToolResult(result) => Part::FunctionResponse {
            function_response: FunctionResponse {
                name: result.tool_name.clone(),
                response: match &result.output {
                    Value::Object(_) => result.output.clone(),
                    other => json!({ "result": other }),
                },
            },
        },
        other => text_part(other.fallback_text()),
    })
}

impl GenerateRequest {
    fn new(model: &str, request: &Request) -> Self {
        let contents = request
            .conversation()
            .filter_map(|message| {
                let parts: Vec<Part> = message.parts().filter_map(|p| to_part(p, message.role)).collect();
                let role = match message.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                (!parts.is_empty()).then(|| Content {
                    role: Some(role.to_string()),
                    parts,
                })
            })
            .collect();

        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![GeminiTool {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|t| FunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    })
                    .collect(),
            }]
        };

        let tool_config = match (&request.tool_choice, tools.is_empty()) {
            (_, true) | (None, _) => None,
            (Some(ToolChoice::Auto), _) => Some(json!({"functionCallingConfig": {"mode": "AUTO"}})),
            (Some(ToolChoice::None), _) => Some(json!({"functionCallingConfig": {"mode": "NONE"}})),
            (Some(ToolChoice::Required), _) => Some(json!({"functionCallingConfig": {"mode": "ANY"}})),
            (Some(ToolChoice::Tool { name }), _) => Some(json!({
                "functionCallingConfig": {"mode": "ANY", "allowedFunctionNames": [name]}
            })),
        };

        let output = request.output();
        let thinking_config = output
            .reasoning_effort
            .filter(|_| supports_thinking(model))
            .map(|effort| ThinkingConfig {
                include_thoughts: true,
                thinking_budget: effort.budget_tokens(),
            });

        GenerateRequest {
            contents,
            system_instruction: request.system_prompt().map(|system| Content {
                role: None,
                parts: vec![text_part(system)],
            }),
            tools,
            tool_config,
            generation_config: GenerationConfig {
                temperature: output.temperature,
                top_p: output.top_p,
                top_k: output.top_k,
                max_output_tokens: output.max_output_tokens,
                presence_penalty: output.presence_penalty,
                frequency_penalty: output.frequency_penalty,
                thinking_config,
            },
        }
    }
}

// --- Response Types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    prompt_feedback: Option<PromptFeedback>,
    response_id: Option<String>,
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    web: Option<WebSource>,
}

#[derive(Debug, Deserialize)]
struct WebSource {
    uri: String,
    title: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    total_token_count: Option<u32>,
    thoughts_token_count: Option<u32>,
    cached_content_token_count: Option<u32>,
}

impl From<UsageMetadata> for Usage {
    fn from(u: UsageMetadata) -> Self {
        let output = u.candidates_token_count.saturating_add(u.thoughts_token_count.unwrap_or(0));
        Usage {
            total_tokens: Some(u.total_token_count.unwrap_or(u.prompt_token_count.saturating_add(output))),
            reasoning_tokens: u.thoughts_token_count,
            cached_input_tokens: u.cached_content_token_count,
            ..Usage::new(u.prompt_token_count, output)
        }
    }
}

fn grounding_sources(metadata: Option<&GroundingMetadata>) -> Vec<Source> {
    metadata
        .map(|m| {
            m.grounding_chunks
                .iter()
                .filter_map(|c| c.web.as_ref())
                .map(|web| Source {
                    id: None,
                    url: web.uri.clone(),
                    title: web.title.clone(),
                })
                .collect()
        })
        .unwrap_or_default()
}

impl GenerateResponse {
    fn into_response(self, model: &str) -> Result<Response, ClientError> {
        let Some(candidate) = self.candidates.into_iter().next() else {
            let reason = self
                .prompt_feedback
                .and_then(|f| f.block_reason)
                .map(|r| format!("prompt blocked: {}", r))
                .unwrap_or_else(|| "response has no candidates".to_string());
            return Err(ClientError::upstream("gemini", model, None, reason));
        };

        let mut content = Vec::new();
        let mut files = Vec::new();
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            match part {
                Part::Text {
                    text,
                    thought: Some(true),
                    thought_signature,
                } => content.push(MessagePart::Reasoning {
                    text,
                    signature: thought_signature,
                }),
                Part::Text { text, .. } => content.push(MessagePart::text(text)),
                Part::FunctionCall { function_call, .. } => content.push(MessagePart::ToolCall(ToolCall {
                    id: function_call.id,
                    tool_name: function_call.name,
                    input: function_call.args,
                })),
                Part::InlineData { inline_data } => match BASE64_STANDARD.decode(&inline_data.data) {
                    Ok(data) => files.push(GeneratedFile {
                        media_type: inline_data.mime_type,
                        data: Bytes::from(data),
                    }),
                    Err(e) => tracing::debug!("Undecodable inline data: {}", e),
                },
                _ => {}
            }
        }

        let finish = candidate
            .finish_reason
            .as_deref()
            .map(finish_reason)
            .unwrap_or(FinishReason::Stop);
        let finish = if finish == FinishReason::Stop && content.iter().any(|p| matches!(p, MessagePart::ToolCall(_))) {
            FinishReason::ToolCalls
        } else {
            finish
        };
        let usage = self.usage_metadata.map(Usage::from).unwrap_or_default();

        Ok(Response::from_content(content, finish, usage)
            .with_files(files)
            .with_sources(grounding_sources(candidate.grounding_metadata.as_ref()))
            .with_meta(self.response_id, self.model_version))
    }
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelEntry {
    name: String,
    display_name: Option<String>,
    input_token_limit: Option<u32>,
    output_token_limit: Option<u32>,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
    #[serde(default)]
    thinking: bool,
}

impl ModelEntry {
    fn into_metadata(self) -> ModelMetaData {
        let id = self.name.trim_start_matches("models/").to_string();
        let known = find_model(GEMINI_MODELS, &id);
        let embeds = self.supported_generation_methods.iter().any(|m| m.starts_with("embed"));
        let limits = match (self.input_token_limit, self.output_token_limit) {
            (Some(input), output) => TokenLimits::split(input, output.unwrap_or(0)),
            _ => known.map(|m| m.limits).unwrap_or(DEFAULT_LIMITS),
        };
        let mut capabilities = known.map(|m| m.capabilities).unwrap_or(Capabilities {
            vision: !embeds,
            pdf_input: !embeds,
            tool_calling: !embeds,
            ..Default::default()
        });
        capabilities.reasoning |= self.thinking;
        capabilities.max_context = Some(limits.max_total_tokens);

        ModelMetaData {
            display_name: self.display_name.unwrap_or_else(|| id.clone()),
            id,
            icon: "gemini".to_string(),
            model_type: if embeds { ModelType::Embedding } else { ModelType::Llm },
            capabilities,
            token_limits: limits,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embeddings: Vec<Embedding>,
}

#[derive(Debug, Deserialize)]
struct Embedding {
    values: Vec<f32>,
}

/// Decodes `streamGenerateContent` chunks.
///
/// Every chunk is a partial `GenerateContentResponse`; usage metadata is
/// cumulative, so the last one seen is the step total.
struct GeminiStreamDecoder {
    model: String,
    finish: Option<FinishReason>,
    usage: Option<Usage>,
    called_tools: bool,
    cited: HashSet<String>,
}

impl GeminiStreamDecoder {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            finish: None,
            usage: None,
            called_tools: false,
            cited: HashSet::new(),
        }
    }
}

impl StreamDecoder for GeminiStreamDecoder {
    type Event = GenerateResponse;

    fn decode(&mut self, event: GenerateResponse) -> Vec<Chunk> {
        let mut chunks = Vec::new();

        if event.candidates.is_empty() {
            if let Some(reason) = event.prompt_feedback.and_then(|f| f.block_reason) {
                chunks.push(Chunk::Error(ClientError::upstream(
                    "gemini",
                    self.model.clone(),
                    None,
                    format!("prompt blocked: {}", reason),
                )));
                return chunks;
            }
        }

        for candidate in event.candidates.into_iter().take(1) {
            for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                match part {
                    Part::Text { text, thought: Some(true), .. } => chunks.push(Chunk::ReasoningDelta(text)),
                    Part::Text { text, .. } if !text.is_empty() => chunks.push(Chunk::TextDelta(text)),
                    Part::Text { .. } => {}
                    Part::FunctionCall { function_call, .. } => {
                        self.called_tools = true;
                        chunks.push(Chunk::ToolInputStart {
                            id: function_call.id.clone(),
                            tool_name: function_call.name.clone(),
                        });
                        chunks.push(Chunk::ToolCall {
                            id: function_call.id,
                            tool_name: function_call.name,
                            input: function_call.args,
                        });
                    }
                    other => chunks.push(Chunk::Unsupported(serde_json::to_value(&other).unwrap_or(Value::Null))),
                }
            }
            for source in grounding_sources(candidate.grounding_metadata.as_ref()) {
                if self.cited.insert(source.url.clone()) {
                    chunks.push(Chunk::Source(source));
                }
            }
            if let Some(reason) = candidate.finish_reason {
                self.finish = Some(finish_reason(&reason));
            }
        }

        if let Some(usage) = event.usage_metadata {
            self.usage = Some(usage.into());
        }
        chunks
    }

    fn flush(&mut self) -> Vec<Chunk> {
        let Some(mut finish_reason) = self.finish else {
            return Vec::new();
        };
        if finish_reason == FinishReason::Stop && self.called_tools {
            finish_reason = FinishReason::ToolCalls;
        }
        let usage = self.usage.unwrap_or_default();
        vec![
            Chunk::StepFinish { finish_reason, usage },
            Chunk::Finish {
                finish_reason: Some(finish_reason),
                usage: Some(usage),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MetadataCache;
    use crate::client::ErrorKind;
    use crate::model::{Message, ToolDefinition};
    use crate::options::{OutputControl, ReasoningEffort};
    use crate::stream::StreamEvent;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context() -> BuildContext {
        BuildContext {
            timeout: None,
            cache: Arc::new(MetadataCache::new()),
        }
    }

    fn client(server: &MockServer) -> GeminiClient {
        let config = ProviderConfig::new("AIza-test").with_base_url(server.uri());
        GeminiClient::new(&config, &context()).unwrap()
    }

    #[test]
    fn test_request_shape() {
        let request = Request::new("gemini", "gemini-2.5-flash")
            .with_message(Message::system("S"))
            .with_message(Message::user("U1"))
            .with_message(Message::assistant("A1"))
            .with_tool(ToolDefinition {
                name: "lookup".into(),
                description: None,
                parameters: json!({"type": "object"}),
            })
            .with_tool_choice(ToolChoice::Required)
            .with_output_control(OutputControl {
                temperature: Some(0.25),
                max_output_tokens: Some(1024),
                reasoning_effort: Some(ReasoningEffort::Medium),
                ..Default::default()
            });

        let body = serde_json::to_value(GenerateRequest::new("gemini-2.5-flash", &request)).unwrap();
        assert_eq!(
            body,
            json!({
                "contents": [
                    { "role": "user", "parts": [{ "text": "U1" }] },
                    { "role": "model", "parts": [{ "text": "A1" }] },
                ],
                "systemInstruction": { "parts": [{ "text": "S" }] },
                "tools": [{ "functionDeclarations": [{ "name": "lookup", "parameters": { "type": "object" } }] }],
                "toolConfig": { "functionCallingConfig": { "mode": "ANY" } },
                "generationConfig": {
                    "temperature": 0.25,
                    "maxOutputTokens": 1024,
                    "thinkingConfig": { "includeThoughts": true, "thinkingBudget": 8192 },
                },
            })
        );
    }

    #[test]
    fn test_unknown_part_kind_is_kept() {
        let part: Part = serde_json::from_value(json!({"executableCode": {"code": "print(1)"}})).unwrap();
        assert!(matches!(part, Part::Other(_)));

        let mut decoder = GeminiStreamDecoder::new("gemini-2.5-flash");
        let chunks = decoder.decode(
            serde_json::from_value(json!({
                "candidates": [{"content": {"role": "model", "parts": [
                    {"text": "hmm", "thought": true},
                    {"executableCode": {"code": "print(1)"}},
                    {"text": "done"}
                ]}}]
            }))
            .unwrap(),
        );
        assert!(matches!(&chunks[0], Chunk::ReasoningDelta(t) if t == "hmm"));
        assert!(matches!(&chunks[1], Chunk::Unsupported(raw) if raw["executableCode"]["code"] == "print(1)"));
        assert!(matches!(&chunks[2], Chunk::TextDelta(t) if t == "done"));
        assert!(decoder.flush().is_empty());
    }

    #[tokio::test]
    async fn test_block_chat_uses_header_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.5-flash:generateContent"))
            .and(header("x-goog-api-key", "AIza-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "Bonjour"}]},
                    "finishReason": "STOP",
                    "groundingMetadata": {"groundingChunks": [{"web": {"uri": "https://fr.example", "title": "FR"}}]}
                }],
                "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6},
                "modelVersion": "gemini-2.5-flash"
            })))
            .mount(&server)
            .await;

        let request = Request::new("gemini", "gemini-2.5-flash").with_message(Message::user("Say hi in French"));
        let response = client(&server).request(&request).await.unwrap();
        assert_eq!(response.text, "Bonjour");
        assert_eq!(response.usage.total_tokens, Some(6));
        assert_eq!(response.sources[0].url, "https://fr.example");

        let received = server.received_requests().await.unwrap();
        assert!(!received[0].url.as_str().contains("AIza-test"));
    }

    #[tokio::test]
    async fn test_stream_with_function_call() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Let me check\"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"functionCall\":{\"name\":\"weather\",\"args\":{\"city\":\"Oslo\"}}}]},\"finishReason\":\"STOP\"}],",
            "\"usageMetadata\":{\"promptTokenCount\":5,\"candidatesTokenCount\":7,\"totalTokenCount\":12}}\r\n\r\n",
        );
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.5-flash:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let request = Request::new("gemini", "gemini-2.5-flash").with_message(Message::user("weather?"));
        let events: Vec<StreamEvent> = client(&server).request_stream(request).collect().await;

        assert_eq!(events.len(), 5);
        assert!(matches!(&events[0], StreamEvent::TextDelta { text } if text == "Let me check"));
        assert!(matches!(&events[1], StreamEvent::ToolInputStart { tool_name, .. } if tool_name == "weather"));
        assert!(matches!(&events[2], StreamEvent::ToolCall { input, .. } if input["city"] == "Oslo"));
        match &events[4] {
            StreamEvent::Complete { usage, finish_reason, .. } => {
                assert_eq!(*finish_reason, FinishReason::ToolCalls);
                assert_eq!(usage.total_tokens, Some(12));
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_models_live_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [
                    {
                        "name": "models/gemini-2.5-pro",
                        "displayName": "Gemini 2.5 Pro",
                        "inputTokenLimit": 1048576,
                        "outputTokenLimit": 65536,
                        "supportedGenerationMethods": ["generateContent", "countTokens"],
                        "thinking": true
                    },
                    {
                        "name": "models/text-embedding-004",
                        "inputTokenLimit": 2048,
                        "outputTokenLimit": 1,
                        "supportedGenerationMethods": ["embedContent"]
                    }
                ]
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        let models = client.available_models().await.unwrap();
        assert_eq!(models[0].id, "gemini-2.5-pro");
        assert!(models[0].capabilities.reasoning);
        assert_eq!(models[1].model_type, ModelType::Embedding);
        assert_eq!(
            client.model_token_limits("models/gemini-2.5-pro"),
            TokenLimits::split(1_048_576, 65_536)
        );
    }

    #[tokio::test]
    async fn test_models_fallback_to_static_table() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let models = client(&server).available_models().await.unwrap();
        assert_eq!(models.len(), GEMINI_MODELS.len());
    }

    #[tokio::test]
    async fn test_batch_embeddings() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/text-embedding-004:batchEmbedContents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embeddings": [{"values": [0.5, 0.25]}, {"values": [1.0, 0.0]}]
            })))
            .mount(&server)
            .await;

        let texts = vec!["a".to_string(), "b".to_string()];
        let embeddings = client(&server)
            .generate_embeddings(&texts, "text-embedding-004")
            .await
            .unwrap();
        assert_eq!(embeddings, vec![vec![0.5, 0.25], vec![1.0, 0.0]]);
    }

    #[tokio::test]
    async fn test_blocked_prompt_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "promptFeedback": {"blockReason": "SAFETY"}
            })))
            .mount(&server)
            .await;

        let request = Request::new("gemini", "gemini-2.5-flash").with_message(Message::user("..."));
        let err = client(&server).request(&request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamError);
        assert!(err.to_string().contains("SAFETY"));
    }
}
