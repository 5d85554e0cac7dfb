//! Common data models for provider-agnostic LLM requests and responses.

use bytes::Bytes;
use itertools::Itertools;
use nonempty::NonEmpty;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::ops::AddAssign;
use tokio_util::sync::CancellationToken;

use base64::prelude::*;

use crate::options::OutputControl;

/// Role of the message sender.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Where the bytes of an image or file live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    Bytes(Bytes),
    Url(String),
}

impl MediaSource {
    /// Base64 payload for inline sources.
    pub fn base64(&self) -> Option<String> {
        match self {
            MediaSource::Bytes(bytes) => Some(BASE64_STANDARD.encode(bytes)),
            MediaSource::Url(_) => None,
        }
    }

    /// A URL for the payload: the URL itself, or a `data:` URL for inline bytes.
    pub fn to_url(&self, media_type: &str) -> String {
        match self {
            MediaSource::Bytes(bytes) => {
                format!("data:{};base64,{}", media_type, BASE64_STANDARD.encode(bytes))
            }
            MediaSource::Url(url) => url.clone(),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub tool_name: String,
    pub input: Value,
}

/// The outcome of a tool invocation, fed back to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub output: Value,
}

/// One piece of message content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    Image {
        source: MediaSource,
        #[serde(default, rename = "mediaType", skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
    File {
        source: MediaSource,
        #[serde(rename = "mediaType")]
        media_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }

    /// The text of a `Text` part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessagePart::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Plain-text rendering for backends with no native slot for this part.
    ///
    /// Text passes through; everything else becomes a JSON blob. Inline bytes
    /// are not embedded, only their size.
    pub fn fallback_text(&self) -> String {
        match self {
            MessagePart::Text { text } => text.clone(),
            MessagePart::Reasoning { text, .. } => text.clone(),
            MessagePart::ToolCall(call) => serde_json::json!({
                "type": "tool-call",
                "toolCallId": call.id,
                "toolName": call.tool_name,
                "input": call.input,
            })
            .to_string(),
            MessagePart::ToolResult(result) => serde_json::json!({
                "type": "tool-result",
                "toolCallId": result.tool_call_id,
                "toolName": result.tool_name,
                "output": result.output,
            })
            .to_string(),
            MessagePart::Image { source, media_type } => serde_json::json!({
                "type": "image",
                "mediaType": media_type,
                "source": describe_source(source),
            })
            .to_string(),
            MessagePart::File {
                source,
                media_type,
                filename,
            } => serde_json::json!({
                "type": "file",
                "mediaType": media_type,
                "filename": filename,
                "source": describe_source(source),
            })
            .to_string(),
        }
    }
}

fn describe_source(source: &MediaSource) -> Value {
    match source {
        MediaSource::Bytes(bytes) => serde_json::json!({ "bytes": bytes.len() }),
        MediaSource::Url(url) => serde_json::json!({ "url": url }),
    }
}

/// A single message in a conversation. Never empty: a message built from no
/// parts carries one empty text part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    #[serde(deserialize_with = "deserialize_content")]
    pub content: NonEmpty<MessagePart>,
}

fn deserialize_content<'de, D>(deserializer: D) -> Result<NonEmpty<MessagePart>, D::Error>
where
    D: Deserializer<'de>,
{
    let parts = Vec::<MessagePart>::deserialize(deserializer)?;
    Ok(non_empty_parts(parts))
}

fn non_empty_parts(parts: Vec<MessagePart>) -> NonEmpty<MessagePart> {
    NonEmpty::from_vec(parts).unwrap_or_else(|| NonEmpty::new(MessagePart::text("")))
}

impl Message {
    pub fn new(role: Role, parts: Vec<MessagePart>) -> Self {
        Self {
            role,
            content: non_empty_parts(parts),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![MessagePart::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![MessagePart::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![MessagePart::text(text)])
    }

    pub fn parts(&self) -> impl Iterator<Item = &MessagePart> {
        self.content.iter()
    }

    /// Concatenated text parts of the message.
    pub fn text(&self) -> String {
        self.parts().filter_map(MessagePart::as_text).join("")
    }
}

/// A function the model may call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the tool input.
    pub parameters: Value,
}

/// How the model should pick tools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Tool { name: String },
}

/// One generation call.
///
/// # Example
/// ```rust
/// use unai_gateway::model::{Message, Request};
///
/// let request = Request::new("openai", "gpt-4o")
///     .with_message(Message::system("Be terse."))
///     .with_message(Message::user("hello"));
///
/// assert_eq!(request.system_prompt().as_deref(), Some("Be terse."));
/// assert_eq!(request.conversation().count(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Provider id (e.g. `"openai"`, `"claude"`).
    pub provider: String,

    /// Model identifier, possibly a user-facing alias.
    pub model: String,

    /// Top-level instructions. When absent, derived from system messages.
    pub system: Option<String>,

    /// Conversation history, in order.
    pub messages: Vec<Message>,

    pub output_control: Option<OutputControl>,

    pub tools: Vec<ToolDefinition>,

    pub tool_choice: Option<ToolChoice>,

    /// Cooperative cancellation.
    pub abort: Option<CancellationToken>,
}

impl Request {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_output_control(mut self, output_control: OutputControl) -> Self {
        self.output_control = Some(output_control);
        self
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    pub fn with_abort(mut self, token: CancellationToken) -> Self {
        self.abort = Some(token);
        self
    }

    /// The system prompt: `system` if set, otherwise the text of every
    /// system-role message in order, separated by a blank line.
    pub fn system_prompt(&self) -> Option<String> {
        if let Some(system) = &self.system {
            return Some(system.clone());
        }
        let joined = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(Message::text)
            .filter(|t| !t.is_empty())
            .join("\n\n");
        Some(joined).filter(|s| !s.is_empty())
    }

    /// Messages to send as conversation turns (system messages excluded).
    pub fn conversation(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }

    /// Effective output control, empty if none was set.
    pub fn output(&self) -> OutputControl {
        self.output_control.clone().unwrap_or_default()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// Reason for finishing the response generation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    PromptTokens,
    OutputTokens,
    ToolCalls,
    ContentFilter,
    Error,
    Other,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_input_tokens: Option<u32>,
}

impl Usage {
    /// Usage with a computed total.
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens: Some(input_tokens),
            output_tokens: Some(output_tokens),
            total_tokens: Some(input_tokens.saturating_add(output_tokens)),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Usage::default()
    }
}

fn add_opt(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0).saturating_add(b.unwrap_or(0))),
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens = add_opt(self.input_tokens, rhs.input_tokens);
        self.output_tokens = add_opt(self.output_tokens, rhs.output_tokens);
        self.total_tokens = add_opt(self.total_tokens, rhs.total_tokens);
        self.reasoning_tokens = add_opt(self.reasoning_tokens, rhs.reasoning_tokens);
        self.cached_input_tokens = add_opt(self.cached_input_tokens, rhs.cached_input_tokens);
    }
}

/// A citation returned alongside generated text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// A file produced by the model (e.g. an inline image).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedFile {
    pub media_type: String,
    pub data: Bytes,
}

/// What was sent to the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Native request body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// What the backend said about its answer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Messages generated by this call.
    pub messages: Vec<Message>,
}

/// Aggregated result of a non-streaming call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Generated content in order.
    pub content: Vec<MessagePart>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_text: Option<String>,
    pub files: Vec<GeneratedFile>,
    pub sources: Vec<Source>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub finish_reason: FinishReason,
    /// Usage of the final step.
    pub usage: Usage,
    /// Usage summed over all steps.
    pub total_usage: Usage,
    pub warnings: Vec<String>,
    pub request: RequestMetadata,
    pub response: ResponseMetadata,
}

impl Response {
    /// Assemble a single-step response, deriving the text, reasoning and tool
    /// views from `content`.
    pub fn from_content(content: Vec<MessagePart>, finish_reason: FinishReason, usage: Usage) -> Self {
        let text = content.iter().filter_map(MessagePart::as_text).join("");
        let reasoning = content
            .iter()
            .filter_map(|p| match p {
                MessagePart::Reasoning { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .join("");
        let tool_calls = content
            .iter()
            .filter_map(|p| match p {
                MessagePart::ToolCall(call) => Some(call.clone()),
                _ => None,
            })
            .collect();
        let tool_results = content
            .iter()
            .filter_map(|p| match p {
                MessagePart::ToolResult(result) => Some(result.clone()),
                _ => None,
            })
            .collect();

        let messages = if content.is_empty() {
            Vec::new()
        } else {
            vec![Message::new(Role::Assistant, content.clone())]
        };

        Response {
            content,
            text,
            reasoning_text: Some(reasoning).filter(|r| !r.is_empty()),
            files: Vec::new(),
            sources: Vec::new(),
            tool_calls,
            tool_results,
            finish_reason,
            usage,
            total_usage: usage,
            warnings: Vec::new(),
            request: RequestMetadata::default(),
            response: ResponseMetadata {
                messages,
                ..Default::default()
            },
        }
    }

    pub fn with_sources(mut self, sources: Vec<Source>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_files(mut self, files: Vec<GeneratedFile>) -> Self {
        self.files = files;
        self
    }

    pub fn with_request_body(mut self, body: Value) -> Self {
        self.request.body = Some(body);
        self
    }

    pub fn with_meta(mut self, id: Option<String>, model: Option<String>) -> Self {
        self.response.id = id;
        self.response.model = model;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_message_gets_empty_text_part() {
        let message = Message::new(Role::User, vec![]);
        assert_eq!(message.content.len(), 1);
        assert_eq!(message.content.first(), &MessagePart::text(""));
    }

    #[test]
    fn test_empty_content_deserializes_to_empty_text() {
        let message: Message =
            serde_json::from_str(r#"{"role":"assistant","content":[]}"#).unwrap();
        assert_eq!(message.text(), "");
        assert_eq!(message.content.len(), 1);
    }

    #[test]
    fn test_system_prompt_joins_system_messages() {
        let request = Request::new("openai", "gpt-4o")
            .with_message(Message::system("first"))
            .with_message(Message::user("U1"))
            .with_message(Message::system("second"));

        assert_eq!(request.system_prompt().as_deref(), Some("first\n\nsecond"));
        let roles: Vec<Role> = request.conversation().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User]);
    }

    #[test]
    fn test_explicit_system_wins() {
        let request = Request::new("openai", "gpt-4o")
            .with_system("explicit")
            .with_message(Message::system("derived"));
        assert_eq!(request.system_prompt().as_deref(), Some("explicit"));
    }

    #[test]
    fn test_usage_add_assign() {
        let mut usage = Usage::new(10, 5);
        usage += Usage::new(3, 2);
        assert_eq!(usage.total_tokens, Some(20));
        assert_eq!(usage.reasoning_tokens, None);
    }

    #[test]
    fn test_usage_saturates() {
        let mut usage = Usage::new(u32::MAX, 7);
        assert_eq!(usage.total_tokens, Some(u32::MAX));
        usage += Usage::new(1, 1);
        assert_eq!(usage.input_tokens, Some(u32::MAX));
        assert_eq!(usage.output_tokens, Some(8));
    }

    #[test]
    fn test_part_tags() {
        let part = MessagePart::ToolCall(ToolCall {
            id: Some("call_1".into()),
            tool_name: "weather".into(),
            input: serde_json::json!({"city": "Oslo"}),
        });
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "tool-call");
        assert_eq!(json["toolName"], "weather");
    }

    #[test]
    fn test_fallback_text_for_tool_result() {
        let part = MessagePart::ToolResult(ToolResult {
            tool_call_id: "call_1".into(),
            tool_name: "weather".into(),
            output: serde_json::json!({"temp": 3}),
        });
        let value: Value = serde_json::from_str(&part.fallback_text()).unwrap();
        assert_eq!(value["output"]["temp"], 3);
    }

    #[test]
    fn test_response_from_content() {
        let response = Response::from_content(
            vec![
                MessagePart::Reasoning { text: "hmm".into(), signature: None },
                MessagePart::text("Hi"),
                MessagePart::text(" there"),
            ],
            FinishReason::Stop,
            Usage::new(4, 2),
        );
        assert_eq!(response.text, "Hi there");
        assert_eq!(response.reasoning_text.as_deref(), Some("hmm"));
        assert_eq!(response.response.messages.len(), 1);
        assert_eq!(response.total_usage.total_tokens, Some(6));
    }
}
