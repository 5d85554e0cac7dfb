//! Configuration types: credentials, per-provider settings and generation
//! parameters ("output control").

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::client::ClientError;

/// A secret string type for sensitive data like API keys.
/// Prevents accidental logging or display of secrets.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    /// Create a new secret string.
    pub fn new(s: String) -> Self {
        Self(s)
    }

    /// Get the underlying secret value.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    /// Whether the secret is blank after trimming whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString([REDACTED])")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s.to_string())
    }
}

/// How much effort a reasoning model should spend thinking.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }

    /// Thinking budget in tokens for backends that take an explicit budget.
    pub fn budget_tokens(&self) -> u32 {
        match self {
            ReasoningEffort::Minimal => 1024,
            ReasoningEffort::Low => 2048,
            ReasoningEffort::Medium => 8192,
            ReasoningEffort::High => 24576,
        }
    }
}

/// Output verbosity hint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Low,
    Medium,
    High,
}

impl Verbosity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Low => "low",
            Verbosity::Medium => "medium",
            Verbosity::High => "high",
        }
    }
}

/// Generation parameters.
///
/// Every field is optional. Resolution is field-by-field: a set field on the
/// request wins, an unset one falls through to per-model overrides, then to
/// gateway defaults, then to whatever the backend uses when the parameter is
/// omitted.
///
/// # Example
/// ```rust
/// use unai_gateway::options::OutputControl;
///
/// let defaults = OutputControl {
///     temperature: Some(0.7),
///     max_output_tokens: Some(1024),
///     ..Default::default()
/// };
/// let request = OutputControl {
///     temperature: Some(0.2),
///     ..Default::default()
/// };
///
/// let merged = request.merged_over(&defaults);
/// assert_eq!(merged.temperature, Some(0.2));
/// assert_eq!(merged.max_output_tokens, Some(1024));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputControl {
    /// Temperature for sampling (0.0 - 2.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Top-p (nucleus) sampling parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<Verbosity>,

    /// Upper bound for a whole call, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_timeout_ms: Option<u64>,

    /// Upper bound for the gap between two stream items, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_ms: Option<u64>,
}

impl OutputControl {
    /// Fill every unset field of `self` from `fallback`.
    pub fn merged_over(&self, fallback: &OutputControl) -> OutputControl {
        OutputControl {
            temperature: self.temperature.or(fallback.temperature),
            top_p: self.top_p.or(fallback.top_p),
            top_k: self.top_k.or(fallback.top_k),
            frequency_penalty: self.frequency_penalty.or(fallback.frequency_penalty),
            presence_penalty: self.presence_penalty.or(fallback.presence_penalty),
            max_output_tokens: self.max_output_tokens.or(fallback.max_output_tokens),
            reasoning_effort: self.reasoning_effort.or(fallback.reasoning_effort),
            verbosity: self.verbosity.or(fallback.verbosity),
            total_timeout_ms: self.total_timeout_ms.or(fallback.total_timeout_ms),
            step_timeout_ms: self.step_timeout_ms.or(fallback.step_timeout_ms),
        }
    }

    pub fn total_timeout(&self) -> Option<Duration> {
        self.total_timeout_ms.map(Duration::from_millis)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }
}

/// Per-provider credentials and settings, supplied by the host.
///
/// The gateway never mutates a `ProviderConfig`; a changed config reaches it
/// through [`Gateway::refresh`](crate::gateway::Gateway::refresh).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: Option<SecretString>,

    /// Environment variable consulted when `api_key` is absent.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Base URL for API endpoints
    #[serde(default)]
    pub base_url: Option<String>,

    /// HTTP proxy URL
    #[serde(default)]
    pub proxy: Option<String>,

    /// Additional HTTP headers to include in requests
    #[serde(default)]
    pub extra_headers: Option<HashMap<String, String>>,

    /// Backend-specific knobs that have no typed field.
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,

    /// Per-model output-control overrides, keyed by model id.
    #[serde(default)]
    pub models: HashMap<String, OutputControl>,
}

impl ProviderConfig {
    /// Create new provider settings with an API key.
    pub fn new(api_key: impl Into<SecretString>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Default::default()
        }
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set the proxy URL.
    pub fn with_proxy(mut self, proxy: String) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Add a single extra header.
    pub fn with_header(mut self, key: String, value: String) -> Self {
        self.extra_headers
            .get_or_insert_with(HashMap::new)
            .insert(key, value);
        self
    }

    /// Set an entry in the `extra` bag.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// The usable API key: the configured one, else the one named by
    /// `api_key_env`. Blank keys count as absent.
    pub fn resolved_api_key(&self) -> Option<SecretString> {
        self.api_key
            .clone()
            .or_else(|| {
                self.api_key_env
                    .as_deref()
                    .and_then(|name| std::env::var(name).ok())
                    .map(SecretString::new)
            })
            .filter(|key| !key.is_blank())
    }

    /// Base URL with any trailing slash removed, or `default`.
    pub fn base_url_or(&self, default: &str) -> String {
        self.base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }

    /// Per-model overrides for `model`, if any.
    pub fn model_overrides(&self, model: &str) -> Option<&OutputControl> {
        self.models.get(model)
    }
}

/// Everything the host hands the gateway: provider settings keyed by provider
/// id, default output control and an optional request timeout.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub defaults: OutputControl,

    /// HTTP timeout applied to every backend client.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl GatewayConfig {
    /// Parse a JSON settings document.
    pub fn from_json_str(json: &str) -> Result<Self, ClientError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}
