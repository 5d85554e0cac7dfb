//! Provider kinds and the constructor table that builds backend clients.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{MetadataCache, ModelCache};
use crate::catalog::{ModelMetaData, ProviderMetadata};
use crate::client::{Client, ClientError, ErrorKind};
use crate::options::ProviderConfig;
use crate::providers::claude::ClaudeClient;
use crate::providers::gemini::GeminiClient;
use crate::providers::ollama::OllamaClient;
use crate::providers::openai::{Flavor, OpenAiClient};

/// Every backend this crate knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Claude,
    Gemini,
    Perplexity,
    OpenRouter,
    Ollama,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 6] = [
        ProviderKind::OpenAi,
        ProviderKind::Claude,
        ProviderKind::Gemini,
        ProviderKind::Perplexity,
        ProviderKind::OpenRouter,
        ProviderKind::Ollama,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Claude => "claude",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Perplexity => "perplexity",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Ollama => "ollama",
        }
    }

    /// Whether a backend of this kind can be built without an API key.
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, ProviderKind::Ollama)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "claude" | "anthropic" => Ok(ProviderKind::Claude),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "perplexity" => Ok(ProviderKind::Perplexity),
            "openrouter" => Ok(ProviderKind::OpenRouter),
            "ollama" => Ok(ProviderKind::Ollama),
            _ => Err(ClientError::ProviderNotFound(s.to_string())),
        }
    }
}

/// Shared resources handed to every constructor.
#[derive(Clone)]
pub struct BuildContext {
    /// HTTP timeout for the backend's client.
    pub timeout: Option<Duration>,
    pub cache: ModelCache,
}

/// Builds one backend client from its settings.
pub type Constructor =
    Arc<dyn Fn(&ProviderConfig, &BuildContext) -> Result<Arc<dyn Client>, ClientError> + Send + Sync>;

/// A non-fatal per-provider failure collected by a tolerant operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderWarning {
    pub provider: String,
    #[serde(skip)]
    pub kind: ErrorKind,
    pub message: String,
}

impl ProviderWarning {
    pub fn new(provider: impl Into<String>, error: &ClientError) -> Self {
        Self {
            provider: provider.into(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Static metadata of every registered backend plus whatever failed.
#[derive(Debug, Clone, Default)]
pub struct ProviderMetadataReport {
    pub providers: Vec<ProviderMetadata>,
    pub warnings: Vec<ProviderWarning>,
}

/// Maps provider kinds to constructors.
///
/// The registry is an ordinary value: the application builds one (usually
/// with [`Registry::with_builtin_providers`]) and hands it to the
/// [`Gateway`](crate::gateway::Gateway). Tests register their own
/// constructors the same way.
///
/// # Example
/// ```rust
/// use unai_gateway::options::ProviderConfig;
/// use unai_gateway::registry::Registry;
///
/// let registry = Registry::with_builtin_providers();
/// assert!(registry.create("openai", &ProviderConfig::new("sk-test"), None).is_some());
/// // Missing key: no backend, and no error either.
/// assert!(registry.create("openai", &ProviderConfig::default(), None).is_none());
/// ```
pub struct Registry {
    constructors: RwLock<HashMap<ProviderKind, Constructor>>,
    cache: ModelCache,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            constructors: RwLock::new(HashMap::new()),
            cache: Arc::new(MetadataCache::new()),
        }
    }

    /// A registry with a constructor for every [`ProviderKind`].
    pub fn with_builtin_providers() -> Self {
        let registry = Self::new();
        for kind in ProviderKind::ALL {
            registry.register(kind, builtin(kind));
        }
        registry
    }

    /// Add or replace the constructor for `kind`.
    pub fn register(&self, kind: ProviderKind, constructor: Constructor) {
        self.constructors.write().insert(kind, constructor);
    }

    pub fn is_registered(&self, kind: ProviderKind) -> bool {
        self.constructors.read().contains_key(&kind)
    }

    pub fn registered(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.constructors.read().keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    fn constructor(&self, kind: ProviderKind) -> Option<Constructor> {
        self.constructors.read().get(&kind).cloned()
    }

    /// Build a backend, reporting why it could not be built.
    pub fn try_create(
        &self,
        kind: ProviderKind,
        config: &ProviderConfig,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn Client>, ClientError> {
        let constructor = self
            .constructor(kind)
            .ok_or_else(|| ClientError::ProviderNotFound(kind.as_str().to_string()))?;
        let context = BuildContext {
            timeout,
            cache: self.cache.clone(),
        };
        constructor(config, &context).map_err(|e| match e {
            ClientError::Config(reason) => ClientError::BackendConstructionFailed {
                provider: kind.as_str().to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Build a backend for `id`, or `None` if the id is unknown or the
    /// settings are unusable.
    pub fn create(
        &self,
        id: &str,
        config: &ProviderConfig,
        timeout: Option<Duration>,
    ) -> Option<Arc<dyn Client>> {
        let kind = id.parse::<ProviderKind>().ok()?;
        match self.try_create(kind, config, timeout) {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::debug!(provider = id, error = %e, "backend not created");
                None
            }
        }
    }

    /// Build every backend that can be built; the rest are left out.
    pub fn create_all(
        &self,
        configs: &HashMap<String, ProviderConfig>,
        timeout: Option<Duration>,
    ) -> HashMap<String, Arc<dyn Client>> {
        configs
            .iter()
            .filter_map(|(id, config)| {
                self.create(id, config, timeout)
                    .map(|client| (id.clone(), client))
            })
            .collect()
    }

    /// Static metadata for every registered backend, read from throwaway
    /// clients built with placeholder credentials.
    pub fn all_provider_metadata(&self) -> ProviderMetadataReport {
        let mut report = ProviderMetadataReport::default();
        for kind in self.registered() {
            match self.try_create(kind, &placeholder_config(), None) {
                Ok(client) => report.providers.push(client.metadata()),
                Err(e) => {
                    tracing::warn!(provider = %kind, error = %e, "failed to read provider metadata");
                    report.warnings.push(ProviderWarning::new(kind.as_str(), &e));
                }
            }
        }
        report
    }

    /// List the models of `id`, live where the backend supports it.
    ///
    /// Uses placeholder credentials when `config` is `None`. Failures are
    /// returned to the caller.
    pub async fn provider_support_models(
        &self,
        id: &str,
        config: Option<&ProviderConfig>,
    ) -> Result<Vec<ModelMetaData>, ClientError> {
        let kind: ProviderKind = id.parse()?;
        let placeholder = placeholder_config();
        let client = self.try_create(kind, config.unwrap_or(&placeholder), None)?;
        client.available_models().await
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn placeholder_config() -> ProviderConfig {
    ProviderConfig::new("placeholder")
}

fn builtin(kind: ProviderKind) -> Constructor {
    match kind {
        ProviderKind::OpenAi => openai_flavor(Flavor::OpenAi),
        ProviderKind::Perplexity => openai_flavor(Flavor::Perplexity),
        ProviderKind::OpenRouter => openai_flavor(Flavor::OpenRouter),
        ProviderKind::Claude => {
            Arc::new(|config, context| Ok(Arc::new(ClaudeClient::new(config, context)?)))
        }
        ProviderKind::Gemini => {
            Arc::new(|config, context| Ok(Arc::new(GeminiClient::new(config, context)?)))
        }
        ProviderKind::Ollama => {
            Arc::new(|config, context| Ok(Arc::new(OllamaClient::new(config, context)?)))
        }
    }
}

fn openai_flavor(flavor: Flavor) -> Constructor {
    Arc::new(move |config, context| Ok(Arc::new(OpenAiClient::new(flavor, config, context)?)))
}
