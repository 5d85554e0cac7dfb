//! The multi-provider façade.
//!
//! A [`Gateway`] owns the live backend clients, resolves them lazily from the
//! current configuration and applies output-control defaults before handing a
//! request to a backend.

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::catalog::{ModelMetaData, ProviderMetadata, TokenLimits};
use crate::client::{Client, ClientError, EventStream};
use crate::model::{Request, Response};
use crate::options::{GatewayConfig, OutputControl, ProviderConfig};
use crate::registry::{ProviderKind, ProviderWarning, Registry};
use crate::stream::failed;

/// A model tagged with the provider that serves it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderModel {
    pub provider: ProviderKind,
    #[serde(flatten)]
    pub model: ModelMetaData,
}

/// Result of [`Gateway::all_available_models`]: whatever could be listed,
/// plus one warning per provider that could not.
#[derive(Debug, Clone, Default)]
pub struct AvailableModels {
    pub models: Vec<ProviderModel>,
    pub warnings: Vec<ProviderWarning>,
}

/// One generation of configuration and the clients built from it.
///
/// `refresh` swaps in a new state as a whole; calls that already hold the old
/// one keep using it until they finish.
struct GatewayState {
    configs: HashMap<ProviderKind, ProviderConfig>,
    defaults: OutputControl,
    timeout: Option<Duration>,
    clients: RwLock<HashMap<ProviderKind, Arc<dyn Client>>>,
}

impl GatewayState {
    fn new(registry: &Registry, config: GatewayConfig) -> Self {
        let timeout = config.timeout();
        let mut configs = HashMap::new();
        for (id, provider_config) in config.providers {
            match id.parse::<ProviderKind>() {
                Ok(kind) if registry.is_registered(kind) => {
                    configs.insert(kind, provider_config);
                }
                _ => warn!(provider = %id, "ignoring configuration for unknown provider"),
            }
        }
        Self {
            configs,
            defaults: config.defaults,
            timeout,
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn configured(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.configs.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// Routes canonical requests to backend clients.
///
/// Backends are built on first use and kept until the next [`refresh`](Gateway::refresh).
/// Every method takes `&self`; share a gateway between tasks with `Arc`.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use unai_gateway::gateway::Gateway;
/// use unai_gateway::model::{Message, Request};
/// use unai_gateway::options::GatewayConfig;
/// use unai_gateway::registry::Registry;
///
/// # async fn run() -> Result<(), unai_gateway::client::ClientError> {
/// let config = GatewayConfig::from_json_str(r#"{
///     "providers": { "openai": { "apiKeyEnv": "OPENAI_API_KEY" } },
///     "defaults": { "temperature": 0.7 }
/// }"#)?;
/// let gateway = Gateway::new(Arc::new(Registry::with_builtin_providers()), config);
///
/// let request = Request::new("openai", "gpt-4o").with_message(Message::user("hello"));
/// let response = gateway.block_chat(request).await?;
/// println!("{}", response.text);
/// # Ok(())
/// # }
/// ```
pub struct Gateway {
    registry: Arc<Registry>,
    state: RwLock<Arc<GatewayState>>,
}

impl Gateway {
    pub fn new(registry: Arc<Registry>, config: GatewayConfig) -> Self {
        let state = GatewayState::new(&registry, config);
        Self {
            registry,
            state: RwLock::new(Arc::new(state)),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn snapshot(&self) -> Arc<GatewayState> {
        self.state.read().clone()
    }

    /// Find or build the backend for `id` within `state`.
    fn resolve_in(&self, state: &GatewayState, id: &str) -> Result<(ProviderKind, Arc<dyn Client>), ClientError> {
        let kind: ProviderKind = id.parse()?;
        if !self.registry.is_registered(kind) {
            return Err(ClientError::ProviderNotFound(id.to_string()));
        }
        if let Some(client) = state.clients.read().get(&kind) {
            return Ok((kind, client.clone()));
        }

        let config = state
            .configs
            .get(&kind)
            .ok_or_else(|| ClientError::ConfigurationMissing(kind.as_str().to_string()))?;

        let mut clients = state.clients.write();
        // Another caller may have built it while we waited for the lock.
        if let Some(client) = clients.get(&kind) {
            return Ok((kind, client.clone()));
        }
        let client = self.registry.try_create(kind, config, state.timeout)?;
        debug!(provider = %kind, "backend constructed");
        clients.insert(kind, client.clone());
        Ok((kind, client))
    }

    /// The backend for `id`, constructing it on first use.
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Client>, ClientError> {
        let state = self.snapshot();
        self.resolve_in(&state, id).map(|(_, client)| client)
    }

    /// Resolve the request's backend and fill its output control from the
    /// per-model overrides and the gateway defaults.
    fn prepare(&self, mut request: Request) -> Result<(Arc<dyn Client>, Request), ClientError> {
        let state = self.snapshot();
        let (kind, client) = self.resolve_in(&state, &request.provider)?;

        let fallback = match state.configs.get(&kind).and_then(|c| c.model_overrides(&request.model)) {
            Some(overrides) => overrides.merged_over(&state.defaults),
            None => state.defaults.clone(),
        };
        request.output_control = Some(request.output().merged_over(&fallback));
        Ok((client, request))
    }

    /// Send `request` and wait for the whole response.
    pub async fn block_chat(&self, request: Request) -> Result<Response, ClientError> {
        let (client, request) = self.prepare(request)?;
        client.request(&request).await
    }

    /// Stream `request` as canonical events.
    ///
    /// Never fails directly: resolution errors become the single terminal
    /// `Error` event of the returned stream.
    pub fn stream_chat(&self, request: Request) -> EventStream {
        let started = Instant::now();
        match self.prepare(request) {
            Ok((client, request)) => client.request_stream(request),
            Err(e) => {
                warn!("stream could not start: {}", e);
                Box::pin(futures::stream::once(async move { failed(e, started) }))
            }
        }
    }

    /// Embed `texts` with `model`. There is no default provider for
    /// embeddings, so `provider` must be given.
    pub async fn generate_embeddings(
        &self,
        texts: &[String],
        model: &str,
        provider: Option<&str>,
    ) -> Result<Vec<Vec<f32>>, ClientError> {
        let provider = provider.ok_or(ClientError::ProviderRequired("embeddings"))?;
        let client = self.resolve(provider)?;
        client.generate_embeddings(texts, model).await
    }

    /// Models of a single provider; failures are returned as-is.
    pub async fn available_models(&self, id: &str) -> Result<Vec<ModelMetaData>, ClientError> {
        let client = self.resolve(id)?;
        client.available_models().await
    }

    /// Models of every configured provider.
    ///
    /// A provider that cannot be built or listed is left out and reported in
    /// `warnings`; the call itself never fails.
    pub async fn all_available_models(&self) -> AvailableModels {
        let state = self.snapshot();
        let mut result = AvailableModels::default();

        let mut clients = Vec::new();
        for kind in state.configured() {
            match self.resolve_in(&state, kind.as_str()) {
                Ok((kind, client)) => clients.push((kind, client)),
                Err(e) => {
                    warn!(provider = %kind, error = %e, "failed to get models from provider");
                    result.warnings.push(ProviderWarning::new(kind.as_str(), &e));
                }
            }
        }

        let listings = join_all(clients.iter().map(|(_, client)| client.available_models())).await;
        for ((kind, _), listing) in clients.iter().zip(listings) {
            match listing {
                Ok(models) => result.models.extend(models.into_iter().map(|model| ProviderModel {
                    provider: *kind,
                    model,
                })),
                Err(e) => {
                    warn!(provider = %kind, error = %e, "failed to get models from provider");
                    result.warnings.push(ProviderWarning::new(kind.as_str(), &e));
                }
            }
        }
        result
    }

    pub fn provider_metadata(&self, id: &str) -> Result<ProviderMetadata, ClientError> {
        Ok(self.resolve(id)?.metadata())
    }

    pub fn model_token_limits(&self, id: &str, model: &str) -> Result<TokenLimits, ClientError> {
        Ok(self.resolve(id)?.model_token_limits(model))
    }

    /// Replace the configuration and drop every built backend.
    ///
    /// Calls started before this returns finish against the backends they
    /// already resolved; calls started after see only `config`.
    pub fn refresh(&self, config: GatewayConfig) {
        let state = Arc::new(GatewayState::new(&self.registry, config));
        info!(providers = state.configs.len(), "gateway configuration refreshed");
        *self.state.write() = state;
    }

    /// [`refresh`](Gateway::refresh) with a provider map and defaults,
    /// keeping the current HTTP timeout.
    pub fn refresh_providers(&self, providers: HashMap<String, ProviderConfig>, defaults: OutputControl) {
        let timeout_ms = self.snapshot().timeout.map(|t| t.as_millis() as u64);
        self.refresh(GatewayConfig {
            providers,
            defaults,
            timeout_ms,
        });
    }
}
