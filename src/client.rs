//! Core backend trait and error types.

use async_trait::async_trait;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

use crate::catalog::{ModelMetaData, ProviderMetadata, TokenLimits};
use crate::model::{Request, Response};
use crate::registry::ProviderKind;
use crate::stream::StreamEvent;

/// Coarse error category, stable enough for a UI to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConfigurationMissing,
    ProviderNotFound,
    BackendConstructionFailed,
    ProviderUnavailable,
    ModelUnavailable,
    ProviderRequired,
    UnsupportedOperation,
    UpstreamError,
    Cancelled,
    Timeout,
}

/// Errors that can occur during gateway and backend operations.
///
/// Messages never carry credentials: keys travel in headers only and HTTP
/// errors are stored without their URL.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{provider} error{} for model '{model}': {message}", status_suffix(.status))]
    Upstream {
        provider: String,
        model: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Stream cancelled")]
    StreamCancelled,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No configuration for provider '{0}'")]
    ConfigurationMissing(String),

    #[error("Unknown provider '{0}'")]
    ProviderNotFound(String),

    #[error("Could not construct provider '{provider}': {reason}")]
    BackendConstructionFailed { provider: String, reason: String },

    #[error("Provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("Model '{model}' unavailable on '{provider}'")]
    ModelUnavailable { provider: String, model: String },

    #[error("A provider must be specified for {0}")]
    ProviderRequired(&'static str),

    #[error("Provider '{provider}' does not support {operation}")]
    UnsupportedOperation {
        provider: String,
        operation: &'static str,
    },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Http(e.without_url())
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Http(e) if e.is_timeout() => ErrorKind::Timeout,
            ClientError::Http(_) | ClientError::Parse(_) | ClientError::Upstream { .. } => {
                ErrorKind::UpstreamError
            }
            ClientError::StreamCancelled => ErrorKind::Cancelled,
            ClientError::Timeout(_) => ErrorKind::Timeout,
            ClientError::Config(_) | ClientError::BackendConstructionFailed { .. } => {
                ErrorKind::BackendConstructionFailed
            }
            ClientError::ConfigurationMissing(_) => ErrorKind::ConfigurationMissing,
            ClientError::ProviderNotFound(_) => ErrorKind::ProviderNotFound,
            ClientError::ProviderUnavailable { .. } => ErrorKind::ProviderUnavailable,
            ClientError::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            ClientError::ProviderRequired(_) => ErrorKind::ProviderRequired,
            ClientError::UnsupportedOperation { .. } => ErrorKind::UnsupportedOperation,
        }
    }

    /// Failure reported by a backend for `model`.
    pub fn upstream(
        provider: impl Into<String>,
        model: impl Into<String>,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        ClientError::Upstream {
            provider: provider.into(),
            model: model.into(),
            status,
            message: message.into(),
        }
    }

    pub fn unsupported(provider: ProviderKind, operation: &'static str) -> Self {
        ClientError::UnsupportedOperation {
            provider: provider.as_str().to_string(),
            operation,
        }
    }
}

/// Canonical event stream returned by [`Client::request_stream`].
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// One LLM backend.
///
/// Implement this trait to add support for a new provider. A client owns its
/// HTTP handle and configuration; every call takes the whole canonical
/// [`Request`], whose output control has already been resolved by the
/// gateway.
///
/// # Required Methods
/// - `kind` / `metadata`: identity of the backend
/// - `request`: send once, wait for the whole answer
/// - `request_stream`: stream canonical events
/// - `available_models` / `model_token_limits`: catalog queries
///
/// # Provided Methods (with default implementations)
/// - `model_client`: alias resolution (identity by default)
/// - `generate_embeddings`: fails with `UnsupportedOperation`
#[async_trait]
pub trait Client: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn metadata(&self) -> ProviderMetadata;

    /// Map a user-facing model name to the id the API expects.
    fn model_client(&self, model: &str) -> String {
        model.to_string()
    }

    /// Send a request and wait for the complete response.
    async fn request(&self, request: &Request) -> Result<Response, ClientError>;

    /// Stream the response as canonical events.
    ///
    /// Returns immediately; network I/O happens while the stream is polled.
    /// Failures arrive as the terminal [`StreamEvent::Error`].
    fn request_stream(&self, request: Request) -> EventStream;

    async fn available_models(&self) -> Result<Vec<ModelMetaData>, ClientError>;

    /// Token limits for `model`. Unknown models get a conservative default.
    fn model_token_limits(&self, model: &str) -> TokenLimits;

    async fn generate_embeddings(
        &self,
        _texts: &[String],
        _model: &str,
    ) -> Result<Vec<Vec<f32>>, ClientError> {
        Err(ClientError::unsupported(self.kind(), "embeddings"))
    }
}

/// Run `call` under the request's abort token and total timeout.
pub async fn guarded<T, F>(request: &Request, call: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    if request.is_aborted() {
        return Err(ClientError::StreamCancelled);
    }
    let abort = request.abort.clone().unwrap_or_default();
    let timeout = request.output().total_timeout();

    let limited = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(ClientError::Timeout(limit))),
            None => call.await,
        }
    };

    tokio::select! {
        biased;
        _ = abort.cancelled() => Err(ClientError::StreamCancelled),
        result = limited => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OutputControl;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ClientError::ProviderNotFound("foobar".into()).kind(),
            ErrorKind::ProviderNotFound
        );
        assert_eq!(
            ClientError::Config("missing key".into()).kind(),
            ErrorKind::BackendConstructionFailed
        );
        assert_eq!(
            ClientError::upstream("openai", "gpt-4o", Some(429), "rate limited").kind(),
            ErrorKind::UpstreamError
        );
    }

    #[test]
    fn test_upstream_message_has_context() {
        let err = ClientError::upstream("openai", "gpt-4o", Some(401), "bad key");
        assert_eq!(err.to_string(), "openai error (401) for model 'gpt-4o': bad key");
    }

    #[tokio::test]
    async fn test_guarded_abort() {
        let token = CancellationToken::new();
        let request = Request::new("openai", "gpt-4o").with_abort(token.clone());
        token.cancel();
        let result: Result<(), _> = guarded(&request, async { Ok(()) }).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_guarded_timeout() {
        let request = Request::new("openai", "gpt-4o").with_output_control(OutputControl {
            total_timeout_ms: Some(10),
            ..Default::default()
        });
        let result: Result<(), _> = guarded(&request, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
    }
}
