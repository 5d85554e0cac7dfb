//! HTTP client utilities for making requests to LLM APIs.
//!
//! This module provides reusable HTTP client construction, request logging
//! and error-status mapping shared across providers.

use reqwest::{Client as HttpClient, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::client::ClientError;
use crate::options::ProviderConfig;

/// Build a configured HTTP client from provider settings.
///
/// This applies common configuration like timeouts and proxies. An invalid
/// proxy URL is a configuration error rather than silently ignored.
///
/// # Example
/// ```ignore
/// let client = build_http_client(&config, Some(Duration::from_secs(60)))?;
/// ```
pub fn build_http_client(
    config: &ProviderConfig,
    timeout: Option<Duration>,
) -> Result<HttpClient, ClientError> {
    let mut builder = HttpClient::builder();

    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    if let Some(proxy_url) = config.proxy.as_deref().filter(|p| !p.trim().is_empty()) {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|_| ClientError::Config(format!("invalid proxy URL '{}'", proxy_url)))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| ClientError::Config(format!("HTTP client: {}", e.without_url())))
}

/// Add extra headers to a request if specified in provider settings.
///
/// # Example
/// ```ignore
/// let mut req = client.post(url);
/// req = add_extra_headers(req, &config.extra_headers);
/// ```
pub fn add_extra_headers(
    mut request: RequestBuilder,
    extra_headers: &Option<HashMap<String, String>>,
) -> RequestBuilder {
    if let Some(headers) = extra_headers {
        for (key, value) in headers {
            request = request.header(key, value);
        }
    }
    request
}

/// Attach a JSON body and trace-log it.
pub trait RequestBuilderExt {
    fn json_logged<T: Serialize + ?Sized>(self, body: &T) -> RequestBuilder;
}

impl RequestBuilderExt for RequestBuilder {
    fn json_logged<T: Serialize + ?Sized>(self, body: &T) -> RequestBuilder {
        if tracing::enabled!(tracing::Level::TRACE) {
            match serde_json::to_string(body) {
                Ok(json) => tracing::trace!(body = %json, "request body"),
                Err(e) => tracing::trace!(error = %e, "request body not serializable"),
            }
        }
        self.json(body)
    }
}

/// Read a response body with trace logging.
#[async_trait::async_trait]
pub trait ResponseExt {
    async fn text_logged(self) -> Result<String, ClientError>;

    async fn json_logged<T: DeserializeOwned>(self) -> Result<T, ClientError>;
}

#[async_trait::async_trait]
impl ResponseExt for Response {
    async fn text_logged(self) -> Result<String, ClientError> {
        let status = self.status();
        let text = self.text().await?;
        tracing::trace!(status = status.as_u16(), body = %text, "response body");
        Ok(text)
    }

    async fn json_logged<T: DeserializeOwned>(self) -> Result<T, ClientError> {
        let text = self.text_logged().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Pass a successful response through; turn any other status into an
/// [`ClientError::Upstream`] carrying the provider's own error message.
pub async fn check_status(
    response: Response,
    provider: &str,
    model: &str,
) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text_logged().await.unwrap_or_default();
    tracing::debug!(provider, model, status = status.as_u16(), "upstream request failed");
    Err(ClientError::upstream(
        provider,
        model,
        Some(status.as_u16()),
        error_message(&body).unwrap_or_else(|| fallback_message(status, &body)),
    ))
}

/// Pull a human-readable message out of the common provider error shapes:
/// `{"error": {"message": ..}}`, `{"error": ".."}` and `{"message": ..}`.
pub fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let error = value.get("error");
    error
        .and_then(|e| e.get("message"))
        .or_else(|| error.filter(|e| e.is_string()))
        .or_else(|| value.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn fallback_message(status: reqwest::StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        body.chars().take(500).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_build_http_client() {
        let config = ProviderConfig::new("test");
        assert!(build_http_client(&config, Some(Duration::from_secs(30))).is_ok());
    }

    #[test]
    fn test_build_http_client_with_proxy() {
        let config = ProviderConfig::new("test").with_proxy("http://proxy.example.com:8080".to_string());
        assert!(build_http_client(&config, None).is_ok());
    }

    #[test]
    fn test_error_message_shapes() {
        assert_eq!(
            error_message(r#"{"error":{"message":"bad key","type":"auth"}}"#).as_deref(),
            Some("bad key")
        );
        assert_eq!(error_message(r#"{"error":"model not found"}"#).as_deref(), Some("model not found"));
        assert_eq!(error_message(r#"{"message":"quota"}"#).as_deref(), Some("quota"));
        assert_eq!(error_message("<html>"), None);
    }

    #[tokio::test]
    async fn test_check_status_maps_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fail"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_string(r#"{"error":{"message":"Incorrect API key"}}"#),
            )
            .mount(&server)
            .await;

        let response = reqwest::get(format!("{}/fail", server.uri())).await.unwrap();
        let err = check_status(response, "openai", "gpt-4o").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "openai error (401) for model 'gpt-4o': Incorrect API key"
        );
    }
}
