//! # unai-gateway - one interface over many LLM providers
//!
//! A provider-agnostic gateway for chat generation, streaming, embeddings and
//! model discovery across OpenAI, Anthropic Claude, Google Gemini, Perplexity,
//! OpenRouter and Ollama.
//!
//! ## Features
//! - Async-first, tokio compatible
//! - Closed set of provider kinds behind one object-safe [`Client`] trait
//! - Lazy, per-provider backend construction with atomic configuration refresh
//! - A canonical stream event union with exactly one terminal event per stream
//! - Typed errors a UI can branch on without string matching
//! - TTL cache for model listings
//!
//! ## Architecture
//!
//! - **[`Registry`]**: maps each [`ProviderKind`] to a constructor. Built by
//!   the application and passed to the gateway, never a global.
//! - **[`Gateway`]**: the façade. Resolves backends from the current
//!   [`GatewayConfig`], merges output control and delegates.
//! - **[`Client`]**: one backend. Translates a canonical [`Request`] into
//!   the provider's wire format.
//! - **[`stream`]**: per-backend decoders feed a shared normalizer that emits
//!   [`StreamEvent`]s.
//!
//! ## Example
//! ```no_run
//! use futures::StreamExt;
//! use std::sync::Arc;
//! use unai_gateway::{Gateway, GatewayConfig, Message, Registry, Request, StreamEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::from_json_str(r#"{
//!         "providers": {
//!             "openai": { "apiKeyEnv": "OPENAI_API_KEY" },
//!             "ollama": {}
//!         },
//!         "defaults": { "maxOutputTokens": 1024 }
//!     }"#)?;
//!     let gateway = Gateway::new(Arc::new(Registry::with_builtin_providers()), config);
//!
//!     let request = Request::new("openai", "gpt-4o").with_message(Message::user("Hello!"));
//!     let mut events = gateway.stream_chat(request);
//!     while let Some(event) = events.next().await {
//!         match event {
//!             StreamEvent::TextDelta { text } => print!("{}", text),
//!             StreamEvent::Complete { usage, .. } => println!("\n{:?}", usage),
//!             StreamEvent::Error { error, .. } => eprintln!("\n{}", error),
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod catalog;
pub mod client;
pub mod gateway;
pub mod http;
pub mod model;
pub mod options;
pub mod providers;
pub mod registry;
pub mod sse;
pub mod stream;

// Re-exports for convenience
pub use catalog::{ModelMetaData, ProviderMetadata, TokenLimits};
pub use client::{Client, ClientError, ErrorKind};
pub use gateway::{AvailableModels, Gateway, ProviderModel};
pub use model::{Message, MessagePart, Request, Response, Role};
pub use options::{GatewayConfig, OutputControl, ProviderConfig};
pub use registry::{ProviderKind, Registry};
pub use stream::StreamEvent;
