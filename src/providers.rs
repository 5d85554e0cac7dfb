//! Backend implementations.
//!
//! OpenAI, OpenRouter and Perplexity share the Chat Completions client in
//! [`openai`]; the others speak their own protocol.

pub mod claude;
pub mod gemini;
pub mod ollama;
pub mod openai;

pub use claude::ClaudeClient;
pub use gemini::GeminiClient;
pub use ollama::OllamaClient;
pub use openai::{Flavor, OpenAiClient};
