//! Streaming through the gateway, with a total timeout.
//!
//! Run with:
//! ```bash
//! export GEMINI_API_KEY="your-api-key"
//! cargo run --example gateway_streaming
//! ```

use futures::StreamExt;
use std::io::Write;
use std::sync::Arc;
use unai_gateway::model::{Message, Request};
use unai_gateway::options::{GatewayConfig, OutputControl, ProviderConfig, ReasoningEffort};
use unai_gateway::{Gateway, Registry, StreamEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let api_key = std::env::var("GEMINI_API_KEY")?;
    let mut config = GatewayConfig::default();
    config.providers.insert("gemini".to_string(), ProviderConfig::new(api_key));

    let gateway = Gateway::new(Arc::new(Registry::with_builtin_providers()), config);

    let request = Request::new("gemini", "gemini-2.5-flash")
        .with_message(Message::user("Write a haiku about Rust programming."))
        .with_output_control(OutputControl {
            reasoning_effort: Some(ReasoningEffort::Low),
            total_timeout_ms: Some(60_000),
            ..Default::default()
        });

    println!("Streaming response from Gemini...\n");
    let mut events = gateway.stream_chat(request);
    while let Some(event) = events.next().await {
        match event {
            StreamEvent::ReasoningDelta { text } => print!("\x1b[2m{}\x1b[0m", text),
            StreamEvent::TextDelta { text } => print!("{}", text),
            StreamEvent::Source(source) => println!("\n[source] {}", source.url),
            StreamEvent::Complete {
                usage,
                finish_reason,
                duration_ms,
            } => {
                println!("\n\n=== Stream Complete ===");
                println!("Finish reason: {:?}", finish_reason);
                println!("Usage: {:?}", usage);
                println!("Took {} ms", duration_ms);
            }
            StreamEvent::Error { error, .. } => {
                eprintln!("\nError in stream: {}", error);
                return Err(error.into());
            }
            _ => {}
        }
        std::io::stdout().flush()?;
    }

    Ok(())
}
