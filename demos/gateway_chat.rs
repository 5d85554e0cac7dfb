//! Block chat and model discovery through the gateway.
//!
//! Run with:
//! ```bash
//! export OPENAI_API_KEY="your-api-key"
//! cargo run --example gateway_chat
//! ```

use std::sync::Arc;
use unai_gateway::model::{Message, Request};
use unai_gateway::options::{GatewayConfig, OutputControl};
use unai_gateway::{Gateway, Registry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::from_json_str(
        r#"{
            "providers": {
                "openai": { "apiKeyEnv": "OPENAI_API_KEY" },
                "ollama": {}
            },
            "defaults": { "temperature": 0.7, "maxOutputTokens": 256 },
            "timeoutMs": 60000
        }"#,
    )?;
    let gateway = Gateway::new(Arc::new(Registry::with_builtin_providers()), config);

    let request = Request::new("openai", "gpt-4o-mini")
        .with_message(Message::system("Answer in one word."))
        .with_message(Message::user("What is the capital of France?"))
        .with_output_control(OutputControl {
            temperature: Some(0.0),
            ..Default::default()
        });

    println!("Sending request to OpenAI...");
    match gateway.block_chat(request).await {
        Ok(response) => {
            println!("\n=== Response ===");
            println!("{}", response.text);
            println!("Finish reason: {:?}", response.finish_reason);
            println!("Usage: {:?}", response.usage);
        }
        Err(e) => {
            eprintln!("Error ({:?}): {}", e.kind(), e);
            return Err(e.into());
        }
    }

    println!("\n=== Models ===");
    let available = gateway.all_available_models().await;
    for entry in &available.models {
        println!(
            "{:<12} {:<40} ctx={}",
            entry.provider.as_str(),
            entry.model.id,
            entry.model.token_limits.max_total_tokens
        );
    }
    for warning in &available.warnings {
        eprintln!("skipped {}: {}", warning.provider, warning.message);
    }

    Ok(())
}
