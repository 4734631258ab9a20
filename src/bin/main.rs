//! One-shot chat turn from the command line, without persistence.
//!
//! Usage: `assistant What is AAPL trading at?`

use futures::StreamExt;
use std::io::Write;
use std::sync::Arc;
use stock_chat_assistant::{
    agent::{InMemoryCheckpointer, OpenAiAgent},
    config::AppConfig,
    market::YahooMarketData,
    models::{MessageRole, Prompt, TurnRequest},
    orchestrator::ChatOrchestrator,
    store::Persistence,
    tools::create_default_registry,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Logs go to stderr so stdout carries only the answer
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let question = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if question.trim().is_empty() {
        eprintln!("usage: assistant <question>");
        std::process::exit(2);
    }

    let config = AppConfig::from_env()?;
    let registry = create_default_registry(Arc::new(YahooMarketData::new()?));
    let agent = OpenAiAgent::new(config.model, registry, Arc::new(InMemoryCheckpointer::new()))?;
    let orchestrator = ChatOrchestrator::new(Persistence::Unconfigured, Arc::new(agent));

    let thread_id = uuid::Uuid::new_v4().to_string();
    info!(thread = %thread_id, "Running one-shot turn");

    let mut fragments = orchestrator
        .start_turn(TurnRequest {
            prompt: Prompt {
                content: question,
                id: uuid::Uuid::new_v4().to_string(),
                role: MessageRole::User,
            },
            thread_id,
            response_id: uuid::Uuid::new_v4().to_string(),
        })
        .await?;

    let mut stdout = std::io::stdout();
    while let Some(fragment) = fragments.next().await {
        match fragment {
            Ok(text) => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            Err(e) => {
                writeln!(stdout)?;
                eprintln!("Turn failed: {}", e);
                return Err(e.into());
            }
        }
    }
    writeln!(stdout)?;

    Ok(())
}
