use std::sync::Arc;
use stock_chat_assistant::{
    agent::{InMemoryCheckpointer, OpenAiAgent},
    api::start_server,
    config::AppConfig,
    market::YahooMarketData,
    orchestrator::ChatOrchestrator,
    store::Persistence,
    tools::create_default_registry,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;

    info!("🚀 Stock Chat Assistant - API Server");
    info!("📍 Port: {}", config.port);
    info!("🤖 Model: {} @ {}", config.model.model, config.model.base_url);
    if config.model.api_key.is_none() {
        warn!("⚠️  OPENAI_API_KEY not set, chat turns will fail until it is configured");
    }

    // Create components
    let persistence = Persistence::from_config(config.database.as_ref())?;
    let market = Arc::new(YahooMarketData::new()?);
    let registry = create_default_registry(market);
    let agent = OpenAiAgent::new(
        config.model.clone(),
        registry,
        Arc::new(InMemoryCheckpointer::new()),
    )?;

    let orchestrator = Arc::new(ChatOrchestrator::new(persistence, Arc::new(agent)));

    info!("✅ Chat orchestrator initialized");
    info!("📡 Starting API server...");

    start_server(orchestrator, config.port).await?;

    Ok(())
}
