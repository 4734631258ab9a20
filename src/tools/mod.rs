//! Tool trait and registry
//!
//! Tools are the callable capabilities offered to the model. Each one has a
//! name, a description, a JSON-schema parameter list and an async invoke.

use crate::error::ChatError;
use crate::market::MarketDataProvider;
use crate::models::{ToolInput, ToolOutput};
use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub mod market;

pub use market::{BalanceSheetTool, HistoricalPriceTool, StockNewsTool, StockPriceTool};

/// Trait for a single callable tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON schema of the `parameters` object.
    fn parameters(&self) -> Value;
    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput>;
}

/// Tool registry for looking up and executing tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Tools in name order, for advertising to the model.
    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.list()
            .into_iter()
            .filter_map(|name| self.get(name))
            .collect()
    }

    /// Look up `name` and run it with JSON `arguments`.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        let tool = self
            .get(name)
            .ok_or_else(|| ChatError::ToolNotFound(name.to_string()))?;

        let input = ToolInput {
            parameters: arguments,
        };
        tool.execute(&input).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create the default registry: the four market data tools over `provider`.
pub fn create_default_registry(provider: Arc<dyn MarketDataProvider>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(StockPriceTool::new(provider.clone())));
    registry.register(Arc::new(HistoricalPriceTool::new(provider.clone())));
    registry.register(Arc::new(BalanceSheetTool::new(provider.clone())));
    registry.register(Arc::new(StockNewsTool::new(provider)));

    registry
}
