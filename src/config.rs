//! Process configuration loaded from the environment (and `.env`).

use std::env;

use crate::error::ChatError;
use crate::Result;

pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_MODEL_BASE_URL: &str = "https://api.thesys.dev/v1/embed";
pub const DEFAULT_MODEL: &str = "c1/openai/gpt-5/v-20250930";
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;

/// Where conversation history is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseConfig {
    /// Hosted Supabase project, reached through its PostgREST interface.
    Supabase { url: String, anon_key: String },
    /// Direct Postgres connection.
    Postgres { url: String },
}

impl DatabaseConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            DatabaseConfig::Supabase { .. } => "supabase",
            DatabaseConfig::Postgres { .. } => "postgres",
        }
    }
}

/// OpenAI-compatible model endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tool_rounds: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_MODEL_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub port: u16,
    /// `None` runs the assistant in stream-only mode.
    pub database: Option<DatabaseConfig>,
    pub model: ModelConfig,
}

impl AppConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let port = match get("PORT").or_else(|| get("API_PORT")) {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| ChatError::Config(format!("PORT must be a port number, got '{}'", raw)))?,
            None => DEFAULT_PORT,
        };

        let database = match (get("SUPABASE_URL"), get("SUPABASE_ANON_KEY")) {
            (Some(url), Some(anon_key)) => Some(DatabaseConfig::Supabase {
                url: url.trim_end_matches('/').to_string(),
                anon_key,
            }),
            _ => get("DATABASE_URL")
                .or_else(|| get("POSTGRES_URL"))
                .map(|url| DatabaseConfig::Postgres { url }),
        };

        let max_tool_rounds = match get("MAX_TOOL_ROUNDS") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(rounds) if rounds > 0 => rounds,
                _ => {
                    return Err(ChatError::Config(format!(
                        "MAX_TOOL_ROUNDS must be a positive number, got '{}'",
                        raw
                    )))
                }
            },
            None => DEFAULT_MAX_TOOL_ROUNDS,
        };

        let model = ModelConfig {
            base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_MODEL_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_key: get("OPENAI_API_KEY").or_else(|| get("THESYS_API_KEY")),
            max_tool_rounds,
        };

        Ok(Self {
            port,
            database,
            model,
        })
    }
}
