use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How tools within one iteration are executed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionStrategy {
    #[default]
    Sequential,
    Parallel,
}

impl FromStr for ToolExecutionStrategy {
    type Err = crate::errors::AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(ToolExecutionStrategy::Sequential),
            "parallel" => Ok(ToolExecutionStrategy::Parallel),
            other => Err(crate::errors::AgentError::InvalidConfiguration(format!(
                "unknown tool execution strategy: {other}"
            ))),
        }
    }
}

/// Process-wide configuration, initialized once at startup and read-only
/// thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub context_token_threshold: usize,
    pub context_summary_target_tokens: usize,
    pub context_reserve_tokens: usize,
    pub max_iterations: u32,
    pub native_max_auto_continues: u32,
    pub max_xml_tool_calls: usize,
    pub redis_key_ttl: Duration,
    pub redis_response_list_ttl: Duration,
    pub default_model: String,
    pub tool_execution_strategy: ToolExecutionStrategy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            context_token_threshold: 120_000,
            context_summary_target_tokens: 10_000,
            context_reserve_tokens: 5_000,
            max_iterations: 25,
            native_max_auto_continues: 3,
            max_xml_tool_calls: 25,
            redis_key_ttl: Duration::from_secs(60 * 60),
            redis_response_list_ttl: Duration::from_secs(24 * 60 * 60),
            default_model: "gpt-4o".to_string(),
            tool_execution_strategy: ToolExecutionStrategy::Sequential,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            context_token_threshold: env_parse(
                "CONTEXT_TOKEN_THRESHOLD",
                defaults.context_token_threshold,
            ),
            context_summary_target_tokens: env_parse(
                "CONTEXT_SUMMARY_TARGET_TOKENS",
                defaults.context_summary_target_tokens,
            ),
            context_reserve_tokens: env_parse(
                "CONTEXT_RESERVE_TOKENS",
                defaults.context_reserve_tokens,
            ),
            max_iterations: env_parse("MAX_ITERATIONS", defaults.max_iterations),
            native_max_auto_continues: env_parse(
                "NATIVE_MAX_AUTO_CONTINUES",
                defaults.native_max_auto_continues,
            ),
            max_xml_tool_calls: env_parse("MAX_XML_TOOL_CALLS", defaults.max_xml_tool_calls),
            redis_key_ttl: Duration::from_secs(env_parse(
                "REDIS_KEY_TTL",
                defaults.redis_key_ttl.as_secs(),
            )),
            redis_response_list_ttl: Duration::from_secs(env_parse(
                "REDIS_RESPONSE_LIST_TTL",
                defaults.redis_response_list_ttl.as_secs(),
            )),
            default_model: std::env::var("LLM_DEFAULT_MODEL")
                .unwrap_or_else(|_| defaults.default_model.clone()),
            tool_execution_strategy: std::env::var("TOOL_EXECUTION_STRATEGY")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.tool_execution_strategy),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("invalid value for {key}, using default");
            default
        }),
        Err(_) => default,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendKind {
    #[default]
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RedisSettings {
    pub url: String,
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Backend selection for the message store and pub/sub layer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackendKind,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub redis: Option<RedisSettings>,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let backend = match std::env::var("STORE_BACKEND").ok().as_deref() {
            Some("sqlite") => StoreBackendKind::Sqlite,
            Some("postgres") => StoreBackendKind::Postgres,
            _ => StoreBackendKind::Memory,
        };
        Self {
            backend,
            database_url: std::env::var("DATABASE_URL").ok(),
            redis: std::env::var("REDIS_URL").ok().map(|url| RedisSettings {
                url,
                prefix: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = RuntimeConfig::default();
        assert_eq!(config.context_token_threshold, 120_000);
        assert_eq!(config.context_summary_target_tokens, 10_000);
        assert_eq!(config.context_reserve_tokens, 5_000);
        assert_eq!(config.max_iterations, 25);
        assert_eq!(config.native_max_auto_continues, 3);
        assert_eq!(config.max_xml_tool_calls, 25);
        assert_eq!(config.redis_key_ttl, Duration::from_secs(3600));
        assert_eq!(config.redis_response_list_ttl, Duration::from_secs(86400));
        assert_eq!(
            config.tool_execution_strategy,
            ToolExecutionStrategy::Sequential
        );
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!(
            "parallel".parse::<ToolExecutionStrategy>().unwrap(),
            ToolExecutionStrategy::Parallel
        );
        assert!("both".parse::<ToolExecutionStrategy>().is_err());
    }
}
