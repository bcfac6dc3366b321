use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_openai::config::Config;
use reqwest::header::{HeaderMap, HeaderName, AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};

/// One OpenAI-compatible chat endpoint: base url, bearer token, and the
/// extra headers a gateway in front of it may require.
#[derive(Clone, Debug)]
pub struct ProviderEndpoint {
    api_base: String,
    api_key: SecretString,
    additional_headers: HashMap<String, String>,
}

impl ProviderEndpoint {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: SecretString::from(api_key.into()),
            additional_headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.additional_headers
            .insert(key.to_string(), value.to_string());
        self
    }
}

impl Config for ProviderEndpoint {
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let secret = self.api_key.expose_secret();
        if !secret.is_empty() {
            if let Ok(value) = format!("Bearer {secret}").parse() {
                headers.insert(AUTHORIZATION, value);
            }
        }
        for (key, value) in &self.additional_headers {
            if let (Ok(name), Ok(value)) = (HeaderName::from_str(key), value.parse()) {
                headers.insert(name, value);
            }
        }
        headers
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn api_base(&self) -> &str {
        &self.api_base
    }

    fn api_key(&self) -> &secrecy::SecretBox<str> {
        &self.api_key
    }

    fn query(&self) -> Vec<(&str, &str)> {
        vec![]
    }
}

pub const OPENAI_FAMILY: &str = "openai";
pub const ANTHROPIC_FAMILY: &str = "anthropic";
pub const LOCAL_FAMILY: &str = "local";

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const LOCAL_BASE_URL: &str = "http://localhost:8000/v1";

/// Provider-family endpoints plus model alias/family tables; built once at
/// startup and read-only afterwards.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub default_model: String,
    pub endpoints: HashMap<String, ProviderEndpoint>,
    /// normalized alias -> canonical model name
    pub aliases: HashMap<String, String>,
    /// canonical model name -> provider family
    pub families: HashMap<String, String>,
    pub request_deadline: Duration,
}

impl ProviderConfig {
    pub fn new(default_model: impl Into<String>) -> Self {
        let mut config = Self {
            default_model: default_model.into(),
            endpoints: HashMap::new(),
            aliases: HashMap::new(),
            families: HashMap::new(),
            request_deadline: Duration::from_secs(120),
        };
        config.register_default_models();
        config
    }

    pub fn from_env(default_model: &str) -> Self {
        let mut config = Self::new(default_model);
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            let base = std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| OPENAI_BASE_URL.to_string());
            config
                .endpoints
                .insert(OPENAI_FAMILY.to_string(), ProviderEndpoint::new(base, key));
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            let base = std::env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| ANTHROPIC_BASE_URL.to_string());
            config.endpoints.insert(
                ANTHROPIC_FAMILY.to_string(),
                ProviderEndpoint::new(base, key),
            );
        }
        if let Ok(base) = std::env::var("LOCAL_LLM_BASE_URL") {
            config.endpoints.insert(
                LOCAL_FAMILY.to_string(),
                ProviderEndpoint::new(base, String::new()),
            );
        }
        if config.endpoints.is_empty() {
            tracing::warn!("no LLM provider endpoints configured");
            config.endpoints.insert(
                LOCAL_FAMILY.to_string(),
                ProviderEndpoint::new(LOCAL_BASE_URL, String::new()),
            );
        }
        config
    }

    pub fn with_endpoint(mut self, family: &str, endpoint: ProviderEndpoint) -> Self {
        self.endpoints.insert(family.to_string(), endpoint);
        self
    }

    pub fn with_model(mut self, canonical: &str, family: &str, aliases: &[&str]) -> Self {
        self.register_model(canonical, family, aliases);
        self
    }

    pub fn register_model(&mut self, canonical: &str, family: &str, aliases: &[&str]) {
        self.families
            .insert(canonical.to_string(), family.to_string());
        self.aliases
            .insert(normalize_model_name(canonical), canonical.to_string());
        for alias in aliases {
            self.aliases
                .insert(normalize_model_name(alias), canonical.to_string());
        }
    }

    fn register_default_models(&mut self) {
        self.register_model("gpt-4o", OPENAI_FAMILY, &["gpt4o", "4o"]);
        self.register_model("gpt-4o-mini", OPENAI_FAMILY, &["gpt4o-mini", "4o-mini"]);
        self.register_model("gpt-4.1", OPENAI_FAMILY, &["gpt4.1"]);
        self.register_model("gpt-4.1-mini", OPENAI_FAMILY, &["gpt4.1-mini"]);
        self.register_model(
            "claude-sonnet-4",
            ANTHROPIC_FAMILY,
            &["sonnet", "claude-sonnet"],
        );
        self.register_model(
            "claude-haiku-3-5",
            ANTHROPIC_FAMILY,
            &["haiku", "claude-haiku"],
        );
        self.register_model("qwen2.5-32b-instruct", LOCAL_FAMILY, &["qwen"]);
    }

    pub fn family_of(&self, canonical: &str) -> &str {
        self.families
            .get(canonical)
            .map(String::as_str)
            .unwrap_or(OPENAI_FAMILY)
    }

    pub fn endpoint_for(&self, family: &str) -> Option<&ProviderEndpoint> {
        self.endpoints
            .get(family)
            .or_else(|| self.endpoints.get(OPENAI_FAMILY))
            .or_else(|| self.endpoints.values().next())
    }
}

/// Lookup key for aliases: case-insensitive and dash/dot-insensitive.
pub(crate) fn normalize_model_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '-' && *c != '.')
        .collect::<String>()
        .to_ascii_lowercase()
}
