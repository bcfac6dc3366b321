use super::provider_config::{normalize_model_name, ProviderConfig};

/// Maps requested model names to canonical ones. Aliases are case- and
/// dash-insensitive; unknown names fall back to the configured default with
/// a warning.
#[derive(Debug, Clone)]
pub struct ModelResolver {
    aliases: std::collections::HashMap<String, String>,
    default_model: String,
}

impl ModelResolver {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            aliases: config.aliases.clone(),
            default_model: config.default_model.clone(),
        }
    }

    pub fn resolve(&self, model_name: &str) -> String {
        let key = normalize_model_name(model_name);
        match self.aliases.get(&key) {
            Some(canonical) => canonical.clone(),
            None => {
                tracing::warn!(
                    requested = %model_name,
                    fallback = %self.default_model,
                    "unknown model name; falling back to default"
                );
                self.default_model.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> ModelResolver {
        ModelResolver::from_config(&ProviderConfig::new("gpt-4o"))
    }

    #[test]
    fn resolves_aliases_case_and_dash_insensitively() {
        let r = resolver();
        assert_eq!(r.resolve("gpt-4o"), "gpt-4o");
        assert_eq!(r.resolve("GPT4O"), "gpt-4o");
        assert_eq!(r.resolve("Gpt-4O"), "gpt-4o");
        assert_eq!(r.resolve("sonnet"), "claude-sonnet-4");
        assert_eq!(r.resolve("Claude-Sonnet"), "claude-sonnet-4");
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        assert_eq!(resolver().resolve("totally-made-up"), "gpt-4o");
    }
}
