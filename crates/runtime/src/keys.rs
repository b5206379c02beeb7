//! API key resolution for model providers.
//!
//! Precedence:
//! 1. Explicit `api_keys` map in the runtime config
//! 2. Environment variable `{PROVIDER}_API_KEY` (uppercased)
//! 3. Custom-provider table snapshotted from the admin store
//!
//! Unresolved keys fail the spawn fast with `Unauthenticated`.

use std::collections::HashMap;

use hb_domain::{Error, Result};

pub fn resolve_api_key(
    provider: &str,
    explicit: &HashMap<String, String>,
    custom: &HashMap<String, String>,
) -> Result<String> {
    if let Some(key) = explicit.get(provider) {
        return Ok(key.clone());
    }

    let var = env_var_name(provider);
    if let Ok(value) = std::env::var(&var) {
        if !value.is_empty() {
            tracing::debug!(provider, env_var = %var, "API key resolved from environment");
            return Ok(value);
        }
    }

    if let Some(key) = custom.get(provider) {
        return Ok(key.clone());
    }

    Err(Error::Unauthenticated(format!(
        "no API key for provider '{provider}': set api_keys.{provider}, \
         the {var} environment variable, or a custom-provider entry"
    )))
}

fn env_var_name(provider: &str) -> String {
    let mut name: String = provider
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    name.push_str("_API_KEY");
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_map_wins() {
        let mut explicit = HashMap::new();
        explicit.insert("anthropic".to_owned(), "sk-explicit".to_owned());
        let key = resolve_api_key("anthropic", &explicit, &HashMap::new()).unwrap();
        assert_eq!(key, "sk-explicit");
    }

    #[test]
    fn env_var_name_normalises() {
        assert_eq!(env_var_name("anthropic"), "ANTHROPIC_API_KEY");
        assert_eq!(env_var_name("my-proxy"), "MY_PROXY_API_KEY");
    }

    #[test]
    fn custom_table_is_last_resort() {
        let mut custom = HashMap::new();
        custom.insert("acme-llm".to_owned(), "sk-custom".to_owned());
        let key = resolve_api_key("acme-llm", &HashMap::new(), &custom).unwrap();
        assert_eq!(key, "sk-custom");
    }

    #[test]
    fn unresolved_is_unauthenticated() {
        let err = resolve_api_key("nowhere", &HashMap::new(), &HashMap::new()).unwrap_err();
        assert_eq!(err.kind(), "unauthenticated");
    }
}
