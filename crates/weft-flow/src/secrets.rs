//! Secrets provider abstraction.
//!
//! Connector code and task bodies look secrets up through the runtime's
//! provider rather than reading the environment directly, so tests and
//! hosted deployments can substitute their own source.

use std::collections::BTreeMap;

/// Source of named secrets.
pub trait SecretsProvider: Send + Sync {
    /// Returns the secret for `key`, if present.
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads secrets from process environment variables. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecrets;

impl SecretsProvider for EnvSecrets {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Fixed-map provider for tests and embedded configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    values: BTreeMap<String, String>,
}

impl StaticSecrets {
    /// Creates a provider over the given map.
    #[must_use]
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }
}

impl SecretsProvider for StaticSecrets {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_provider_returns_known_keys() {
        let provider = StaticSecrets::new(BTreeMap::from([(
            "DB_PASSWORD".to_string(),
            "hunter2".to_string(),
        )]));
        assert_eq!(provider.get("DB_PASSWORD").as_deref(), Some("hunter2"));
        assert_eq!(provider.get("MISSING"), None);
    }

    #[test]
    fn env_provider_reads_the_environment() {
        std::env::set_var("WEFT_TEST_SECRET_XYZZY", "42");
        assert_eq!(EnvSecrets.get("WEFT_TEST_SECRET_XYZZY").as_deref(), Some("42"));
        std::env::remove_var("WEFT_TEST_SECRET_XYZZY");
    }
}
