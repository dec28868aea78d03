//! Read-only access to secrets supplied by the hosting environment.

use std::collections::HashMap;

/// Source of secrets and settings (API keys, gateway token, feature flags).
pub trait SecretSource: Send + Sync {
    /// Look up a value. Empty values are treated as unset.
    fn get(&self, key: &str) -> Option<String>;
}

/// Secrets read from this process's environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl SecretSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl SecretSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).filter(|v| !v.is_empty()).cloned()
    }
}
