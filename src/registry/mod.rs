//! Config & Limits Registry: a startup-loaded immutable `api_key ->
//! Limits` mapping plus a default used only when explicitly requested.

use crate::config::{LimitsConfig, RegistryConfig};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub rpm: u64,
    pub input_tpm: u64,
    pub output_tpm: u64,
}

impl From<LimitsConfig> for Limits {
    fn from(c: LimitsConfig) -> Self {
        Self {
            rpm: c.rpm,
            input_tpm: c.input_tpm,
            output_tpm: c.output_tpm,
        }
    }
}

/// Read-only after startup — no locking needed on the lookup path.
pub struct LimitsRegistry {
    api_keys: HashMap<String, Limits>,
    default: Limits,
}

impl LimitsRegistry {
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self {
            api_keys: config
                .api_keys
                .iter()
                .map(|(k, v)| (k.clone(), Limits::from(*v)))
                .collect(),
            default: Limits::from(config.default),
        }
    }

    /// `None` means the key is not present at all — the caller must
    /// reject it with 401 *before* ever consulting `default`.
    pub fn lookup(&self, api_key: &str) -> Option<Limits> {
        self.api_keys.get(api_key).copied()
    }

    pub fn is_known(&self, api_key: &str) -> bool {
        self.api_keys.contains_key(api_key)
    }

    /// Explicit fallback resolution, for callers that have already
    /// authenticated the key through some other path and want a default
    /// rather than a hard failure. Never used by the admission handler's
    /// own authentication step.
    pub fn lookup_or_default(&self, api_key: &str) -> Limits {
        self.api_keys.get(api_key).copied().unwrap_or(self.default)
    }
}
