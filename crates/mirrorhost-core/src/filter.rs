//! Item ingestion filter.
//!
//! Dynamic-interface items (names templated with `<...>`) and keys with an
//! administratively excluded prefix are never replicated or replayed.

use crate::config::FilterConfig;

#[derive(Debug, Clone)]
pub struct ItemFilter {
    excluded_key_prefixes: Vec<String>,
}

impl Default for ItemFilter {
    fn default() -> Self {
        Self::from_config(&FilterConfig::default())
    }
}

impl ItemFilter {
    #[must_use]
    pub fn new(excluded_key_prefixes: Vec<String>) -> Self {
        Self {
            excluded_key_prefixes,
        }
    }

    #[must_use]
    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(config.excluded_key_prefixes.clone())
    }

    /// Full ingestion check, used where the item name is known.
    #[must_use]
    pub fn should_skip(&self, name: &str, key: &str) -> bool {
        (name.contains('<') && name.contains('>')) || self.is_excluded_key(key)
    }

    /// Key-only check, used at replay time where only the destination key is at hand.
    #[must_use]
    pub fn is_excluded_key(&self, key: &str) -> bool {
        self.excluded_key_prefixes
            .iter()
            .any(|prefix| key.starts_with(prefix.as_str()))
    }
}
