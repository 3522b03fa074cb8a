//! Configuration access port trait.
//!
//! Lookups are by `[section] key`. `get_int` falls back to the supplied
//! default when the key is absent or does not parse.

use crate::domain::error::StoreError;

pub trait ConfigPort {
    fn get_string(&self, section: &str, key: &str) -> Option<String>;
    fn get_int(&self, section: &str, key: &str, default: i64) -> i64;

    /// A non-blank, trimmed string value, or `ConfigMissing`.
    fn require_string(&self, section: &str, key: &str) -> Result<String, StoreError> {
        self.get_string(section, key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| StoreError::ConfigMissing {
                section: section.into(),
                key: key.into(),
            })
    }
}
