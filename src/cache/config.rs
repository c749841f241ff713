//! Cache configuration, derived from the `[compiler]` settings section.

use std::time::Duration;

const DEFAULT_COMPILE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Upper bound on one build, including source reads. Waiters receive a
    /// compile error when it expires and the entry resets to empty.
    pub compile_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            compile_timeout: Duration::from_secs(DEFAULT_COMPILE_TIMEOUT_SECS),
        }
    }
}

impl From<&crate::config::CompilerSettings> for CacheConfig {
    fn from(settings: &crate::config::CompilerSettings) -> Self {
        Self {
            compile_timeout: settings.timeout,
        }
    }
}
