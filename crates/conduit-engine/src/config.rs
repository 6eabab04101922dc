//! Environment-driven configuration for the coordinator (spec.md §6:
//! "two optional configuration inputs"). Loaded the way control-plane's own
//! config layer does it: `dotenvy` for a local `.env`, then `std::env::var`
//! parsing, no config-file format.

/// Configuration for the engine/store layer. `conduit-api` extends this
/// with its own HTTP-bind settings.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Durable-storage connection string. When set, write-through
    /// persistence is enabled (spec.md §4.A, §6).
    pub database_url: Option<String>,
    /// Cache connection string. When set, reads prefer cache on memory miss.
    pub redis_url: Option<String>,
}

impl EngineConfig {
    /// Read from the process environment. `.env` (if present) is loaded
    /// first via `dotenvy`; explicit environment variables always win.
    ///
    /// - `DATABASE_URL`: enables write-through Postgres persistence.
    /// - `REDIS_URL`: enables the best-effort read cache.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            redis_url: std::env::var("REDIS_URL").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_memory_only() {
        let config = EngineConfig::default();
        assert!(config.database_url.is_none());
        assert!(config.redis_url.is_none());
    }
}
