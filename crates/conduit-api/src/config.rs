//! Server-level configuration, layered on top of [`conduit_engine::EngineConfig`].

use conduit_engine::EngineConfig;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub engine: EngineConfig,
    pub bind_addr: String,
}

impl ApiConfig {
    /// `.env` (if present) then `std::env::var`, matching
    /// `EngineConfig::from_env`. `BIND_ADDR` defaults to `0.0.0.0:8080`.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self {
            engine: EngineConfig::from_env(),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bind_addr_is_all_interfaces_8080() {
        std::env::remove_var("BIND_ADDR");
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("REDIS_URL");
        let config = ApiConfig::from_env();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
    }
}
