use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::core::FlushMode;
use crate::engine::{SchemaAction, SessionFactoryConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// none, create or recreate
    pub schema_auto: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub flush_mode: String,
    pub order_inserts: bool,
    pub order_updates: bool,
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database: DatabaseConfig {
                url: env_or("DATABASE_URL", "sqlite:library.db"),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", "5")
                    .parse()
                    .unwrap_or(5),
                schema_auto: env_or("SCHEMA_AUTO", "create"),
            },
            server: ServerConfig {
                host: env_or("SERVER_HOST", "0.0.0.0"),
                port: env_or("SERVER_PORT", "3000").parse().unwrap_or(3000),
            },
            cache: CacheConfig {
                enabled: env_flag("SECOND_LEVEL_CACHE", true),
                capacity: env_or("CACHE_CAPACITY", "1000").parse().unwrap_or(1000),
                ttl_secs: env::var("CACHE_TTL_SECS").ok().and_then(|v| v.parse().ok()),
            },
            session: SessionConfig {
                flush_mode: env_or("FLUSH_MODE", "auto"),
                order_inserts: env_flag("ORDER_INSERTS", true),
                order_updates: env_flag("ORDER_UPDATES", true),
            },
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Engine settings; unknown flush modes or schema actions are rejected
    pub fn session_factory_config(&self) -> anyhow::Result<SessionFactoryConfig> {
        Ok(SessionFactoryConfig {
            flush_mode: self.session.flush_mode.parse::<FlushMode>()?,
            order_inserts: self.session.order_inserts,
            order_updates: self.session.order_updates,
            second_level_cache: self.cache.enabled,
            cache_ttl: self.cache.ttl_secs.map(Duration::from_secs),
            schema_action: self.database.schema_auto.parse::<SchemaAction>()?,
            node_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(flush_mode: &str, schema_auto: &str) -> Config {
        Config {
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
                max_connections: 1,
                schema_auto: schema_auto.to_string(),
            },
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            cache: CacheConfig {
                enabled: true,
                capacity: 10,
                ttl_secs: Some(60),
            },
            session: SessionConfig {
                flush_mode: flush_mode.to_string(),
                order_inserts: true,
                order_updates: false,
            },
        }
    }

    #[test]
    fn test_session_factory_config_from_settings() {
        let config = config("commit", "recreate");
        assert_eq!(config.server_address(), "127.0.0.1:8080");

        let factory_config = config.session_factory_config().unwrap();
        assert_eq!(factory_config.flush_mode, FlushMode::Commit);
        assert_eq!(factory_config.schema_action, SchemaAction::Recreate);
        assert_eq!(factory_config.cache_ttl, Some(Duration::from_secs(60)));
        assert!(!factory_config.order_updates);
    }

    #[test]
    fn test_unknown_settings_are_rejected() {
        assert!(config("sometimes", "create").session_factory_config().is_err());
        assert!(config("auto", "migrate").session_factory_config().is_err());
    }
}
