//! Server configuration types

use huddle_canvas::CollaborationConfig;
use serde::{Deserialize, Serialize};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub collaboration: CollaborationConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub advisor: AdvisorConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS origins; empty allows any origin
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8090
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: Vec::new(),
        }
    }
}

/// Canvas persistence backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// `memory` or `sqlite`
    #[serde(default = "default_backend")]
    pub backend: String,
    /// SQLite connection string
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_database_url() -> String {
    "sqlite://data/huddle.db?mode=rwc".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            database_url: default_database_url(),
        }
    }
}

/// Suggestion advisor switch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdvisorConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8090);
        assert_eq!(config.persistence.backend, "memory");
        assert_eq!(config.collaboration.batch_window_ms, 100);
        assert!(!config.advisor.enabled);
    }

    #[test]
    fn test_toml_round_trip_keeps_overrides() {
        let config: AppConfig = toml::from_str(
            r#"
            [collaboration]
            batch_window_ms = 40

            [persistence]
            backend = "sqlite"
            "#,
        )
        .unwrap();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.collaboration.batch_window_ms, 40);
        assert_eq!(parsed.persistence.backend, "sqlite");
    }
}
