//! Startup configuration validation

use super::config::AppConfig;
use anyhow::{bail, Result};
use tracing::warn;

/// Persistence backends the server can build
pub const BACKENDS: [&str; 2] = ["memory", "sqlite"];

/// Reject settings that would stall the pipeline; warn about risky ones
pub fn validate_config(config: &AppConfig, environment: &str) -> Result<()> {
    if let Err(reason) = config.collaboration.validate() {
        bail!("Invalid configuration: {reason}");
    }

    if !BACKENDS.contains(&config.persistence.backend.as_str()) {
        bail!(
            "Invalid configuration: unknown persistence.backend '{}' (expected one of {})",
            config.persistence.backend,
            BACKENDS.join(", ")
        );
    }

    if environment.eq_ignore_ascii_case("production") {
        if config.server.host == "0.0.0.0" {
            warn!(
                "Server is binding to all interfaces (0.0.0.0) in production. \
                 Consider binding to 127.0.0.1 behind a reverse proxy."
            );
        }
        if config.persistence.backend == "memory" {
            warn!("Canvas state is kept in memory only and will be lost on restart");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_pass() {
        assert!(validate_config(&AppConfig::default(), "development").is_ok());
    }

    #[test]
    fn test_zero_batch_window_rejected() {
        let mut config = AppConfig::default();
        config.collaboration.batch_window_ms = 0;
        let err = validate_config(&config, "development").unwrap_err();
        assert!(err.to_string().contains("batch_window_ms"));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = AppConfig::default();
        config.collaboration.max_batch_size = 0;
        assert!(validate_config(&config, "development").is_err());

        let mut config = AppConfig::default();
        config.collaboration.max_participants_per_session = 0;
        assert!(validate_config(&config, "development").is_err());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let mut config = AppConfig::default();
        config.persistence.backend = "postgres".to_string();
        let err = validate_config(&config, "production").unwrap_err();
        assert!(err.to_string().contains("postgres"));
    }
}
