//! Configuration loading
//!
//! Settings are layered, later layers winning:
//!
//! 1. defaults compiled into the binary
//! 2. `default.toml`, `{HUDDLE_ENV}.toml` and `local.toml` from the config
//!    directory (`HUDDLE_CONFIG_DIR`, default `config/`); `local.toml` is
//!    skipped in production
//! 3. a file named with `--config`, which must exist
//! 4. `HUDDLE_*` variables such as `HUDDLE_COLLABORATION__BATCH_WINDOW_MS`

use super::config::AppConfig;
use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

/// Compiled-in defaults
pub const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

const ENV_PREFIX: &str = "HUDDLE";

/// Deployment environment name (`HUDDLE_ENV`, default `development`)
pub fn environment() -> String {
    std::env::var("HUDDLE_ENV").unwrap_or_else(|_| "development".to_string())
}

/// Where the configuration layers are read from
#[derive(Debug, Clone)]
pub struct ConfigSources {
    dir: PathBuf,
    environment: String,
    file: Option<PathBuf>,
    read_env: bool,
}

impl ConfigSources {
    /// Sources picked from the process environment
    pub fn from_env() -> Self {
        let dir = std::env::var_os("HUDDLE_CONFIG_DIR").map_or_else(|| PathBuf::from("config"), PathBuf::from);
        Self {
            dir,
            environment: environment(),
            file: None,
            read_env: true,
        }
    }

    /// Add an explicit file on top of the directory layers
    #[must_use]
    pub fn with_file(mut self, file: Option<&Path>) -> Self {
        self.file = file.map(Path::to_path_buf);
        self
    }

    /// Files read from the config directory, lowest priority first
    fn directory_layers(&self) -> Vec<PathBuf> {
        let mut layers = vec![
            self.dir.join("default"),
            self.dir.join(&self.environment),
        ];
        if !self.environment.eq_ignore_ascii_case("production") {
            layers.push(self.dir.join("local"));
        }
        layers
    }

    /// Merge every layer into an [`AppConfig`]
    pub fn load(&self) -> Result<AppConfig> {
        let mut builder =
            Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));
        for layer in self.directory_layers() {
            builder = builder.add_source(File::from(layer).required(false));
        }
        if let Some(file) = &self.file {
            builder = builder.add_source(File::from(file.as_path()).required(true));
        }
        if self.read_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let merged = builder.build().with_context(|| match &self.file {
            Some(file) => format!("Failed to read configuration (with {})", file.display()),
            None => format!("Failed to read configuration from {}", self.dir.display()),
        })?;
        merged
            .try_deserialize()
            .context("Configuration does not match the expected settings")
    }
}

/// Load the layered configuration, optionally with an explicit file
pub fn load_config(file: Option<&Path>) -> Result<AppConfig> {
    ConfigSources::from_env().with_file(file).load()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("huddle-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sources(dir: &Path, environment: &str) -> ConfigSources {
        ConfigSources {
            dir: dir.to_path_buf(),
            environment: environment.to_string(),
            file: None,
            read_env: false,
        }
    }

    #[test]
    fn test_embedded_defaults_deserialize() {
        let config = sources(Path::new("/nonexistent"), "development").load().unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.collaboration.max_batch_size, 256);
        assert_eq!(config.collaboration.outbox_capacity, 512);
        assert!(config.collaboration.validate().is_ok());
    }

    #[test]
    fn test_layers_override_in_order() {
        let dir = scratch_dir();
        std::fs::write(dir.join("staging.toml"), "[collaboration]\nbatch_window_ms = 50\n").unwrap();
        std::fs::write(dir.join("local.toml"), "[server]\nport = 9100\n").unwrap();
        let extra = dir.join("extra.toml");
        std::fs::write(&extra, "[collaboration]\nbatch_window_ms = 25\n").unwrap();

        let config = sources(&dir, "staging").load().unwrap();
        assert_eq!(config.collaboration.batch_window_ms, 50);
        assert_eq!(config.server.port, 9100);

        let config = sources(&dir, "staging").with_file(Some(&extra)).load().unwrap();
        assert_eq!(config.collaboration.batch_window_ms, 25);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_production_ignores_local_overrides() {
        let dir = scratch_dir();
        std::fs::write(dir.join("local.toml"), "[server]\nport = 9100\n").unwrap();

        let config = sources(&dir, "production").load().unwrap();
        assert_eq!(config.server.port, 8090);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let dir = scratch_dir();
        let err = sources(&dir, "development")
            .with_file(Some(&dir.join("absent.toml")))
            .load()
            .unwrap_err();
        assert!(err.to_string().contains("absent.toml"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
