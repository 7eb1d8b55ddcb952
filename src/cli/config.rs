//! `huddle config` command

use anyhow::{Context, Result};
use std::path::Path;

/// Print the merged configuration
pub fn run(file: Option<&Path>) -> Result<()> {
    let config = crate::server::load_config(file)?;
    let rendered = toml::to_string_pretty(&config).context("Failed to serialize config")?;
    println!("{rendered}");
    Ok(())
}
