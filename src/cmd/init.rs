//! Project bootstrap (`metricflow init`).

use std::path::Path;

use anyhow::{Context, Result, bail};

use metricflow::config::AppConfig;
use metricflow::pipeline::db::PipelineDb;

/// Write a default config file (unless one exists) and create the database.
pub fn cmd_init(config_path: &Path, config: &AppConfig, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists. Use --force to overwrite it.",
            config_path.display()
        );
    }
    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    let fresh = AppConfig {
        server: config.server.clone(),
        ..AppConfig::default()
    };
    fresh.save(config_path)?;
    println!("Wrote {}", config_path.display());

    let db_path = &fresh.server.db_path;
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    PipelineDb::new(db_path)?;
    println!("Pipeline database initialized at {}", db_path.display());
    Ok(())
}
