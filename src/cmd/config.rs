//! Configuration view and validation commands (`metricflow config`).

use std::path::Path;

use anyhow::{Context, Result, bail};

use super::super::ConfigCommands;
use metricflow::config::AppConfig;

pub fn cmd_config(config_path: &Path, config: &AppConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {}; using defaults", config_path.display());
            }
            println!("Effective values (with env/CLI overrides):");
            println!();
            let content = toml::to_string_pretty(&redacted(config))
                .context("Failed to render configuration")?;
            println!("{}", content);
        }
        Some(ConfigCommands::Validate) => {
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
            } else {
                for problem in &problems {
                    println!("  - {}", problem);
                }
                bail!("Configuration has {} problem(s)", problems.len());
            }
        }
    }
    Ok(())
}

fn redacted(config: &AppConfig) -> AppConfig {
    let mut shown = config.clone();
    if !shown.connector.secret_key.is_empty() {
        shown.connector.secret_key = "********".to_string();
    }
    if shown.generator.api_key.is_some() {
        shown.generator.api_key = Some("********".to_string());
    }
    shown
}
