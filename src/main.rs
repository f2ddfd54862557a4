use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use metricflow::config::{AppConfig, CONFIG_FILE, LoggingSection};

mod cmd;

#[derive(Parser)]
#[command(name = "metricflow")]
#[command(version, about = "Metric data pipeline: ingest provider data and build dashboard charts")]
pub struct Cli {
    /// Path to the config file
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    pub config: PathBuf,

    /// Log output format. Overrides `logging.json`.
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline HTTP server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS, bind all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Write a default config file and create the database
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate the configuration
    Validate,
}

fn init_tracing(logging: &LoggingSection, format: Option<LogFormat>) -> Result<Option<WorkerGuard>> {
    let json = match format {
        Some(format) => format == LogFormat::Json,
        None => logging.json,
    };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, guard) = match &logging.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let file_appender = tracing_appender::rolling::daily(dir, "metricflow.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (tracing_subscriber::fmt::writer::BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stderr),
            None,
        ),
    };

    let result = if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .json()
            .with_writer(writer)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(writer)
            .try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let mut config = AppConfig::load_or_default(&cli.config)?;
    config.apply_env()?;
    if let Commands::Serve { port, db_path, dev } = &cli.command {
        config.apply_cli(*port, db_path.clone(), *dev);
    }

    let _log_guard = init_tracing(&config.logging, cli.log_format)?;

    match cli.command {
        Commands::Serve { .. } => cmd::cmd_serve(config).await?,
        Commands::Init { force } => cmd::cmd_init(&cli.config, &config, force)?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, &config, command)?,
    }

    Ok(())
}
