//! Pipeline server command (`metricflow serve`).

use anyhow::{Result, bail};

use metricflow::config::AppConfig;

pub async fn cmd_serve(config: AppConfig) -> Result<()> {
    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("config error: {}", problem);
        }
        bail!("Invalid configuration ({} problem(s))", problems.len());
    }

    metricflow::pipeline::server::start_server(config.server_config()).await
}
