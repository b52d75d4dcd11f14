use anyhow::Context;
use clap::{Parser, Subcommand};
use metric_pipeline_lib::config::AppConfig;
use metric_pipeline_lib::models::MetricRow;
use metric_pipeline_lib::service::RunOutcome;
use metric_pipeline_lib::telemetry::init_tracing;
use metric_pipeline_lib::transform::{group_by_chart, group_totals};
use metric_pipeline_lib::Pipeline;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "metric-pipeline", about = "Evaluates dashboard metric rows against their backends")]
struct Cli {
    /// YAML configuration file.
    #[arg(long, short, default_value = "pipeline.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process every stored row until Ctrl-C.
    Run {
        /// Stop after a single pass over the rows.
        #[arg(long)]
        once: bool,
    },
    /// Upsert row definitions from a JSON array file.
    Import { rows: PathBuf },
    /// Print stored rows as JSON.
    List,
    /// Print rows grouped by chart, with per-group totals.
    Groups,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(&config.log)?;

    match cli.command {
        Command::Run { once } => {
            if once {
                config.pipeline.max_cycles = Some(1);
            }
            let pipeline = Pipeline::open(&config)?;
            match pipeline.run_until_shutdown().await? {
                RunOutcome::Finished(status) => tracing::info!(status = status.as_str(), "pipeline exited"),
                RunOutcome::AlreadyRunning => tracing::warn!("pipeline was already running"),
            }
        }
        Command::Import { rows } => {
            let raw = std::fs::read_to_string(&rows).with_context(|| format!("reading {}", rows.display()))?;
            let parsed: Vec<MetricRow> = serde_json::from_str(&raw).context("parsing row definitions")?;
            let pipeline = Pipeline::open(&config)?;
            let count = pipeline.db().import_rows(&parsed)?;
            tracing::info!(count, "imported metric rows");
        }
        Command::List => {
            let pipeline = Pipeline::open(&config)?;
            println!("{}", serde_json::to_string_pretty(&pipeline.db().list_rows()?)?);
        }
        Command::Groups => {
            let pipeline = Pipeline::open(&config)?;
            let groups = group_by_chart(&pipeline.db().list_rows()?);
            let output = serde_json::json!({
                "groups": groups,
                "totals": group_totals(&groups),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
