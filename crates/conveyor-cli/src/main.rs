//! Conveyor CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod client;
mod commands;

use client::ApiClient;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Conveyor CI controller CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "CONVEYOR_API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    /// Bearer token for the API server
    #[arg(long, env = "CONVEYOR_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "pipeline.kdl")]
        path: String,
    },
    /// Print a pipeline's saved configuration
    GetConfig {
        /// Pipeline name; the server's default pipeline if omitted
        #[arg(long, short)]
        pipeline: Option<String>,
    },
    /// Validate and upload a pipeline configuration
    SetConfig {
        /// Path to the configuration file
        path: String,
        /// Pipeline name; the server's default pipeline if omitted
        #[arg(long, short)]
        pipeline: Option<String>,
    },
    /// Queue a build of a job
    Trigger {
        /// Pipeline name
        pipeline: String,
        /// Job name
        job: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::GetConfig { pipeline } => {
            let client = ApiClient::new(&cli.api_url, cli.token)?;
            commands::config::get(&client, pipeline.as_deref()).await?;
        }
        Commands::SetConfig { path, pipeline } => {
            let client = ApiClient::new(&cli.api_url, cli.token)?;
            commands::config::set(&client, &path, pipeline.as_deref()).await?;
        }
        Commands::Trigger { pipeline, job } => {
            let client = ApiClient::new(&cli.api_url, cli.token)?;
            commands::builds::trigger(&client, &pipeline, &job).await?;
        }
    }

    Ok(())
}
