//! isoforge CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::ApiClient;
use isoforge_config::BuildRequest;

#[derive(Parser)]
#[command(name = "isoforge")]
#[command(about = "Request and fetch custom installation images", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "ISOFORGE_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Request a new image build
    Submit {
        /// Service to include (repeatable)
        #[arg(short, long = "service", required = true)]
        services: Vec<String>,
        /// Model to bundle (repeatable)
        #[arg(short, long = "model")]
        models: Vec<String>,
        /// Build for a GPU host
        #[arg(long)]
        gpu: bool,
        /// Identity the build is attributed to
        #[arg(long, env = "ISOFORGE_REQUESTER")]
        requester: String,
        /// Name of the produced image
        #[arg(long, default_value = "isoforge")]
        image_name: String,
        /// Poll until the build finishes
        #[arg(short, long)]
        wait: bool,
    },
    /// Show a build
    Status {
        /// Build ID
        id: String,
        /// Number of log lines to show
        #[arg(long, default_value = "20")]
        logs: usize,
    },
    /// List builds
    List {
        /// Only builds of this requester
        #[arg(long)]
        requester: Option<String>,
    },
    /// Get a download link, optionally fetching the image
    Download {
        /// Build ID
        id: String,
        /// Write the image to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Cancel a build
    Cancel {
        /// Build ID
        id: String,
    },
    /// Inspect the service and model catalog
    Catalog {
        #[command(subcommand)]
        command: CatalogCommands,
    },
}

#[derive(Subcommand)]
enum CatalogCommands {
    /// Show the server's catalog
    Show,
    /// Validate a catalog file
    Validate {
        /// Path to the catalog file
        #[arg(default_value = "catalog.kdl")]
        path: PathBuf,
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

    let client = ApiClient::new(&cli.api_url)?;
    match cli.command {
        Commands::Submit {
            services,
            models,
            gpu,
            requester,
            image_name,
            wait,
        } => {
            let request = BuildRequest {
                services,
                models,
                gpu,
                requester,
                image_name,
            };
            commands::builds::submit(&client, &request, wait).await?;
        }
        Commands::Status { id, logs } => {
            commands::builds::status(&client, &id, logs).await?;
        }
        Commands::List { requester } => {
            commands::builds::list(&client, requester.as_deref()).await?;
        }
        Commands::Download { id, output } => {
            commands::builds::download(&client, &id, output.as_deref()).await?;
        }
        Commands::Cancel { id } => {
            commands::builds::cancel(&client, &id).await?;
        }
        Commands::Catalog { command } => match command {
            CatalogCommands::Show => commands::catalog::show(&client).await?,
            CatalogCommands::Validate { path } => commands::catalog::validate(&path)?,
        },
    }

    Ok(())
}
