//! dbx - stream MySQL row changes to a downstream sink.

mod config;
mod pipeline;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " — built with ",
    env!("DBX_BUILD_TOOLCHAIN"),
    " on ",
    env!("DBX_BUILD_OS"),
    "/",
    env!("DBX_BUILD_ARCH"),
);

#[derive(Parser)]
#[command(name = "dbx")]
#[command(about = "Change data capture from MySQL to a pluggable sink")]
#[command(version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail the primary's binlog and deliver change events to the output
    Listen {
        /// Configuration file
        #[arg(short, long, default_value = "config.yml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Listen { config } => listen(&config).await,
    }
}

async fn listen(config_path: &str) {
    let config = match config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(2);
        }
    };

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });

    match pipeline::run(token, &config, pipeline::PipelineOptions::default()).await {
        Ok(()) => info!("pipeline stopped"),
        Err(e) => {
            error!(error = %e, "pipeline terminated");
            std::process::exit(1);
        }
    }
}
