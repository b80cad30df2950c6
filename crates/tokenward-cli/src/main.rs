//! tokenward - keep an identity-service session signed in from the terminal.
//!
//! Signs in, reports session status, and in `watch` mode keeps the access
//! token fresh until interrupted or until the session ends.

mod app;

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tokenward_core::Config;

use app::App;

/// Log file prefix inside the data directory
const LOG_FILE_PREFIX: &str = "tokenward";

#[derive(Parser)]
#[command(name = "tokenward")]
#[command(about = "Keep an identity service session signed in")]
#[command(version)]
struct Cli {
    /// Identity service base URL (overrides config and TOKENWARD_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and store the session
    Login {
        /// Account identifier; defaults to the last one used
        #[arg(short, long, env = "TOKENWARD_IDENTIFIER")]
        identifier: Option<String>,
    },
    /// Sign out and clear stored credentials
    Logout,
    /// Show the current session
    Status,
    /// Refresh the token pair now
    Refresh,
    /// Print the signed-in user's profile
    Profile,
    /// Stay signed in, refreshing on schedule, until Ctrl-C
    Watch,
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file_appender = log_dir.and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix("log")
            .build(dir)
            .ok()
    });
    let (file_layer, guard) = match file_appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let data_dir = Config::data_dir().ok();
    let _log_guard = init_tracing(data_dir.as_deref());
    info!("tokenward starting");

    let data_dir = data_dir.unwrap_or_else(|| {
        warn!("Could not find data directory, using ./.tokenward");
        PathBuf::from("./.tokenward")
    });
    let mut app = App::new(cli.api_url, &data_dir)?;

    let result = match cli.command {
        Commands::Login { identifier } => app.login(identifier).await,
        Commands::Logout => app.logout().await,
        Commands::Status => app.status().await,
        Commands::Refresh => app.refresh().await,
        Commands::Profile => app.profile().await,
        Commands::Watch => app.watch().await,
    };

    app.shutdown();
    info!("tokenward shutting down");
    result
}
