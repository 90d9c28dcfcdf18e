// crates/engram-server/src/main.rs
// Engram - persistent conversation memory for AI agents

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env from ~/.engram/.env only (never from CWD - a hostile
    // working directory could override keys)
    if let Some(home) = dirs::home_dir()
        && let Err(e) = dotenvy::from_path(home.join(".engram/.env"))
    {
        tracing::debug!("Failed to load global .env file: {}", e);
    }

    let cli = Cli::parse();

    let log_level = match std::env::var("ENGRAM_LOG").ok().as_deref() {
        Some("error") => Level::ERROR,
        Some("warn") => Level::WARN,
        Some("debug") => Level::DEBUG,
        Some("trace") => Level::TRACE,
        Some("info") | None => Level::INFO,
        Some(other) => {
            eprintln!("[engram] Unknown ENGRAM_LOG={other:?}, using info");
            Level::INFO
        }
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match cli.command {
        None => cli::run_serve(cli::ServeArgs::default()).await?,
        Some(Commands::Serve(args)) => cli::run_serve(args).await?,
        Some(Commands::Migrate(args)) => cli::run_migrate(args).await?,
    }

    Ok(())
}
