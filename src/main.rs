//! # docqa server binary
//!
//! The `docqa` binary runs the RAG question-answering backend. It provides
//! two commands: database initialization and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! docqa --config ./docqa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docqa init` | Create the SQLite database and run schema migrations |
//! | `docqa serve` | Start the HTTP API server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! docqa init --config ./docqa.toml
//!
//! # Start the server
//! GROQ_API_KEY=... OPENAI_API_KEY=... docqa serve --config ./docqa.toml
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docqa::{config, db, migrate, server};

/// docqa — a retrieval-augmented question answering backend for PDF
/// documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. API keys are read from the environment, never from the config file.
#[derive(Parser)]
#[command(
    name = "docqa",
    about = "docqa — a retrieval-augmented question answering backend for PDF documents",
    version,
    long_about = "docqa ingests PDF documents (extract, chunk, embed, index), answers \
    natural-language questions over them with LLM-generated answers and source citations, \
    and records token/cost/latency accounting for every LLM call."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./docqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (chunks,
    /// prompt templates, request logs). Idempotent — running it multiple
    /// times is safe.
    Init,

    /// Start the HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// document, query, observability, and system endpoints.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
