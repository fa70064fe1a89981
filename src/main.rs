//! # Vet Harness CLI (`harness`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harness init` | Create the SQLite database and run schema migrations |
//! | `harness import <file.jsonl>` | Import (and optionally embed) literature chunks |
//! | `harness ask "<question>"` | Ask a cited clinical question |
//! | `harness diagnose --species dog --complaint "..."` | Run a diagnostic session to a decision |
//! | `harness serve` | Start the HTTP API |
//! | `harness completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! harness init --config ./config/harness.toml
//! harness import ./data/corpus.jsonl
//! harness ask "What causes kennel cough in dogs?"
//! harness diagnose --species dog --complaint "honking cough after boarding" --temp 39.4
//! harness serve
//! ```

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;

use vet_harness::diagnose::DiagnoseArgs;
use vet_harness::{ask, config, diagnose, import, logging, migrate, server};

/// Vet Harness: citation-grounded veterinary evidence and sequential
/// diagnosis.
#[derive(Parser)]
#[command(name = "harness", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harness.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Import literature chunks from a JSONL file.
    Import {
        /// One chunk record per line.
        path: PathBuf,
    },

    /// Ask a clinical question and print a cited answer.
    Ask {
        query: String,
        /// Trace id for idempotent retries. Generated when omitted.
        #[arg(long)]
        trace_id: Option<String>,
        /// Print the full JSON response.
        #[arg(long)]
        json: bool,
    },

    /// Run a diagnostic session from intake to decision.
    Diagnose {
        /// Patient species (dog, cat, horse, ...).
        #[arg(long)]
        species: String,
        /// Presenting complaint in free text.
        #[arg(long)]
        complaint: String,
        /// Rectal temperature in °C.
        #[arg(long = "temp")]
        temperature_c: Option<f64>,
        /// Heart rate in beats per minute.
        #[arg(long = "hr")]
        heart_rate_bpm: Option<f64>,
        /// Respiratory rate in breaths per minute.
        #[arg(long = "rr")]
        respiratory_rate_bpm: Option<f64>,
        /// Additional examination finding (repeatable).
        #[arg(long = "finding")]
        findings: Vec<String>,
        /// Lift the evidence loop cap.
        #[arg(long)]
        override_loop_cap: bool,
        /// Cost budget for this session.
        #[arg(long)]
        budget: Option<f64>,
        /// Print the full session as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Print shell completions to stdout.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "harness", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Import { path } => {
            import::run_import(&cfg, &path).await?;
        }
        Commands::Ask {
            query,
            trace_id,
            json,
        } => {
            ask::run_ask(&cfg, &query, trace_id, json).await?;
        }
        Commands::Diagnose {
            species,
            complaint,
            temperature_c,
            heart_rate_bpm,
            respiratory_rate_bpm,
            findings,
            override_loop_cap,
            budget,
            json,
        } => {
            diagnose::run_diagnose(
                &cfg,
                DiagnoseArgs {
                    species,
                    complaint,
                    temperature_c,
                    heart_rate_bpm,
                    respiratory_rate_bpm,
                    findings,
                    override_loop_cap,
                    budget,
                    json,
                },
            )
            .await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
