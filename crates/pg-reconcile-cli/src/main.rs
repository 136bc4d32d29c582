//! pg-reconcile CLI - idempotent reconciliation jobs for live PostgreSQL data.

use clap::{Parser, Subcommand};
use pg_reconcile::error::EXIT_CANCELLED;
use pg_reconcile::{ClearSessionsOptions, Config, JobReport, JobRunner, ReconcileError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "pg-reconcile")]
#[command(about = "Idempotent reconciliation and safe-migration jobs for PostgreSQL")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "reconcile.yaml")]
    config: PathBuf,

    /// Database URL (overrides DATABASE_URL and store.url)
    #[arg(long)]
    database_url: Option<String>,

    /// Output JSON report to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Delete duplicate records, keeping the most recent per logical key
    Dedup {
        /// Job name from the dedup section
        job: String,

        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Reattach orphaned children through a secondary identifier
    Relink {
        /// Job name from the relink section
        job: String,

        /// Report what would be linked without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Rewrite a unique identifier column in place
    Rename {
        /// Job name from the rename section
        job: String,

        /// Report what would be renamed without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Apply additive schema steps with a bounded lock wait
    SchemaPatch {
        /// Job name from the schema_patch section
        job: String,
    },

    /// Terminate sessions blocking a schema patch, then retry it once
    ClearSessions {
        /// Job name from the schema_patch section
        job: String,

        /// Confirm terminating other database sessions
        #[arg(long)]
        yes: bool,

        /// Also terminate every idle-in-transaction session in the database
        #[arg(long)]
        all_idle: bool,

        /// Only terminate sessions whose transaction is at least this old
        #[arg(long)]
        min_age_secs: Option<u64>,
    },

    /// Report unlinked and dangling children of a relink job (read-only)
    Audit {
        /// Job name from the relink section
        job: String,
    },

    /// List configured jobs
    List,

    /// Test the database connection
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, ReconcileError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| ReconcileError::Config(e.to_string()))?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    if let Commands::List = cli.command {
        for (operation, name) in config.jobs() {
            println!("{:<14} {}", operation, name);
        }
        return Ok(ExitCode::SUCCESS);
    }

    // Resolve the job and confirmations before touching the database
    match &cli.command {
        Commands::Dedup { job, .. } => {
            config.dedup_job(job)?;
        }
        Commands::Relink { job, .. } | Commands::Audit { job } => {
            config.relink_job(job)?;
        }
        Commands::Rename { job, .. } => {
            config.rename_job(job)?;
        }
        Commands::SchemaPatch { job } => {
            config.schema_patch_job(job)?;
        }
        Commands::ClearSessions { job, yes, .. } => {
            config.schema_patch_job(job)?;
            if !yes {
                return Err(ReconcileError::Config(
                    "clear-sessions terminates other database sessions; re-run with --yes to confirm"
                        .to_string(),
                ));
            }
        }
        Commands::List | Commands::HealthCheck => {}
    }

    // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
    let cancel = setup_signal_handler().await?;

    let runner = JobRunner::connect(config, cli.database_url.as_deref()).await?;

    let report = match cli.command {
        Commands::List => unreachable!(), // Handled above
        Commands::HealthCheck => {
            let status = runner.health_check().await;
            runner.close().await;
            let status = status?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Health Check Results:");
                println!("  PostgreSQL: OK ({}ms)", status.latency_ms);
                println!("  Version: {}", status.server_version);
                println!("  lock_timeout: {}", status.lock_timeout);
                println!("  statement_timeout: {}", status.statement_timeout);
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Dedup { job, dry_run } => runner.dedup(&job, dry_run, &cancel).await,
        Commands::Relink { job, dry_run } => runner.relink(&job, dry_run, &cancel).await,
        Commands::Rename { job, dry_run } => runner.rename(&job, dry_run, &cancel).await,
        Commands::SchemaPatch { job } => runner.schema_patch(&job, &cancel).await,
        Commands::ClearSessions {
            job,
            all_idle,
            min_age_secs,
            ..
        } => {
            let options = ClearSessionsOptions {
                all_idle_in_transaction: all_idle,
                min_age: min_age_secs.map(Duration::from_secs),
            };
            runner.clear_sessions(&job, options, &cancel).await
        }
        Commands::Audit { job } => runner.audit(&job, &cancel).await,
    };
    runner.close().await;

    let report = report?;
    print_report(&report, cli.output_json)?;

    if report.is_cancelled() {
        return Ok(ExitCode::from(EXIT_CANCELLED));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &JobReport, json: bool) -> Result<(), ReconcileError> {
    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("\n{}", report.render_text());
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr; stdout carries the report
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM. Engines stop at the next unit
/// boundary once the returned token is cancelled.
#[cfg(unix)]
async fn setup_signal_handler() -> Result<CancellationToken, ReconcileError> {
    let cancel_token = CancellationToken::new();

    let token_int = cancel_token.clone();
    let token_term = cancel_token.clone();

    // SIGINT handler (Ctrl-C)
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT handler");
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Stopping after the current unit of work...");
        token_int.cancel();
    });

    // SIGTERM handler
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Stopping after the current unit of work...");
        token_term.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only SIGINT/Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler() -> Result<CancellationToken, ReconcileError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to setup Ctrl-C handler");
        eprintln!("\nReceived Ctrl-C. Stopping after the current unit of work...");
        token.cancel();
    });

    Ok(cancel_token)
}
