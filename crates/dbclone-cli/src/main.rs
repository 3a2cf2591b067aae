//! dbclone CLI - clone a database into one or more targets across dialects.

use clap::{Parser, Subcommand};
use dbclone::{
    render_ddl, CloneError, Config, Dialect, Orchestrator, RunStatus, SchemaSyncMode,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code of a run that ended on a signal.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "dbclone")]
#[command(about = "Clone databases across MySQL, PostgreSQL, SQL Server and SQLite")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to the run record file (overrides run.state_file)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to wait for in-flight jobs after a shutdown signal
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone the source into every target
    Run {
        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Override rows per chunk
        #[arg(long)]
        chunk_size: Option<u64>,

        /// Override schema sync mode: none, truncate, drop-create
        #[arg(long)]
        mode: Option<SchemaSyncMode>,
    },

    /// Compare row counts between source and targets
    Validate,

    /// Test database connections
    HealthCheck,

    /// Print a connection's schema as JSON
    Inspect {
        /// Connection name (defaults to the source)
        #[arg(long)]
        connection: Option<String>,
    },

    /// Print the DDL the source schema produces for a dialect
    Ddl {
        /// Target dialect: mysql, mariadb, postgres, mssql, sqlite
        #[arg(long)]
        dialect: Dialect,
    },
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

async fn run() -> Result<ExitCode, CloneError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    if let Some(path) = cli.state_file {
        config.run.state_file = Some(path);
    }

    match cli.command {
        Commands::Run {
            workers,
            chunk_size,
            mode,
        } => {
            if let Some(w) = workers {
                config.run.workers = w;
            }
            if let Some(size) = chunk_size {
                config.options.chunk_size = size;
            }
            if let Some(mode) = mode {
                config.options.synchronize_table_schema = mode;
            }
            config.validate()?;

            let cancel_token = setup_signal_handler(cli.shutdown_timeout)?;
            let result = Orchestrator::new(config)
                .with_cancellation(cancel_token)
                .run()
                .await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("\nRun {}", result.status);
                println!("  Run ID: {}", result.run_id);
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!("  Jobs: {}/{}", result.processed_jobs, result.total_jobs);
                println!("  Rows: {}", result.rows_transferred);
                let failed = result.failed_tables();
                if !failed.is_empty() {
                    println!("  Failed tables: {:?}", failed);
                }
                if let Some(ref signature) = result.signature {
                    println!("  Signature: {}", signature);
                }
            }

            Ok(match result.status {
                RunStatus::Completed => ExitCode::SUCCESS,
                RunStatus::Cancelled => ExitCode::from(EXIT_CANCELLED),
                _ => ExitCode::FAILURE,
            })
        }

        Commands::Validate => {
            let report = Orchestrator::new(config).validate().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for target in &report.targets {
                    println!("Target {}:", target.target);
                    for table in &target.tables {
                        let mark = if table.matches() { "OK" } else { "MISMATCH" };
                        let target_rows = table
                            .target_rows
                            .map(|n| n.to_string())
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "  {:<8} {} (source: {}, expected: {}, target: {})",
                            mark, table.table, table.source_rows, table.expected_rows, target_rows
                        );
                        if let Some(ref err) = table.error {
                            println!("    Error: {}", err);
                        }
                    }
                }
            }

            if report.is_consistent() {
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("{} table(s) differ", report.mismatches().len());
                Ok(ExitCode::FAILURE)
            }
        }

        Commands::HealthCheck => {
            let report = Orchestrator::new(config).health_check().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Health Check Results:");
                for conn in &report.connections {
                    println!(
                        "  {} ({}): {} ({}ms)",
                        conn.name,
                        conn.driver,
                        if conn.healthy { "OK" } else { "FAILED" },
                        conn.latency_ms
                    );
                    if let Some(ref err) = conn.error {
                        println!("    Error: {}", err);
                    }
                }
                println!(
                    "\n  Overall: {}",
                    if report.healthy() { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            Ok(if report.healthy() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Inspect { connection } => {
            let schema = Orchestrator::new(config)
                .inspect(connection.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Ddl { dialect } => {
            let schema = Orchestrator::new(config).inspect(None).await?;
            let statements = render_ddl(&schema, dialect)?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&statements)?);
            } else {
                for statement in statements {
                    println!("{};\n", statement);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

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
}

/// Cancel the batch on SIGINT or SIGTERM. Jobs already running get
/// `shutdown_timeout` seconds to reach a chunk boundary before the process
/// exits.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, CloneError> {
    let cancel_token = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
        force_exit_after(shutdown_timeout).await;
    });

    Ok(cancel_token)
}

#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, CloneError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
            token.cancel();
            force_exit_after(shutdown_timeout).await;
        }
    });

    Ok(cancel_token)
}

async fn force_exit_after(shutdown_timeout: u64) {
    tokio::time::sleep(Duration::from_secs(shutdown_timeout)).await;
    eprintln!("Shutdown timeout reached, exiting");
    std::process::exit(EXIT_CANCELLED.into());
}
