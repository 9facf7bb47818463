//! basemigrate CLI - one-shot platform instance migration.

use basemigrate::{Config, Orchestrator, SyncError};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "basemigrate")]
#[command(about = "One-shot migration of a platform instance (database, auth, storage)")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
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
    /// Run the full migration pipeline
    Run {
        /// Preview what would change without mutating the target
        #[arg(long)]
        dry_run: bool,

        /// Skip the interactive confirmation prompt
        #[arg(long, short)]
        yes: bool,

        /// Override the temp directory for dump artifacts
        #[arg(long)]
        temp_dir: Option<PathBuf>,
    },

    /// Validate source and target connections without migrating
    Check,
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

async fn run() -> Result<ExitCode, SyncError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| SyncError::validation("cli", e))?;

    let mut config = Config::load(&cli.config)?;
    info!("loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            dry_run,
            yes,
            temp_dir,
        } => {
            if let Some(dir) = temp_dir {
                config.sync.temp_dir = Some(dir);
            }

            if !dry_run && !yes && !confirm_destructive(&config)? {
                println!("Aborted.");
                return Ok(ExitCode::SUCCESS);
            }

            let orchestrator = Orchestrator::new(config).with_dry_run(dry_run);
            let result = orchestrator.execute().await;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_summary(&result, dry_run);
            }

            // Non-zero only when the run overall failed; best-effort
            // warnings inside successful steps do not change the exit code.
            if result.success {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }

        Commands::Check => {
            let orchestrator = Orchestrator::new(config);
            orchestrator.check().await?;
            println!("Both endpoints reachable.");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// A migration replaces the target's data, users, and storage. Double-confirm
/// unless the caller opted out.
fn confirm_destructive(config: &Config) -> Result<bool, SyncError> {
    println!(
        "This will REPLACE the contents of the target instance at {}",
        config.target.api_url
    );
    println!("with data from {}.", config.source.api_url);
    println!("Existing target data, users, and storage objects will be overwritten.\n");

    let confirmed = Confirm::new()
        .with_prompt("Continue?")
        .default(false)
        .interact()
        .map_err(|e| SyncError::validation("cli", e))?;
    Ok(confirmed)
}

fn print_summary(result: &basemigrate::RunResult, dry_run: bool) {
    let heading = match (dry_run, result.success) {
        (true, true) => "Dry run completed!",
        (true, false) => "Dry run failed!",
        (false, true) => "Migration completed!",
        (false, false) => "Migration failed!",
    };
    println!("\n{}", heading);
    println!("  Duration: {:.2}s", result.duration_seconds);
    for step in &result.steps {
        let status = if step.success { "ok" } else { "FAILED" };
        println!("  {:<16} {:>6} ({}ms)", step.name, status, step.duration_ms);
        if let Some(ref err) = step.error {
            println!("    {}", err);
        }
    }
    if !result.errors.is_empty() {
        println!("  Errors:");
        for err in &result.errors {
            println!("    - {}", err);
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}
