use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bitbuckup::error::{exit_code_for, EXIT_FATAL};
use bitbuckup::health::CheckResult;
use bitbuckup::shutdown::listen_for_shutdown;
use bitbuckup::{BackupError, Config, GitCli, HealthCheck, SyncEngine, TerminalProgress};

#[derive(Parser)]
#[command(name = "bitbuckup")]
#[command(about = "Mirror every git repository of a set of Bitbucket accounts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory under which repos/ is created
    #[arg(short, long, global = true)]
    work_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone missing repositories and fetch all branches of existing ones (default)
    Sync,

    /// Write and print the manifest of every account without touching git
    List,

    /// System health check and diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Real environment variables win over .env
    let dotenv = dotenvy::dotenv();

    let mut config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };

    init_logging(cli.verbose, &config.logging.level);
    info!("Starting bitbuckup v{}", env!("CARGO_PKG_VERSION"));

    match dotenv {
        Ok(path) => debug!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => warn!("Ignoring .env file: {}", e),
    }

    config.apply_env();
    if let Some(work_dir) = cli.work_dir {
        config.work_directory = work_dir;
    }

    let result = match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => cmd_sync(&config).await,
        Commands::List => cmd_list(&config).await,
        Commands::Doctor => Ok(cmd_doctor(&config)),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// Initialize logging: RUST_LOG wins, then --verbose, then the configured level
fn init_logging(verbose: bool, level: &str) {
    let fallback = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&std::path::Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

/// Mirror every configured account
async fn cmd_sync(config: &Config) -> Result<u8> {
    let credentials = config.credentials()?;

    let git = GitCli::new(&config.git.program, config.git_timeout());
    if !git.is_available() {
        return Err(BackupError::GitUnavailable {
            program: config.git.program.clone(),
        }
        .into());
    }

    let cancel = CancellationToken::new();
    listen_for_shutdown(cancel.clone());

    let engine = SyncEngine::new(config, git, cancel)?;
    info!("Mirroring into {}", engine.repos_root().display());

    let summary = engine.run(&credentials, &TerminalProgress::new()).await?;

    println!(
        "Synced {} repositories across {} accounts in {:.1}s",
        summary.total_repositories(),
        summary.accounts.len(),
        summary.duration.as_secs_f64()
    );
    if summary.failed_repositories() > 0 {
        println!("   {} repositories failed", summary.failed_repositories());
    }
    for (account, error) in &summary.failed_accounts {
        println!("   Could not list {}: {}", account, error);
    }
    if summary.aborted {
        println!("   Interrupted before every repository was processed");
    }

    Ok(summary.exit_code())
}

/// Enumerate every account and print its manifest
async fn cmd_list(config: &Config) -> Result<u8> {
    let credentials = config.credentials()?;

    let cancel = CancellationToken::new();
    listen_for_shutdown(cancel.clone());

    // git is never invoked while listing
    let git = GitCli::new(&config.git.program, config.git_timeout());
    let engine = SyncEngine::new(config, git, cancel)?;

    let summary = engine.list(&credentials, &TerminalProgress::new()).await?;

    for (account, manifest) in &summary.manifests {
        println!("{} ({}):", account, manifest.len());
        for record in manifest {
            match &record.project {
                Some(project) => println!("  {} [{}] {}", record.slug, project, record.remote_url),
                None => println!("  {} {}", record.slug, record.remote_url),
            }
        }
        println!();
    }
    for (account, error) in &summary.failed_accounts {
        eprintln!("Could not list {}: {}", account, error);
    }

    Ok(summary.exit_code())
}

/// Print the preflight report; exits 1 when a required check fails
fn cmd_doctor(config: &Config) -> u8 {
    let health = HealthCheck::run(config);
    print_health_report(&health);
    if health.all_passed() {
        0
    } else {
        EXIT_FATAL
    }
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 bitbuckup System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    let errors = health.errors();
    let warnings = health.warnings();
    if errors.is_empty() {
        println!("✅ All checks passed ({} warnings)", warnings.len());
    } else {
        println!(
            "❌ {} checks failed: {}",
            errors.len(),
            errors
                .iter()
                .map(|check| check.message.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
}
