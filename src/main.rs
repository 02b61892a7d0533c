mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use ragctl::core::archive::{list_archives, list_members};
use ragctl::core::{
    AutoApprove, ControllerConfig, DockerDriver, HealthValidator, HttpHealthValidator,
    Outcome, OutcomeKind, Restorer, RotationDecider, Rotator, ShutdownEscalator, Snapshotter,
    TerminalPrompt,
};
use ragctl::utils::{format_bytes, AppConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::from(1)
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "ragctl=debug" } else { "ragctl=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<u8> {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}", OutcomeKind::ConfigInvalid.as_str().red().bold(), e);
            return Ok(OutcomeKind::ConfigInvalid.exit_code());
        }
    };

    let decider: &dyn RotationDecider = if cli.yes { &AutoApprove } else { &TerminalPrompt };

    let outcome = match cli.command {
        Commands::Down { force } => {
            let driver = connect(&config).await?;
            ShutdownEscalator::new(&config, &driver).run(force).await
        }
        Commands::Snapshot { name } => {
            let driver = connect(&config).await?;
            let health = HttpHealthValidator::new(&config.health)?;
            Snapshotter::new(&config, &driver, &health).run(&name).await
        }
        Commands::Restore { archive } => {
            let driver = connect(&config).await?;
            let health = HttpHealthValidator::new(&config.health)?;
            Restorer::new(&config, &driver, &health)
                .with_rotation(decider)
                .run(&archive)
                .await
        }
        Commands::Rotate { keep } => {
            let driver = connect(&config).await?;
            Rotator::new(&config, &driver, decider)
                .run(keep.or(config.backup_retention))
                .await
        }
        Commands::Archives => {
            print_archives(&config)?;
            return Ok(0);
        }
        Commands::Health => {
            let health = HttpHealthValidator::new(&config.health)?;
            let status = health.check().await;
            if status.is_healthy() {
                println!("{} {}", "healthy".green().bold(), config.health.url);
                return Ok(0);
            }
            println!("{} {}", status.to_string().red().bold(), config.health.url);
            return Ok(OutcomeKind::PreconditionInvalid.exit_code());
        }
        Commands::Config => {
            print_config(&config);
            return Ok(0);
        }
    };

    print_outcome(&outcome);
    Ok(outcome.exit_code())
}

async fn connect(config: &ControllerConfig) -> Result<DockerDriver> {
    let driver = DockerDriver::connect(config).context("Failed to connect to Docker")?;
    if !driver.check_docker().await {
        tracing::warn!("Docker daemon is not answering pings; continuing anyway");
    }
    Ok(driver)
}

/// Settings file < env file < process environment
fn load_config(cli: &Cli) -> Result<ControllerConfig> {
    match &cli.env_file {
        Some(path) => {
            dotenv::from_path(path).with_context(|| format!("Failed to load env file {}", path.display()))?;
        }
        None => {
            let _ = dotenv::dotenv();
        }
    }

    let settings = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };

    let cwd = std::env::current_dir().context("Failed to determine working directory")?;
    let lookup = |key: &str| std::env::var(key).ok().or_else(|| settings.get(key));

    Ok(ControllerConfig::from_lookup(lookup, &cwd)?)
}

fn print_outcome(outcome: &Outcome) {
    if !outcome.stage_log.is_empty() {
        println!("{}", "Timeline".bold());
        for record in outcome.stage_log.records() {
            println!("  {} {}", "-".dimmed(), record);
        }
        println!();
    }

    let kind = outcome.kind.as_str();
    let label = if outcome.kind.is_success() {
        kind.green().bold()
    } else {
        kind.red().bold()
    };
    println!("{} {}", label, outcome.message);

    for artifact in &outcome.artifacts {
        println!("  {}", artifact.cyan());
    }
}

fn print_archives(config: &ControllerConfig) -> Result<()> {
    let dir = config.archive_dir();
    let archives = list_archives(&dir).with_context(|| format!("Failed to list {}", dir.display()))?;

    if archives.is_empty() {
        println!("No archives in {}", dir.display());
        return Ok(());
    }

    println!("{:<50} {:>12} {:>8}", "Archive", "Size", "Members");
    println!("{}", "-".repeat(72));
    for (path, size) in archives {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let members = match list_members(&path) {
            Ok(members) => members.len().to_string(),
            Err(_) => "corrupt".red().to_string(),
        };
        println!("{:<50} {:>12} {:>8}", name, format_bytes(size), members);
    }
    Ok(())
}

fn print_config(config: &ControllerConfig) {
    let t = &config.timeouts;
    let duration = |d: std::time::Duration| humantime::format_duration(d).to_string();
    let path = |p: &Path| p.display().to_string();

    let rows = [
        ("project", config.project.clone()),
        ("base path", path(&config.base_path)),
        ("compose dir", path(&config.compose_dir)),
        ("active data", path(&config.active_dir())),
        ("archives", path(&config.archive_dir())),
        (
            "backup retention",
            config
                .backup_retention
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
        ),
        ("health url", config.health.url.clone()),
        ("health wait", duration(config.health.wait)),
        ("graceful", duration(t.graceful)),
        ("gather", duration(t.gather)),
        ("kill", duration(t.kill)),
        ("force remove", duration(t.remove)),
        ("daemon restart", duration(t.daemon_restart)),
        ("host kill", duration(t.host_kill)),
        ("cleanup", duration(t.cleanup)),
        ("bring-up", duration(t.bringup)),
        ("volume operation", duration(t.volume_op)),
        ("utility image", config.utility_image.clone()),
        ("daemon service", config.daemon_service.clone()),
        (
            "remote",
            config
                .remote
                .as_ref()
                .map(|r| format!("{}@{}:{}", r.user, r.host, r.path))
                .unwrap_or_else(|| "none".to_string()),
        ),
    ];

    for (key, value) in rows {
        println!("{:<18} {}", format!("{}:", key).bold(), value);
    }
}
