/// CLI argument parsing

use clap::builder::FalseyValueParser;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ragctl::utils::{is_valid_archive_name, DEFAULT_SNAPSHOT_NAME};

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "ragctl")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Env file to load (default: .env in the working directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub env_file: Option<PathBuf>,

    /// Settings file (default: ~/.config/ragctl/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, global = true, env = "RAGCTL_DEBUG", value_parser = FalseyValueParser::new())]
    pub debug: bool,

    /// Approve safety-copy deletion without asking
    #[arg(short, long, global = true)]
    pub yes: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Stop the stack, escalating until it is down
    Down {
        /// Skip the graceful stop and start at unit kill
        #[arg(short, long)]
        force: bool,
    },

    /// Archive every stack volume into one verified snapshot
    Snapshot {
        /// Snapshot name; the archive is <name>_<date>_<time>.tar.gz
        #[arg(default_value = DEFAULT_SNAPSHOT_NAME, value_parser = parse_snapshot_name)]
        name: String,
    },

    /// Replace stack volumes from an archive, rolling back on failure
    Restore {
        /// Archive to restore
        archive: PathBuf,
    },

    /// Delete safety copies beyond the retention count
    Rotate {
        /// Safety copies to keep per volume (default: RAGCTL_BACKUP_RETENTION)
        #[arg(short, long)]
        keep: Option<usize>,
    },

    /// List archives, oldest first
    Archives,

    /// Query the stack's health endpoint
    Health,

    /// Show the resolved configuration
    Config,
}

fn parse_snapshot_name(s: &str) -> Result<String, String> {
    if is_valid_archive_name(s) {
        Ok(s.to_string())
    } else {
        Err("use letters, digits, '.', '_' or '-'".to_string())
    }
}
