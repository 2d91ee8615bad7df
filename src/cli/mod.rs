//! Command-line front end
//!
//! One SFTP operation per invocation, run inside a scoped client so the pool
//! is drained before the process exits.

mod runner;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

pub use runner::{CommandOutput, execute, resolve_config, run};

/// pooled-sftp - SFTP file operations over a pooled connection
#[derive(Parser, Debug)]
#[command(name = "pooled-sftp")]
#[command(about = "SFTP client with connection pooling and automatic retry")]
#[command(version)]
#[command(after_help = "EXAMPLES:
    # List a remote directory using the default config file
    pooled-sftp ls /var/log

    # Upload with explicit credentials and a progress line
    pooled-sftp --host backup.lan --user admin --key ~/.ssh/id_ed25519 \\
        put ./dump.sql /srv/backups/dump.sql --progress

    # Mirror a remote tree locally and print the summary as JSON
    pooled-sftp --json get-dir /srv/www ./www")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub target: TargetArgs,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Connection flags; each one overrides the config file
#[derive(Args, Debug, Default, Clone)]
pub struct TargetArgs {
    /// Remote hostname
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Remote SSH port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Remote username
    #[arg(short, long, global = true)]
    pub user: Option<String>,

    /// Password authentication
    #[arg(long, global = true, conflicts_with_all = ["key", "agent"])]
    pub password: Option<String>,

    /// Private key authentication
    #[arg(long, global = true, conflicts_with = "agent")]
    pub key: Option<PathBuf>,

    /// SSH agent authentication
    #[arg(long, global = true)]
    pub agent: bool,

    /// Retries after the first attempt
    #[arg(long, global = true)]
    pub retries: Option<u32>,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// List a remote directory
    Ls {
        #[arg(default_value = ".")]
        path: String,

        /// Show size and permissions
        #[arg(short, long)]
        long: bool,
    },

    /// Show remote file attributes
    Stat { path: String },

    /// Upload a file
    Put {
        local: PathBuf,
        remote: String,

        /// Print a progress line
        #[arg(short, long)]
        progress: bool,
    },

    /// Download a file
    Get {
        remote: String,
        local: PathBuf,

        /// Print a progress line
        #[arg(short, long)]
        progress: bool,
    },

    /// Create a remote directory
    Mkdir {
        path: String,

        /// Octal permissions, e.g. 755
        #[arg(short, long, value_parser = parse_mode)]
        mode: Option<i32>,
    },

    /// Remove an empty remote directory
    Rmdir { path: String },

    /// Remove a remote file
    Rm { path: String },

    /// Check whether a remote path exists (exit code 1 if not)
    Exists { path: String },

    /// Upload a directory tree
    PutDir {
        local: PathBuf,
        remote: String,

        /// Print a progress line
        #[arg(short, long)]
        progress: bool,
    },

    /// Download a directory tree
    GetDir {
        remote: String,
        local: PathBuf,

        /// Print a progress line
        #[arg(short, long)]
        progress: bool,
    },
}

fn parse_mode(value: &str) -> Result<i32, String> {
    let digits = value.trim_start_matches("0o");
    i32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| (0..=0o7777).contains(mode))
        .ok_or_else(|| format!("invalid octal mode: {value}"))
}
