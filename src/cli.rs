// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

use crate::types::BackendType;

/// Command-line arguments for `fedplan`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "fedplan",
    version,
    about = "Register assets and run a federated compute plan described in a workspace file.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the workspace file (TOML).
    ///
    /// Default: `Fedplan.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Fedplan.toml")]
    pub config: String,

    /// Override `[client].backend`.
    #[arg(long, value_name = "BACKEND")]
    pub backend: Option<BackendType>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `FEDPLAN_LOG` or a default level will be used. Also
    /// forwarded to function processes as `--log-level`.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Seconds to wait for a remote compute plan to finish.
    #[arg(long, value_name = "SECS", default_value_t = 3600)]
    pub timeout: u64,

    /// Parse + validate, print the ranked plan, but don't register or run anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "debug",
        }
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
