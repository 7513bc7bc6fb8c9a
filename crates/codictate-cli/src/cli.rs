//! CLI argument definitions for the backup tool.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use codictate_backup::Scope;
use colorchoice_clap::Color;

#[derive(Parser)]
#[command(
    name = "codictate-backup",
    version,
    about = "Back up and restore Codictate user data",
    long_about = "Export Codictate history, dictionary, settings and recordings to a ZIP archive,\n\
                  and restore them through a staged import with a safety backup.\n\n\
                  Interrupted restores are resolved automatically on the next run."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Data directory (default: the platform data directory for Codictate).
    #[arg(long = "data-dir", value_name = "DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Adjust log verbosity (-v for debug, -vv for trace, -q for errors only).
    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,

    /// Control ANSI color output (auto, always, never).
    #[command(flatten)]
    pub color: Color,

    /// Explicit log level (overrides -v/-q flags).
    #[arg(long = "log-level", value_enum, global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Log output format (pretty for human, json for machine parsing).
    #[arg(
        long = "log-format",
        value_enum,
        default_value = "pretty",
        global = true
    )]
    pub log_format: LogFormatArg,

    /// Write logs to a file instead of stderr.
    #[arg(long = "log-file", value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Export the current data to a backup archive.
    Export(ExportArgs),

    /// Restore a backup archive over the current data.
    Restore(RestoreArgs),

    /// Validate an archive without changing anything.
    Verify(VerifyArgs),

    /// Show the running or interrupted operation and the last outcome.
    Status,

    /// Resolve a restore that was interrupted by a crash.
    Recover,

    /// Manage safety backups taken before restores.
    #[command(subcommand)]
    Safety(SafetyCommand),
}

#[derive(Args)]
pub struct ExportArgs {
    /// What to include in the archive.
    #[arg(long = "scope", value_enum, default_value = "full")]
    pub scope: ScopeArg,

    /// Archive file or directory (default: the current directory).
    #[arg(long = "output", short = 'o', value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Replace an existing archive at the destination.
    #[arg(long = "overwrite")]
    pub overwrite: bool,
}

#[derive(Args)]
pub struct RestoreArgs {
    /// Archive to restore.
    #[arg(value_name = "ARCHIVE")]
    pub archive: PathBuf,

    /// Continue when some history rows must be skipped.
    #[arg(long = "accept-partial", conflicts_with = "raise_limits")]
    pub accept_partial: bool,

    /// Raise the soft limits to fit this archive and save them.
    #[arg(long = "raise-limits")]
    pub raise_limits: bool,

    /// What to do when the safety backup cannot be created.
    #[arg(long = "safety-fallback", value_enum, default_value = "ask")]
    pub safety_fallback: SafetyFallbackArg,

    /// Delete the safety backup after a successful restore.
    #[arg(long = "discard-safety-backup")]
    pub discard_safety_backup: bool,

    /// Answer yes to confirmations instead of prompting.
    #[arg(long = "yes", short = 'y')]
    pub yes: bool,
}

#[derive(Args)]
pub struct VerifyArgs {
    /// Archive to validate.
    #[arg(value_name = "ARCHIVE")]
    pub archive: PathBuf,
}

#[derive(Subcommand)]
pub enum SafetyCommand {
    /// List safety backups, newest first.
    List,

    /// Delete automatic safety backups beyond the retention count.
    Prune,

    /// Keep a safety backup permanently.
    Keep {
        #[arg(value_name = "NAME")]
        name: String,

        /// Hand the backup back to automatic pruning instead.
        #[arg(long = "release")]
        release: bool,
    },

    /// Delete a safety backup.
    Discard {
        #[arg(value_name = "NAME")]
        name: String,

        /// Skip the confirmation prompt.
        #[arg(long = "yes", short = 'y')]
        yes: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ScopeArg {
    /// History, dictionary, settings and recordings.
    Full,
    /// Everything except recordings.
    Lightweight,
}

impl From<ScopeArg> for Scope {
    fn from(value: ScopeArg) -> Self {
        match value {
            ScopeArg::Full => Scope::Full,
            ScopeArg::Lightweight => Scope::Lightweight,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SafetyFallbackArg {
    /// Prompt when interactive, cancel otherwise.
    Ask,
    /// Fall back to a safety backup without recordings.
    Lightweight,
    Cancel,
}

/// CLI log level choices.
#[derive(Clone, Copy, ValueEnum)]
pub enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// CLI log format choices.
#[derive(Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}
