//! Codictate backup CLI.

use std::io::{self, IsTerminal};

use clap::{ColorChoice, Parser};
use codictate_cli::cli::{Cli, Command, LogFormatArg, LogLevelArg};
use codictate_cli::commands::{
    Session, exit_code, report_error, run_export, run_recover, run_restore, run_safety,
    run_status, run_verify,
};
use codictate_cli::logging::{LogConfig, LogFormat, init_logging};
use codictate_cli::prompt::Prompter;
use tracing::level_filters::LevelFilter;

fn main() {
    let cli = Cli::parse();
    cli.color.write_global();
    let log_config = log_config_from_cli(&cli);
    if let Err(error) = init_logging(&log_config) {
        eprintln!("error: failed to initialize logging: {error}");
        std::process::exit(1);
    }

    let verbose = cli.verbosity.tracing_level_filter() >= LevelFilter::INFO;
    let show_progress = !matches!(log_config.format, LogFormat::Json);
    let session = match Session::open(cli.data_dir.clone(), show_progress) {
        Ok(session) => session,
        Err(error) => {
            report_error(&error, verbose);
            std::process::exit(exit_code(&error));
        }
    };

    let result = match &cli.command {
        Command::Export(args) => run_export(&session, args).map(drop),
        Command::Restore(args) => run_restore(&session, args, Prompter::stdio(), verbose).map(drop),
        Command::Verify(args) => run_verify(&session, args).map(drop),
        Command::Status => run_status(&session),
        Command::Recover => run_recover(&session).map(drop),
        Command::Safety(command) => run_safety(&session, command, Prompter::stdio()),
    };
    let code = match result {
        Ok(()) => 0,
        Err(error) => {
            report_error(&error, verbose);
            exit_code(&error)
        }
    };
    std::process::exit(code);
}

/// Build logging configuration from CLI flags with consistent precedence.
fn log_config_from_cli(cli: &Cli) -> LogConfig {
    let mut config = LogConfig {
        level_filter: cli.verbosity.tracing_level_filter(),
        ..LogConfig::default()
    };
    config.use_env_filter = !(cli.verbosity.is_present() || cli.log_level.is_some());
    if let Some(level) = cli.log_level {
        config.level_filter = match level {
            LogLevelArg::Error => LevelFilter::ERROR,
            LogLevelArg::Warn => LevelFilter::WARN,
            LogLevelArg::Info => LevelFilter::INFO,
            LogLevelArg::Debug => LevelFilter::DEBUG,
            LogLevelArg::Trace => LevelFilter::TRACE,
        };
    }
    config.format = match cli.log_format {
        LogFormatArg::Pretty => LogFormat::Pretty,
        LogFormatArg::Compact => LogFormat::Compact,
        LogFormatArg::Json => LogFormat::Json,
    };
    config.log_file = cli.log_file.clone();
    config.with_ansi = match cli.color.color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => cli.log_file.is_none() && io::stderr().is_terminal(),
    };
    config
}
