use anyhow::{Context as _, Result};
use clap::Parser;
use divvy::{
    config::{LogLevel, Slots},
    log,
    master::Master,
    spec::CommandTask,
};
use figment::{
    providers::{Env, Format as _, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::{path::PathBuf, process::ExitCode};

/// Run a task's work items across a pool of forked worker processes.
#[derive(Parser)]
#[command(version)]
#[command(
    after_help = "Configuration values can be specified in three ways: fields in a config file, \
environment variables, or command-line options. Command-line options have the highest \
precedence, followed by environment variables.

The configuration value 'log_level' would be set via the '--log-level' command-line option, \
the DIVVY_LOG_LEVEL environment variable, and the 'log_level' key in a configuration file.
"
)]
struct CliOptions {
    /// Path to the task definition file.
    task_file: PathBuf,

    /// Configuration file. Values set in the configuration file will be
    /// overridden by values set through environment variables and values
    /// set on the command line.
    #[arg(short = 'c', long, default_value = ".config/divvy.toml")]
    config_file: PathBuf,

    /// Print configuration and exit.
    #[arg(short = 'P', long)]
    print_config: bool,

    /// Number of worker processes to fork.
    #[arg(short = 'n', long)]
    slots: Option<Slots>,

    /// Minimum log level to output.
    #[arg(short = 'l', long)]
    log_level: Option<LogLevel>,
}

impl CliOptions {
    fn to_config_options(&self) -> ConfigOptions {
        ConfigOptions {
            slots: self.slots,
            log_level: self.log_level,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    /// Number of worker processes to fork.
    #[serde(default)]
    slots: Slots,

    /// Minimum log level to output.
    #[serde(default)]
    log_level: LogLevel,
}

#[skip_serializing_none]
#[derive(Default, Serialize)]
struct ConfigOptions {
    slots: Option<Slots>,
    log_level: Option<LogLevel>,
}

fn main() -> Result<ExitCode> {
    let cli_options = CliOptions::parse();
    let print_config = cli_options.print_config;
    let config: Config = Figment::new()
        .merge(Serialized::defaults(ConfigOptions::default()))
        .merge(Toml::file(&cli_options.config_file))
        .merge(Env::prefixed("DIVVY_"))
        .merge(Serialized::globals(cli_options.to_config_options()))
        .extract()
        .context("reading configuration")?;

    if print_config {
        println!("{config:#?}");
        return Ok(ExitCode::SUCCESS);
    }

    let task = CommandTask::load(&cli_options.task_file)?;
    log::run_with_logger(config.log_level, |log| {
        slog::info!(
            log, "starting";
            "task" => %cli_options.task_file.display(),
            "slots" => %config.slots
        );
        let mut master = Master::new(task, config.slots, log.clone());
        let summary = master.run()?;
        slog::info!(
            log, "run complete";
            "dispatched" => summary.dispatched,
            "skipped" => summary.skipped,
            "lost" => summary.lost,
            "worker_failures" => summary.worker_failures
        );
        Ok(ExitCode::SUCCESS)
    })
}
