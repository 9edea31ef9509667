// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wires parsed CLI flags into a complete run: configuration validation,
//! suite discovery (or reproduce replay), and dispatch through either the
//! multi-process dispatcher or the in-controller fast path.

use crate::cli::Cli;
use crate::discovery;
use camino::Utf8PathBuf;
use color_eyre::eyre::{eyre, Context, Result};
use rand::seq::SliceRandom;
use std::time::Duration;
use testgrid_core::config::{Parallelism, RunnerConfig};
use testgrid_core::dispatcher::{run_in_controller, CommandWorkerLauncher, Dispatcher};
use testgrid_core::driver::CommandDriver;
use testgrid_core::errors::ConfigError;
use testgrid_core::observers::{
    ConsoleMultiplexer, FailFastTrigger, HangDetector, LogSink, ObserverSet, StatisticsAggregator,
};
use testgrid_core::reproduce::parse_reproduce_file;
use testgrid_core::signal::SignalHandler;

pub async fn run(cli: Cli) -> Result<i32> {
    let config = build_runner_config(&cli)
        .validate()
        .wrap_err("invalid run configuration")?;

    let mut task_groups = if let Some(path) = &config.reproduce {
        let task_ids = parse_reproduce_file(path).wrap_err("failed to parse reproduce file")?;
        vec![("reproduce".to_string(), task_ids)]
    } else {
        discovery::discover_groups(
            &cli.suite_dir,
            cli.include.as_deref(),
            cli.exclude.as_deref(),
            &cli.configs,
        )
        .wrap_err("failed to discover suites")?
    };

    if task_groups.iter().all(|(_, tasks)| tasks.is_empty()) {
        return Err(ConfigError::NoTasks.into());
    }

    if config.randomize {
        let mut rng = rand::thread_rng();
        task_groups.shuffle(&mut rng);
        for (_, task_ids) in &mut task_groups {
            task_ids.shuffle(&mut rng);
        }
    }

    std::fs::create_dir_all(&config.vardir).wrap_err("failed to create var directory")?;

    if matches!(config.parallelism, Parallelism::InController) {
        return run_in_controller_mode(config, task_groups).await;
    }

    let launcher = CommandWorkerLauncher::new(worker_binary_path()?, Vec::new());
    let dispatcher =
        Dispatcher::new(config, launcher, task_groups).wrap_err("failed to initialize dispatcher")?;
    let mut signals = SignalHandler::new().wrap_err("failed to install signal handlers")?;
    let report = dispatcher.run(&mut signals).await.wrap_err("run failed")?;

    print_summary(&report.statistics);
    for (group, tasks) in &report.undone {
        for task in tasks {
            eprintln!("undone: {group}/{task}");
        }
    }

    Ok(report.outcome.exit_code())
}

async fn run_in_controller_mode(
    config: RunnerConfig,
    task_groups: Vec<(String, Vec<testgrid_core::message::TaskId>)>,
) -> Result<i32> {
    let driver = CommandDriver::new(config.driver_program.clone(), config.driver_args.clone());

    let mut observers = ObserverSet::new();
    observers.register(Box::new(StatisticsAggregator::default()));
    observers.register(Box::new(
        LogSink::new(&config.vardir).wrap_err("failed to open log sink")?,
    ));
    observers.register(Box::new(ConsoleMultiplexer::new()));
    observers.register(Box::new(FailFastTrigger::new(config.force)));
    observers.register(Box::new(HangDetector::disabled()));

    let outcome = run_in_controller(task_groups, &driver, &mut observers).await;
    let statistics = observers.take_statistics();
    print_summary(&statistics);
    Ok(outcome.exit_code())
}

fn build_runner_config(cli: &Cli) -> RunnerConfig {
    let no_output_timeout = if cli.no_output_timeout < 0 {
        None
    } else {
        Some(Duration::from_secs(cli.no_output_timeout as u64))
    };
    RunnerConfig {
        parallelism: Parallelism::from_cli_value(cli.parallelism),
        force: cli.force,
        no_output_timeout,
        debugger: cli.debugger,
        long_tests: cli.long_tests,
        warn_timeout: cli.warn_timeout,
        test_timeout: cli.test_timeout,
        server_start_timeout: cli.server_start_timeout,
        reproduce: cli.reproduce.clone(),
        randomize: cli.randomize,
        vardir: cli.vardir.clone(),
        driver_program: cli.driver_program.clone(),
        driver_args: cli.driver_args.clone(),
    }
}

/// The worker binary ships alongside the controller binary; this assumes
/// the usual `cargo build`/install layout where both land in the same
/// directory rather than requiring `testgrid-worker` on `PATH`.
fn worker_binary_path() -> Result<Utf8PathBuf> {
    let exe = std::env::current_exe().wrap_err("failed to locate current executable")?;
    let dir = exe
        .parent()
        .ok_or_else(|| eyre!("current executable has no parent directory"))?;
    let binary_name = if cfg!(windows) {
        "testgrid-worker.exe"
    } else {
        "testgrid-worker"
    };
    Utf8PathBuf::from_path_buf(dir.join(binary_name))
        .map_err(|raw| eyre!("non-utf8 worker binary path: {raw:?}"))
}

fn print_summary(statistics: &StatisticsAggregator) {
    let summary = statistics.summary();
    if !summary.is_empty() {
        eprint!("{summary}");
    }
}
