// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Thin entry point for a worker process: decodes its [`WorkerConfig`] from
//! the environment, wires stdin/stdout to the line-delimited protocol, and
//! hands off to [`run_worker_harness`]. All of the actual protocol logic
//! lives in `testgrid-core`; this binary exists only because a worker needs
//! to be a separate OS process.

use color_eyre::eyre::{Context, Result};
use testgrid_core::driver::CommandDriver;
use testgrid_core::worker::{run_worker_harness, SigTermFlag, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let raw_config = std::env::var(WorkerConfig::ENV_VAR).wrap_err_with(|| {
        format!(
            "missing {} in environment; testgrid-worker is not meant to be run directly",
            WorkerConfig::ENV_VAR
        )
    })?;
    let config = WorkerConfig::from_env_value(&raw_config)
        .wrap_err("failed to decode worker configuration")?;

    tracing::info!(worker = %config.worker_name, group = %config.group_key, "worker starting");

    let driver = CommandDriver::new(config.driver_program.clone(), config.driver_args.clone());

    let sigterm = SigTermFlag::new();
    sigterm.install();

    let stdin = testgrid_core::ipc::buffered(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    run_worker_harness(&config, &driver, stdin, stdout, &sigterm, || {
        tracing::debug!(worker = %config.worker_name, "stopping server");
    })
    .await
    .wrap_err("worker harness exited with an I/O error")?;

    tracing::info!(worker = %config.worker_name, "worker exiting");
    Ok(())
}
