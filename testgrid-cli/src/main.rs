// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;
use cli::Cli;
use color_eyre::Result;

mod app;
mod cli;
mod discovery;
mod exit_code;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match app::run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("{error:?}");
            std::process::exit(exit_code::UNKNOWN_ERROR)
        }
    }
}
