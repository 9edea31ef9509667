// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command-line flags, matching the command surface enumerated in the
//! external-interfaces section of the design document.

use camino::Utf8PathBuf;
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "testgrid",
    about = "Parallel test dispatcher for a database server's regression suite"
)]
pub struct Cli {
    /// Directory to search for suites; each immediate subdirectory becomes
    /// one task group.
    #[arg(long, default_value = "tests")]
    pub suite_dir: Utf8PathBuf,

    /// Only include discovered tests whose relative path contains this
    /// substring.
    #[arg(long)]
    pub include: Option<String>,

    /// Exclude discovered tests whose relative path contains this substring.
    #[arg(long)]
    pub exclude: Option<String>,

    /// Configuration name to run each discovered test under. Repeatable; a
    /// test is scheduled once per configuration given, or once with an
    /// empty configuration name if none are given.
    #[arg(long = "config", value_name = "NAME")]
    pub configs: Vec<String>,

    /// Worker pool size. `0` means auto-detect (2x CPU count); `-1` means
    /// run every task in the controller process with no worker processes
    /// at all.
    #[arg(long, allow_hyphen_values = true, default_value_t = 0)]
    pub parallelism: i64,

    /// Keep running after a test fails instead of stopping the rest of the
    /// pool.
    #[arg(long)]
    pub force: bool,

    /// Seconds without output from any worker before the run is considered
    /// hung. A negative value disables the hang detector.
    #[arg(long, allow_hyphen_values = true, default_value_t = -1)]
    pub no_output_timeout: i64,

    /// The run is started under a debugger or profiler (gdb, lldb,
    /// valgrind, ...) and may legitimately sit silent for a long time;
    /// disables the hang detector regardless of `--no-output-timeout`.
    #[arg(long)]
    pub debugger: bool,

    /// The suite is known to contain long-running tests; disables the hang
    /// detector regardless of `--no-output-timeout`.
    #[arg(long = "long", alias = "long-tests")]
    pub long_tests: bool,

    /// Duration of worker silence before the hang detector's first warning,
    /// in humantime form (`30s`, `2m`, `1m 30s`, ...).
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "30s")]
    pub warn_timeout: Duration,

    /// Per-test timeout, in humantime form, passed through to the test
    /// driver.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "60s")]
    pub test_timeout: Duration,

    /// Server startup timeout, in humantime form, passed through to the
    /// test driver.
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, default_value = "20s")]
    pub server_start_timeout: Duration,

    /// Replay a previously recorded reproduce file instead of discovering
    /// suites. Forces pool size 1 and disables randomization.
    #[arg(long)]
    pub reproduce: Option<Utf8PathBuf>,

    /// Shuffle task order within each group, and group order itself, at
    /// startup.
    #[arg(long)]
    pub randomize: bool,

    /// Directory for logs, reproduce files, per-worker scratch space, and
    /// post-run artifacts.
    #[arg(long, default_value = "vardir")]
    pub vardir: Utf8PathBuf,

    /// The program each worker's driver runs once per task.
    #[arg(long, default_value = "true")]
    pub driver_program: String,

    /// An argument to pass to `--driver-program`, with `{test}` and
    /// `{config}` substituted. Repeatable.
    #[arg(long = "driver-arg")]
    pub driver_args: Vec<String>,
}

fn parse_duration(input: &str) -> Result<Duration, String> {
    humantime::parse_duration(input).map_err(|e| e.to_string())
}
