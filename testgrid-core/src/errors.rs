// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by testgrid.

use crate::message::TaskId;
use camino::Utf8PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error returned by the dispatcher.
///
/// Per-task failures (a test reporting `fail`) are *not* represented here --
/// they're local to the statistics observer and drive the fail-fast policy,
/// not the `Result` returned from running the dispatcher. This enum is for
/// structural failures: a run that could not even produce a trustworthy
/// result.
#[derive(Debug, Error)]
pub enum DispatcherError {
    /// The run was misconfigured in a way that must be caught before any
    /// process is spawned.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A worker process could not be spawned.
    #[error("failed to spawn worker `{worker_name}`")]
    SpawnWorker {
        worker_name: String,
        #[source]
        source: std::io::Error,
    },

    /// A line written by a worker could not be decoded as a [`Message`](crate::message::Message).
    /// Not fatal to the run -- the supervisor logs it and reaps the worker
    /// as if it had exited, same as any other abend -- but it's a real,
    /// constructed error rather than an ad hoc log line, so operators get
    /// the same message whether it's logged or (via `{:#}`) surfaced
    /// elsewhere.
    #[error("failed to decode message from worker `{worker_name}`")]
    IpcDecode {
        worker_name: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing the next task ID (or the stop marker) to a worker's stdin
    /// failed. Also not fatal: the worker may have already exited and the
    /// reaper will notice shortly.
    #[error("failed to send work item to worker `{worker_name}`")]
    IpcSend {
        worker_name: String,
        #[source]
        source: std::io::Error,
    },

    /// The reproduce file could not be written or read.
    #[error(transparent)]
    Reproduce(#[from] ReproduceError),
}

/// A configuration error detected during pre-flight validation, before the
/// event loop starts. Maps onto the specification's `FatalConfiguration`
/// taxonomy entry.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "inconsistent timeouts: no-output ({no_output:?}) must be >= \
         test-timeout + 10s ({test:?}), which must be >= server-start-timeout \
         + 20s ({server_start:?})"
    )]
    TimeoutOrdering {
        no_output: Duration,
        test: Duration,
        server_start: Duration,
    },

    #[error("reproduce file `{path}` could not be read")]
    ReproduceFileMissing {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no tasks were discovered; nothing to run")]
    NoTasks,
}

/// Failure modes specific to the reproduce recorder / replay parser.
#[derive(Debug, Error)]
pub enum ReproduceError {
    #[error("failed to open reproduce file `{path}` for appending")]
    Open {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to append task {task_id:?} to reproduce file `{path}`")]
    Append {
        path: Utf8PathBuf,
        task_id: TaskId,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed reproduce line {line_no} in `{path}`: {text:?}")]
    Parse {
        path: Utf8PathBuf,
        line_no: usize,
        text: String,
        #[source]
        source: serde_json::Error,
    },
}
