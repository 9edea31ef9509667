// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker harness (component C2).
//!
//! This module is the logic that actually runs inside a worker process. The
//! `testgrid-worker` binary crate is a thin wrapper: it decodes a
//! [`WorkerConfig`] from its environment, builds a driver, and calls
//! [`run_worker_harness`]. Keeping the harness itself in this library crate
//! means it can be exercised directly in tests without spawning a real
//! subprocess.

use crate::driver::Driver;
use crate::ipc;
use crate::message::{Message, ShortStatus, TaskId};
use crate::reproduce::ReproduceRecorder;
use crate::task::WorkItem;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite};

/// Everything a worker needs to know about the suite it's bound to. Passed
/// from the controller to the worker process as a single JSON-encoded
/// environment variable (`TESTGRID_WORKER_CONFIG`) at spawn time, keeping
/// stdin reserved exclusively for the `TaskId | Stop` protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub group_key: String,
    pub worker_id: u32,
    pub worker_name: String,
    /// This worker's own exclusive scratch subdirectory
    /// (`<controller_vardir>/<worker_name>`), used for task result paths.
    pub vardir: Utf8PathBuf,
    /// The controller's shared vardir, whose `reproduce/` subdirectory this
    /// worker appends its reproduce file to. Distinct from `vardir`: per the
    /// shared-resource policy, a worker owns its own subdirectory exclusively
    /// but `reproduce/`, like `log/` and `artifacts/`, is controller-owned.
    pub controller_vardir: Utf8PathBuf,
    /// If true, a failing task does not stop the worker (force mode).
    pub force: bool,
    /// The command the worker's driver runs per task; see
    /// [`crate::driver::CommandDriver`] for the `{test}`/`{config}`
    /// substitution rules.
    pub driver_program: String,
    pub driver_args: Vec<String>,
}

impl WorkerConfig {
    pub const ENV_VAR: &'static str = "TESTGRID_WORKER_CONFIG";

    pub fn to_env_value(&self) -> String {
        serde_json::to_string(self).expect("WorkerConfig is always serializable")
    }

    pub fn from_env_value(value: &str) -> serde_json::Result<Self> {
        serde_json::from_str(value)
    }
}

/// A flag flipped by a signal-handling task when the worker's termination
/// signal arrives. Checked cooperatively after each task, matching the
/// specification's `sigTermReceived` flag.
#[derive(Clone, Default)]
pub struct SigTermFlag(Arc<AtomicBool>);

impl SigTermFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Spawns a task that sets the flag when SIGTERM arrives (a no-op on
    /// platforms without that signal).
    pub fn install(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                if let Ok(mut term) =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                {
                    term.recv().await;
                    flag.set();
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
                flag.set();
            }
        });
    }
}

/// Runs the worker's main loop to completion against `stdin`/`stdout`,
/// exactly as described in the specification: pop task IDs until `Stop`,
/// run each through `driver`, publish messages, honor fail-stop and
/// sig-term-stop policy.
///
/// The caller is responsible for having already "started the suite's
/// server" (an external collaborator out of this crate's scope) before
/// calling this, and for stopping it afterwards; `on_stop_server` is called
/// at every point the specification calls for `stop_server()`.
pub async fn run_worker_harness<R, W, D, F>(
    config: &WorkerConfig,
    driver: &D,
    mut stdin: R,
    mut stdout: W,
    sigterm: &SigTermFlag,
    mut on_stop_server: F,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    D: Driver,
    F: FnMut(),
{
    let recorder = ReproduceRecorder::new(&config.controller_vardir, &config.worker_name)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    let emit = |message: Message| crate::message::Envelope {
        worker_id: config.worker_id,
        worker_name: config.worker_name.clone(),
        message,
    };

    loop {
        let Some(item): Option<WorkItem> = ipc::read_line(&mut stdin).await? else {
            // Stdin closed unexpectedly (controller went away). Treat the
            // same as a stop marker: clean up and exit.
            on_stop_server();
            let env = emit(Message::Done { synthesized: false });
            ipc::write_line(&mut stdout, &env).await?;
            return Ok(());
        };

        let task_id = match item {
            WorkItem::Stop => {
                on_stop_server();
                let env = emit(Message::Done { synthesized: false });
                ipc::write_line(&mut stdout, &env).await?;
                return Ok(());
            }
            WorkItem::Task(task_id) => task_id,
        };

        if let Err(e) = recorder.record(&task_id) {
            tracing::warn!(error = %e, "failed to append to reproduce file");
        }

        let tmp_result_path = config.vardir.join(format!("{}.tmp.result", task_id));
        let result_path = config.vardir.join(format!("{}.result", task_id));
        let env = emit(Message::CurrentTask {
            task_id: task_id.clone(),
            tmp_result_path,
            result_path,
        });
        ipc::write_line(&mut stdout, &env).await?;

        // The driver streams output fragments over this channel as the task
        // runs, rather than handing back one buffered string once it's
        // done; forwarding it here, concurrently with `run_fut` still being
        // polled, is what lets a chatty task look different from a hung one.
        let (output_tx, mut output_rx) = tokio::sync::mpsc::unbounded_channel();
        let run_result = {
            let run_fut = driver.run(&task_id, &output_tx);
            tokio::pin!(run_fut);
            loop {
                tokio::select! {
                    result = &mut run_fut => break result,
                    Some(text) = output_rx.recv() => {
                        let env = emit(Message::Output { text, log_only: false });
                        ipc::write_line(&mut stdout, &env).await?;
                    }
                }
            }
        };
        drop(output_tx);
        while let Some(text) = output_rx.recv().await {
            let env = emit(Message::Output { text, log_only: false });
            ipc::write_line(&mut stdout, &env).await?;
        }

        let short_status = match run_result {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(task = %task_id, error = %e, "driver failed; stopping worker");
                let env = emit(Message::TaskResult {
                    task_id: task_id.clone(),
                    short_status: ShortStatus::Fail,
                });
                ipc::write_line(&mut stdout, &env).await?;
                drain_remaining_as_not_run(&mut stdin, &mut stdout, config).await?;
                on_stop_server();
                let env = emit(Message::Done { synthesized: false });
                ipc::write_line(&mut stdout, &env).await?;
                return Ok(());
            }
        };

        let env = emit(Message::TaskResult {
            task_id: task_id.clone(),
            short_status,
        });
        ipc::write_line(&mut stdout, &env).await?;

        if short_status == ShortStatus::Fail && !config.force {
            on_stop_server();
            let env = emit(Message::Done { synthesized: false });
            ipc::write_line(&mut stdout, &env).await?;
            return Ok(());
        }

        if sigterm.is_set() {
            on_stop_server();
            let env = emit(Message::Done { synthesized: false });
            ipc::write_line(&mut stdout, &env).await?;
            return Ok(());
        }
    }
}

/// Drains the rest of the controller's input queue, reporting every
/// remaining task as `not_run`, used after an unhandled driver error. The
/// worker keeps consuming until it reaches the stop marker so the
/// controller's input queue for this worker is fully spent.
async fn drain_remaining_as_not_run<R, W>(
    stdin: &mut R,
    stdout: &mut W,
    config: &WorkerConfig,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(item): Option<WorkItem> = ipc::read_line(stdin).await? else {
            return Ok(());
        };
        let task_id = match item {
            WorkItem::Stop => return Ok(()),
            WorkItem::Task(task_id) => task_id,
        };
        let envelope = crate::message::Envelope {
            worker_id: config.worker_id,
            worker_name: config.worker_name.clone(),
            message: Message::TaskResult {
                task_id,
                short_status: ShortStatus::NotRun,
            },
        };
        ipc::write_line(stdout, &envelope).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::buffered;
    use async_trait::async_trait;
    use tokio::sync::mpsc::UnboundedSender;

    struct ScriptedDriver {
        verdicts: std::sync::Mutex<std::collections::HashMap<String, ShortStatus>>,
    }

    #[async_trait]
    impl Driver for ScriptedDriver {
        async fn run(
            &self,
            task_id: &TaskId,
            output_tx: &UnboundedSender<String>,
        ) -> std::io::Result<ShortStatus> {
            let status = self
                .verdicts
                .lock()
                .unwrap()
                .get(&task_id.test_name)
                .copied()
                .unwrap_or(ShortStatus::Pass);
            let _ = output_tx.send(format!("ran {}\n", task_id.test_name));
            Ok(status)
        }
    }

    fn config(dir: &std::path::Path) -> WorkerConfig {
        let controller_vardir = Utf8PathBuf::from_path_buf(dir.to_path_buf()).unwrap();
        WorkerConfig {
            group_key: "suite".to_string(),
            worker_id: 1,
            worker_name: "01_suite".to_string(),
            vardir: controller_vardir.join("01_suite"),
            controller_vardir,
            force: false,
            driver_program: "true".to_string(),
            driver_args: Vec::new(),
        }
    }

    #[tokio::test]
    async fn happy_path_runs_every_task_then_done() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let driver = ScriptedDriver {
            verdicts: Default::default(),
        };
        let sigterm = SigTermFlag::new();

        let (mut input_writer, input_reader) = tokio::io::duplex(65536);
        let (output_writer, output_reader) = tokio::io::duplex(65536);

        for item in [
            WorkItem::Task(TaskId::new("t1", "")),
            WorkItem::Task(TaskId::new("t2", "")),
            WorkItem::Stop,
        ] {
            ipc::write_work_item(&mut input_writer, &item).await.unwrap();
        }

        let mut stopped = 0;
        run_worker_harness(
            &cfg,
            &driver,
            buffered(input_reader),
            output_writer,
            &sigterm,
            || stopped += 1,
        )
        .await
        .unwrap();

        assert_eq!(stopped, 1);

        let mut reader = buffered(output_reader);
        let mut results = Vec::new();
        while let Some(envelope) = ipc::read_envelope(&mut reader).await.unwrap() {
            results.push(envelope.message);
        }
        let result_count = results
            .iter()
            .filter(|m| matches!(m, Message::TaskResult { .. }))
            .count();
        assert_eq!(result_count, 2);
        assert!(matches!(results.last(), Some(Message::Done { .. })));
    }

    #[tokio::test]
    async fn failing_task_stops_worker_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let mut verdicts = std::collections::HashMap::new();
        verdicts.insert("t1".to_string(), ShortStatus::Fail);
        let driver = ScriptedDriver {
            verdicts: std::sync::Mutex::new(verdicts),
        };
        let sigterm = SigTermFlag::new();

        let (mut input_writer, input_reader) = tokio::io::duplex(65536);
        let (output_writer, output_reader) = tokio::io::duplex(65536);

        for item in [
            WorkItem::Task(TaskId::new("t1", "")),
            WorkItem::Task(TaskId::new("t2", "")),
            WorkItem::Stop,
        ] {
            ipc::write_work_item(&mut input_writer, &item).await.unwrap();
        }

        run_worker_harness(&cfg, &driver, buffered(input_reader), output_writer, &sigterm, || {})
            .await
            .unwrap();

        let mut reader = buffered(output_reader);
        let mut task_results = Vec::new();
        while let Some(envelope) = ipc::read_envelope(&mut reader).await.unwrap() {
            if let Message::TaskResult { task_id, .. } = &envelope.message {
                task_results.push(task_id.test_name.clone());
            }
        }
        // t2 was never reached -- the worker stopped right after t1 failed.
        assert_eq!(task_results, vec!["t1".to_string()]);
    }

    #[test]
    fn worker_config_round_trips_through_env_value() {
        let cfg = config(std::path::Path::new("/tmp/vardir"));
        let env_value = cfg.to_env_value();
        let decoded = WorkerConfig::from_env_value(&env_value).unwrap();
        assert_eq!(decoded.worker_name, cfg.worker_name);
        assert_eq!(decoded.force, cfg.force);
    }
}
