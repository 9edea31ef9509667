// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The dispatcher (component C4): owns the worker pool, drives the single
//! event loop that fans worker messages out to observers, reaps dead
//! processes, and orchestrates shutdown.
//!
//! Everything here runs on one task. The only other tasks in the process
//! are the per-worker supervisors spawned by [`Dispatcher::spawn_one_worker`],
//! and each of those does nothing but race a worker's stdout against its
//! exit status and forward what it sees onto a single shared channel. No
//! lock is needed anywhere in this module because all mutation happens on
//! the event-loop task that owns `self`.

use crate::config::RunnerConfig;
use crate::driver::Driver;
use crate::errors::DispatcherError;
use crate::message::{Envelope, Message, ShortStatus, TaskId};
use crate::observers::{
    ConsoleMultiplexer, FailFastTrigger, HangDetector, LogSink, ObserverAction, ObserverSet,
    StatisticsAggregator,
};
use crate::signal::{self, SignalEvent, SignalHandler};
use crate::task::{TaskGroup, WorkItem};
use crate::worker::WorkerConfig;
use async_trait::async_trait;
use camino::Utf8PathBuf;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const IDLE_POLL_PERIOD: Duration = Duration::from_secs(1);

/// How a run concluded, in priority order when more than one condition was
/// true at once (e.g. the run both hung and had already recorded a
/// failure): an interrupt always wins, then a hang, then an ordinary test
/// failure, then leftover undone tasks, then success.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    Success,
    TestFailed,
    Undone,
    Hang,
    Interrupted,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::Hang => 1,
            RunOutcome::Interrupted => 2,
            RunOutcome::TestFailed => 3,
            RunOutcome::Undone => 4,
        }
    }
}

/// The final report handed back to the CLI layer once the event loop exits.
pub struct RunReport {
    pub outcome: RunOutcome,
    pub statistics: StatisticsAggregator,
    pub undone: HashMap<String, Vec<TaskId>>,
}

pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// A handle onto a spawned worker's process identity and lifetime,
/// decoupled from its stdin/stdout streams so tests can substitute a
/// duplex pipe for the streams while still exercising a real (or fake)
/// process lifecycle for reaping.
#[async_trait]
pub trait WorkerProcessHandle: Send {
    fn pid(&self) -> Option<u32>;
    async fn wait(&mut self) -> std::io::Result<ExitStatus>;
}

/// What [`WorkerLauncher::launch`] hands back: the worker's half of the
/// line-delimited protocol pipes, plus a handle for waiting on / signaling
/// the underlying process.
pub struct LaunchedWorker {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub handle: Box<dyn WorkerProcessHandle>,
}

/// Spawns the OS process for a worker bound to `config`. The only shipped
/// implementation is [`CommandWorkerLauncher`]; tests substitute a fake that
/// runs the worker harness in-process against a duplex pipe instead of a
/// real child.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, config: &WorkerConfig) -> std::io::Result<LaunchedWorker>;
}

struct RealChildHandle(tokio::process::Child);

#[async_trait]
impl WorkerProcessHandle for RealChildHandle {
    fn pid(&self) -> Option<u32> {
        self.0.id()
    }

    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.0.wait().await
    }
}

/// Launches `<program> <extra_args...>` with [`WorkerConfig::ENV_VAR`] set to
/// the worker's JSON-encoded configuration, stdin/stdout piped for the
/// line-delimited protocol, and stderr inherited so a worker's own panics
/// still reach the terminal. On Unix the child is made its own process
/// group leader so a single signal reaches any grandchildren it spawns.
pub struct CommandWorkerLauncher {
    pub program: Utf8PathBuf,
    pub extra_args: Vec<String>,
}

impl CommandWorkerLauncher {
    pub fn new(program: impl Into<Utf8PathBuf>, extra_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            extra_args,
        }
    }
}

#[async_trait]
impl WorkerLauncher for CommandWorkerLauncher {
    async fn launch(&self, config: &WorkerConfig) -> std::io::Result<LaunchedWorker> {
        let mut command = tokio::process::Command::new(self.program.as_str());
        command
            .args(&self.extra_args)
            .env(WorkerConfig::ENV_VAR, config.to_env_value())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        {
            command.process_group(0);
        }
        let mut child = command.spawn()?;
        let stdin = child.stdin.take().expect("worker stdin was piped");
        let stdout = child.stdout.take().expect("worker stdout was piped");
        Ok(LaunchedWorker {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            handle: Box::new(RealChildHandle(child)),
        })
    }
}

struct WorkerHandle {
    group_key: String,
    worker_name: String,
    pid: u32,
}

/// Owns the pool, the per-group queues, the observer set, and the event
/// loop. Built once per run via [`Dispatcher::new`] and consumed by
/// [`Dispatcher::run`].
pub struct Dispatcher<L: WorkerLauncher> {
    config: RunnerConfig,
    launcher: L,
    groups: HashMap<String, TaskGroup>,
    group_order: Vec<String>,
    next_group_cursor: usize,
    observers: ObserverSet,
    output_tx: UnboundedSender<Envelope>,
    output_rx: UnboundedReceiver<Envelope>,
    worker_stdins: HashMap<u32, BoxedWriter>,
    workers: HashMap<u32, WorkerHandle>,
    next_worker_id: u32,
    active_workers: usize,
    resolved_parallelism: usize,
    supervisor_tasks: Vec<JoinHandle<()>>,
    fail_fast_fired: bool,
    kill_fired: bool,
    interrupted: bool,
}

impl<L: WorkerLauncher> Dispatcher<L> {
    /// Builds a dispatcher over `task_groups` (key, task IDs in whatever
    /// order they should be attempted in -- the caller is responsible for
    /// shuffling if `config.randomize` is set). Registers the five fixed
    /// observers in the order the specification lists them.
    pub fn new(
        config: RunnerConfig,
        launcher: L,
        task_groups: Vec<(String, Vec<TaskId>)>,
    ) -> std::io::Result<Self> {
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let mut groups = HashMap::new();
        let mut group_order = Vec::new();
        for (key, task_ids) in task_groups {
            group_order.push(key.clone());
            groups.insert(key.clone(), TaskGroup::new(key, task_ids, output_tx.clone()));
        }

        let total_tasks: usize = groups.values().map(|g| g.task_count()).sum();
        let resolved_parallelism = config.parallelism.resolve(total_tasks);

        let mut observers = ObserverSet::new();
        observers.register(Box::new(StatisticsAggregator::default()));
        observers.register(Box::new(LogSink::new(&config.vardir)?));
        observers.register(Box::new(ConsoleMultiplexer::new()));
        observers.register(Box::new(FailFastTrigger::new(config.force)));
        observers.register(Box::new(if config.hang_detector_enabled() {
            HangDetector::new(
                true,
                config.warn_timeout,
                config.no_output_timeout.expect("checked by hang_detector_enabled"),
            )
        } else {
            HangDetector::disabled()
        }));

        Ok(Self {
            config,
            launcher,
            groups,
            group_order,
            next_group_cursor: 0,
            observers,
            output_tx,
            output_rx,
            worker_stdins: HashMap::new(),
            workers: HashMap::new(),
            next_worker_id: 1,
            active_workers: 0,
            resolved_parallelism,
            supervisor_tasks: Vec::new(),
            fail_fast_fired: false,
            kill_fired: false,
            interrupted: false,
        })
    }

    /// Runs the whole suite to completion: spawns the initial pool, drives
    /// the event loop until every worker has been reaped, joins every
    /// supervisor task, and writes the post-run artifacts directory.
    pub async fn run(mut self, signals: &mut SignalHandler) -> Result<RunReport, DispatcherError> {
        assert!(
            self.resolved_parallelism > 0,
            "Parallelism::InController must be routed to run_in_controller, never to Dispatcher::run"
        );

        while self.active_workers < self.resolved_parallelism {
            if !self.spawn_one_worker().await? {
                break;
            }
        }

        let mut ticker = tokio::time::interval(IDLE_POLL_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.active_workers > 0 {
            tokio::select! {
                envelope = self.output_rx.recv() => {
                    match envelope {
                        Some(envelope) => self.handle_envelope(envelope).await?,
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    let action = self.observers.dispatch_idle(IDLE_POLL_PERIOD);
                    self.apply_action(action)?;
                }
                event = signals.recv() => {
                    if let Some(event) = event {
                        self.handle_signal(event);
                    }
                }
            }
        }

        for handle in self.supervisor_tasks.drain(..) {
            let _ = handle.await;
        }

        let statistics = self.observers.take_statistics();
        let undone: HashMap<String, Vec<TaskId>> = self
            .groups
            .iter()
            .map(|(key, group)| (key.clone(), group.undone()))
            .collect();

        let outcome = if self.interrupted {
            RunOutcome::Interrupted
        } else if self.kill_fired {
            RunOutcome::Hang
        } else if statistics.any_failed() {
            RunOutcome::TestFailed
        } else if undone.values().any(|tasks| !tasks.is_empty()) {
            RunOutcome::Undone
        } else {
            RunOutcome::Success
        };

        self.collect_artifacts(&statistics)
            .map_err(|source| DispatcherError::SpawnWorker {
                worker_name: "artifacts".to_string(),
                source,
            })?;

        Ok(RunReport {
            outcome,
            statistics,
            undone,
        })
    }

    fn pick_group_for_new_worker(&mut self) -> Option<String> {
        let n = self.group_order.len();
        for offset in 0..n {
            let idx = (self.next_group_cursor + offset) % n;
            let key = &self.group_order[idx];
            if !self.groups.get(key).expect("group exists").is_finalized() {
                self.next_group_cursor = (idx + 1) % n;
                return Some(key.clone());
            }
        }
        None
    }

    async fn spawn_one_worker(&mut self) -> Result<bool, DispatcherError> {
        let Some(group_key) = self.pick_group_for_new_worker() else {
            return Ok(false);
        };

        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;
        let worker_name = format!("{worker_id:03}_{group_key}");

        let worker_config = WorkerConfig {
            group_key: group_key.clone(),
            worker_id,
            worker_name: worker_name.clone(),
            vardir: self.config.vardir.join(&worker_name),
            controller_vardir: self.config.vardir.clone(),
            force: self.config.force,
            driver_program: self.config.driver_program.clone(),
            driver_args: self.config.driver_args.clone(),
        };
        std::fs::create_dir_all(&worker_config.vardir).map_err(|source| {
            DispatcherError::SpawnWorker {
                worker_name: worker_name.clone(),
                source,
            }
        })?;

        let launched = self.launcher.launch(&worker_config).await.map_err(|source| {
            DispatcherError::SpawnWorker {
                worker_name: worker_name.clone(),
                source,
            }
        })?;
        let LaunchedWorker {
            stdin,
            stdout,
            handle,
        } = launched;
        let pid = handle.pid().unwrap_or(0);

        self.worker_stdins.insert(worker_id, stdin);
        self.workers.insert(
            worker_id,
            WorkerHandle {
                group_key: group_key.clone(),
                worker_name: worker_name.clone(),
                pid,
            },
        );
        self.active_workers += 1;
        self.groups
            .get_mut(&group_key)
            .expect("group exists")
            .register_worker(worker_id);

        info!(worker = %worker_name, group = %group_key, "spawned worker");

        let task_handle = tokio::spawn(supervise_worker(
            worker_id,
            worker_name,
            handle,
            stdout,
            self.output_tx.clone(),
        ));
        self.supervisor_tasks.push(task_handle);

        self.advance_worker(worker_id).await?;
        Ok(true)
    }

    async fn advance_worker(&mut self, worker_id: u32) -> Result<(), DispatcherError> {
        let Some(handle) = self.workers.get(&worker_id) else {
            return Ok(());
        };
        let item = if self.fail_fast_fired || self.kill_fired {
            WorkItem::Stop
        } else {
            self.groups
                .get_mut(&handle.group_key)
                .expect("group exists")
                .next_work_item()
        };
        self.write_to_worker(worker_id, &item).await
    }

    async fn write_to_worker(&mut self, worker_id: u32, item: &WorkItem) -> Result<(), DispatcherError> {
        let Some(stdin) = self.worker_stdins.get_mut(&worker_id) else {
            return Ok(());
        };
        if let Err(source) = crate::ipc::write_work_item(stdin, item).await {
            let worker_name = self
                .workers
                .get(&worker_id)
                .map(|w| w.worker_name.clone())
                .unwrap_or_else(|| worker_id.to_string());
            let err = DispatcherError::IpcSend { worker_name, source };
            // The worker may have already exited; the reaper will notice and
            // synthesize its Done shortly. Don't treat this as fatal.
            debug!(worker_id, error = %err, "failed to write work item");
        }
        Ok(())
    }

    async fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), DispatcherError> {
        let action = self.observers.dispatch_message(&envelope);

        if let Message::TaskResult { task_id, .. } = &envelope.message {
            if let Some(handle) = self.workers.get(&envelope.worker_id) {
                self.groups
                    .get_mut(&handle.group_key)
                    .expect("group exists")
                    .mark_done(task_id);
            }
        }

        self.apply_action(action)?;

        if matches!(envelope.message, Message::TaskResult { .. }) {
            self.advance_worker(envelope.worker_id).await?;
        }

        if envelope.message.is_done() {
            self.reap_worker(envelope.worker_id).await?;
        }

        Ok(())
    }

    async fn reap_worker(&mut self, worker_id: u32) -> Result<(), DispatcherError> {
        self.worker_stdins.remove(&worker_id);
        if let Some(handle) = self.workers.remove(&worker_id) {
            if let Some(group) = self.groups.get_mut(&handle.group_key) {
                group.finalize();
            }
        }
        self.active_workers = self.active_workers.saturating_sub(1);

        if !(self.fail_fast_fired || self.kill_fired) {
            while self.active_workers < self.resolved_parallelism {
                if !self.spawn_one_worker().await? {
                    break;
                }
            }
        }
        Ok(())
    }

    fn apply_action(&mut self, action: ObserverAction) -> Result<(), DispatcherError> {
        match action {
            ObserverAction::None => Ok(()),
            ObserverAction::TerminateAll => {
                self.terminate_all();
                Ok(())
            }
            ObserverAction::KillAll => {
                self.kill_all();
                Ok(())
            }
        }
    }

    fn terminate_all(&mut self) {
        if self.fail_fast_fired {
            return;
        }
        self.fail_fast_fired = true;
        for group in self.groups.values_mut() {
            group.finalize();
        }
        for handle in self.workers.values() {
            signal::terminate_process_group(handle.pid);
        }
    }

    fn kill_all(&mut self) {
        self.kill_fired = true;
        for group in self.groups.values_mut() {
            group.finalize();
        }
        for handle in self.workers.values() {
            signal::kill_process_group(handle.pid);
        }
    }

    fn handle_signal(&mut self, event: SignalEvent) {
        if !self.interrupted {
            info!(?event, "run interrupted; shutting down gracefully");
            self.interrupted = true;
            self.terminate_all();
        } else {
            warn!(?event, "second interrupt received; killing workers");
            self.kill_all();
        }
    }

    /// Copies the log file, reproduce file, and worker `vardir` subtree for
    /// every worker that produced a failing task, into
    /// `<vardir>/artifacts/<worker_name>/`. Socket files are skipped since
    /// they're transient and meaningless once the worker is gone.
    fn collect_artifacts(&self, statistics: &StatisticsAggregator) -> std::io::Result<()> {
        let artifacts_root = self.config.vardir.join("artifacts");
        for worker_name in statistics.failed_worker_names() {
            let dest = artifacts_root.join(&worker_name);
            std::fs::create_dir_all(&dest)?;

            let log_src = self.config.vardir.join("log").join(format!("{worker_name}.log"));
            copy_if_exists(&log_src, &dest.join(format!("{worker_name}.log")))?;

            let reproduce_src = self
                .config
                .vardir
                .join("reproduce")
                .join(format!("{worker_name}.tests.txt"));
            copy_if_exists(
                &reproduce_src,
                &dest.join(format!("{worker_name}.tests.txt")),
            )?;

            let worker_vardir = self.config.vardir.join(&worker_name);
            if worker_vardir.is_dir() {
                copy_dir_excluding_sockets(&worker_vardir, &dest.join("vardir"))?;
            }
        }
        Ok(())
    }
}

fn copy_if_exists(src: &camino::Utf8Path, dest: &camino::Utf8Path) -> std::io::Result<()> {
    match std::fs::copy(src, dest) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn copy_dir_excluding_sockets(src: &camino::Utf8Path, dest: &camino::Utf8Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let child_src = src.join(name.as_ref());
        let child_dest = dest.join(name.as_ref());
        if file_type.is_dir() {
            copy_dir_excluding_sockets(&child_src, &child_dest)?;
        } else if file_type.is_file() {
            if name.ends_with(".sock") {
                continue;
            }
            std::fs::copy(&child_src, &child_dest)?;
        }
    }
    Ok(())
}

/// Races a worker's stdout against its own exit, forwarding every decoded
/// [`Envelope`] to the shared output channel. If the process exits without
/// ever sending a `Done`, synthesizes one so the dispatcher's accounting
/// never waits forever on a worker that crashed or was killed.
async fn supervise_worker(
    worker_id: u32,
    worker_name: String,
    mut handle: Box<dyn WorkerProcessHandle>,
    stdout: BoxedReader,
    output_tx: UnboundedSender<Envelope>,
) {
    let mut reader = crate::ipc::buffered(stdout);
    let mut done_sent = false;

    loop {
        tokio::select! {
            line = crate::ipc::read_envelope(&mut reader) => {
                match line {
                    Ok(Some(envelope)) => {
                        let is_done = envelope.message.is_done();
                        if output_tx.send(envelope).is_err() {
                            return;
                        }
                        if is_done {
                            done_sent = true;
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(source) => {
                        let err = DispatcherError::IpcDecode {
                            worker_name: worker_name.clone(),
                            source,
                        };
                        warn!(worker = %worker_name, error = %err, "worker stdout decode failed");
                        break;
                    }
                }
            }
            status = handle.wait() => {
                match status {
                    Ok(status) if !status.success() => {
                        warn!(worker = %worker_name, %status, "worker process exited abnormally");
                    }
                    Err(e) => warn!(worker = %worker_name, error = %e, "failed to wait on worker process"),
                    _ => {}
                }
                break;
            }
        }
    }

    let _ = handle.wait().await;

    if !done_sent {
        let _ = output_tx.send(Envelope {
            worker_id,
            worker_name,
            message: Message::Done { synthesized: true },
        });
    }
}

/// Runs every task on the calling task with no child processes at all --
/// the `parallelism == -1` mode. Used directly by the CLI when the user
/// asks to run "in the controller process"; bypasses the dispatcher
/// entirely since there is no pool, no IPC, and no reaping to do.
pub async fn run_in_controller(
    task_groups: Vec<(String, Vec<TaskId>)>,
    driver: &dyn Driver,
    observers: &mut ObserverSet,
) -> RunOutcome {
    let worker_id = 0u32;
    let worker_name = "in_controller".to_string();

    for (_, task_ids) in &task_groups {
        for task_id in task_ids {
            let envelope = Envelope {
                worker_id,
                worker_name: worker_name.clone(),
                message: Message::CurrentTask {
                    task_id: task_id.clone(),
                    tmp_result_path: Utf8PathBuf::from("/dev/null"),
                    result_path: Utf8PathBuf::from("/dev/null"),
                },
            };
            observers.dispatch_message(&envelope);

            let (output_tx, mut output_rx) = tokio::sync::mpsc::unbounded_channel();
            let short_status = {
                let run_fut = driver.run(task_id, &output_tx);
                tokio::pin!(run_fut);
                let result = loop {
                    tokio::select! {
                        result = &mut run_fut => break result,
                        Some(text) = output_rx.recv() => {
                            observers.dispatch_message(&Envelope {
                                worker_id,
                                worker_name: worker_name.clone(),
                                message: Message::Output { text, log_only: false },
                            });
                        }
                    }
                };
                drop(output_tx);
                while let Some(text) = output_rx.recv().await {
                    observers.dispatch_message(&Envelope {
                        worker_id,
                        worker_name: worker_name.clone(),
                        message: Message::Output { text, log_only: false },
                    });
                }
                result.unwrap_or(ShortStatus::Fail)
            };

            let envelope = Envelope {
                worker_id,
                worker_name: worker_name.clone(),
                message: Message::TaskResult {
                    task_id: task_id.clone(),
                    short_status,
                },
            };
            let action = observers.dispatch_message(&envelope);
            if action != ObserverAction::None {
                return RunOutcome::TestFailed;
            }
        }
    }

    observers.dispatch_message(&Envelope {
        worker_id,
        worker_name,
        message: Message::Done { synthesized: false },
    });

    RunOutcome::Success
}
