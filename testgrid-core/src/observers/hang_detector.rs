// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The hang detector observer.

use super::{Observer, ObserverAction};
use crate::message::{Envelope, Message, TaskId};
use camino::Utf8PathBuf;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// What the hang detector remembers about a worker's in-flight task, so it
/// can name it in a warning or final report.
#[derive(Clone, Debug)]
struct CurrentTask {
    worker_name: String,
    task_id: TaskId,
    tmp_result_path: Utf8PathBuf,
}

/// Watches for a run going silent. Any message at all (from any worker)
/// resets both timers; a run with even one noisy worker never looks hung,
/// which matches the reference implementation's "no output from any
/// worker" framing.
///
/// The caller is expected to construct this via [`HangDetector::disabled`]
/// for a run under a debugger/profiler or with the long-tests flag set
/// (see [`crate::config::RunnerConfig::hang_detector_enabled`]), since
/// those legitimately produce long silences; this type has no knowledge of
/// either condition itself.
pub struct HangDetector {
    enabled: bool,
    warn_timeout: Duration,
    kill_timeout: Duration,
    inactivity: Duration,
    warned_seconds_ago: Duration,
    current_tasks: HashMap<u32, CurrentTask>,
}

impl HangDetector {
    pub fn new(enabled: bool, warn_timeout: Duration, kill_timeout: Duration) -> Self {
        Self {
            enabled,
            warn_timeout,
            kill_timeout,
            inactivity: Duration::ZERO,
            warned_seconds_ago: Duration::ZERO,
            current_tasks: HashMap::new(),
        }
    }

    /// Constructs a disabled detector.
    pub fn disabled() -> Self {
        Self::new(false, Duration::MAX, Duration::MAX)
    }

    fn reset_timers(&mut self) {
        self.inactivity = Duration::ZERO;
        self.warned_seconds_ago = Duration::ZERO;
    }
}

impl Observer for HangDetector {
    fn on_message(&mut self, envelope: &Envelope) -> ObserverAction {
        if !self.enabled {
            return ObserverAction::None;
        }
        self.reset_timers();
        if let Message::CurrentTask {
            task_id,
            tmp_result_path,
            ..
        } = &envelope.message
        {
            self.current_tasks.insert(
                envelope.worker_id,
                CurrentTask {
                    worker_name: envelope.worker_name.clone(),
                    task_id: task_id.clone(),
                    tmp_result_path: tmp_result_path.clone(),
                },
            );
        }
        if matches!(envelope.message, Message::Done { .. }) {
            self.current_tasks.remove(&envelope.worker_id);
        }
        ObserverAction::None
    }

    fn on_idle(&mut self, delta: Duration) -> ObserverAction {
        if !self.enabled {
            return ObserverAction::None;
        }
        self.inactivity += delta;
        self.warned_seconds_ago += delta;

        if self.warned_seconds_ago < self.warn_timeout {
            return ObserverAction::None;
        }

        let is_warning = self.inactivity < self.kill_timeout;

        warn!(
            inactivity_secs = self.inactivity.as_secs_f64(),
            kill_after_secs = self.kill_timeout.as_secs_f64(),
            "no output from any worker; listing workers not reporting status"
        );
        for task in self.current_tasks.values() {
            warn!(
                worker = %task.worker_name,
                task = %task.task_id,
                result_path = %task.tmp_result_path,
                "worker still running this task"
            );
        }

        self.warned_seconds_ago = Duration::ZERO;

        if is_warning {
            return ObserverAction::None;
        }

        warn!("no output from workers for the kill timeout; sending kill to all workers");
        ObserverAction::KillAll
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_task(worker_id: u32, task: &str) -> Envelope {
        Envelope {
            worker_id,
            worker_name: format!("{worker_id:02}_box"),
            message: Message::CurrentTask {
                task_id: TaskId::new(task, ""),
                tmp_result_path: Utf8PathBuf::from("/tmp/r"),
                result_path: Utf8PathBuf::from("/tmp/r.result"),
            },
        }
    }

    #[test]
    fn disabled_detector_never_acts() {
        let mut detector = HangDetector::disabled();
        assert_eq!(
            detector.on_idle(Duration::from_secs(9999)),
            ObserverAction::None
        );
    }

    #[test]
    fn warns_then_kills_after_the_respective_timeouts() {
        let mut detector = HangDetector::new(
            true,
            Duration::from_secs(5),
            Duration::from_secs(10),
        );
        detector.on_message(&current_task(1, "t_silent"));

        // Below warn timeout: no action.
        assert_eq!(detector.on_idle(Duration::from_secs(3)), ObserverAction::None);
        // Crosses warn timeout, still below kill timeout: a warning, no action.
        assert_eq!(detector.on_idle(Duration::from_secs(3)), ObserverAction::None);
        // Further ticks accumulate inactivity until kill timeout is crossed.
        assert_eq!(detector.on_idle(Duration::from_secs(3)), ObserverAction::None);
        let action = detector.on_idle(Duration::from_secs(3));
        assert_eq!(action, ObserverAction::KillAll);
    }

    #[test]
    fn any_message_resets_the_timers() {
        let mut detector = HangDetector::new(
            true,
            Duration::from_secs(5),
            Duration::from_secs(10),
        );
        detector.on_idle(Duration::from_secs(4));
        detector.on_message(&current_task(1, "t"));
        // Timer reset, so another 4s doesn't reach the 5s warn threshold.
        assert_eq!(detector.on_idle(Duration::from_secs(4)), ObserverAction::None);
    }
}
