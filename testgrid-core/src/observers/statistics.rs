// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The statistics aggregator observer.

use super::{Observer, ObserverAction};
use crate::message::{Envelope, Message, ShortStatus};
use std::collections::BTreeMap;

/// Identifies one failed task for the end-of-run report.
#[derive(Clone, Debug)]
pub struct FailedTask {
    pub task_id: crate::message::TaskId,
    pub worker_name: String,
}

/// Counts task verdicts by [`ShortStatus`] and remembers which tasks (and on
/// which worker) failed, for the summary printed at the end of a run and
/// for the artifact-collection step.
#[derive(Default, Clone)]
pub struct StatisticsAggregator {
    counts: BTreeMap<ShortStatus, usize>,
    failed_tasks: Vec<FailedTask>,
}

impl StatisticsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, status: ShortStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn failed_tasks(&self) -> &[FailedTask] {
        &self.failed_tasks
    }

    pub fn any_failed(&self) -> bool {
        !self.failed_tasks.is_empty()
    }

    /// Distinct worker names that reported at least one failure, used to
    /// scope the post-run artifact copy.
    pub fn failed_worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .failed_tasks
            .iter()
            .map(|f| f.worker_name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Renders the summary block described in the error-handling design:
    /// counts per status, followed by the list of failed tasks.
    pub fn summary(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        if !self.counts.is_empty() {
            out.push_str("Statistics:\n");
            for (status, count) in &self.counts {
                let _ = writeln!(out, "* {status}: {count}");
            }
        }
        if !self.failed_tasks.is_empty() {
            out.push_str("Failed tasks:\n");
            for failed in &self.failed_tasks {
                let _ = writeln!(out, "- {} [{}]", failed.task_id, failed.worker_name);
            }
        }
        out
    }
}

impl Observer for StatisticsAggregator {
    fn on_message(&mut self, envelope: &Envelope) -> ObserverAction {
        if let Message::TaskResult {
            task_id,
            short_status,
        } = &envelope.message
        {
            *self.counts.entry(*short_status).or_insert(0) += 1;
            if *short_status == ShortStatus::Fail {
                self.failed_tasks.push(FailedTask {
                    task_id: task_id.clone(),
                    worker_name: envelope.worker_name.clone(),
                });
            }
        }
        ObserverAction::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TaskId;

    fn result(worker_name: &str, task: &str, status: ShortStatus) -> Envelope {
        Envelope {
            worker_id: 1,
            worker_name: worker_name.to_string(),
            message: Message::TaskResult {
                task_id: TaskId::new(task, ""),
                short_status: status,
            },
        }
    }

    #[test]
    fn counts_accumulate_per_status() {
        let mut stats = StatisticsAggregator::new();
        stats.on_message(&result("01_box", "a", ShortStatus::Pass));
        stats.on_message(&result("01_box", "b", ShortStatus::Pass));
        stats.on_message(&result("01_box", "c", ShortStatus::Fail));
        assert_eq!(stats.count(ShortStatus::Pass), 2);
        assert_eq!(stats.count(ShortStatus::Fail), 1);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn failed_tasks_are_remembered_with_their_worker() {
        let mut stats = StatisticsAggregator::new();
        stats.on_message(&result("01_box", "a", ShortStatus::Fail));
        assert!(stats.any_failed());
        assert_eq!(stats.failed_worker_names(), vec!["01_box".to_string()]);
    }

    #[test]
    fn non_task_result_messages_are_ignored() {
        let mut stats = StatisticsAggregator::new();
        stats.on_message(&Envelope {
            worker_id: 1,
            worker_name: "01_box".to_string(),
            message: Message::Done { synthesized: false },
        });
        assert_eq!(stats.total(), 0);
    }
}
