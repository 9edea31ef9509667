// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The task-group queue (component C1).
//!
//! A [`TaskGroup`] is the durable-for-the-run record of one suite: its task
//! IDs in original order, the subset of those reported done, and the set of
//! worker IDs currently bound to it. The input queue is realized as a plain
//! `VecDeque` mutated only by the dispatcher's single event-loop task --
//! see the "Resolved realization" note in the design document for why no
//! channel is needed here. The output queue is the `UnboundedSender` half of
//! a `tokio::mpsc` channel, cloned into every worker-supervisor task spawned
//! for this group.

use crate::message::{Envelope, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tokio::sync::mpsc::UnboundedSender;

/// One item handed to a worker over its input pipe: either a task to run, or
/// the one-shot marker telling it to stop asking for more work.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    Task(TaskId),
    Stop,
}

/// All the bookkeeping for one suite's worth of tasks.
pub struct TaskGroup {
    pub key: String,
    /// Full original-order list, used to compute `undone()`.
    task_ids: Vec<TaskId>,
    /// Tasks not yet handed out to any worker.
    pending: VecDeque<TaskId>,
    /// Tasks a worker has reported a result for (pass/fail/.../not_run all count).
    done_task_ids: HashSet<TaskId>,
    /// Worker IDs currently (or ever) bound to this group.
    worker_ids: Vec<u32>,
    /// Flips to true the instant the first worker of this group exits.
    finalized: bool,
    /// The shared output-queue sender, cloned into each worker's supervisor task.
    pub(crate) output_tx: UnboundedSender<Envelope>,
}

impl TaskGroup {
    /// Builds a new group. `task_ids` should already be in whatever order
    /// the caller wants tasks attempted in (the dispatcher is responsible
    /// for shuffling, if randomization was requested, before calling this).
    pub fn new(
        key: impl Into<String>,
        task_ids: Vec<TaskId>,
        output_tx: UnboundedSender<Envelope>,
    ) -> Self {
        let pending = task_ids.iter().cloned().collect();
        Self {
            key: key.into(),
            task_ids,
            pending,
            done_task_ids: HashSet::new(),
            worker_ids: Vec::new(),
            finalized: false,
            output_tx,
        }
    }

    pub fn task_count(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// One-way transition: once finalized, the dispatcher will never spawn
    /// another worker for this group, even if the queue still has pending
    /// tasks. See the design document's discussion of why the *first*
    /// worker's `Done` triggers this rather than queue drain.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn register_worker(&mut self, worker_id: u32) {
        self.worker_ids.push(worker_id);
    }

    pub fn worker_ids(&self) -> &[u32] {
        &self.worker_ids
    }

    /// Pops the next task for some worker of this group, or `Stop` if the
    /// queue is empty. Called once right after a worker is spawned, and
    /// again every time the dispatcher observes a `TaskResult` from one of
    /// this group's workers.
    pub fn next_work_item(&mut self) -> WorkItem {
        match self.pending.pop_front() {
            Some(task_id) => WorkItem::Task(task_id),
            None => WorkItem::Stop,
        }
    }

    /// Idempotent: marking an already-done task done again is a no-op.
    pub fn mark_done(&mut self, task_id: &TaskId) {
        self.done_task_ids.insert(task_id.clone());
    }

    pub fn done_count(&self) -> usize {
        self.done_task_ids.len()
    }

    /// Tasks dispatched but never reported done, in original insertion
    /// order. Distinct from failed tasks -- a task can fail and still be
    /// "done" (it reported a result); undone means no result was ever
    /// observed for it at all.
    pub fn undone(&self) -> Vec<TaskId> {
        self.task_ids
            .iter()
            .filter(|t| !self.done_task_ids.contains(*t))
            .cloned()
            .collect()
    }

    pub fn output_sender(&self) -> UnboundedSender<Envelope> {
        self.output_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(task_ids: Vec<TaskId>) -> TaskGroup {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        TaskGroup::new("suite", task_ids, tx)
    }

    #[test]
    fn undone_preserves_original_order_regardless_of_completion_order() {
        let ids = vec![
            TaskId::new("a", ""),
            TaskId::new("b", ""),
            TaskId::new("c", ""),
        ];
        let mut g = group(ids.clone());
        g.mark_done(&ids[2]);
        g.mark_done(&ids[0]);
        assert_eq!(g.undone(), vec![ids[1].clone()]);
    }

    #[test]
    fn next_work_item_yields_stop_once_drained() {
        let ids = vec![TaskId::new("a", "")];
        let mut g = group(ids.clone());
        assert!(matches!(g.next_work_item(), WorkItem::Task(t) if t == ids[0]));
        assert!(matches!(g.next_work_item(), WorkItem::Stop));
        assert!(matches!(g.next_work_item(), WorkItem::Stop));
    }

    #[test]
    fn mark_done_is_idempotent() {
        let ids = vec![TaskId::new("a", "")];
        let mut g = group(ids.clone());
        g.mark_done(&ids[0]);
        g.mark_done(&ids[0]);
        assert_eq!(g.done_count(), 1);
        assert!(g.undone().is_empty());
    }

    #[test]
    fn finalize_is_one_way() {
        let mut g = group(vec![TaskId::new("a", "")]);
        assert!(!g.is_finalized());
        g.finalize();
        assert!(g.is_finalized());
    }
}
