// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The wire types exchanged between a worker and the dispatcher.
//!
//! These mirror the message taxonomy in the design document exactly: a
//! worker emits a stream of [`Message`] values, tagged with its own
//! `worker_id`/`worker_name`, onto its output queue. The dispatcher never
//! constructs these on a worker's behalf except for the synthesized `Done`
//! the reaper produces for a process that exited silently.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque identifier for one test under one configuration.
///
/// `config_name` may be empty, which is the common case for suites that
/// don't parametrize over multiple configurations. Two `TaskId`s are equal
/// iff both fields match; ordering (when a group's tasks are kept in
/// insertion order) is whatever order they were discovered in.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub test_name: String,
    #[serde(default)]
    pub config_name: String,
}

impl TaskId {
    pub fn new(test_name: impl Into<String>, config_name: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            config_name: config_name.into(),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.config_name.is_empty() {
            write!(f, "{}", self.test_name)
        } else {
            write!(f, "{}:{}", self.test_name, self.config_name)
        }
    }
}

/// The verdict a driver reports for one task.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortStatus {
    Pass,
    Fail,
    Skip,
    New,
    Disabled,
    /// The task was dispatched to a worker's input queue but the worker
    /// never got to run it (it drained its remaining queue after a failure,
    /// or the process died before reaching the task).
    NotRun,
}

impl fmt::Display for ShortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShortStatus::Pass => "pass",
            ShortStatus::Fail => "fail",
            ShortStatus::Skip => "skip",
            ShortStatus::New => "new",
            ShortStatus::Disabled => "disabled",
            ShortStatus::NotRun => "not_run",
        };
        f.write_str(s)
    }
}

/// A message emitted by a worker onto its output queue, or synthesized by
/// the dispatcher's reaper on the worker's behalf.
///
/// Every variant implicitly carries `worker_id`/`worker_name` via the
/// enclosing [`Envelope`] -- the payload itself only carries
/// message-specific data, which keeps the wire format flat.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// A fragment of the worker's captured stdout. May or may not end at a
    /// line boundary; the console multiplexer is responsible for
    /// reassembling lines.
    Output { text: String, log_only: bool },

    /// Announced immediately before a task starts running, so observers
    /// (in particular the hang detector) know what's currently in flight.
    CurrentTask {
        task_id: TaskId,
        tmp_result_path: Utf8PathBuf,
        result_path: Utf8PathBuf,
    },

    /// The verdict for one task, once the driver has returned.
    TaskResult {
        task_id: TaskId,
        short_status: ShortStatus,
    },

    /// The worker's final message. Exactly one of these is ever dispatched
    /// to observers per worker, whether the worker sent it voluntarily or
    /// the dispatcher synthesized it after observing the process exit
    /// without one.
    Done { synthesized: bool },
}

impl Message {
    pub fn is_done(&self) -> bool {
        matches!(self, Message::Done { .. })
    }
}

/// A [`Message`] tagged with the identity of the worker that produced it (or,
/// for a synthesized `Done`, the identity the dispatcher assigns it).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub worker_id: u32,
    pub worker_name: String,
    #[serde(flatten)]
    pub message: Message,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_display_omits_empty_config() {
        assert_eq!(TaskId::new("box/basic", "").to_string(), "box/basic");
        assert_eq!(
            TaskId::new("box/basic", "memtx").to_string(),
            "box/basic:memtx"
        );
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = Envelope {
            worker_id: 3,
            worker_name: "03_box".to_string(),
            message: Message::TaskResult {
                task_id: TaskId::new("box/basic", ""),
                short_status: ShortStatus::Fail,
            },
        };
        let encoded = serde_json::to_string(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.worker_id, 3);
        match decoded.message {
            Message::TaskResult {
                task_id,
                short_status,
            } => {
                assert_eq!(task_id, TaskId::new("box/basic", ""));
                assert_eq!(short_status, ShortStatus::Fail);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
