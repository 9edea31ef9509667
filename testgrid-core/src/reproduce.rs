// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The reproduce recorder (component C5).
//!
//! Every worker keeps a per-worker append-only file under
//! `<vardir>/reproduce/<worker_name>.tests.txt`, one JSON-encoded `TaskId`
//! per line, written *before* the task is attempted -- so even a crash mid
//! task preserves the exact prefix that led to the fault. The `--reproduce
//! <file>` flag on the controller side reads such a file back and replays
//! it as a single synthetic group with a pool of one.

use crate::errors::ReproduceError;
use crate::message::TaskId;
use camino::{Utf8Path, Utf8PathBuf};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};

/// Appends task IDs to a worker's reproduce file as they're attempted.
pub struct ReproduceRecorder {
    path: Utf8PathBuf,
}

impl ReproduceRecorder {
    /// `vardir` is the controller's shared vardir; `worker_name` is e.g.
    /// `"01_box"`. The `reproduce/` subdirectory is created if missing.
    pub fn new(vardir: &Utf8Path, worker_name: &str) -> std::io::Result<Self> {
        let dir = vardir.join("reproduce");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{worker_name}.tests.txt"));
        Ok(Self { path })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Appends one task ID as a single JSON line. Called once per task,
    /// before the driver runs it.
    pub fn record(&self, task_id: &TaskId) -> Result<(), ReproduceError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| ReproduceError::Open {
                path: self.path.clone(),
                source,
            })?;
        let mut line =
            serde_json::to_string(task_id).expect("TaskId is always serializable");
        line.push('\n');
        file.write_all(line.as_bytes())
            .map_err(|source| ReproduceError::Append {
                path: self.path.clone(),
                task_id: task_id.clone(),
                source,
            })
    }
}

/// Parses a reproduce file (one JSON-encoded `TaskId` per line) back into an
/// ordered list of task IDs, suitable for building a single synthetic
/// [`TaskGroup`](crate::task::TaskGroup).
pub fn parse_reproduce_file(path: &Utf8Path) -> Result<Vec<TaskId>, ReproduceError> {
    let file = std::fs::File::open(path).map_err(|source| ReproduceError::Open {
        path: path.to_owned(),
        source,
    })?;
    let reader = BufReader::new(file);
    let mut task_ids = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| ReproduceError::Open {
            path: path.to_owned(),
            source,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let task_id: TaskId =
            serde_json::from_str(trimmed).map_err(|source| ReproduceError::Parse {
                path: path.to_owned(),
                line_no: line_no + 1,
                text: trimmed.to_string(),
                source,
            })?;
        task_ids.push(task_id);
    }
    Ok(task_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn record_then_parse_round_trips_task_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let vardir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let recorder = ReproduceRecorder::new(&vardir, "01_box").unwrap();

        let ids = vec![
            TaskId::new("a", ""),
            TaskId::new("b", "x"),
            TaskId::new("c", ""),
        ];
        for id in &ids {
            recorder.record(id).unwrap();
        }

        let parsed = parse_reproduce_file(recorder.path()).unwrap();
        assert_eq!(parsed, ids);
    }

    #[test]
    fn parse_missing_file_is_an_error() {
        let result = parse_reproduce_file(Utf8Path::new("/nonexistent/reproduce.tests.txt"));
        assert!(matches!(result, Err(ReproduceError::Open { .. })));
    }
}
