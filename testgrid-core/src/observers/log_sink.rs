// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-worker log sink observer.

use super::{Observer, ObserverAction};
use crate::message::{Envelope, Message};
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use tracing::warn;

/// Owns one append-only file per worker, opened lazily on that worker's
/// first `Output` and closed on its `Done`. The per-worker log file is
/// documented (§6) to be a byte-for-byte concatenation of all `Output.text`
/// fragments from that worker, in order -- this observer writes them
/// unchanged.
pub struct LogSink {
    log_dir: Utf8PathBuf,
    open_files: HashMap<u32, File>,
}

impl LogSink {
    pub fn new(vardir: &Utf8Path) -> std::io::Result<Self> {
        let log_dir = vardir.join("log");
        std::fs::create_dir_all(&log_dir)?;
        Ok(Self {
            log_dir,
            open_files: HashMap::new(),
        })
    }

    pub fn logfile_path(&self, worker_name: &str) -> Utf8PathBuf {
        self.log_dir.join(format!("{worker_name}.log"))
    }
}

impl Observer for LogSink {
    fn on_message(&mut self, envelope: &Envelope) -> ObserverAction {
        match &envelope.message {
            Message::Output { text, .. } => {
                if !self.open_files.contains_key(&envelope.worker_id) {
                    let path = self.logfile_path(&envelope.worker_name);
                    match File::create(&path) {
                        Ok(file) => {
                            self.open_files.insert(envelope.worker_id, file);
                        }
                        Err(e) => {
                            warn!(worker = %envelope.worker_name, %path, error = %e, "failed to create log file; dropping output for this worker");
                            return ObserverAction::None;
                        }
                    }
                }
                if let Some(file) = self.open_files.get_mut(&envelope.worker_id) {
                    let _ = file.write_all(text.as_bytes());
                }
            }
            Message::Done { .. } => {
                self.open_files.remove(&envelope.worker_id);
            }
            _ => {}
        }
        ObserverAction::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_sink_writes_output_bytes_unchanged_and_closes_on_done() {
        let dir = tempfile::tempdir().unwrap();
        let vardir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let mut sink = LogSink::new(&vardir).unwrap();

        let envelope = |msg: Message| Envelope {
            worker_id: 7,
            worker_name: "07_box".to_string(),
            message: msg,
        };

        sink.on_message(&envelope(Message::Output {
            text: "hello ".to_string(),
            log_only: false,
        }));
        sink.on_message(&envelope(Message::Output {
            text: "world\n".to_string(),
            log_only: false,
        }));
        sink.on_message(&envelope(Message::Done { synthesized: false }));

        let contents = std::fs::read_to_string(sink.logfile_path("07_box")).unwrap();
        assert_eq!(contents, "hello world\n");
        assert!(!sink.open_files.contains_key(&7));
    }
}
