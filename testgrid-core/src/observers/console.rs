// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The console multiplexer observer.

use super::{Observer, ObserverAction};
use crate::message::{Envelope, Message};
use std::collections::BTreeMap;

/// Buffers output fragments per worker and flushes a worker's buffer as
/// soon as it contains a complete line (or the worker is done, in which
/// case whatever's left is flushed regardless). Flushed lines are prefixed
/// with `"[NNN] "` so interleaved output from several workers stays
/// attributable -- this is what lets the multiplexer be order-tolerant
/// across workers even though no cross-worker ordering is guaranteed.
#[derive(Default)]
pub struct ConsoleMultiplexer {
    buffers: BTreeMap<u32, String>,
    flushed: Vec<String>,
}

const PREFIX_WIDTH: usize = 3;

impl ConsoleMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Worker IDs with non-empty buffers -- i.e. workers that have produced
    /// output not yet terminated by a newline or a `Done`. Consulted by the
    /// hang detector to report which workers are still in flight.
    pub fn not_done_worker_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.buffers.keys().copied()
    }

    /// Lines flushed to the console so far, in flush order. Exposed mainly
    /// for tests and for a CLI that wants to re-render rather than write to
    /// real stdout directly.
    pub fn flushed_lines(&self) -> &[String] {
        &self.flushed
    }

    fn add_prefix(worker_id: u32, text: &str) -> String {
        let prefix = format!("[{worker_id:0width$}] ", width = PREFIX_WIDTH);
        let mut out = String::new();
        for line in text.split_inclusive('\n') {
            out.push_str(&prefix);
            out.push_str(line);
        }
        out
    }

    fn flush(&mut self, worker_id: u32, text: &str) {
        if text.is_empty() {
            return;
        }
        self.flushed.push(Self::add_prefix(worker_id, text));
    }
}

impl Observer for ConsoleMultiplexer {
    fn on_message(&mut self, envelope: &Envelope) -> ObserverAction {
        match &envelope.message {
            Message::Output { text, log_only } => {
                if *log_only {
                    return ObserverAction::None;
                }
                let buffer = self.buffers.entry(envelope.worker_id).or_default();
                buffer.push_str(text);
                if buffer.ends_with('\n') {
                    let complete = std::mem::take(buffer);
                    self.buffers.remove(&envelope.worker_id);
                    self.flush(envelope.worker_id, &complete);
                }
            }
            Message::Done { .. } => {
                if let Some(remaining) = self.buffers.remove(&envelope.worker_id) {
                    self.flush(envelope.worker_id, &remaining);
                }
            }
            _ => {}
        }
        ObserverAction::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(worker_id: u32, text: &str) -> Envelope {
        Envelope {
            worker_id,
            worker_name: format!("{worker_id:02}_box"),
            message: Message::Output {
                text: text.to_string(),
                log_only: false,
            },
        }
    }

    fn done(worker_id: u32) -> Envelope {
        Envelope {
            worker_id,
            worker_name: format!("{worker_id:02}_box"),
            message: Message::Done { synthesized: false },
        }
    }

    #[test]
    fn partial_line_is_buffered_until_newline() {
        let mut mux = ConsoleMultiplexer::new();
        mux.on_message(&output(1, "partial"));
        assert!(mux.flushed_lines().is_empty());
        assert_eq!(mux.not_done_worker_ids().collect::<Vec<_>>(), vec![1]);

        mux.on_message(&output(1, " line\n"));
        assert_eq!(mux.flushed_lines(), &["[001] partial line\n".to_string()]);
        assert!(mux.not_done_worker_ids().next().is_none());
    }

    #[test]
    fn done_flushes_remaining_buffer_even_without_newline() {
        let mut mux = ConsoleMultiplexer::new();
        mux.on_message(&output(2, "no newline yet"));
        mux.on_message(&done(2));
        assert_eq!(
            mux.flushed_lines(),
            &["[002] no newline yet".to_string()]
        );
    }

    #[test]
    fn log_only_output_never_reaches_the_console() {
        let mut mux = ConsoleMultiplexer::new();
        mux.on_message(&Envelope {
            worker_id: 3,
            worker_name: "03_box".to_string(),
            message: Message::Output {
                text: "quiet\n".to_string(),
                log_only: true,
            },
        });
        assert!(mux.flushed_lines().is_empty());
    }

    #[test]
    fn interleaved_workers_stay_attributable_by_prefix() {
        let mut mux = ConsoleMultiplexer::new();
        mux.on_message(&output(1, "one\n"));
        mux.on_message(&output(2, "two\n"));
        assert_eq!(
            mux.flushed_lines(),
            &["[001] one\n".to_string(), "[002] two\n".to_string()]
        );
    }
}
