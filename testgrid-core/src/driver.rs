// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The external test driver interface.
//!
//! Per the specification, how a single test is actually run is explicitly
//! out of scope for this crate: "it only schedules, observes, and reaps". A
//! [`Driver`] is the narrow seam through which a worker hands off one task
//! and gets back a verdict. [`CommandDriver`] is the one concrete
//! implementation shipped here -- a thin stand-in that runs a configured
//! command per task and maps its exit status onto [`ShortStatus::Pass`] or
//! [`ShortStatus::Fail`]. A real integration would replace it with
//! something that understands the database server's wire protocol and the
//! test file format, without touching anything in this crate.
//!
//! Output is not buffered and handed back at the end: a driver pushes
//! fragments onto `output_tx` as they become available, so a chatty-but-slow
//! task and a genuinely hung one stay distinguishable to anything watching
//! the channel (in particular the hang detector and the console
//! multiplexer, both of which key off message arrival, not task
//! completion).

use crate::message::{ShortStatus, TaskId};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;

/// A collaborator that knows how to run exactly one task and report a
/// verdict. Implementations must not panic on task failure -- a failing
/// test is a perfectly normal `ShortStatus::Fail`, not an error.
///
/// `output_tx` is the channel a driver sends raw output fragments to as the
/// task runs; the worker harness forwards each fragment as an `Output`
/// message the moment it arrives, concurrently with the `run` call still
/// being in flight.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn run(
        &self,
        task_id: &TaskId,
        output_tx: &UnboundedSender<String>,
    ) -> std::io::Result<ShortStatus>;
}

/// Reads `reader` in chunks until EOF, forwarding each non-empty chunk to
/// `tx` as a lossily-decoded string. A closed receiver just stops the
/// fragments being forwarded; the read loop itself keeps draining the pipe
/// so the child never blocks writing to it.
async fn stream_to_channel<R: AsyncRead + Unpin>(
    mut reader: R,
    tx: UnboundedSender<String>,
) -> std::io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let _ = tx.send(String::from_utf8_lossy(&buf[..n]).into_owned());
    }
}

/// Runs `{program} {args...}` per task, substituting `{test}` and
/// `{config}` placeholders in the argument list with the task's fields.
/// Exit code 0 is `pass`; anything else is `fail`. Stdout and stderr are
/// each streamed to `output_tx` as they're produced, interleaved in
/// whatever order the two pipes happen to deliver them.
#[derive(Debug, Clone)]
pub struct CommandDriver {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandDriver {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn substitute(&self, task_id: &TaskId) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{test}", &task_id.test_name)
                    .replace("{config}", &task_id.config_name)
            })
            .collect()
    }
}

#[async_trait]
impl Driver for CommandDriver {
    async fn run(
        &self,
        task_id: &TaskId,
        output_tx: &UnboundedSender<String>,
    ) -> std::io::Result<ShortStatus> {
        let args = self.substitute(task_id);
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let (out_result, err_result, status) = tokio::join!(
            stream_to_channel(stdout, output_tx.clone()),
            stream_to_channel(stderr, output_tx.clone()),
            child.wait(),
        );
        out_result?;
        err_result?;
        let status = status?;

        Ok(if status.success() {
            ShortStatus::Pass
        } else {
            ShortStatus::Fail
        })
    }
}
