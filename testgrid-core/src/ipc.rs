// Copyright (c) The testgrid Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The line-delimited JSON wire protocol spoken over a worker's stdin/stdout
//! pipes.
//!
//! Stdin carries [`WorkItem`]s (one per line): the controller writes a task
//! or the stop marker every time the worker is ready for more work. Stdout
//! carries [`Envelope`]s (one per line): the worker's messages, already
//! tagged with its own identity. Using newline-delimited JSON rather than a
//! length-prefixed binary framing keeps a worker's raw output debuggable by
//! just running the binary by hand and reading its stdout.

use crate::message::Envelope;
use crate::task::WorkItem;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Serializes `value` as one JSON line (trailing `\n`) and writes + flushes
/// it. Flushing every line is deliberate: these are low-traffic control
/// messages, not a high-throughput stream, and the reader on the other end
/// is blocked waiting for exactly this line.
pub async fn write_line<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_string(value).expect("message types are always serializable");
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Reads and decodes the next JSON line from `reader`. Returns `Ok(None)` on
/// clean EOF (the writer closed its end, e.g. the worker process exited).
pub async fn read_line<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
where
    R: AsyncBufReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end_matches(['\n', '\r']);
    let value = serde_json::from_str(trimmed).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("malformed IPC line {trimmed:?}: {e}"),
        )
    })?;
    Ok(Some(value))
}

/// Convenience alias for wrapping a raw `tokio::process::ChildStdout` (or
/// any other `AsyncRead`) for line-oriented reads.
pub fn buffered<R: tokio::io::AsyncRead + Unpin>(reader: R) -> BufReader<R> {
    BufReader::new(reader)
}

pub async fn write_work_item<W>(writer: &mut W, item: &WorkItem) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_line(writer, item).await
}

pub async fn read_envelope<R>(reader: &mut R) -> std::io::Result<Option<Envelope>>
where
    R: AsyncBufReadExt + Unpin,
{
    read_line(reader).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, ShortStatus, TaskId};

    #[tokio::test]
    async fn work_item_round_trips_over_a_pipe() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = buffered(reader);

        write_work_item(&mut writer, &WorkItem::Task(TaskId::new("a", ""))).await.unwrap();
        write_work_item(&mut writer, &WorkItem::Stop).await.unwrap();

        let first: WorkItem = read_line(&mut reader).await.unwrap().unwrap();
        assert!(matches!(first, WorkItem::Task(t) if t == TaskId::new("a", "")));
        let second: WorkItem = read_line(&mut reader).await.unwrap().unwrap();
        assert!(matches!(second, WorkItem::Stop));
    }

    #[tokio::test]
    async fn envelope_read_returns_none_on_eof() {
        let (writer, reader) = tokio::io::duplex(1024);
        let mut reader = buffered(reader);
        drop(writer);
        let result = read_envelope(&mut reader).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn envelope_round_trips_over_a_pipe() {
        let (mut writer, reader) = tokio::io::duplex(4096);
        let mut reader = buffered(reader);
        let envelope = Envelope {
            worker_id: 1,
            worker_name: "01_box".to_string(),
            message: Message::TaskResult {
                task_id: TaskId::new("box/basic", ""),
                short_status: ShortStatus::Pass,
            },
        };
        write_line(&mut writer, &envelope).await.unwrap();
        let decoded = read_envelope(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded.worker_id, 1);
    }
}
