//! Pipe carrying streamed hook output into the operation log.
//!
//! The producer writes into [`LogPipe::writer`]. A tee task splits the bytes
//! into lines, republishes each line as a progress event and forwards it to a
//! second task that hands the stream to [`Operator::stream_operation_logs`].
//! Both streams are bounded, so a slow log store slows the producer down
//! instead of buffering without limit.

use installer_core::OperationKey;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{OrchestratorError, Result};
use crate::progress::ProgressReporter;
use crate::services::Operator;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Next line of `reader` without its terminator, with invalid UTF-8
/// replaced. `None` at end of stream.
///
/// `buf` keeps a partially read line between calls, so a read cancelled by
/// `select!` resumes where it stopped.
pub(crate) async fn read_line_lossy<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let read = reader.read_until(b'\n', buf).await?;
    if read == 0 && buf.is_empty() {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    Ok(Some(line))
}

pub struct LogPipe {
    writer: DuplexStream,
    tee: JoinHandle<Result<()>>,
    sink: JoinHandle<Result<()>>,
}

impl LogPipe {
    /// Spawn the consumer tasks for operation `key`.
    pub fn start(key: OperationKey, operator: Arc<dyn Operator>, progress: ProgressReporter) -> Self {
        let (writer, tee_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (forward, sink_reader) = tokio::io::duplex(PIPE_CAPACITY);

        let tee = tokio::spawn(async move {
            let mut forward = Some(forward);
            let mut reader = BufReader::new(tee_reader);
            let mut buf = Vec::new();
            while let Some(line) = read_line_lossy(&mut reader, &mut buf).await? {
                if let Some(out) = forward.as_mut() {
                    let written = async {
                        out.write_all(line.as_bytes()).await?;
                        out.write_all(b"\n").await
                    }
                    .await;
                    // keep draining the producer even if the log store went away
                    if let Err(err) = written {
                        warn!(error = %err, "Operation log sink closed early");
                        forward = None;
                    }
                }
                progress.log_line(line);
            }
            if let Some(mut out) = forward {
                out.shutdown().await?;
            }
            Ok(())
        });

        let sink = tokio::spawn(async move {
            operator
                .stream_operation_logs(&key, Box::new(sink_reader))
                .await
        });

        Self { writer, tee, sink }
    }

    /// Producer end of the pipe.
    pub fn writer(&mut self) -> &mut DuplexStream {
        &mut self.writer
    }

    /// Close the producer end and wait for both tasks to drain.
    ///
    /// Failures are logged, never returned: losing log lines must not fail
    /// the phase that produced them.
    pub async fn close(self) {
        let Self {
            mut writer,
            tee,
            sink,
        } = self;
        if let Err(err) = writer.shutdown().await {
            warn!(error = %err, "Failed to close log pipe");
        }
        drop(writer);

        for (name, task) in [("tee", tee), ("sink", sink)] {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(task = name, error = %err, "Log pipe task failed"),
                Err(err) => warn!(
                    task = name,
                    error = %OrchestratorError::ExecutionFailed(err.to_string()),
                    "Log pipe task panicked"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::InMemoryOperator;
    use events::{Event, EventBus};

    #[tokio::test]
    async fn test_lines_reach_log_and_events() {
        let operator = Arc::new(InMemoryOperator::new());
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let key = OperationKey::new("prod");
        let progress = ProgressReporter::new(bus, key.operation_id).for_phase("/app");

        let mut pipe = LogPipe::start(key.clone(), operator.clone(), progress);
        pipe.writer()
            .write_all(b"creating job install\njob completed\n")
            .await
            .unwrap();
        pipe.close().await;

        assert_eq!(
            operator.operation_logs(&key).await.unwrap(),
            vec!["creating job install", "job completed"]
        );
        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first.event,
            Event::Log { ref line, .. } if line == "creating job install"
        ));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let operator = Arc::new(InMemoryOperator::new());
        let key = OperationKey::new("prod");
        let progress = ProgressReporter::new(EventBus::new(), key.operation_id);

        let mut pipe = LogPipe::start(key.clone(), operator.clone(), progress);
        // latin-1 "café" followed by a line without terminator
        pipe.writer().write_all(b"caf\xe9\r\ndone").await.unwrap();
        pipe.close().await;

        assert_eq!(
            operator.operation_logs(&key).await.unwrap(),
            vec!["caf\u{fffd}", "done"]
        );
    }

    #[tokio::test]
    async fn test_close_without_output() {
        let operator = Arc::new(InMemoryOperator::new());
        let key = OperationKey::new("prod");
        let progress = ProgressReporter::new(EventBus::new(), key.operation_id);

        LogPipe::start(key.clone(), operator.clone(), progress)
            .close()
            .await;
        assert!(operator.operation_logs(&key).await.unwrap().is_empty());
    }
}
