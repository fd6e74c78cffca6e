//! Sample-rate conversion through an external byte-stream transformer.
//!
//! The subprocess reads raw PCM16LE mono on stdin and writes the converted
//! stream on stdout. Closing stdin (half-close) lets it flush; stdout then
//! runs until EOF.

use std::process::Stdio;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

const READ_CHUNK: usize = 4096;
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Owns the child process. Dropping it kills the child.
pub struct TransformerHandle {
    label: &'static str,
    child: Child,
    stderr_task: Option<JoinHandle<()>>,
}

pub struct TransformerWriter {
    label: &'static str,
    stdin: Option<ChildStdin>,
}

pub struct TransformerReader {
    stdout: ChildStdout,
    buf: BytesMut,
}

pub fn spawn(
    program: &str,
    args: &[String],
    label: &'static str,
) -> Result<(TransformerHandle, TransformerWriter, TransformerReader)> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BridgeError::Transformer(format!("{label}: cannot start {program}: {e}")))?;

    let stdin = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BridgeError::Transformer(format!("{label}: stdout not captured")))?;

    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    warn!(transformer = label, "{}", line);
                }
            }
        })
    });

    debug!(transformer = label, program, "transformer started");

    Ok((
        TransformerHandle {
            label,
            child,
            stderr_task,
        },
        TransformerWriter { label, stdin },
        TransformerReader {
            stdout,
            buf: BytesMut::with_capacity(READ_CHUNK),
        },
    ))
}

impl TransformerWriter {
    pub async fn feed(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| BridgeError::Transformer(format!("{}: input already closed", self.label)))?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Close stdin so the transformer flushes and exits. Idempotent.
    pub async fn finish(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
    }
}

impl TransformerReader {
    /// Next run of converted bytes; `None` at EOF.
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        self.buf.reserve(READ_CHUNK);
        let n = self.stdout.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf.split().freeze()))
    }
}

impl TransformerHandle {
    /// Wait briefly for a clean exit, then kill.
    pub async fn shutdown(mut self) {
        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(transformer = self.label, %status, "transformer exited"),
            Ok(Err(e)) => warn!(transformer = self.label, "wait failed: {}", e),
            Err(_) => {
                warn!(transformer = self.label, "transformer did not exit, killing");
                let _ = self.child.kill().await;
            }
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }

    /// Immediate kill, used on cancellation.
    pub async fn kill(mut self) {
        let _ = self.child.kill().await;
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_round_trip_with_half_close() {
        let (handle, mut writer, mut reader) = spawn("cat", &[], "test").unwrap();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();

        let feeder = {
            let payload = payload.clone();
            tokio::spawn(async move {
                for chunk in payload.chunks(320) {
                    writer.feed(chunk).await.unwrap();
                }
                writer.finish().await;
                writer.finish().await;
                assert!(writer.feed(&[0]).await.is_err());
            })
        };

        let mut out = Vec::new();
        while let Some(bytes) = reader.read().await.unwrap() {
            out.extend_from_slice(&bytes);
        }
        feeder.await.unwrap();
        assert_eq!(out, payload);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn missing_program_is_a_transformer_error() {
        let err = spawn("definitely-not-a-real-binary-xyz", &[], "test")
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Transformer(_)));
    }
}
