//! JSON-lines framing over any async byte pipe.
//!
//! Used over a child's stdin/stdout for process workers and over
//! `tokio::io::duplex` for in-process workers.

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::error::ProtocolError;

/// Upper bound for a single encoded frame
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Reads newline-delimited frames
///
/// Lines longer than the limit are rejected while they are being buffered,
/// not after. `next` is cancel safe, so it can sit in a `tokio::select!` loop.
pub struct FrameReader<R> {
    lines: FramedRead<R, LinesCodec>,
    max_length: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_length(reader, MAX_FRAME_BYTES)
    }

    pub fn with_max_length(reader: R, max_length: usize) -> Self {
        Self {
            lines: FramedRead::new(reader, LinesCodec::new_with_max_length(max_length)),
            max_length,
        }
    }

    /// Next decoded frame, or `None` once the peer closed the pipe
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        while let Some(line) = self.lines.next().await {
            let line = line.map_err(|e| match e {
                LinesCodecError::MaxLineLengthExceeded => ProtocolError::FrameTooLarge {
                    limit: self.max_length,
                },
                LinesCodecError::Io(e) => ProtocolError::Io(e),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(&line)?));
        }
        Ok(None)
    }
}

/// Writes newline-delimited frames, flushing after each one
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send<T: Serialize>(&mut self, frame: &T) -> Result<(), ProtocolError> {
        let mut bytes = serde_json::to_vec(frame)?;
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                limit: MAX_FRAME_BYTES,
            });
        }
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{HostFrame, WorkerFrame};
    use chrono::Utc;

    #[tokio::test]
    async fn test_frames_cross_a_duplex_pipe() {
        let (host, worker) = tokio::io::duplex(1024);
        let (host_read, host_write) = tokio::io::split(host);
        let (worker_read, worker_write) = tokio::io::split(worker);

        let mut host_writer = FrameWriter::new(host_write);
        let mut worker_reader = FrameReader::new(worker_read);
        let mut worker_writer = FrameWriter::new(worker_write);
        let mut host_reader = FrameReader::new(host_read);

        host_writer.send(&HostFrame::Shutdown).await.unwrap();
        let frame: Option<HostFrame> = worker_reader.next().await.unwrap();
        assert!(matches!(frame, Some(HostFrame::Shutdown)));

        worker_writer
            .send(&WorkerFrame::Heartbeat {
                tasks_completed: 3,
                at: Utc::now(),
            })
            .await
            .unwrap();
        let frame: Option<WorkerFrame> = host_reader.next().await.unwrap();
        assert!(matches!(
            frame,
            Some(WorkerFrame::Heartbeat {
                tasks_completed: 3,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_eof_yields_none() {
        let (host, worker) = tokio::io::duplex(64);
        drop(host);
        let mut reader = FrameReader::new(worker);
        let frame: Option<HostFrame> = reader.next().await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn test_malformed_line_is_an_error() {
        let mock = tokio_test::io::Builder::new().read(b"not json\n").build();
        let mut reader = FrameReader::new(mock);
        let result: Result<Option<HostFrame>, _> = reader.next().await;
        assert!(matches!(result, Err(ProtocolError::MalformedFrame(_))));
    }

    #[tokio::test]
    async fn test_blank_lines_are_skipped() {
        let mock = tokio_test::io::Builder::new()
            .read(b"\n\r\n")
            .read(b"{\"type\":\"shutdown\"}\n")
            .build();
        let mut reader = FrameReader::new(mock);
        let frame: Option<HostFrame> = reader.next().await.unwrap();
        assert!(matches!(frame, Some(HostFrame::Shutdown)));
        let frame: Option<HostFrame> = reader.next().await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn test_oversized_line_rejected_before_newline() {
        // No newline ever arrives; the limit trips on the buffered prefix
        let mock = tokio_test::io::Builder::new().read(&[b'x'; 96]).build();
        let mut reader = FrameReader::with_max_length(mock, 32);
        let result: Result<Option<HostFrame>, _> = reader.next().await;
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { limit: 32 })
        ));
    }
}
