//! Line framing over any async byte stream.
//!
//! [`FrameReader`] buffers inbound bytes and yields one [`Frame`] per
//! well-formed line, resynchronizing past corrupt or oversized lines.
//! [`FrameWriter`] encodes and flushes one frame per call.  Both append every
//! frame to the controller's shared log.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use ledlink_core::{decode_frame, encode_frame, Direction, Frame, ProtocolError};

use crate::application::link::{unix_millis, FrameSink, FrameSource, SharedFrameLog, TransportError};

const READ_CHUNK: usize = 1024;

fn record(log: &SharedFrameLog, direction: Direction, frame: &Frame) {
    let line = frame.to_line();
    match log.lock() {
        Ok(mut log) => log.push(direction, line, unix_millis()),
        Err(poisoned) => poisoned.into_inner().push(direction, line, unix_millis()),
    }
}

/// Inbound half: bytes in, frames out.
pub struct FrameReader<R> {
    inner: R,
    buffer: Vec<u8>,
    log: SharedFrameLog,
    label: String,
}

impl<R> FrameReader<R> {
    pub fn new(inner: R, log: SharedFrameLog, label: impl Into<String>) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(READ_CHUNK),
            log,
            label: label.into(),
        }
    }

    /// Decodes the next complete frame already in the buffer, discarding
    /// corrupt lines on the way.
    fn take_buffered(&mut self) -> Option<Frame> {
        loop {
            match decode_frame(&self.buffer) {
                Ok((frame, consumed)) => {
                    self.buffer.drain(..consumed);
                    return Some(frame);
                }
                Err(ProtocolError::InsufficientData { .. }) => return None,
                Err(err) => {
                    let skip = err.resync_len().unwrap_or(self.buffer.len()).max(1).min(self.buffer.len());
                    warn!(link = %self.label, error = %err, skipped = skip, "resynchronizing");
                    self.buffer.drain(..skip);
                    if self.buffer.is_empty() {
                        return None;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<R> FrameSource for FrameReader<R>
where
    R: AsyncRead + Send + Unpin,
{
    async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            if let Some(frame) = self.take_buffered() {
                debug!(link = %self.label, frame = %frame.to_line(), "RX");
                record(&self.log, Direction::Rx, &frame);
                return Ok(frame);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                return Err(TransportError::Closed);
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

/// Outbound half: frames in, bytes out.
pub struct FrameWriter<W> {
    inner: W,
    log: SharedFrameLog,
    label: String,
}

impl<W> FrameWriter<W> {
    pub fn new(inner: W, log: SharedFrameLog, label: impl Into<String>) -> Self {
        Self {
            inner,
            log,
            label: label.into(),
        }
    }
}

#[async_trait]
impl<W> FrameSink for FrameWriter<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = encode_frame(frame)?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        debug!(link = %self.label, frame = %frame.to_line(), "TX");
        record(&self.log, Direction::Tx, frame);
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    use ledlink_core::FrameLog;

    use super::*;

    fn shared_log() -> SharedFrameLog {
        Arc::new(Mutex::new(FrameLog::new(8)))
    }

    #[tokio::test]
    async fn test_reader_skips_corrupt_line_and_logs_good_ones() {
        // Arrange
        let (mut device, host) = tokio::io::duplex(256);
        let log = shared_log();
        let mut reader = FrameReader::new(host, Arc::clone(&log), "test");
        device
            .write_all(b"{\"t\":\"ok\"}\r\n{broken\r\n\r\n{\"t\":\"status\",\"up\":5}\r\n")
            .await
            .expect("write");

        // Act
        let first = reader.next_frame().await.expect("first");
        let second = reader.next_frame().await.expect("second");

        // Assert
        assert_eq!(first.message_type(), "ok");
        assert_eq!(second.message_type(), "status");
        let entries = log.lock().expect("lock").entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.direction == Direction::Rx));
    }

    #[tokio::test]
    async fn test_reader_assembles_frame_split_across_writes() {
        let (mut device, host) = tokio::io::duplex(256);
        let mut reader = FrameReader::new(host, shared_log(), "test");
        device.write_all(b"{\"t\":\"ev").await.expect("write");
        device.write_all(b"ent\",\"ev\":\"x\"}\n").await.expect("write");
        let frame = reader.next_frame().await.expect("frame");
        assert_eq!(frame.message_type(), "event");
    }

    #[tokio::test]
    async fn test_reader_reports_closed_link() {
        let (device, host) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(host, shared_log(), "test");
        drop(device);
        assert!(matches!(reader.next_frame().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_writer_emits_crlf_line_and_logs_tx() {
        // Arrange
        let port = tokio_test::io::Builder::new()
            .write(b"{\"cm\":\"status\"}\r\n")
            .build();
        let log = shared_log();
        let mut writer = FrameWriter::new(port, Arc::clone(&log), "test");
        let frame = Frame::from_value(json!({"cm": "status"})).expect("object");

        // Act
        writer.send(&frame).await.expect("send");

        // Assert
        assert_eq!(log.lock().expect("lock").entries()[0].direction, Direction::Tx);
    }

    #[tokio::test]
    async fn test_reader_surfaces_port_error() {
        let port = tokio_test::io::Builder::new()
            .read_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged"))
            .build();
        let mut reader = FrameReader::new(port, shared_log(), "test");
        assert!(matches!(reader.next_frame().await, Err(TransportError::Io(_))));
    }
}
