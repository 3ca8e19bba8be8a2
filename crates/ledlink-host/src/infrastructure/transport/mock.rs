//! In-memory links for tests and demos.
//!
//! Each [`DuplexConnector::connect`] creates a fresh `tokio::io::duplex` pair,
//! hands the host end to the session and publishes the device end as a
//! [`DeviceEnd`] on a channel, so a test can play the controller.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::application::link::{FrameSink, FrameSource, LinkConnector, SharedFrameLog, TransportError};
use crate::infrastructure::transport::framed::{FrameReader, FrameWriter};

const DUPLEX_BUFFER: usize = 16 * 1024;

/// Connector that produces in-memory links.
pub struct DuplexConnector {
    label: String,
    devices: mpsc::UnboundedSender<DeviceEnd>,
    refusals: AtomicUsize,
}

impl DuplexConnector {
    /// Returns the connector and the receiver of device ends, one per
    /// successful connect.
    pub fn new(label: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<DeviceEnd>) {
        let (devices, rx) = mpsc::unbounded_channel();
        let connector = Self {
            label: label.into(),
            devices,
            refusals: AtomicUsize::new(0),
        };
        (connector, rx)
    }

    /// Makes the next `count` connect attempts fail.
    pub fn refuse_next(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl LinkConnector for DuplexConnector {
    async fn connect(&self, log: SharedFrameLog) -> Result<(Box<dyn FrameSource>, Box<dyn FrameSink>), TransportError> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Open {
                port: self.label.clone(),
                reason: "refused".to_string(),
            });
        }

        let (host, device) = tokio::io::duplex(DUPLEX_BUFFER);
        self.devices
            .send(DeviceEnd::new(device))
            .map_err(|_| TransportError::Closed)?;
        let (read_half, write_half) = tokio::io::split(host);
        Ok((
            Box::new(FrameReader::new(read_half, log.clone(), self.label.clone())),
            Box::new(FrameWriter::new(write_half, log, self.label.clone())),
        ))
    }

    fn describe(&self) -> String {
        format!("duplex:{}", self.label)
    }
}

/// The controller side of an in-memory link.
pub struct DeviceEnd {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl DeviceEnd {
    fn new(stream: DuplexStream) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    /// Next JSON line sent by the host, or `None` once the host hung up.
    ///
    /// # Errors
    ///
    /// Returns an I/O error for a failed read or a line that is not JSON.
    pub async fn recv(&mut self) -> std::io::Result<Option<Value>> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        serde_json::from_str(line.trim())
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Sends one JSON frame to the host.
    ///
    /// # Errors
    ///
    /// Returns an I/O error once the host end is gone.
    pub async fn send(&mut self, value: &Value) -> std::io::Result<()> {
        let mut line = value.to_string().into_bytes();
        line.extend_from_slice(b"\r\n");
        self.send_raw(&line).await
    }

    /// Sends raw bytes, e.g. a corrupt line.
    ///
    /// # Errors
    ///
    /// Returns an I/O error once the host end is gone.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }
}
