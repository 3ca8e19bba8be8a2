//! The seam between a controller session and its physical link.
//!
//! A [`LinkConnector`] opens a link and hands back a [`FrameSource`] and a
//! [`FrameSink`].  Sessions only ever see these traits; the serial port and
//! the in-memory test link live in `infrastructure::transport`.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;

use ledlink_core::{Frame, FrameLog, ProtocolError};

/// Frame log shared between a session's reader, its writer and the
/// diagnostics readout.  Held only for the duration of a push or a copy.
pub type SharedFrameLog = Arc<Mutex<FrameLog>>;

/// Error type for link operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The link could not be opened.
    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    /// An I/O error on an open link.
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the link.
    #[error("link closed by peer")]
    Closed,

    /// An outbound frame could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Inbound half of an open link.
#[async_trait]
pub trait FrameSource: Send {
    /// Waits for the next well-formed frame.
    ///
    /// Must be cancel-safe: dropping the future loses no buffered bytes.
    ///
    /// # Errors
    ///
    /// Any [`TransportError`] ends the link.
    async fn next_frame(&mut self) -> Result<Frame, TransportError>;
}

/// Outbound half of an open link.
#[async_trait]
pub trait FrameSink: Send {
    /// Writes one frame and flushes it.
    ///
    /// # Errors
    ///
    /// Any [`TransportError`] ends the link.
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;
}

/// Opens the physical link of one controller.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// Opens the link.  Both halves append to `log`.
    async fn connect(&self, log: SharedFrameLog) -> Result<(Box<dyn FrameSource>, Box<dyn FrameSink>), TransportError>;

    /// Human-readable endpoint for logs, e.g. the serial port path.
    fn describe(&self) -> String;
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
