//! Serial-port links.
//!
//! Controllers speak 8N1 without flow control.  Opening a port can block
//! (USB enumeration, driver probing), so the open runs on the blocking pool.

use async_trait::async_trait;
use tokio_serial::SerialPortBuilderExt;
use tracing::debug;

use crate::application::link::{FrameSink, FrameSource, LinkConnector, SharedFrameLog, TransportError};
use crate::infrastructure::transport::framed::{FrameReader, FrameWriter};

/// Opens `port` at `baudrate` each time the session (re)connects.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port: String,
    baudrate: u32,
}

impl SerialConnector {
    pub fn new(port: impl Into<String>, baudrate: u32) -> Self {
        Self {
            port: port.into(),
            baudrate,
        }
    }

    fn open(port: &str, baudrate: u32) -> Result<tokio_serial::SerialStream, TransportError> {
        tokio_serial::new(port, baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| TransportError::Open {
                port: port.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl LinkConnector for SerialConnector {
    async fn connect(&self, log: SharedFrameLog) -> Result<(Box<dyn FrameSource>, Box<dyn FrameSink>), TransportError> {
        let port = self.port.clone();
        let baudrate = self.baudrate;
        debug!(port = %port, baudrate, "opening serial port");
        let stream = tokio::task::spawn_blocking(move || Self::open(&port, baudrate))
            .await
            .map_err(|e| TransportError::Open {
                port: self.port.clone(),
                reason: format!("open task failed: {e}"),
            })??;

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FrameReader::new(read_half, log.clone(), self.port.clone());
        let writer = FrameWriter::new(write_half, log, self.port.clone());
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.port, self.baudrate)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use ledlink_core::FrameLog;

    use super::*;

    #[test]
    fn test_describe_names_port_and_speed() {
        let connector = SerialConnector::new("/dev/ttyUSB0", 115_200);
        assert_eq!(connector.describe(), "/dev/ttyUSB0@115200");
    }

    #[tokio::test]
    async fn test_missing_port_fails_with_open_error() {
        // Arrange
        let connector = SerialConnector::new("/dev/ledlink-no-such-port", 115_200);
        let log = Arc::new(Mutex::new(FrameLog::new(4)));

        // Act
        let result = connector.connect(log).await;

        // Assert
        assert!(matches!(result, Err(TransportError::Open { .. })));
    }
}
