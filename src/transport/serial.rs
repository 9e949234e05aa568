//! Line-oriented serial transport backing the ComPort/Console generic
//! command drivers and the Chassis/LS fixture connections (spec §4.B,
//! "ComPort / TCPIP / Console / SSH / SSH+ComPort").
//!
//! Generalizes the teacher's `SerialAdapter`
//! (`src/adapters/serial_adapter.rs`): blocking serial I/O is executed on a
//! dedicated `spawn_blocking` task so it never stalls the cooperative
//! scheduler (spec §9, "Cooperative async throughout").

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::transport::Transport;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;

/// Serial transport for RS-232 command/response instruments.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    line_terminator: String,
    response_delimiter: u8,
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
    #[cfg(not(feature = "instrument_serial"))]
    _port: Option<Arc<Mutex<()>>>,
}

impl SerialTransport {
    pub fn new(port_name: String, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port_name,
            baud_rate,
            timeout,
            line_terminator: "\r\n".to_string(),
            response_delimiter: b'\n',
            #[cfg(feature = "instrument_serial")]
            port: None,
            #[cfg(not(feature = "instrument_serial"))]
            _port: None,
        }
    }

    pub fn with_terminator(mut self, terminator: impl Into<String>, delimiter: u8) -> Self {
        self.line_terminator = terminator.into();
        self.response_delimiter = delimiter;
        self
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> EngineResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = serialport::new(&self.port_name, self.baud_rate)
                .timeout(Duration::from_millis(100))
                .open()
                .map_err(|e| {
                    EngineError::TransportOpenError(format!(
                        "failed to open serial port '{}' at {} baud: {e}",
                        self.port_name, self.baud_rate
                    ))
                })?;
            self.port = Some(Arc::new(Mutex::new(port)));
            Ok(())
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(EngineError::TransportOpenError(
                "serial support not enabled; rebuild with --features instrument_serial".into(),
            ))
        }
    }

    async fn close(&mut self) -> EngineResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            self.port = None;
        }
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> EngineResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port.clone().ok_or(EngineError::TransportClosed)?;
            let mut command = frame.to_vec();
            command.extend_from_slice(self.line_terminator.as_bytes());
            tokio::task::spawn_blocking(move || -> EngineResult<()> {
                let mut guard = port.blocking_lock();
                guard.write_all(&command).map_err(EngineError::Io)?;
                guard.flush().map_err(EngineError::Io)?;
                Ok(())
            })
            .await
            .map_err(|e| EngineError::Internal(format!("serial send task panicked: {e}")))?
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = frame;
            Err(EngineError::TransportClosed)
        }
    }

    async fn recv(&mut self, timeout: Duration) -> EngineResult<Vec<u8>> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port.clone().ok_or(EngineError::TransportClosed)?;
            let delimiter = self.response_delimiter;
            let result = tokio::task::spawn_blocking(move || -> EngineResult<Vec<u8>> {
                let mut guard = port.blocking_lock();
                let mut response = Vec::new();
                let mut byte = [0u8; 1];
                let start = std::time::Instant::now();
                loop {
                    if start.elapsed() > timeout {
                        return Err(EngineError::TransportTimeout(timeout));
                    }
                    match guard.read(&mut byte) {
                        Ok(1) => {
                            if byte[0] == delimiter {
                                break;
                            }
                            response.push(byte[0]);
                        }
                        Ok(0) => return Err(EngineError::TransportClosed),
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                        Err(e) => return Err(EngineError::Io(e)),
                        Ok(_) => unreachable!("single-byte read returned >1 byte"),
                    }
                }
                Ok(response)
            })
            .await
            .map_err(|e| EngineError::Internal(format!("serial recv task panicked: {e}")))?;
            result
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = timeout;
            Err(EngineError::TransportClosed)
        }
    }
}
