//! TCP/IP socket transport backing the TCPIP generic command driver and any
//! Serial-over-TCP chassis/LS connections (spec §4.A, §4.B "TCPIP").
//!
//! Grounded on the teacher's socket-handling style in
//! `src/adapters/visa_adapter.rs` (open/close lifecycle around a shared
//! handle) generalized to raw TCP with `tokio::net::TcpStream`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{EngineError, EngineResult};
use crate::transport::Transport;

pub struct TcpTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    response_delimiter: u8,
}

impl TcpTransport {
    pub fn new(host: String, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host,
            port,
            connect_timeout,
            stream: None,
            response_delimiter: b'\n',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.response_delimiter = delimiter;
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> EngineResult<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| EngineError::TransportTimeout(self.connect_timeout))?
            .map_err(|e| {
                EngineError::TransportOpenError(format!("failed to connect to {addr}: {e}"))
            })?;
        stream.set_nodelay(true).map_err(EngineError::Io)?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> EngineResult<()> {
        self.stream = None;
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> EngineResult<()> {
        let stream = self.stream.as_mut().ok_or(EngineError::TransportClosed)?;
        stream.write_all(frame).await.map_err(EngineError::Io)?;
        stream.flush().await.map_err(EngineError::Io)?;
        Ok(())
    }

    async fn recv(&mut self, timeout_dur: Duration) -> EngineResult<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or(EngineError::TransportClosed)?;
        let delimiter = self.response_delimiter;
        timeout(timeout_dur, async move {
            let mut response = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                let n = stream.read(&mut byte).await.map_err(EngineError::Io)?;
                if n == 0 {
                    return Err(EngineError::TransportClosed);
                }
                if byte[0] == delimiter {
                    break;
                }
                response.push(byte[0]);
            }
            Ok(response)
        })
        .await
        .map_err(|_| EngineError::TransportTimeout(timeout_dur))?
    }
}
