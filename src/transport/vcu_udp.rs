//! VCU UDP transport: DUT telemetry over two UDP endpoints, a *connect* port
//! and a *test* port (spec §4.A.4).
//!
//! Handshake: send the literal string `"connect"` to the connect endpoint;
//! must receive an exact echo within a small timeout; retry up to 15 times
//! at 100 ms intervals before failing with `ConnectFailed`. On each request
//! the receive socket buffer is flushed before send to avoid stale frames.
//! Frame detection reuses the LS-safety header shape (spec §4.A.3) over
//! datagram boundaries.

use std::io::Cursor;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::{EngineError, EngineResult};
use crate::transport::ls_safety;

const HANDSHAKE_PAYLOAD: &[u8] = b"connect";
const HANDSHAKE_RETRIES: u32 = 15;
const HANDSHAKE_INTERVAL: Duration = Duration::from_millis(100);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(80);
const MAX_DATAGRAM: usize = 2048;

pub struct VcuUdpTransport {
    connect_addr: SocketAddr,
    test_addr: SocketAddr,
    connect_socket: Option<UdpSocket>,
    test_socket: Option<UdpSocket>,
}

impl VcuUdpTransport {
    pub fn new(connect_addr: SocketAddr, test_addr: SocketAddr) -> Self {
        Self {
            connect_addr,
            test_addr,
            connect_socket: None,
            test_socket: None,
        }
    }

    /// Open local sockets and perform the connect handshake (spec §4.A.4).
    pub async fn connect(&mut self) -> EngineResult<()> {
        let connect_socket = UdpSocket::bind("0.0.0.0:0").await.map_err(EngineError::Io)?;
        connect_socket
            .connect(self.connect_addr)
            .await
            .map_err(EngineError::Io)?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            connect_socket
                .send(HANDSHAKE_PAYLOAD)
                .await
                .map_err(EngineError::Io)?;

            let mut buf = [0u8; 64];
            match timeout(HANDSHAKE_TIMEOUT, connect_socket.recv(&mut buf)).await {
                Ok(Ok(n)) if &buf[..n] == HANDSHAKE_PAYLOAD => break,
                _ => {
                    if attempts >= HANDSHAKE_RETRIES {
                        return Err(EngineError::ConnectFailed(attempts));
                    }
                    tokio::time::sleep(HANDSHAKE_INTERVAL).await;
                }
            }
        }

        let test_socket = UdpSocket::bind("0.0.0.0:0").await.map_err(EngineError::Io)?;
        test_socket
            .connect(self.test_addr)
            .await
            .map_err(EngineError::Io)?;

        self.connect_socket = Some(connect_socket);
        self.test_socket = Some(test_socket);
        Ok(())
    }

    /// Flush any stale datagrams sitting in the test socket's receive
    /// buffer before issuing a new request (spec §4.A.4).
    async fn flush_stale(&self, socket: &UdpSocket) {
        let mut buf = [0u8; MAX_DATAGRAM];
        while timeout(Duration::from_millis(1), socket.recv(&mut buf))
            .await
            .is_ok()
        {}
    }

    /// Send `body` as a framed request on the test port and decode the
    /// response frame.
    pub async fn request(
        &mut self,
        msg_format: u16,
        body: &[u8],
        timeout_dur: Duration,
    ) -> EngineResult<(u16, Vec<u8>)> {
        let socket = self
            .test_socket
            .as_ref()
            .ok_or(EngineError::TransportClosed)?;

        self.flush_stale(socket).await;

        let frame = ls_safety::encode_frame(msg_format, 0, body);
        socket.send(&frame).await.map_err(EngineError::Io)?;

        let mut buf = [0u8; MAX_DATAGRAM];
        let n = timeout(timeout_dur, socket.recv(&mut buf))
            .await
            .map_err(|_| EngineError::TransportTimeout(timeout_dur))?
            .map_err(EngineError::Io)?;

        let mut cursor = Cursor::new(buf[..n].to_vec());
        ls_safety::decode_frame(&mut cursor, timeout_dur).await
    }

    pub async fn close(&mut self) {
        self.connect_socket = None;
        self.test_socket = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_succeeds_against_an_echo_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            if let Ok((n, peer)) = server.recv_from(&mut buf).await {
                let _ = server.send_to(&buf[..n], peer).await;
            }
        });

        let mut transport = VcuUdpTransport::new(server_addr, server_addr);
        transport.connect().await.unwrap();
    }

    #[tokio::test]
    async fn handshake_fails_after_retries_with_no_server() {
        // Bind then drop so the port is (almost certainly) unreachable.
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = probe.local_addr().unwrap();
        drop(probe);

        let mut transport = VcuUdpTransport::new(dead_addr, dead_addr);
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, EngineError::ConnectFailed(15)));
    }
}
