//! Framed transport primitives atop raw byte/datagram/stream I/O (spec §4.A).
//!
//! Every transport exposes `open`/`close`/`send`/`recv` plus scoped
//! acquisition with guaranteed release on all exit paths (provided by
//! [`crate::pool::Lease`], not by this trait itself). All I/O here is
//! async/cooperative; any read that might stall is bounded by the caller's
//! deadline.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::EngineResult;

pub mod can;
pub mod chassis;
pub mod framing;
pub mod ls_safety;
pub mod serial;
pub mod simulated;
pub mod ssh;
pub mod tcp;
pub mod vcu_udp;
pub mod visa;

/// Common transport contract (spec §4.A.1). Implementors drive raw I/O;
/// framing (sync word, length, CRC) is layered on top by transports that
/// need it (chassis, LS safety, VCU).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the underlying connection. Idempotent if already open.
    async fn open(&mut self) -> EngineResult<()>;

    /// Close the connection. Idempotent if already closed.
    async fn close(&mut self) -> EngineResult<()>;

    /// Send a raw frame/message.
    async fn send(&mut self, frame: &[u8]) -> EngineResult<()>;

    /// Receive a raw frame/message, bounded by `timeout`.
    async fn recv(&mut self, timeout: Duration) -> EngineResult<Vec<u8>>;
}

/// Any duplex byte stream a framed driver (chassis fixture, LS safety) can
/// read/write frames over, erased to a trait object so the connection pool
/// can hand the same driver type a `TcpStream` or a `tokio_serial::SerialStream`
/// without a generic parameter leaking into `Box<dyn Driver>`.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}
