//! CAN bus transport for PEAK/SocketCAN adapters (spec §4.A, feature-gated
//! since it depends on a Linux-only kernel interface).
//!
//! Grounded on
//! `examples/original_source/backend/app/services/instruments/peak_can.py`:
//! send a frame with an arbitration ID and up to 8 (classic) or 64 (FD)
//! data bytes, then optionally wait for a reply frame matching a filter ID.
//! `socketcan`'s blocking socket is driven through `spawn_blocking`, matching
//! the teacher's treatment of other blocking hardware APIs.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::transport::Transport;

#[cfg(feature = "instrument_can")]
use socketcan::{CanFrame, CanSocket, Frame, Socket, StandardId};

/// One CAN request: an outgoing frame and (optionally) an expected reply ID.
pub struct CanTransport {
    interface: String,
    filter_id: Option<u32>,
    pending_frame: Option<(u32, Vec<u8>)>,
    #[cfg(feature = "instrument_can")]
    socket: Option<CanSocket>,
    #[cfg(not(feature = "instrument_can"))]
    _socket: Option<()>,
}

impl CanTransport {
    pub fn new(interface: String) -> Self {
        Self {
            interface,
            filter_id: None,
            pending_frame: None,
            #[cfg(feature = "instrument_can")]
            socket: None,
            #[cfg(not(feature = "instrument_can"))]
            _socket: None,
        }
    }

    pub fn with_filter(mut self, can_id: u32) -> Self {
        self.filter_id = Some(can_id);
        self
    }
}

#[async_trait]
impl Transport for CanTransport {
    async fn open(&mut self) -> EngineResult<()> {
        #[cfg(feature = "instrument_can")]
        {
            let interface = self.interface.clone();
            let socket = tokio::task::spawn_blocking(move || CanSocket::open(&interface))
                .await
                .map_err(|e| EngineError::Internal(format!("can open task panicked: {e}")))?
                .map_err(|e| {
                    EngineError::TransportOpenError(format!(
                        "failed to open CAN interface: {e}"
                    ))
                })?;
            self.socket = Some(socket);
            Ok(())
        }
        #[cfg(not(feature = "instrument_can"))]
        {
            Err(EngineError::TransportOpenError(
                "CAN support not enabled; rebuild with --features instrument_can".into(),
            ))
        }
    }

    async fn close(&mut self) -> EngineResult<()> {
        #[cfg(feature = "instrument_can")]
        {
            self.socket = None;
        }
        Ok(())
    }

    /// Stage a frame: `frame[0..4]` big-endian arbitration ID, remainder is
    /// data (max 8 bytes for classic CAN).
    async fn send(&mut self, frame: &[u8]) -> EngineResult<()> {
        if frame.len() < 4 {
            return Err(EngineError::BadParameter(
                "CAN frame requires a 4-byte arbitration ID prefix".into(),
            ));
        }
        let can_id = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let data = frame[4..].to_vec();
        if data.len() > 8 {
            return Err(EngineError::BadParameter(
                "classic CAN data payload exceeds 8 bytes".into(),
            ));
        }
        self.pending_frame = Some((can_id, data));

        #[cfg(feature = "instrument_can")]
        {
            let socket = self.socket.as_ref().ok_or(EngineError::TransportClosed)?;
            let (can_id, data) = self.pending_frame.clone().unwrap();
            let id = StandardId::new(can_id as u16)
                .ok_or_else(|| EngineError::BadParameter("CAN ID out of range".into()))?;
            let out_frame = CanFrame::new(id, &data)
                .ok_or_else(|| EngineError::BadParameter("invalid CAN frame".into()))?;
            socket
                .write_frame(&out_frame)
                .map_err(EngineError::Io)?;
            Ok(())
        }
        #[cfg(not(feature = "instrument_can"))]
        {
            Err(EngineError::TransportClosed)
        }
    }

    async fn recv(&mut self, timeout_dur: Duration) -> EngineResult<Vec<u8>> {
        #[cfg(feature = "instrument_can")]
        {
            let socket = self.socket.as_ref().ok_or(EngineError::TransportClosed)?;
            let filter_id = self.filter_id;
            let deadline = tokio::time::Instant::now() + timeout_dur;
            loop {
                if tokio::time::Instant::now() >= deadline {
                    return Err(EngineError::TransportTimeout(timeout_dur));
                }
                match socket.read_frame() {
                    Ok(frame) => {
                        let id = frame.raw_id();
                        if filter_id.map(|f| f == id).unwrap_or(true) {
                            let mut out = id.to_be_bytes().to_vec();
                            out.extend_from_slice(frame.data());
                            return Ok(out);
                        }
                    }
                    Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        }
        #[cfg(not(feature = "instrument_can"))]
        {
            let _ = timeout_dur;
            Err(EngineError::TransportClosed)
        }
    }
}
