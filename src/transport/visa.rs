//! VISA transport for GPIB/USB/LXI-Ethernet instruments (spec §3.1
//! `ConnectionConfig::Visa{resource}`).
//!
//! `visa-rs` is blocking, so every call runs on a `spawn_blocking` task, the
//! same pattern the teacher uses in `src/adapters/visa_adapter.rs`. A
//! trailing `?` on the staged command selects `query` (write + read);
//! anything else is a write-only command with an empty reply, matching the
//! teacher's SCPI query/write split.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::transport::Transport;

#[cfg(feature = "instrument_visa")]
struct Session {
    instrument: Box<dyn visa_rs::Instrument>,
}

/// One request/response round trip stages a SCPI command string via `send`
/// and resolves it via `recv` (query if the command ends in `?`, otherwise
/// a write with an empty reply).
pub struct VisaTransport {
    resource: String,
    line_terminator: String,
    pending_command: Option<String>,
    #[cfg(feature = "instrument_visa")]
    session: Option<std::sync::Arc<std::sync::Mutex<Session>>>,
    #[cfg(not(feature = "instrument_visa"))]
    _session: Option<std::sync::Arc<std::sync::Mutex<()>>>,
}

impl VisaTransport {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            line_terminator: "\n".to_string(),
            pending_command: None,
            #[cfg(feature = "instrument_visa")]
            session: None,
            #[cfg(not(feature = "instrument_visa"))]
            _session: None,
        }
    }

    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }
}

#[async_trait]
impl Transport for VisaTransport {
    async fn open(&mut self) -> EngineResult<()> {
        #[cfg(feature = "instrument_visa")]
        {
            let resource = self.resource.clone();
            let session = tokio::task::spawn_blocking(move || -> EngineResult<Session> {
                let rm = visa_rs::DefaultRM::new().map_err(|e| {
                    EngineError::TransportOpenError(format!(
                        "failed to create VISA resource manager: {e}"
                    ))
                })?;
                let instrument = rm.open(&resource, 5000, 0).map_err(|e| {
                    EngineError::TransportOpenError(format!(
                        "failed to open VISA resource '{resource}': {e}"
                    ))
                })?;
                Ok(Session { instrument })
            })
            .await
            .map_err(|e| EngineError::Internal(format!("visa open task panicked: {e}")))??;

            self.session = Some(std::sync::Arc::new(std::sync::Mutex::new(session)));
            Ok(())
        }
        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(EngineError::TransportOpenError(
                "visa support not enabled; rebuild with --features instrument_visa".into(),
            ))
        }
    }

    async fn close(&mut self) -> EngineResult<()> {
        #[cfg(feature = "instrument_visa")]
        {
            self.session = None;
        }
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> EngineResult<()> {
        self.pending_command = Some(String::from_utf8_lossy(frame).trim().to_string());
        Ok(())
    }

    async fn recv(&mut self, timeout_dur: Duration) -> EngineResult<Vec<u8>> {
        #[cfg(feature = "instrument_visa")]
        {
            let session = self.session.clone().ok_or(EngineError::TransportClosed)?;
            let command = self
                .pending_command
                .take()
                .ok_or_else(|| EngineError::Internal("recv called before send".into()))?;
            let terminator = self.line_terminator.clone();
            let timeout_ms = timeout_dur.as_millis() as u32;

            let result = tokio::task::spawn_blocking(move || -> EngineResult<Vec<u8>> {
                let mut guard = session
                    .lock()
                    .map_err(|_| EngineError::Internal("visa session mutex poisoned".into()))?;
                guard
                    .instrument
                    .set_timeout(timeout_ms)
                    .map_err(|e| EngineError::Internal(format!("failed to set VISA timeout: {e}")))?;

                let command_str = format!("{command}{terminator}");
                if command.ends_with('?') {
                    let response = guard.instrument.query(&command_str).map_err(|e| {
                        EngineError::DomainError(format!("VISA query failed for '{command}': {e}"))
                    })?;
                    Ok(response.trim().as_bytes().to_vec())
                } else {
                    guard.instrument.write(&command_str).map_err(|e| {
                        EngineError::DomainError(format!("VISA write failed for '{command}': {e}"))
                    })?;
                    Ok(Vec::new())
                }
            });

            tokio::time::timeout(timeout_dur, result)
                .await
                .map_err(|_| EngineError::TransportTimeout(timeout_dur))?
                .map_err(|e| EngineError::Internal(format!("visa recv task panicked: {e}")))?
        }
        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = timeout_dur;
            Err(EngineError::TransportClosed)
        }
    }
}
