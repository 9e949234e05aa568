//! SSH command transport backing the SSH and SSH+ComPort generic command
//! drivers (spec §4.B, grounded on
//! `examples/original_source/backend/app/services/instruments/l6mpu_ssh.py`
//! and `l6mpu_ssh_comport.py`, which open a session to an embedded Linux
//! target and issue one shell command per measurement).
//!
//! `ssh2` is blocking, so every call runs on a `spawn_blocking` task, the
//! same pattern the teacher uses for `serialport` in
//! `src/adapters/serial_adapter.rs`.

use std::io::Read;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::transport::Transport;

#[cfg(feature = "instrument_ssh")]
struct Session {
    handle: ssh2::Session,
}

/// One request/response round trip is one shell command execution; `send`
/// stages the command text, `recv` runs it and collects stdout.
pub struct SshTransport {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    private_key_path: Option<String>,
    connect_timeout: Duration,
    pending_command: Option<String>,
    #[cfg(feature = "instrument_ssh")]
    session: Option<Arc<Mutex<Session>>>,
    #[cfg(not(feature = "instrument_ssh"))]
    _session: Option<Arc<Mutex<()>>>,
}

impl SshTransport {
    pub fn new(host: String, port: u16, username: String, connect_timeout: Duration) -> Self {
        Self {
            host,
            port,
            username,
            password: None,
            private_key_path: None,
            connect_timeout,
            pending_command: None,
            #[cfg(feature = "instrument_ssh")]
            session: None,
            #[cfg(not(feature = "instrument_ssh"))]
            _session: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_private_key(mut self, path: impl Into<String>) -> Self {
        self.private_key_path = Some(path.into());
        self
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open(&mut self) -> EngineResult<()> {
        #[cfg(feature = "instrument_ssh")]
        {
            let host = self.host.clone();
            let port = self.port;
            let username = self.username.clone();
            let password = self.password.clone();
            let key_path = self.private_key_path.clone();
            let connect_timeout = self.connect_timeout;

            let session = tokio::task::spawn_blocking(move || -> EngineResult<Session> {
                let tcp = TcpStream::connect((host.as_str(), port)).map_err(EngineError::Io)?;
                tcp.set_read_timeout(Some(connect_timeout))
                    .map_err(EngineError::Io)?;
                let mut handle = ssh2::Session::new().map_err(|e| {
                    EngineError::TransportOpenError(format!("ssh session init failed: {e}"))
                })?;
                handle.set_tcp_stream(tcp);
                handle.handshake().map_err(|e| {
                    EngineError::TransportOpenError(format!("ssh handshake failed: {e}"))
                })?;

                if let Some(key) = key_path {
                    handle
                        .userauth_pubkey_file(&username, None, std::path::Path::new(&key), None)
                        .map_err(|e| {
                            EngineError::TransportOpenError(format!("ssh key auth failed: {e}"))
                        })?;
                } else {
                    let password = password.unwrap_or_default();
                    handle
                        .userauth_password(&username, &password)
                        .map_err(|e| {
                            EngineError::TransportOpenError(format!(
                                "ssh password auth failed: {e}"
                            ))
                        })?;
                }

                if !handle.authenticated() {
                    return Err(EngineError::TransportOpenError(
                        "ssh authentication did not complete".into(),
                    ));
                }
                Ok(Session { handle })
            })
            .await
            .map_err(|e| EngineError::Internal(format!("ssh open task panicked: {e}")))??;

            self.session = Some(Arc::new(Mutex::new(session)));
            Ok(())
        }
        #[cfg(not(feature = "instrument_ssh"))]
        {
            Err(EngineError::TransportOpenError(
                "ssh support not enabled; rebuild with --features instrument_ssh".into(),
            ))
        }
    }

    async fn close(&mut self) -> EngineResult<()> {
        #[cfg(feature = "instrument_ssh")]
        {
            self.session = None;
        }
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> EngineResult<()> {
        self.pending_command = Some(String::from_utf8_lossy(frame).into_owned());
        Ok(())
    }

    async fn recv(&mut self, timeout_dur: Duration) -> EngineResult<Vec<u8>> {
        #[cfg(feature = "instrument_ssh")]
        {
            let session = self.session.clone().ok_or(EngineError::TransportClosed)?;
            let command = self
                .pending_command
                .take()
                .ok_or_else(|| EngineError::Internal("recv called before send".into()))?;

            let result = tokio::task::spawn_blocking(move || -> EngineResult<Vec<u8>> {
                let guard = session.lock().map_err(|_| {
                    EngineError::Internal("ssh session mutex poisoned".into())
                })?;
                let mut channel = guard.handle.channel_session().map_err(|e| {
                    EngineError::TransportOpenError(format!("failed to open channel: {e}"))
                })?;
                channel.exec(&command).map_err(|e| {
                    EngineError::DomainError(format!("ssh command execution failed: {e}"))
                })?;
                let mut output = String::new();
                channel.read_to_string(&mut output).map_err(EngineError::Io)?;
                channel.wait_close().ok();
                Ok(output.into_bytes())
            });

            tokio::time::timeout(timeout_dur, result)
                .await
                .map_err(|_| EngineError::TransportTimeout(timeout_dur))?
                .map_err(|e| EngineError::Internal(format!("ssh recv task panicked: {e}")))?
        }
        #[cfg(not(feature = "instrument_ssh"))]
        {
            let _ = timeout_dur;
            Err(EngineError::TransportClosed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_auth_fields() {
        let t = SshTransport::new(
            "10.0.0.5".into(),
            22,
            "root".into(),
            Duration::from_secs(5),
        )
        .with_password("hunter2");
        assert_eq!(t.password.as_deref(), Some("hunter2"));
        assert!(t.private_key_path.is_none());
    }

    #[tokio::test]
    async fn send_stages_command_text_for_recv() {
        let mut t = SshTransport::new(
            "10.0.0.5".into(),
            22,
            "root".into(),
            Duration::from_secs(5),
        );
        t.send(b"cat /proc/uptime").await.unwrap();
        assert_eq!(t.pending_command.as_deref(), Some("cat /proc/uptime"));
    }
}
