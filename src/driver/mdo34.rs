//! MDO34 oscilloscope driver (spec §4.B): `auto_setup` polls `BUSY?` down to
//! 0 with a 10 s ceiling; a measurement-type change polls `TYPE?` until it
//! echoes the requested type.
//!
//! Grounded on
//! `examples/original_source/backend/app/services/instruments/mdo34.py`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::driver::{require, Driver, ParamSchema};
use crate::error::{EngineError, EngineResult};
use crate::model::ParameterValue;
use crate::transport::Transport;

const AUTO_SETUP_CEILING: Duration = Duration::from_secs(10);
const TYPE_CHANGE_CEILING: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Mdo34Driver {
    transport: Box<dyn Transport>,
    command_timeout: Duration,
}

impl Mdo34Driver {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            command_timeout: Duration::from_secs(2),
        }
    }

    async fn query(&mut self, command: &str) -> EngineResult<String> {
        self.transport.send(command.as_bytes()).await?;
        let raw = self.transport.recv(self.command_timeout).await?;
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }

    async fn write(&mut self, command: &str) -> EngineResult<()> {
        self.transport.send(command.as_bytes()).await?;
        self.transport.recv(self.command_timeout).await?;
        Ok(())
    }

    async fn auto_setup(&mut self) -> EngineResult<()> {
        self.write("AUTOSet EXECute").await?;
        let start = Instant::now();
        loop {
            let busy = self.query("BUSY?").await?;
            if busy.trim() == "0" {
                return Ok(());
            }
            if start.elapsed() > AUTO_SETUP_CEILING {
                return Err(EngineError::TransportTimeout(AUTO_SETUP_CEILING));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn set_measurement_type(&mut self, channel: &str, measurement_type: &str) -> EngineResult<()> {
        self.write(&format!("MEASU:MEAS1:SOURCE {channel}")).await?;
        self.write(&format!("MEASU:MEAS1:TYPE {measurement_type}")).await?;
        let start = Instant::now();
        loop {
            let confirmed = self.query("MEASU:MEAS1:TYPE?").await?;
            if confirmed.trim().eq_ignore_ascii_case(measurement_type) {
                return Ok(());
            }
            if start.elapsed() > TYPE_CHANGE_CEILING {
                return Err(EngineError::TransportTimeout(TYPE_CHANGE_CEILING));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Driver for Mdo34Driver {
    async fn initialize(&mut self) -> EngineResult<()> {
        self.transport.open().await?;
        self.write("*RST").await.ok();
        Ok(())
    }

    async fn reset(&mut self) -> EngineResult<()> {
        self.write("*RST").await
    }

    fn schema_for(&self, command: &str, _switch_mode: Option<&str>) -> Option<ParamSchema> {
        match command {
            "AutoSetup" => Some(ParamSchema::new([], [], "(no parameters)")),
            "MeasureWaveform" => Some(ParamSchema::new(
                ["channel", "measurement_type"],
                [],
                "channel=CH1,measurement_type=AMPLITUDE",
            )),
            _ => None,
        }
    }

    async fn execute_command(
        &mut self,
        command: &str,
        params: &HashMap<String, ParameterValue>,
    ) -> EngineResult<String> {
        match command {
            "AutoSetup" => {
                self.auto_setup().await?;
                Ok("OK".to_string())
            }
            "MeasureWaveform" => {
                let channel = require(params, command, "channel")?
                    .as_str()
                    .ok_or_else(|| EngineError::BadParameter("channel must be a string".into()))?
                    .to_string();
                let measurement_type = require(params, command, "measurement_type")?
                    .as_str()
                    .ok_or_else(|| {
                        EngineError::BadParameter("measurement_type must be a string".into())
                    })?
                    .to_string();
                self.set_measurement_type(&channel, &measurement_type).await?;
                self.query("MEASU:MEAS1:VALUE?").await
            }
            other => Err(EngineError::BadParameter(format!(
                "MDO34 does not support command '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::simulated::SimulatedTransport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn auto_setup_succeeds_immediately_in_simulation() {
        // `SimulatedTransport` answers `BUSY?` with "0" so a simulated
        // auto-setup clears on the first poll instead of running out its
        // real 10s ceiling (spec §4.B.2).
        let mut d = Mdo34Driver::new(Box::new(SimulatedTransport::new("MDO34")));
        d.initialize().await.unwrap();
        d.execute_command("AutoSetup", &HashMap::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn measure_waveform_succeeds_immediately_in_simulation() {
        let mut d = Mdo34Driver::new(Box::new(SimulatedTransport::new("MDO34")));
        d.initialize().await.unwrap();
        let mut params = HashMap::new();
        params.insert("channel".to_string(), ParameterValue::Str("CH1".into()));
        params.insert(
            "measurement_type".to_string(),
            ParameterValue::Str("AMPLITUDE".into()),
        );
        let result = d.execute_command("MeasureWaveform", &params).await.unwrap();
        assert!(!result.is_empty());
    }

    #[tokio::test]
    async fn measure_waveform_requires_channel_and_type() {
        let mut d = Mdo34Driver::new(Box::new(SimulatedTransport::new("MDO34")));
        d.initialize().await.unwrap();
        let params = HashMap::new();
        let err = d
            .execute_command("MeasureWaveform", &params)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SchemaViolation { .. }));
    }

    /// A transport whose `BUSY?` never clears, for pinning the real ceiling
    /// behavior against real hardware (as opposed to simulation).
    struct AlwaysBusyTransport {
        recv_count: AtomicU32,
    }

    #[async_trait]
    impl Transport for AlwaysBusyTransport {
        async fn open(&mut self) -> EngineResult<()> {
            Ok(())
        }
        async fn close(&mut self) -> EngineResult<()> {
            Ok(())
        }
        async fn send(&mut self, _frame: &[u8]) -> EngineResult<()> {
            Ok(())
        }
        async fn recv(&mut self, _timeout: Duration) -> EngineResult<Vec<u8>> {
            self.recv_count.fetch_add(1, Ordering::SeqCst);
            Ok(b"1".to_vec())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn auto_setup_times_out_when_busy_never_clears_on_real_hardware() {
        let mut d = Mdo34Driver::new(Box::new(AlwaysBusyTransport {
            recv_count: AtomicU32::new(0),
        }));
        d.initialize().await.unwrap();
        let err = d
            .execute_command("AutoSetup", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TransportTimeout(_)));
    }
}
