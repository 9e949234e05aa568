//! Channel-switched DMM/DAQ drivers: DAQ973A / 34970A / APS7050 / DAQ6510
//! (spec §4.B). Current-capable channels are a fixed subset per model; a
//! current measurement request on any other channel is a domain error.
//!
//! Grounded on
//! `examples/original_source/backend/app/services/instruments/daq973a.py`
//! and `a34970a.py` (channel scan list, `MEAS:<FUNC>? (@<channel>)` SCPI
//! shape).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{require, Driver, ParamSchema};
use crate::error::{EngineError, EngineResult};
use crate::model::ParameterValue;
use crate::transport::Transport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaqModel {
    Daq973a,
    Daq34970a,
    Aps7050,
    Daq6510,
}

impl DaqModel {
    /// Channels wired for current measurement, per spec §4.B's table
    /// ("Current-capable channels are a fixed subset (e.g. {121,122} for
    /// DAQ973A)").
    fn current_capable_channels(&self) -> &'static [u32] {
        match self {
            DaqModel::Daq973a => &[121, 122],
            DaqModel::Daq34970a => &[121, 122],
            DaqModel::Aps7050 => &[101, 102],
            DaqModel::Daq6510 => &[121, 122, 123],
        }
    }
}

pub struct DaqDmmDriver {
    model: DaqModel,
    transport: Box<dyn Transport>,
    command_timeout: Duration,
}

impl DaqDmmDriver {
    pub fn new(model: DaqModel, transport: Box<dyn Transport>) -> Self {
        Self {
            model,
            transport,
            command_timeout: Duration::from_secs(5),
        }
    }

    async fn query(&mut self, command: &str) -> EngineResult<String> {
        self.transport.send(command.as_bytes()).await?;
        let raw = self.transport.recv(self.command_timeout).await?;
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }
}

#[async_trait]
impl Driver for DaqDmmDriver {
    async fn initialize(&mut self) -> EngineResult<()> {
        self.transport.open().await?;
        self.transport.send(b"*RST").await?;
        self.transport.recv(self.command_timeout).await.ok();
        Ok(())
    }

    async fn reset(&mut self) -> EngineResult<()> {
        self.transport.send(b"*RST").await?;
        self.transport.recv(self.command_timeout).await?;
        Ok(())
    }

    fn schema_for(&self, command: &str, _switch_mode: Option<&str>) -> Option<ParamSchema> {
        match command {
            "VoltageRead" | "CurrentRead" | "ResistanceRead" | "TemperatureRead" => Some(
                ParamSchema::new(["channel"], [], "channel=101"),
            ),
            _ => None,
        }
    }

    async fn execute_command(
        &mut self,
        command: &str,
        params: &HashMap<String, ParameterValue>,
    ) -> EngineResult<String> {
        let channel = require(params, command, "channel")?
            .as_i64()
            .ok_or_else(|| EngineError::BadParameter("channel must be an integer".into()))?
            as u32;

        let function = match command {
            "VoltageRead" => "VOLT:DC",
            "CurrentRead" => {
                if !self.model.current_capable_channels().contains(&channel) {
                    return Err(EngineError::DomainError(format!(
                        "channel {channel} is not current-capable on {:?}",
                        self.model
                    )));
                }
                "CURR:DC"
            }
            "ResistanceRead" => "RES",
            "TemperatureRead" => "TEMP",
            other => {
                return Err(EngineError::BadParameter(format!(
                    "{:?} does not support command '{other}'",
                    self.model
                )))
            }
        };

        self.query(&format!("MEAS:{function}? (@{channel})")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::simulated::SimulatedTransport;

    fn driver() -> DaqDmmDriver {
        DaqDmmDriver::new(DaqModel::Daq973a, Box::new(SimulatedTransport::new("DAQ973A")))
    }

    #[tokio::test]
    async fn current_read_on_noncapable_channel_is_domain_error() {
        let mut d = driver();
        d.initialize().await.unwrap();
        let mut params = HashMap::new();
        params.insert("channel".to_string(), ParameterValue::Int(101));
        let err = d.execute_command("CurrentRead", &params).await.unwrap_err();
        assert!(matches!(err, EngineError::DomainError(_)));
    }

    #[tokio::test]
    async fn current_read_on_capable_channel_succeeds() {
        let mut d = driver();
        d.initialize().await.unwrap();
        let mut params = HashMap::new();
        params.insert("channel".to_string(), ParameterValue::Int(121));
        let result = d.execute_command("CurrentRead", &params).await.unwrap();
        assert!(result.parse::<f64>().is_ok());
    }

    #[tokio::test]
    async fn voltage_read_requires_channel() {
        let mut d = driver();
        d.initialize().await.unwrap();
        let params = HashMap::new();
        let err = d.execute_command("VoltageRead", &params).await.unwrap_err();
        assert!(matches!(err, EngineError::SchemaViolation { .. }));
    }
}
