//! Programmable power supply drivers: Model 2303 / 2306 / 2260B / IT6723C /
//! PSW3072 (spec §4.B). Set-and-read-back with a rounded-to-2-decimals
//! comparison; a mismatch propagates as `EngineError::SetMismatchError`
//! rather than being silently accepted as a value, per spec's "never
//! silently default safety-critical values." The dispatcher's
//! `classify_outcome` turns that error into a `FAIL` result (spec §7: the
//! measurement ran, it just produced a device-level negative outcome).
//!
//! Grounded on
//! `examples/original_source/backend/app/services/instruments/model2306.py`
//! and `a2260b.py` (SCPI `*RST`, `VOLT <v>`, `OUTP ON`, `MEAS:VOLT?` shape),
//! adapted onto the teacher's `SerialAdapter`/`VisaAdapter` send/query
//! pattern.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{require, Driver, ParamSchema};
use crate::error::{EngineError, EngineResult};
use crate::model::ParameterValue;
use crate::transport::Transport;

/// Family-specific channel/protocol quirks. Each entry is deliberately a
/// data value, not a separate struct per model, since the SCPI shape is
/// identical across the family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerSupplyModel {
    Model2303,
    Model2306,
    Model2260B,
    It6723c,
    Psw3072,
}

pub struct PowerSupplyDriver {
    model: PowerSupplyModel,
    transport: Box<dyn Transport>,
    command_timeout: Duration,
}

impl PowerSupplyDriver {
    pub fn new(model: PowerSupplyModel, transport: Box<dyn Transport>) -> Self {
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

    async fn write(&mut self, command: &str) -> EngineResult<()> {
        self.transport.send(command.as_bytes()).await?;
        // SCPI set commands still get an OK/echo round trip on these models.
        self.transport.recv(self.command_timeout).await?;
        Ok(())
    }

    async fn set_voltage(&mut self, voltage: f64) -> EngineResult<String> {
        self.write(&format!("VOLT {voltage:.3}")).await?;
        self.write("OUTP ON").await?;
        let measured_raw = self.query("MEAS:VOLT?").await?;
        let measured: f64 = measured_raw.parse().map_err(|_| EngineError::ParseError {
            raw: measured_raw.clone(),
            value_type: "float".to_string(),
        })?;

        let set_rounded = (voltage * 100.0).round() / 100.0;
        let measured_rounded = (measured * 100.0).round() / 100.0;
        if (set_rounded - measured_rounded).abs() > f64::EPSILON {
            return Err(EngineError::SetMismatchError {
                set: set_rounded,
                measured: measured_rounded,
            });
        }
        Ok(format!("{measured_rounded:.2}"))
    }
}

#[async_trait]
impl Driver for PowerSupplyDriver {
    async fn initialize(&mut self) -> EngineResult<()> {
        self.transport.open().await?;
        self.write("*RST").await.ok();
        Ok(())
    }

    async fn reset(&mut self) -> EngineResult<()> {
        self.write("OUTP OFF").await?;
        self.write("*RST").await
    }

    fn schema_for(&self, command: &str, _switch_mode: Option<&str>) -> Option<ParamSchema> {
        match command {
            "PowerSet" => Some(ParamSchema::new(["voltage"], ["channel"], "voltage=5.00")),
            "PowerRead" => Some(ParamSchema::new([], ["channel"], "(no parameters)")),
            _ => None,
        }
    }

    async fn execute_command(
        &mut self,
        command: &str,
        params: &HashMap<String, ParameterValue>,
    ) -> EngineResult<String> {
        match command {
            "PowerSet" => {
                let voltage = require(params, command, "voltage")?
                    .as_f64()
                    .ok_or_else(|| EngineError::BadParameter("voltage must be numeric".into()))?;
                self.set_voltage(voltage).await
            }
            "PowerRead" => self.query("MEAS:VOLT?").await,
            other => Err(EngineError::BadParameter(format!(
                "{:?} does not support command '{other}'",
                self.model
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::simulated::SimulatedTransport;

    #[tokio::test]
    async fn power_set_surfaces_a_mismatch_as_set_mismatch_error_not_a_value() {
        // Nominal 5.5V means set_voltage(5.00) will read back off; force a
        // deterministic mismatch via a wide noise band.
        let sim = SimulatedTransport::new("2306").with_nominal(5.5, 0.3);
        let mut driver = PowerSupplyDriver::new(PowerSupplyModel::Model2306, Box::new(sim));
        driver.initialize().await.unwrap();

        let mut params = HashMap::new();
        params.insert("voltage".to_string(), ParameterValue::Float(5.00));
        let err = driver.execute_command("PowerSet", &params).await.unwrap_err();
        assert!(matches!(err, EngineError::SetMismatchError { .. }));
    }

    #[tokio::test]
    async fn power_set_requires_voltage_parameter() {
        let sim = SimulatedTransport::new("2306");
        let mut driver = PowerSupplyDriver::new(PowerSupplyModel::Model2306, Box::new(sim));
        driver.initialize().await.unwrap();
        let params = HashMap::new();
        let err = driver.execute_command("PowerSet", &params).await.unwrap_err();
        assert!(matches!(err, EngineError::SchemaViolation { .. }));
    }

    #[tokio::test]
    async fn unsupported_command_is_rejected() {
        let sim = SimulatedTransport::new("2306");
        let mut driver = PowerSupplyDriver::new(PowerSupplyModel::Model2306, Box::new(sim));
        driver.initialize().await.unwrap();
        let params = HashMap::new();
        let err = driver
            .execute_command("CurrentRead", &params)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BadParameter(_)));
    }
}
