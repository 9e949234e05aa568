//! SMCV100B signal generator driver (spec §4.B): mode selector ∈ {RESET,
//! DAB, AM, FM, IQ, RF}; each mode has its own required parameters.
//!
//! Grounded on
//! `examples/original_source/backend/app/services/instruments/smcv100b.py`
//! (`configure_dab`/`configure_am`/`configure_fm`/`configure_iq` SCPI
//! sequences: enable the baseband generator for the mode, set
//! frequency/power, then enable RF output).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{require, Driver, ParamSchema};
use crate::error::{EngineError, EngineResult};
use crate::model::ParameterValue;
use crate::transport::Transport;

pub struct Smcv100bDriver {
    transport: Box<dyn Transport>,
    command_timeout: Duration,
}

impl Smcv100bDriver {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            command_timeout: Duration::from_secs(3),
        }
    }

    async fn write(&mut self, command: &str) -> EngineResult<()> {
        self.transport.send(command.as_bytes()).await?;
        self.transport.recv(self.command_timeout).await?;
        Ok(())
    }

    async fn set_frequency_power(&mut self, frequency: f64, power: f64) -> EngineResult<()> {
        self.write(&format!("SOUR:FREQ:CW {frequency}")).await?;
        self.write(&format!("SOUR:POW:POW {power}")).await
    }
}

fn numeric_param(
    params: &HashMap<String, ParameterValue>,
    command: &str,
    key: &str,
) -> EngineResult<f64> {
    require(params, command, key)?
        .as_f64()
        .ok_or_else(|| EngineError::BadParameter(format!("{key} must be numeric")))
}

#[async_trait]
impl Driver for Smcv100bDriver {
    async fn initialize(&mut self) -> EngineResult<()> {
        self.transport.open().await
    }

    async fn reset(&mut self) -> EngineResult<()> {
        self.write("*RST").await
    }

    fn schema_for(&self, command: &str, _switch_mode: Option<&str>) -> Option<ParamSchema> {
        if command != "Configure" {
            return None;
        }
        Some(ParamSchema::new(
            ["mode"],
            ["frequency", "power", "enable"],
            "mode=AM,frequency=100000000,power=-10",
        ))
    }

    async fn execute_command(
        &mut self,
        command: &str,
        params: &HashMap<String, ParameterValue>,
    ) -> EngineResult<String> {
        if command != "Configure" {
            return Err(EngineError::BadParameter(format!(
                "SMCV100B does not support command '{command}'"
            )));
        }
        let mode = require(params, command, "mode")?
            .as_str()
            .ok_or_else(|| EngineError::BadParameter("mode must be a string".into()))?
            .to_ascii_uppercase();

        match mode.as_str() {
            "RESET" => {
                self.reset().await?;
                Ok("RESET".to_string())
            }
            "DAB" => {
                let frequency = numeric_param(params, command, "frequency")?;
                let power = numeric_param(params, command, "power")?;
                self.write("SOURce:BB:DAB:STATe ON").await?;
                self.set_frequency_power(frequency, power).await?;
                self.write("OUTP:STAT ON").await?;
                Ok("DAB".to_string())
            }
            "AM" => {
                let frequency = numeric_param(params, command, "frequency")?;
                let power = numeric_param(params, command, "power")?;
                self.write("SOURce:BB:RAdio:AM:STATe ON").await?;
                self.set_frequency_power(frequency, power).await?;
                self.write("OUTP:STAT ON").await?;
                Ok("AM".to_string())
            }
            "FM" => {
                let frequency = numeric_param(params, command, "frequency")?;
                let power = numeric_param(params, command, "power")?;
                self.write("SOURce:BB:RAdio:FM:STATe ON").await?;
                self.set_frequency_power(frequency, power).await?;
                self.write("OUTP:STAT ON").await?;
                Ok("FM".to_string())
            }
            "IQ" => {
                let enable = params
                    .get("enable")
                    .and_then(ParameterValue::as_i64)
                    .map(|v| v != 0)
                    .unwrap_or(true);
                self.write(&format!(
                    "SOURce:IQ:STATe {}",
                    if enable { "ON" } else { "OFF" }
                ))
                .await?;
                Ok("IQ".to_string())
            }
            "RF" => {
                let frequency = numeric_param(params, command, "frequency")?;
                let power = numeric_param(params, command, "power")?;
                self.set_frequency_power(frequency, power).await?;
                self.write("OUTP:STAT ON").await?;
                Ok("RF".to_string())
            }
            other => Err(EngineError::BadParameter(format!(
                "unrecognized SMCV100B mode '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::simulated::SimulatedTransport;

    #[tokio::test]
    async fn am_mode_requires_frequency_and_power() {
        let mut d = Smcv100bDriver::new(Box::new(SimulatedTransport::new("SMCV100B")));
        d.initialize().await.unwrap();
        let mut params = HashMap::new();
        params.insert("mode".to_string(), ParameterValue::Str("AM".into()));
        let err = d.execute_command("Configure", &params).await.unwrap_err();
        assert!(matches!(err, EngineError::BadParameter(_)));
    }

    #[tokio::test]
    async fn unrecognized_mode_is_rejected() {
        let mut d = Smcv100bDriver::new(Box::new(SimulatedTransport::new("SMCV100B")));
        d.initialize().await.unwrap();
        let mut params = HashMap::new();
        params.insert("mode".to_string(), ParameterValue::Str("LASER".into()));
        let err = d.execute_command("Configure", &params).await.unwrap_err();
        assert!(matches!(err, EngineError::BadParameter(_)));
    }

    #[tokio::test]
    async fn reset_mode_reinitializes_the_instrument() {
        let mut d = Smcv100bDriver::new(Box::new(SimulatedTransport::new("SMCV100B")));
        d.initialize().await.unwrap();
        let mut params = HashMap::new();
        params.insert("mode".to_string(), ParameterValue::Str("RESET".into()));
        assert_eq!(d.execute_command("Configure", &params).await.unwrap(), "RESET");
    }
}
