//! Analog Discovery 2 USB oscilloscope/AWG driver (spec §4.B): the real
//! hardware is behind an FFI-bound C shared library (WaveForms SDK); when
//! that library isn't present the driver advertises simulation mode and
//! returns synthetic readings instead of failing outright.
//!
//! Grounded on the teacher's `src/instrument/pvcam.rs`, which documents the
//! same "requires an SDK to be installed and linked" shape and ships a
//! synthetic-data fallback placeholder for environments without the SDK.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::driver::{require, Driver, ParamSchema};
use crate::error::{EngineError, EngineResult};
use crate::model::ParameterValue;
use crate::transport::simulated::SimulatedTransport;

/// Whether the WaveForms SDK shared library is linked into this build.
/// There is no Rust binding for it in the pack; this flag is a placeholder
/// the driver checks before attempting any hardware call, so the crate
/// compiles and runs fully in simulation everywhere.
const SDK_LINKED: bool = false;

pub struct AnalogDiscoveryDriver {
    simulated: SimulatedTransport,
}

impl AnalogDiscoveryDriver {
    pub fn new() -> Self {
        Self {
            simulated: SimulatedTransport::new("AD2").with_nominal(0.0, 0.05),
        }
    }

    fn acquire_channel(&mut self, channel: u32, scale: f64) -> f64 {
        let _ = channel;
        self.simulated.sample() * scale
    }

    fn generate_waveform(&self, frequency: f64, amplitude: f64) -> String {
        format!("generated {frequency}Hz @ {amplitude}V (simulated)")
    }
}

impl Default for AnalogDiscoveryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for AnalogDiscoveryDriver {
    async fn initialize(&mut self) -> EngineResult<()> {
        if SDK_LINKED {
            return Err(EngineError::Internal(
                "WaveForms SDK linkage is not implemented; this build only supports simulation mode".into(),
            ));
        }
        Ok(())
    }

    async fn reset(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn schema_for(&self, command: &str, _switch_mode: Option<&str>) -> Option<ParamSchema> {
        match command {
            "AcquireChannel" => Some(ParamSchema::new(
                ["channel"],
                ["scale"],
                "channel=1,scale=1.0",
            )),
            "GenerateWaveform" => Some(ParamSchema::new(
                ["frequency", "amplitude"],
                [],
                "frequency=1000.0,amplitude=1.0",
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
            "AcquireChannel" => {
                let channel = require(params, command, "channel")?
                    .as_i64()
                    .ok_or_else(|| EngineError::BadParameter("channel must be an integer".into()))?
                    as u32;
                let scale = params
                    .get("scale")
                    .and_then(ParameterValue::as_f64)
                    .unwrap_or(1.0);
                Ok(format!("{:.6}", self.acquire_channel(channel, scale)))
            }
            "GenerateWaveform" => {
                let frequency = require(params, command, "frequency")?
                    .as_f64()
                    .ok_or_else(|| EngineError::BadParameter("frequency must be numeric".into()))?;
                let amplitude = require(params, command, "amplitude")?
                    .as_f64()
                    .ok_or_else(|| EngineError::BadParameter("amplitude must be numeric".into()))?;
                Ok(self.generate_waveform(frequency, amplitude))
            }
            other => Err(EngineError::BadParameter(format!(
                "Analog Discovery 2 does not support command '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_channel_returns_a_parsable_reading() {
        let mut d = AnalogDiscoveryDriver::new();
        d.initialize().await.unwrap();
        let mut params = HashMap::new();
        params.insert("channel".to_string(), ParameterValue::Int(1));
        let result = d.execute_command("AcquireChannel", &params).await.unwrap();
        assert!(result.parse::<f64>().is_ok());
    }

    #[tokio::test]
    async fn generate_waveform_requires_frequency_and_amplitude() {
        let mut d = AnalogDiscoveryDriver::new();
        d.initialize().await.unwrap();
        let params = HashMap::new();
        let err = d
            .execute_command("GenerateWaveform", &params)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SchemaViolation { .. }));
    }
}
