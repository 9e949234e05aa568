//! Keithley 2015 THD/SINAD meter driver (spec §4.B): a small state machine
//! — 0 = reset, 1 = measurement (mode × type × freq), 2 = signal-generator
//! output (amplitude, impedance, shape).
//!
//! Grounded on
//! `examples/original_source/backend/app/services/instruments/keithley2015.py`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{require, Driver, ParamSchema};
use crate::error::{EngineError, EngineResult};
use crate::model::ParameterValue;
use crate::transport::Transport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Reset,
    Measurement,
    SignalGenerator,
}

pub struct Keithley2015Driver {
    transport: Box<dyn Transport>,
    command_timeout: Duration,
    state: State,
}

impl Keithley2015Driver {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            command_timeout: Duration::from_secs(5),
            state: State::Reset,
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
}

#[async_trait]
impl Driver for Keithley2015Driver {
    async fn initialize(&mut self) -> EngineResult<()> {
        self.transport.open().await?;
        self.write("*RST").await.ok();
        self.state = State::Reset;
        Ok(())
    }

    async fn reset(&mut self) -> EngineResult<()> {
        self.write("*RST").await?;
        self.state = State::Reset;
        Ok(())
    }

    fn schema_for(&self, command: &str, _switch_mode: Option<&str>) -> Option<ParamSchema> {
        match command {
            "Measure" => Some(ParamSchema::new(
                ["mode", "measurement_type", "frequency"],
                [],
                "mode=AUDIO,measurement_type=THD,frequency=1000",
            )),
            "SignalGenerate" => Some(ParamSchema::new(
                ["amplitude", "impedance", "shape"],
                [],
                "amplitude=1.0,impedance=600,shape=SIN",
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
            "Measure" => {
                let mode = require(params, command, "mode")?
                    .as_str()
                    .ok_or_else(|| EngineError::BadParameter("mode must be a string".into()))?;
                let measurement_type = require(params, command, "measurement_type")?
                    .as_str()
                    .ok_or_else(|| {
                        EngineError::BadParameter("measurement_type must be a string".into())
                    })?;
                let frequency = require(params, command, "frequency")?
                    .as_f64()
                    .ok_or_else(|| EngineError::BadParameter("frequency must be numeric".into()))?;

                self.write(&format!("SENS:FUNC '{measurement_type}'")).await?;
                self.write(&format!("SENS:FREQ {frequency}")).await?;
                self.write(&format!("SENS:MODE {mode}")).await?;
                self.state = State::Measurement;
                self.query("READ?").await
            }
            "SignalGenerate" => {
                let amplitude = require(params, command, "amplitude")?
                    .as_f64()
                    .ok_or_else(|| EngineError::BadParameter("amplitude must be numeric".into()))?;
                let impedance = require(params, command, "impedance")?
                    .as_f64()
                    .ok_or_else(|| EngineError::BadParameter("impedance must be numeric".into()))?;
                let shape = require(params, command, "shape")?
                    .as_str()
                    .ok_or_else(|| EngineError::BadParameter("shape must be a string".into()))?;

                self.write(&format!("SOUR:FUNC:SHAP {shape}")).await?;
                self.write(&format!("SOUR:VOLT {amplitude}")).await?;
                self.write(&format!("SOUR:IMP {impedance}")).await?;
                self.write("OUTP ON").await?;
                self.state = State::SignalGenerator;
                Ok("OK".to_string())
            }
            other => Err(EngineError::BadParameter(format!(
                "Keithley 2015 does not support command '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::simulated::SimulatedTransport;

    #[tokio::test]
    async fn measure_transitions_into_measurement_state() {
        let mut d = Keithley2015Driver::new(Box::new(SimulatedTransport::new("2015")));
        d.initialize().await.unwrap();
        let mut params = HashMap::new();
        params.insert("mode".to_string(), ParameterValue::Str("AUDIO".into()));
        params.insert(
            "measurement_type".to_string(),
            ParameterValue::Str("THD".into()),
        );
        params.insert("frequency".to_string(), ParameterValue::Float(1000.0));
        d.execute_command("Measure", &params).await.unwrap();
        assert_eq!(d.state, State::Measurement);
    }

    #[tokio::test]
    async fn signal_generate_requires_all_three_fields() {
        let mut d = Keithley2015Driver::new(Box::new(SimulatedTransport::new("2015")));
        d.initialize().await.unwrap();
        let mut params = HashMap::new();
        params.insert("amplitude".to_string(), ParameterValue::Float(1.0));
        let err = d
            .execute_command("SignalGenerate", &params)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SchemaViolation { .. }));
    }
}
