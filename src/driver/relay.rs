//! Relay / chassis-rotate actuator driver (spec §4.B): open/close a relay
//! channel, or rotate CW/CCW for a duration.
//!
//! Grounded on the chassis rotation message shape in
//! `examples/original_source/backend/app/services/dut_comms/ltl_chassis_fixt_comms/chassis_msgs.py`
//! and the simple relay-address commands used throughout the original
//! `dut_comms` instrument drivers.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{require, Driver, ParamSchema};
use crate::error::{EngineError, EngineResult};
use crate::model::ParameterValue;
use crate::transport::Transport;

pub struct RelayDriver {
    transport: Box<dyn Transport>,
    command_timeout: Duration,
}

impl RelayDriver {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            command_timeout: Duration::from_secs(3),
        }
    }
}

#[async_trait]
impl Driver for RelayDriver {
    async fn initialize(&mut self) -> EngineResult<()> {
        self.transport.open().await
    }

    async fn reset(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn schema_for(&self, command: &str, _switch_mode: Option<&str>) -> Option<ParamSchema> {
        match command {
            "relay" => Some(ParamSchema::new(["channel", "state"], [], "channel=1,state=on")),
            "chassis_rotation" => Some(ParamSchema::new(
                ["direction", "duration_ms"],
                [],
                "direction=cw,duration_ms=2000",
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
            "relay" => {
                let channel = require(params, command, "channel")?
                    .as_i64()
                    .ok_or_else(|| EngineError::BadParameter("channel must be an integer".into()))?;
                let state = require(params, command, "state")?
                    .as_str()
                    .ok_or_else(|| EngineError::BadParameter("state must be a string".into()))?;
                let on = match state.to_ascii_lowercase().as_str() {
                    "on" | "close" | "closed" | "1" => true,
                    "off" | "open" | "0" => false,
                    other => {
                        return Err(EngineError::BadParameter(format!(
                            "unrecognized relay state '{other}'"
                        )))
                    }
                };
                let cmd = format!("RELAY:CH{channel}:{}", if on { "CLOSE" } else { "OPEN" });
                self.transport.send(cmd.as_bytes()).await?;
                self.transport.recv(self.command_timeout).await?;
                Ok(if on { "CLOSED" } else { "OPEN" }.to_string())
            }
            "chassis_rotation" => {
                let direction = require(params, command, "direction")?
                    .as_str()
                    .ok_or_else(|| EngineError::BadParameter("direction must be a string".into()))?;
                let duration_ms = require(params, command, "duration_ms")?
                    .as_i64()
                    .ok_or_else(|| {
                        EngineError::BadParameter("duration_ms must be an integer".into())
                    })?;
                let cmd = format!("ROTATE:{}:{duration_ms}", direction.to_ascii_uppercase());
                self.transport.send(cmd.as_bytes()).await?;
                self.transport.recv(self.command_timeout).await?;
                Ok("OK".to_string())
            }
            other => Err(EngineError::BadParameter(format!(
                "relay driver does not support command '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::simulated::SimulatedTransport;

    #[tokio::test]
    async fn relay_on_closes_the_channel() {
        let mut d = RelayDriver::new(Box::new(SimulatedTransport::new("relay")));
        d.initialize().await.unwrap();
        let mut params = HashMap::new();
        params.insert("channel".to_string(), ParameterValue::Int(1));
        params.insert("state".to_string(), ParameterValue::Str("on".into()));
        assert_eq!(d.execute_command("relay", &params).await.unwrap(), "CLOSED");
    }

    #[tokio::test]
    async fn relay_rejects_unrecognized_state() {
        let mut d = RelayDriver::new(Box::new(SimulatedTransport::new("relay")));
        d.initialize().await.unwrap();
        let mut params = HashMap::new();
        params.insert("channel".to_string(), ParameterValue::Int(1));
        params.insert("state".to_string(), ParameterValue::Str("maybe".into()));
        let err = d.execute_command("relay", &params).await.unwrap_err();
        assert!(matches!(err, EngineError::BadParameter(_)));
    }
}
