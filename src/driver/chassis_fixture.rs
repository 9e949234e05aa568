//! Chassis test-fixture driver: turntable, cliff-sensor doors, encoders
//! (spec §4.B, operates via the framed protocol in §4.A.2 / `transport::chassis`).
//!
//! Message types are grounded on
//! `examples/original_source/backend/app/services/dut_comms/ltl_chassis_fixt_comms/chassis_msgs.py`
//! (request is an even `msg_type`, its response is `msg_type + 1`).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{require, Driver, ParamSchema};
use crate::error::{EngineError, EngineResult};
use crate::model::ParameterValue;
use crate::transport::chassis;
use crate::transport::simulated::SimulatedTransport;
use crate::transport::AsyncDuplex;

const MSG_ACTUATE_CLIFF_SENSOR_DOOR: u16 = 0x10;
const MSG_READ_ENCODER_COUNT: u16 = 0x12;
const MSG_WAIT_FOR_TURNTABLE: u16 = 0x14;
const MSG_ROTATE_TURNTABLE: u16 = 0x16;
const MSG_GET_TURNTABLE_ANGLE: u16 = 0x1A;

/// `operation_enum` from the original protocol.
fn rotation_operation(direction: &str) -> EngineResult<u8> {
    match direction.to_ascii_uppercase().as_str() {
        "ROTATE_LEFT" | "CCW" => Ok(0),
        "ROTATE_RIGHT" | "CW" => Ok(1),
        "ROTATE_TO_OPTO_SWITCH" | "HOME" => Ok(2),
        other => Err(EngineError::BadParameter(format!(
            "unrecognized rotation direction '{other}'"
        ))),
    }
}

/// Backing I/O for a chassis fixture driver: a live duplex stream, or an
/// in-process simulator that never opens a device (spec §4.B.2).
enum Backend {
    Live(Box<dyn AsyncDuplex>),
    Simulated(SimulatedTransport),
}

/// Chassis fixture driver over a framed duplex byte stream (a real serial
/// port or TCP socket, erased behind [`AsyncDuplex`]) or a simulator.
pub struct ChassisFixtureDriver {
    backend: Backend,
    timeout: Duration,
}

impl ChassisFixtureDriver {
    pub fn new(stream: Box<dyn AsyncDuplex>, timeout: Duration) -> Self {
        Self {
            backend: Backend::Live(stream),
            timeout,
        }
    }

    pub fn simulated(timeout: Duration) -> Self {
        Self {
            backend: Backend::Simulated(SimulatedTransport::new("chassis_fixture").with_nominal(0.0, 1.0)),
            timeout,
        }
    }

    async fn round_trip(&mut self, msg_type: u16, body: &[u8]) -> EngineResult<(u16, Vec<u8>)> {
        match &mut self.backend {
            Backend::Live(stream) => {
                let frame = chassis::encode_frame(msg_type, body);
                chassis::write_frame(stream, &frame).await?;
                chassis::decode_frame(stream, self.timeout).await
            }
            Backend::Simulated(sim) => Ok((msg_type + 1, simulated_response(sim, msg_type))),
        }
    }
}

/// Plausible canned reply bodies per message type, so a simulated session
/// still produces values of the shape each command expects.
fn simulated_response(sim: &mut SimulatedTransport, msg_type: u16) -> Vec<u8> {
    match msg_type {
        MSG_GET_TURNTABLE_ANGLE => ((sim.sample().rem_euclid(360.0)) as u16).to_be_bytes().to_vec(),
        MSG_READ_ENCODER_COUNT => ((sim.sample().abs() * 1000.0) as u32).to_be_bytes().to_vec(),
        _ => vec![1],
    }
}

#[async_trait]
impl Driver for ChassisFixtureDriver {
    async fn initialize(&mut self) -> EngineResult<()> {
        Ok(())
    }

    async fn reset(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn retry_safe(&self) -> bool {
        true
    }

    fn schema_for(&self, command: &str, _switch_mode: Option<&str>) -> Option<ParamSchema> {
        match command {
            "RotateTurntable" => Some(ParamSchema::new(
                ["direction", "angle"],
                [],
                "direction=CW,angle=90",
            )),
            "GetTurntableAngle" => Some(ParamSchema::new([], [], "(no parameters)")),
            "ActuateCliffSensorDoor" => Some(ParamSchema::new(["open"], [], "open=true")),
            "ReadEncoderCount" => Some(ParamSchema::new([], [], "(no parameters)")),
            "WaitForTurntable" => Some(ParamSchema::new([], ["timeout_s"], "timeout_s=30")),
            _ => None,
        }
    }

    async fn execute_command(
        &mut self,
        command: &str,
        params: &HashMap<String, ParameterValue>,
    ) -> EngineResult<String> {
        match command {
            "RotateTurntable" => {
                let direction = require(params, command, "direction")?
                    .as_str()
                    .ok_or_else(|| EngineError::BadParameter("direction must be a string".into()))?;
                let angle = require(params, command, "angle")?
                    .as_i64()
                    .ok_or_else(|| EngineError::BadParameter("angle must be an integer".into()))?;
                let operation = rotation_operation(direction)?;
                let mut body = vec![operation];
                body.extend_from_slice(&(angle as u16).to_be_bytes());
                let (_, response) = self.round_trip(MSG_ROTATE_TURNTABLE, &body).await?;
                Ok(format!("{}", response.first().copied().unwrap_or(0)))
            }
            "GetTurntableAngle" => {
                let (_, response) = self.round_trip(MSG_GET_TURNTABLE_ANGLE, &[]).await?;
                if response.len() < 2 {
                    return Err(EngineError::FrameTruncated {
                        expected: 2,
                        actual: response.len(),
                    });
                }
                let angle = u16::from_be_bytes([response[0], response[1]]);
                Ok(angle.to_string())
            }
            "ActuateCliffSensorDoor" => {
                let open = require(params, command, "open")?
                    .as_i64()
                    .map(|v| v != 0)
                    .or_else(|| params.get("open").and_then(|v| v.as_str()).map(|s| s.eq_ignore_ascii_case("true")))
                    .ok_or_else(|| EngineError::BadParameter("open must be boolean-like".into()))?;
                let (_, response) = self
                    .round_trip(MSG_ACTUATE_CLIFF_SENSOR_DOOR, &[open as u8])
                    .await?;
                Ok(format!("{}", response.first().copied().unwrap_or(0)))
            }
            "ReadEncoderCount" => {
                let (_, response) = self.round_trip(MSG_READ_ENCODER_COUNT, &[]).await?;
                if response.len() < 4 {
                    return Err(EngineError::FrameTruncated {
                        expected: 4,
                        actual: response.len(),
                    });
                }
                let count = u32::from_be_bytes([response[0], response[1], response[2], response[3]]);
                Ok(count.to_string())
            }
            "WaitForTurntable" => {
                let (_, response) = self.round_trip(MSG_WAIT_FOR_TURNTABLE, &[]).await?;
                Ok(format!("{}", response.first().copied().unwrap_or(0)))
            }
            other => Err(EngineError::BadParameter(format!(
                "Chassis fixture does not support command '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_operation_maps_known_directions() {
        assert_eq!(rotation_operation("CW").unwrap(), 1);
        assert_eq!(rotation_operation("ROTATE_LEFT").unwrap(), 0);
        assert_eq!(rotation_operation("HOME").unwrap(), 2);
        assert!(rotation_operation("SIDEWAYS").is_err());
    }

    #[tokio::test]
    async fn simulated_driver_never_opens_a_real_stream_and_returns_plausible_values() {
        let mut driver = ChassisFixtureDriver::simulated(Duration::from_millis(50));
        let response = driver
            .execute_command("GetTurntableAngle", &HashMap::new())
            .await
            .unwrap();
        let angle: u16 = response.parse().unwrap();
        assert!(angle < 360);
    }
}
