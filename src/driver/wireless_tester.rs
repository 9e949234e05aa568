//! Wireless tester drivers: CMW100 / MT8872A (spec §4.B). Long measurements
//! poll a status register; terminal statuses distinguish "sync lost" from
//! "timeout" from "ok".
//!
//! Grounded on
//! `examples/original_source/backend/app/services/instruments/cmw100.py`
//! (`_fetch_ble_results`/`_fetch_wifi_results` polling style) and
//! `mt8872a.py`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::driver::{require, Driver, ParamSchema};
use crate::error::{EngineError, EngineResult};
use crate::model::ParameterValue;
use crate::transport::Transport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WirelessTesterModel {
    Cmw100,
    Mt8872a,
}

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A polled status register's terminal states.
#[derive(Debug, PartialEq, Eq)]
enum StatusOutcome {
    Ok,
    SyncLost,
}

pub struct WirelessTesterDriver {
    model: WirelessTesterModel,
    transport: Box<dyn Transport>,
    command_timeout: Duration,
}

impl WirelessTesterDriver {
    pub fn new(model: WirelessTesterModel, transport: Box<dyn Transport>) -> Self {
        Self {
            model,
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

    async fn poll_status(&mut self, deadline: Duration) -> EngineResult<StatusOutcome> {
        let start = Instant::now();
        loop {
            let raw = self.query("STAT:OPER:COND?").await?;
            match raw.trim() {
                "0" => return Ok(StatusOutcome::Ok),
                "SYNC_LOST" | "-1" => return Ok(StatusOutcome::SyncLost),
                _ => {}
            }
            if start.elapsed() > deadline {
                return Err(EngineError::TransportTimeout(deadline));
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    async fn measure_tx_power(&mut self, technology: &str, expected_power: f64) -> EngineResult<String> {
        self.write(&format!("CONF:{technology}:MEAS:POW")).await?;
        self.write("INIT").await?;
        match self.poll_status(Duration::from_secs(10)).await? {
            StatusOutcome::SyncLost => Err(EngineError::DomainError(format!(
                "{:?}: signal sync lost during {technology} measurement",
                self.model
            ))),
            StatusOutcome::Ok => {
                let raw = self.query("FETC:POW:AVER?").await?;
                let tx_power: f64 = raw.parse().map_err(|_| EngineError::ParseError {
                    raw: raw.clone(),
                    value_type: "float".to_string(),
                })?;
                let _delta = tx_power - expected_power;
                Ok(format!("{tx_power:.2}"))
            }
        }
    }
}

#[async_trait]
impl Driver for WirelessTesterDriver {
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
            "MeasureTxPower" => Some(ParamSchema::new(
                ["technology", "expected_power"],
                [],
                "technology=BLUETOOTH,expected_power=0.0",
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
            "MeasureTxPower" => {
                let technology = require(params, command, "technology")?
                    .as_str()
                    .ok_or_else(|| EngineError::BadParameter("technology must be a string".into()))?
                    .to_string();
                let expected_power = require(params, command, "expected_power")?
                    .as_f64()
                    .ok_or_else(|| {
                        EngineError::BadParameter("expected_power must be numeric".into())
                    })?;
                self.measure_tx_power(&technology, expected_power).await
            }
            other => Err(EngineError::BadParameter(format!(
                "{:?} does not support command '{other}'",
                self.model
            ))),
        }
    }
}
