//! Wait driver (spec §4.B): validates `wait_ms` ∈ [0, 3_600_000] and reports
//! elapsed time. Grounded on
//! `examples/original_source/backend/app/services/instruments/wait_test.py`.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;

use crate::driver::{require, Driver, ParamSchema};
use crate::error::{EngineError, EngineResult};
use crate::model::ParameterValue;

const MAX_WAIT_MS: i64 = 3_600_000;

#[derive(Default)]
pub struct WaitDriver;

impl WaitDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for WaitDriver {
    async fn initialize(&mut self) -> EngineResult<()> {
        Ok(())
    }

    async fn reset(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn schema_for(&self, command: &str, _switch_mode: Option<&str>) -> Option<ParamSchema> {
        match command {
            "wait" => Some(ParamSchema::new(["wait_ms"], [], "wait_ms=500")),
            _ => None,
        }
    }

    async fn execute_command(
        &mut self,
        command: &str,
        params: &HashMap<String, ParameterValue>,
    ) -> EngineResult<String> {
        if command != "wait" {
            return Err(EngineError::BadParameter(format!(
                "wait driver does not support command '{command}'"
            )));
        }
        let wait_ms = require(params, command, "wait_ms")?
            .as_i64()
            .ok_or_else(|| EngineError::BadParameter("wait_ms must be an integer".into()))?;
        if !(0..=MAX_WAIT_MS).contains(&wait_ms) {
            return Err(EngineError::BadParameter(format!(
                "wait_ms {wait_ms} out of range [0, {MAX_WAIT_MS}]"
            )));
        }

        let start = Instant::now();
        tokio::time::sleep(std::time::Duration::from_millis(wait_ms as u64)).await;
        Ok(start.elapsed().as_millis().to_string())
    }
}
