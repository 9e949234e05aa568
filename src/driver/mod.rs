//! Instrument driver contract and per-family implementations (spec §4.B).
//!
//! Every driver implements [`Driver`]: a lifecycle (`initialize`/`reset`)
//! plus the dispatcher-facing `execute_command`. Parameters are a free-form
//! map (`ParameterValue` keeps the original type instead of forcing
//! everything through strings) and each driver publishes a [`ParamSchema`]
//! per `(command, switch_mode)` pair the dispatcher uses for pre-flight
//! validation (spec §4.B.1).
//!
//! Generalizes the teacher's `HardwareAdapter` (`src/hardware/adapter.rs`)
//! contract: `default_config`/`validate_config` becomes `schema_for`, and
//! `connect`/`disconnect` becomes `initialize`/`reset` to match this
//! domain's "known state" semantics rather than a raw transport lifecycle.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::model::ParameterValue;

pub mod analog_discovery;
pub mod chassis_fixture;
pub mod daq_dmm;
pub mod generic_command;
pub mod keithley2015;
pub mod ls_vcu;
pub mod mdo34;
pub mod peak_can;
pub mod power_supply;
pub mod registry;
pub mod relay;
pub mod smcv100b;
pub mod wait;
pub mod wireless_tester;

/// A command's parameter contract, advertised so the dispatcher can
/// pre-validate before ever invoking the driver (spec §4.B.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSchema {
    pub required: Vec<String>,
    pub optional: Vec<String>,
    pub example: String,
}

impl ParamSchema {
    pub fn new(
        required: impl IntoIterator<Item = &'static str>,
        optional: impl IntoIterator<Item = &'static str>,
        example: impl Into<String>,
    ) -> Self {
        Self {
            required: required.into_iter().map(String::from).collect(),
            optional: optional.into_iter().map(String::from).collect(),
            example: example.into(),
        }
    }

    /// Check `params` against this schema, returning the missing keys.
    pub fn missing_keys(&self, params: &HashMap<String, ParameterValue>) -> Vec<String> {
        self.required
            .iter()
            .filter(|key| !params.contains_key(key.as_str()))
            .cloned()
            .collect()
    }
}

/// Common driver contract (spec §4.B).
#[async_trait]
pub trait Driver: Send + Sync {
    /// Reset to a known state (e.g. SCPI `*RST`, or a protocol handshake).
    /// Idempotent.
    async fn initialize(&mut self) -> EngineResult<()>;

    /// Restore to idle/output-off.
    async fn reset(&mut self) -> EngineResult<()>;

    /// Advertise the parameter schema for `command` under `switch_mode`
    /// (`switch_mode` is `None` for drivers with a single command shape).
    fn schema_for(&self, command: &str, switch_mode: Option<&str>) -> Option<ParamSchema>;

    /// Execute one dispatcher-facing command, returning the raw response
    /// text for the limit evaluator to parse (spec §4.D step 6).
    async fn execute_command(
        &mut self,
        command: &str,
        params: &HashMap<String, ParameterValue>,
    ) -> EngineResult<String>;

    /// Whether the dispatcher may retry this driver once on a transient
    /// transport fault (spec §4.D step 5, §7: "retried once if the driver
    /// is marked retry-safe"). Defaults to `false`; framed-protocol and
    /// generic command drivers that are naturally idempotent override it.
    fn retry_safe(&self) -> bool {
        false
    }
}

/// Look up a required parameter, or fail with a typed schema violation
/// naming both the command and the single missing key (spec §4.B:
/// "enumerate required keys in an error, never silently default
/// safety-critical values"). Mirrors
/// `original_source`'s `validate_required_params`/`get_param` helpers.
pub fn require<'a>(
    params: &'a HashMap<String, ParameterValue>,
    command: &str,
    key: &str,
) -> EngineResult<&'a ParameterValue> {
    params.get(key).ok_or_else(|| EngineError::SchemaViolation {
        command: command.to_string(),
        missing: vec![key.to_string()],
    })
}

/// Look up an optional parameter, falling back to `default` when absent.
pub fn optional<'a>(
    params: &'a HashMap<String, ParameterValue>,
    key: &str,
    default: &'a ParameterValue,
) -> &'a ParameterValue {
    params.get(key).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_reports_only_absent_required_fields() {
        let schema = ParamSchema::new(["voltage", "channel"], ["slew_rate"], "voltage=5.0,channel=1");
        let mut params = HashMap::new();
        params.insert("voltage".to_string(), ParameterValue::Float(5.0));
        assert_eq!(schema.missing_keys(&params), vec!["channel".to_string()]);
    }

    #[test]
    fn require_fails_with_schema_violation() {
        let params: HashMap<String, ParameterValue> = HashMap::new();
        let err = require(&params, "set_voltage", "voltage").unwrap_err();
        match err {
            EngineError::SchemaViolation { command, missing } => {
                assert_eq!(command, "set_voltage");
                assert_eq!(missing, vec!["voltage".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
