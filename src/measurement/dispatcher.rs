//! Measurement dispatcher (spec §4.D): maps a `TestPlanItem` to a driver
//! invocation and assembles the typed `TestResult`.
//!
//! Grounded on `examples/original_source/backend/app/services/measurement_service.py`'s
//! `measurement_dispatch` table and `execute_single_measurement` flow
//! (validate → dispatch → execute → time), generalized from a Python
//! function-table dispatch to a typed, in-process call through the
//! connection pool (spec Design Notes "Subprocess-per-instrument → in-process
//! driver").

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use crate::driver::Driver;
use crate::error::EngineError;
use crate::measurement::evaluator;
use crate::model::{ParameterValue, ResultStatus, TestPlanItem, TestPointMap, TestResult};
use crate::pool::ConnectionPool;

/// Sentinel parameter value marking "substitute the `use_result` referent's
/// measured value here" (spec §4.D step 2; Design Notes "Open question" —
/// the original spec leaves the designated key unspecified, so this crate
/// pins it down as: any parameter whose value is this literal sentinel gets
/// replaced. See DESIGN.md.).
pub const USE_RESULT_SENTINEL: &str = "$use_result";

/// Raw-response substrings that the dispatcher coerces to `ERROR`
/// regardless of `limit_type` (spec §4.D.1).
const ERROR_MARKERS: &[&str] = &["No instrument found", "Error:"];

/// Stateless measurement dispatcher: one instance is shared by every
/// session's execution loop, since all mutable state (leases, instrument
/// identity) lives in the `ConnectionPool` and the per-session
/// `TestPointMap`.
pub struct Dispatcher<'a> {
    pool: &'a ConnectionPool,
    default_timeout_ms: u64,
    simulation: bool,
}

impl<'a> Dispatcher<'a> {
    pub fn new(pool: &'a ConnectionPool, default_timeout_ms: u64, simulation: bool) -> Self {
        Self {
            pool,
            default_timeout_ms,
            simulation,
        }
    }

    /// Execute exactly one measurement for `item`, against the current
    /// `map` for `use_result` lookups. Never returns `Err`: every failure
    /// category becomes a `TestResult` whose `result` reflects it (spec §7
    /// "Propagation": failures inside the per-item block are always caught).
    pub async fn dispatch(
        &self,
        session_id: Uuid,
        item: &TestPlanItem,
        map: &TestPointMap,
    ) -> TestResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let command = item.resolved_command().to_string();

        match self.run(item, map, &command).await {
            Ok((measured_value, passed)) => TestResult {
                session_id,
                test_plan_item_id: item.item_key.clone(),
                item_no: item.item_no,
                item_name: item.item_name.clone(),
                measured_value: Some(measured_value),
                lower_limit: item.lower_limit,
                upper_limit: item.upper_limit,
                unit: item.unit.clone(),
                result: if passed {
                    ResultStatus::Pass
                } else {
                    ResultStatus::Fail
                },
                error_message: None,
                execution_duration_ms: start.elapsed().as_millis() as u64,
                started_at,
            },
            Err(Outcome::Fail { measured_value, message }) => TestResult {
                session_id,
                test_plan_item_id: item.item_key.clone(),
                item_no: item.item_no,
                item_name: item.item_name.clone(),
                measured_value,
                lower_limit: item.lower_limit,
                upper_limit: item.upper_limit,
                unit: item.unit.clone(),
                result: ResultStatus::Fail,
                error_message: Some(message),
                execution_duration_ms: start.elapsed().as_millis() as u64,
                started_at,
            },
            Err(Outcome::Error(err)) => {
                tracing::warn!(
                    session_id = %session_id,
                    item_no = item.item_no,
                    command = %command,
                    error = %err,
                    "measurement item failed"
                );
                TestResult {
                    session_id,
                    test_plan_item_id: item.item_key.clone(),
                    item_no: item.item_no,
                    item_name: item.item_name.clone(),
                    measured_value: None,
                    lower_limit: item.lower_limit,
                    upper_limit: item.upper_limit,
                    unit: item.unit.clone(),
                    result: ResultStatus::Error,
                    error_message: Some(err.to_string()),
                    execution_duration_ms: start.elapsed().as_millis() as u64,
                    started_at,
                }
            }
        }
    }

    async fn run(
        &self,
        item: &TestPlanItem,
        map: &TestPointMap,
        command: &str,
    ) -> Result<(String, bool), Outcome> {
        let mut params = item.parameters.clone();
        self.substitute_use_result(item, map, &mut params)?;

        let instrument_id = resolve_instrument_id(item, &params)?;

        let lease_fut = self.pool.get_connection(&instrument_id, self.simulation);
        let mut lease = lease_fut.await.map_err(Outcome::Error)?;

        if let Some(schema) = lease.schema_for(command, item.switch_mode.as_deref()) {
            let missing = schema.missing_keys(&params);
            if !missing.is_empty() {
                return Err(Outcome::Error(EngineError::SchemaViolation {
                    command: command.to_string(),
                    missing,
                }));
            }
        }

        let deadline = Duration::from_millis(item.timeout_ms.unwrap_or(self.default_timeout_ms));
        let retry_safe = lease.retry_safe();

        let raw = match self.invoke(&mut lease, command, &params, deadline).await {
            Ok(raw) => raw,
            Err(err) if retry_safe && err.is_transient_transport() => {
                tracing::debug!(command = %command, "transient transport error, retrying once");
                match self.invoke(&mut lease, command, &params, deadline).await {
                    Ok(raw) => raw,
                    Err(err) => return Err(classify_outcome(err)),
                }
            }
            Err(err) => return Err(classify_outcome(err)),
        };

        if contains_error_marker(&raw) {
            return Err(Outcome::Error(EngineError::DomainError(raw)));
        }

        let coerced = evaluator::coerce(&raw, item.value_type).map_err(Outcome::Error)?;
        let passed = evaluator::evaluate(
            &coerced,
            item.limit_type,
            item.lower_limit,
            item.upper_limit,
            item.eq_limit.as_ref(),
        )
        .map_err(Outcome::Error)?;

        Ok((coerced.canonical(), passed))
    }

    async fn invoke(
        &self,
        lease: &mut crate::pool::Lease,
        command: &str,
        params: &HashMap<String, ParameterValue>,
        deadline: Duration,
    ) -> Result<String, EngineError> {
        match tokio::time::timeout(deadline, lease.execute_command(command, params)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::TransportTimeout(deadline)),
        }
    }

    fn substitute_use_result(
        &self,
        item: &TestPlanItem,
        map: &TestPointMap,
        params: &mut HashMap<String, ParameterValue>,
    ) -> Result<(), Outcome> {
        let Some(referent_key) = &item.use_result else {
            return Ok(());
        };
        let (_, state) = map.get(referent_key).ok_or_else(|| {
            Outcome::Error(EngineError::BadParameter(format!(
                "use_result references unknown item_key '{referent_key}'"
            )))
        })?;
        if !state.executed || !state.passed {
            return Err(Outcome::Error(EngineError::BadParameter(format!(
                "dependency unsatisfied: item_key '{referent_key}' has not executed and passed"
            ))));
        }
        let Some(value) = &state.value else {
            return Err(Outcome::Error(EngineError::BadParameter(format!(
                "dependency unsatisfied: item_key '{referent_key}' produced no value"
            ))));
        };

        let substituted: ParameterValue = value
            .parse::<f64>()
            .map(ParameterValue::Float)
            .unwrap_or_else(|_| ParameterValue::Str(value.clone()));

        for slot in params.values_mut() {
            if matches!(slot, ParameterValue::Str(s) if s == USE_RESULT_SENTINEL) {
                *slot = substituted.clone();
            }
        }
        Ok(())
    }
}

/// Every non-terminal failure the dispatcher needs to turn into a
/// `TestResult` (spec §7 taxonomy mapped onto `ERROR`/`FAIL`).
enum Outcome {
    Error(EngineError),
    Fail {
        measured_value: Option<String>,
        message: String,
    },
}

/// `SetMismatchError` means the measurement ran but produced a device-level
/// negative outcome — spec §7 says that is `FAIL`, not `ERROR`. Every other
/// variant propagates as-is.
fn classify_outcome(err: EngineError) -> Outcome {
    match err {
        EngineError::SetMismatchError { set, measured } => Outcome::Fail {
            measured_value: Some(format!("{measured:.2}")),
            message: format!("set/read-back mismatch: set {set:.2}, measured {measured:.2}"),
        },
        other => Outcome::Error(other),
    }
}

/// Whether a raw driver response should be coerced to `ERROR` regardless of
/// `limit_type` (spec §4.D.1).
fn contains_error_marker(raw: &str) -> bool {
    ERROR_MARKERS.iter().any(|marker| raw.contains(marker))
}

/// Resolve which configured instrument this item drives. Per spec Design
/// Notes (`PowerSetParams{ instrument, channel, volt, curr }`), the
/// instrument identity travels as the `instrument` parameter; items that
/// need no shared hardware (`wait`) fall back to the resolved command name
/// so a test plan can configure a single dedicated "wait" instrument entry.
fn resolve_instrument_id(
    item: &TestPlanItem,
    params: &HashMap<String, ParameterValue>,
) -> Result<String, Outcome> {
    if let Some(id) = params.get("instrument").and_then(ParameterValue::as_str) {
        return Ok(id.to_string());
    }
    if let Some(mode) = &item.switch_mode {
        return Ok(mode.clone());
    }
    Ok(item.resolved_command().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, EngineConfig, InstrumentConfig};
    use crate::model::{LimitType, TestPointMap, ValueType};
    use std::collections::HashMap as Map;

    fn config() -> EngineConfig {
        EngineConfig {
            instruments: vec![
                InstrumentConfig {
                    id: "wait".to_string(),
                    r#type: "wait".to_string(),
                    connection: ConnectionConfig::Simulated {
                        model: "wait".to_string(),
                    },
                    options: Map::new(),
                    enabled: true,
                },
                InstrumentConfig {
                    id: "PS1".to_string(),
                    r#type: "Model2303".to_string(),
                    connection: ConnectionConfig::Simulated {
                        model: "2303".to_string(),
                    },
                    options: Map::new(),
                    enabled: true,
                },
            ],
            report_root: "./reports".into(),
            default_item_timeout_ms: 5_000,
            stop_on_fail: true,
            simulation: true,
        }
    }

    fn item(no: u32, key: &str, command: &str) -> TestPlanItem {
        TestPlanItem {
            item_no: no,
            item_name: format!("item-{no}"),
            item_key: key.to_string(),
            command: command.to_string(),
            switch_mode: None,
            parameters: Map::new(),
            value_type: ValueType::Float,
            limit_type: LimitType::None,
            lower_limit: None,
            upper_limit: None,
            eq_limit: None,
            unit: None,
            enabled: true,
            timeout_ms: None,
            wait_ms: None,
            use_result: None,
        }
    }

    #[tokio::test]
    async fn wait_item_passes_with_none_limit_type() {
        let pool = ConnectionPool::new(config());
        let dispatcher = Dispatcher::new(&pool, 5_000, true);
        let mut i = item(1, "A", "wait");
        i.parameters.insert("instrument".into(), ParameterValue::Str("wait".into()));
        i.parameters.insert("wait_ms".into(), ParameterValue::Int(10));
        let map = TestPointMap::build(vec![]).unwrap();
        let result = dispatcher.dispatch(Uuid::new_v4(), &i, &map).await;
        assert_eq!(result.result, ResultStatus::Pass);
    }

    #[tokio::test]
    async fn missing_instrument_parameter_is_error_not_panic() {
        let pool = ConnectionPool::new(config());
        let dispatcher = Dispatcher::new(&pool, 5_000, true);
        let mut i = item(1, "A", "PowerRead");
        i.limit_type = LimitType::None;
        i.switch_mode = None;
        i.command = "PowerRead".to_string();
        i.parameters.clear();
        // No "instrument" parameter and no switch_mode: falls back to the
        // resolved command name, which has no matching configured
        // instrument, so the pool lease fails with InstrumentNotFound.
        let map = TestPointMap::build(vec![]).unwrap();
        let result = dispatcher.dispatch(Uuid::new_v4(), &i, &map).await;
        assert_eq!(result.result, ResultStatus::Error);
    }

    #[tokio::test]
    async fn use_result_dependency_not_executed_is_error() {
        let pool = ConnectionPool::new(config());
        let dispatcher = Dispatcher::new(&pool, 5_000, true);
        let mut i = item(2, "B", "PowerRead");
        i.use_result = Some("A".to_string());
        i.parameters
            .insert("instrument".into(), ParameterValue::Str("PS1".into()));
        let base = item(1, "A", "PowerRead");
        let map = TestPointMap::build(vec![base]).unwrap();
        let result = dispatcher.dispatch(Uuid::new_v4(), &i, &map).await;
        assert_eq!(result.result, ResultStatus::Error);
        assert!(result.error_message.unwrap().contains("dependency unsatisfied"));
    }

    #[test]
    fn error_markers_are_detected_regardless_of_limit_type() {
        assert!(contains_error_marker("No instrument found for id PS1"));
        assert!(contains_error_marker("Error: timeout waiting for reply"));
        assert!(!contains_error_marker("5.021"));
    }

    #[tokio::test]
    async fn send_command_round_trips_through_a_simulated_com_port() {
        let mut instruments = config();
        instruments.instruments.push(InstrumentConfig {
            id: "CMD1".to_string(),
            r#type: "ComPort".to_string(),
            connection: ConnectionConfig::Simulated {
                model: "ComPort".to_string(),
            },
            options: Map::new(),
            enabled: true,
        });
        let pool = ConnectionPool::new(instruments);
        let dispatcher = Dispatcher::new(&pool, 5_000, true);
        let mut i = item(1, "A", "SendCommand");
        i.value_type = ValueType::Float;
        i.limit_type = LimitType::None;
        i.parameters
            .insert("instrument".into(), ParameterValue::Str("CMD1".into()));
        i.parameters.insert(
            "command_text".into(),
            ParameterValue::Str("MEAS:VOLT?".into()),
        );
        let map = TestPointMap::build(vec![]).unwrap();
        let result = dispatcher.dispatch(Uuid::new_v4(), &i, &map).await;
        assert_eq!(result.result, ResultStatus::Pass);
        assert!(result.measured_value.unwrap().parse::<f64>().is_ok());
    }
}
