//! The test-plan data model: `TestPlanItem` and the session-scoped
//! `TestPointMap` derived from it (spec §3.1, §4.F).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// How the raw measured value should be coerced before limit evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Integer,
    Float,
    String,
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValueType::Integer => "integer",
            ValueType::Float => "float",
            ValueType::String => "string",
        };
        f.write_str(s)
    }
}

/// The rule family used to convert a measured value into PASS/FAIL (spec §4.E).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    None,
    Lower,
    Upper,
    Both,
    Equality,
    Partial,
    Inequality,
}

/// A free-form parameter value: scalar string/number, or a nested list.
///
/// Grounded on the teacher's `ParameterValue` used throughout
/// `src/instrument/capabilities.rs` for capability-proxy command arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ParameterValue>),
}

impl ParameterValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Int(i) => Some(*i as f64),
            ParameterValue::Float(f) => Some(*f),
            ParameterValue::Str(s) => s.parse().ok(),
            ParameterValue::List(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(i) => Some(*i),
            ParameterValue::Float(f) => Some(*f as i64),
            ParameterValue::Str(s) => s.parse().ok(),
            ParameterValue::List(_) => None,
        }
    }
}

impl From<&str> for ParameterValue {
    fn from(s: &str) -> Self {
        ParameterValue::Str(s.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(s: String) -> Self {
        ParameterValue::Str(s)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        ParameterValue::Float(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        ParameterValue::Int(v)
    }
}

/// One row of a test plan (spec §3.1).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestPlanItem {
    /// 1..N, strictly ordered within a plan.
    pub item_no: u32,
    pub item_name: String,
    /// Stable identifier used for cross-item reference and map lookup.
    pub item_key: String,
    /// Identifies the measurement handler (e.g. "PowerSet", "PowerRead", "Wait").
    pub command: String,
    /// Secondary classifier: instrument family, or a special handler name.
    /// Special values (`wait`, `relay`, `chassis_rotation`, `console`,
    /// `comport`, `tcpip`) take precedence over `command` when resolving
    /// which measurement handler runs (spec §4.D step 1, Design Notes "Open
    /// question").
    pub switch_mode: Option<String>,
    pub parameters: HashMap<String, ParameterValue>,
    pub value_type: ValueType,
    pub limit_type: LimitType,
    pub lower_limit: Option<f64>,
    pub upper_limit: Option<f64>,
    pub eq_limit: Option<ParameterValue>,
    pub unit: Option<String>,
    pub enabled: bool,
    pub timeout_ms: Option<u64>,
    pub wait_ms: Option<u64>,
    /// Reference to another item's `item_key` whose measured value
    /// substitutes for one of this item's parameters.
    pub use_result: Option<String>,
}

/// The set of `switch_mode` values that take precedence over `command` when
/// selecting a measurement handler (spec §4.D step 1, Design Notes).
pub const SPECIAL_SWITCH_MODES: &[&str] = &[
    "wait",
    "relay",
    "chassis_rotation",
    "console",
    "comport",
    "tcpip",
];

impl TestPlanItem {
    /// Resolve which command the dispatcher should use: a recognized special
    /// `switch_mode` wins, otherwise `command`.
    pub fn resolved_command(&self) -> &str {
        if let Some(mode) = &self.switch_mode {
            let lower = mode.to_lowercase();
            if SPECIAL_SWITCH_MODES.contains(&lower.as_str()) {
                return mode.as_str();
            }
        }
        &self.command
    }

    /// Validate the invariants from spec §3.1: limit-type/limit-field
    /// consistency.
    pub fn validate(&self) -> EngineResult<()> {
        match self.limit_type {
            LimitType::Lower if self.lower_limit.is_none() => {
                return Err(EngineError::BadParameter(format!(
                    "item {}: limit_type=lower requires lower_limit",
                    self.item_no
                )))
            }
            LimitType::Upper if self.upper_limit.is_none() => {
                return Err(EngineError::BadParameter(format!(
                    "item {}: limit_type=upper requires upper_limit",
                    self.item_no
                )))
            }
            LimitType::Both if self.lower_limit.is_none() || self.upper_limit.is_none() => {
                return Err(EngineError::BadParameter(format!(
                    "item {}: limit_type=both requires lower_limit and upper_limit",
                    self.item_no
                )))
            }
            LimitType::Equality | LimitType::Partial | LimitType::Inequality
                if self.eq_limit.is_none() =>
            {
                return Err(EngineError::BadParameter(format!(
                    "item {}: limit_type={:?} requires eq_limit",
                    self.item_no, self.limit_type
                )))
            }
            _ => {}
        }
        Ok(())
    }
}

/// Mutable per-item execution state tracked by the `TestPointMap`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TestPointState {
    pub executed: bool,
    pub passed: bool,
    pub value: Option<String>,
}

/// Session-scoped derived structure: iteration order plus keyed lookup over
/// the enabled items of a test plan (spec §3.1, §4.F). Owned exclusively by
/// the running session's task; discarded at termination.
#[derive(Debug, Default)]
pub struct TestPointMap {
    /// Ordered, enabled items (iteration order == `item_no` order).
    items: Vec<TestPlanItem>,
    /// `item_key` -> index into `items`.
    index: HashMap<String, usize>,
    /// Mutable state parallel to `items`.
    state: Vec<TestPointState>,
}

impl TestPointMap {
    /// Build from the full item list, keeping only enabled items, preserving
    /// `item_no` order.
    pub fn build(mut items: Vec<TestPlanItem>) -> EngineResult<Self> {
        items.retain(|i| i.enabled);
        items.sort_by_key(|i| i.item_no);

        let mut seen_keys = HashSet::new();
        let mut index = HashMap::new();
        for (i, item) in items.iter().enumerate() {
            item.validate()?;
            if !seen_keys.insert(item.item_key.clone()) {
                return Err(EngineError::BadParameter(format!(
                    "duplicate item_key '{}'",
                    item.item_key
                )));
            }
            index.insert(item.item_key.clone(), i);
        }

        let state = vec![TestPointState::default(); items.len()];
        Ok(Self {
            items,
            index,
            state,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate items in `item_no` order.
    pub fn iter(&self) -> impl Iterator<Item = &TestPlanItem> {
        self.items.iter()
    }

    pub fn item_at(&self, idx: usize) -> Option<&TestPlanItem> {
        self.items.get(idx)
    }

    pub fn state_at(&self, idx: usize) -> Option<&TestPointState> {
        self.state.get(idx)
    }

    /// Look up an item (and its current state) by `item_key`.
    pub fn get(&self, item_key: &str) -> Option<(&TestPlanItem, &TestPointState)> {
        let idx = *self.index.get(item_key)?;
        Some((&self.items[idx], &self.state[idx]))
    }

    /// Record the outcome of executing the item at `idx`. Called by the
    /// session engine after each item terminates (spec §4.F).
    pub fn record(&mut self, idx: usize, passed: bool, value: Option<String>) {
        if let Some(s) = self.state.get_mut(idx) {
            s.executed = true;
            s.passed = passed;
            s.value = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(no: u32, key: &str, switch_mode: Option<&str>) -> TestPlanItem {
        TestPlanItem {
            item_no: no,
            item_name: format!("item-{no}"),
            item_key: key.to_string(),
            command: "PowerRead".to_string(),
            switch_mode: switch_mode.map(|s| s.to_string()),
            parameters: HashMap::new(),
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

    #[test]
    fn special_switch_mode_overrides_command() {
        let i = item(1, "A", Some("wait"));
        assert_eq!(i.resolved_command(), "wait");
    }

    #[test]
    fn non_special_switch_mode_is_overridden_by_command() {
        let i = item(1, "A", Some("DAQ973A"));
        assert_eq!(i.resolved_command(), "PowerRead");
    }

    #[test]
    fn map_skips_disabled_items_and_preserves_order() {
        let mut i1 = item(2, "B", None);
        i1.enabled = true;
        let mut i2 = item(1, "A", None);
        i2.enabled = false;
        let map = TestPointMap::build(vec![i1, i2]).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.item_at(0).unwrap().item_key, "B");
    }

    #[test]
    fn duplicate_item_key_rejected() {
        let items = vec![item(1, "A", None), item(2, "A", None)];
        assert!(TestPointMap::build(items).is_err());
    }

    #[test]
    fn lower_limit_without_value_is_invalid() {
        let mut i = item(1, "A", None);
        i.limit_type = LimitType::Lower;
        assert!(i.validate().is_err());
    }

    #[test]
    fn record_updates_state() {
        let i = item(1, "A", None);
        let mut map = TestPointMap::build(vec![i]).unwrap();
        map.record(0, true, Some("12.03".to_string()));
        let (_, state) = map.get("A").unwrap();
        assert!(state.executed);
        assert!(state.passed);
        assert_eq!(state.value.as_deref(), Some("12.03"));
    }
}
