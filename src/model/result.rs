//! The per-item observation model (spec §3.1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal outcome of executing a single test-plan item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultStatus {
    Pass,
    Fail,
    Error,
    Skip,
    Abort,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultStatus::Pass => "PASS",
            ResultStatus::Fail => "FAIL",
            ResultStatus::Error => "ERROR",
            ResultStatus::Skip => "SKIP",
            ResultStatus::Abort => "ABORT",
        };
        f.write_str(s)
    }
}

/// One observation, persisted once per `(session_id, item_no)` on the
/// successful path (spec §3.1).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub session_id: Uuid,
    pub test_plan_item_id: String,
    pub item_no: u32,
    pub item_name: String,
    /// String-encoded canonical representation of a number, text, or null.
    pub measured_value: Option<String>,
    pub lower_limit: Option<f64>,
    pub upper_limit: Option<f64>,
    pub unit: Option<String>,
    pub result: ResultStatus,
    pub error_message: Option<String>,
    pub execution_duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

impl TestResult {
    /// Invariant from spec §3.1: `result = ERROR` implies a non-empty
    /// `error_message`.
    pub fn invariant_holds(&self) -> bool {
        if self.result == ResultStatus::Error {
            return self
                .error_message
                .as_ref()
                .is_some_and(|m| !m.is_empty());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TestResult {
        TestResult {
            session_id: Uuid::new_v4(),
            test_plan_item_id: "A".into(),
            item_no: 1,
            item_name: "item".into(),
            measured_value: None,
            lower_limit: None,
            upper_limit: None,
            unit: None,
            result: ResultStatus::Pass,
            error_message: None,
            execution_duration_ms: 0,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn error_without_message_violates_invariant() {
        let mut r = base();
        r.result = ResultStatus::Error;
        assert!(!r.invariant_holds());
        r.error_message = Some("boom".into());
        assert!(r.invariant_holds());
    }

    #[test]
    fn pass_without_message_is_fine() {
        assert!(base().invariant_holds());
    }
}
