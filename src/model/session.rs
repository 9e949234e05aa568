//! `TestSession`: one run of a test plan against one DUT (spec §3.1, §4.G.1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a `TestSession` (spec §4.G.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Running,
    Completed,
    Failed,
    Aborted,
    Errored,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::Aborted
                | SessionStatus::Errored
        )
    }
}

/// Single aggregate outcome for a terminated session (spec §3.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FinalResult {
    Pass,
    Fail,
    Abort,
    Error,
}

impl std::fmt::Display for FinalResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FinalResult::Pass => "PASS",
            FinalResult::Fail => "FAIL",
            FinalResult::Abort => "ABORT",
            FinalResult::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One run of the test plan against one DUT (spec §3.1).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestSession {
    pub id: Uuid,
    pub serial_number: String,
    pub station_id: String,
    pub operator_id: Option<String>,
    pub project_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_items: u32,
    pub pass_items: u32,
    pub fail_items: u32,
    pub error_items: u32,
    pub final_result: Option<FinalResult>,
    pub duration_ms: u64,
}

impl TestSession {
    pub fn new(serial_number: String, station_id: String, project_id: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            serial_number,
            station_id,
            operator_id: None,
            project_id,
            status: SessionStatus::Created,
            started_at: Utc::now(),
            ended_at: None,
            total_items: 0,
            pass_items: 0,
            fail_items: 0,
            error_items: 0,
            final_result: None,
            duration_ms: 0,
        }
    }

    /// Invariants from spec §3.1.
    pub fn invariants_hold(&self) -> bool {
        if let Some(ended) = self.ended_at {
            if self.started_at > ended {
                return false;
            }
        }
        if self.status.is_terminal() != self.final_result.is_some() {
            return false;
        }
        self.pass_items + self.fail_items + self.error_items <= self.total_items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_created_and_non_terminal() {
        let s = TestSession::new("SN1".into(), "STA1".into(), "PROJ".into());
        assert_eq!(s.status, SessionStatus::Created);
        assert!(s.final_result.is_none());
        assert!(s.invariants_hold());
    }

    #[test]
    fn terminal_status_requires_final_result() {
        let mut s = TestSession::new("SN1".into(), "STA1".into(), "PROJ".into());
        s.status = SessionStatus::Completed;
        assert!(!s.invariants_hold());
        s.final_result = Some(FinalResult::Pass);
        assert!(s.invariants_hold());
    }

    #[test]
    fn item_count_invariant() {
        let mut s = TestSession::new("SN1".into(), "STA1".into(), "PROJ".into());
        s.total_items = 2;
        s.pass_items = 2;
        s.fail_items = 1;
        assert!(!s.invariants_hold());
    }
}
