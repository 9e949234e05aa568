//! Session execution engine (spec §4.G): drives one `TestSession` from
//! `Created` through its terminal state, dispatching every enabled item in
//! plan order and persisting as it goes.
//!
//! Grounded on
//! `examples/original_source/backend/app/services/test_engine.py`'s
//! `run_test_session`/`_execute_single_item`/`_finalize_test_session`: the
//! same per-item "check stop, dispatch, persist, update dependency state,
//! stop-on-fail" loop and the same finalize-then-report shape, generalized
//! from a synchronous thread target to an async task cooperatively
//! cancelled through a `tokio::sync::watch` flag rather than a `threading.Event`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::measurement::Dispatcher;
use crate::model::{
    FinalResult, ResultStatus, SessionStatus, TestPlanItem, TestPointMap, TestResult, TestSession,
};
use crate::pool::ConnectionPool;
use crate::repository::{with_retry, Repository};
use crate::telemetry::{LogLevel, ProgressUpdate, Telemetry};

/// Live counters the control surface (`crate::registry::EngineRegistry`)
/// reads back between items (spec §6.4 "status").
#[derive(Clone, Debug, Default)]
pub struct StatusSnapshot {
    pub status: Option<SessionStatus>,
    pub current_item: u32,
    pub total_items: u32,
    pub pass_items: u32,
    pub fail_items: u32,
    pub error_items: u32,
}

/// Cooperative stop flag: level-triggered, observed both between items and
/// racing the in-flight dispatch (spec §5 "cancellation").
pub type StopSignal = watch::Receiver<bool>;

async fn wait_for_stop(stop: &mut StopSignal) {
    if *stop.borrow() {
        return;
    }
    while stop.changed().await.is_ok() {
        if *stop.borrow() {
            return;
        }
    }
    // Sender dropped without ever requesting a stop: this branch of a
    // `select!` should simply never win.
    std::future::pending::<()>().await
}

/// Executes test sessions against a shared instrument pool. One instance is
/// shared by every concurrently running session (spec §4.C "the pool, not
/// the engine, is the thing sessions share").
pub struct SessionEngine {
    pool: Arc<ConnectionPool>,
    repository: Arc<dyn Repository>,
    telemetry: Telemetry,
    default_item_timeout_ms: u64,
    stop_on_fail: bool,
    simulation: bool,
    report_root: std::path::PathBuf,
}

impl SessionEngine {
    pub fn new(
        pool: Arc<ConnectionPool>,
        repository: Arc<dyn Repository>,
        telemetry: Telemetry,
        config: &EngineConfig,
    ) -> Self {
        Self {
            pool,
            repository,
            telemetry,
            default_item_timeout_ms: config.default_item_timeout_ms,
            stop_on_fail: config.stop_on_fail,
            simulation: config.simulation,
            report_root: config.report_root.clone(),
        }
    }

    /// Run `session` to completion against `plan_items`, reporting progress
    /// on `telemetry`'s broadcast channel and live counters into `status`.
    /// Never panics the caller's task on a domain failure: every outcome,
    /// including an internal/repository failure, ends in a terminal
    /// `TestSession` (spec §4.G.1, §7 "only a repository fault that escapes
    /// the per-item block turns the session itself into Errored").
    pub async fn run(
        &self,
        mut session: TestSession,
        plan_items: Vec<TestPlanItem>,
        mut stop: StopSignal,
        status: Arc<tokio::sync::RwLock<StatusSnapshot>>,
    ) -> TestSession {
        session.status = SessionStatus::Running;
        status.write().await.status = Some(SessionStatus::Running);

        let mut map = match TestPointMap::build(plan_items) {
            Ok(map) => map,
            Err(err) => {
                self.telemetry.log(
                    session.id,
                    None,
                    LogLevel::Error,
                    format!("failed to build test plan: {err}"),
                );
                return self.finalize(session, SessionStatus::Errored, Vec::new()).await;
            }
        };

        let total_items = map.len() as u32;
        status.write().await.total_items = total_items;

        let dispatcher = Dispatcher::new(&self.pool, self.default_item_timeout_ms, self.simulation);
        let mut results: Vec<TestResult> = Vec::with_capacity(map.len());
        let mut outcome_status = SessionStatus::Completed;

        for idx in 0..map.len() {
            if *stop.borrow() {
                outcome_status = SessionStatus::Aborted;
                break;
            }

            let item = match map.item_at(idx) {
                Some(item) => item.clone(),
                None => break,
            };

            let result = tokio::select! {
                biased;
                () = wait_for_stop(&mut stop) => {
                    self.telemetry.log(
                        session.id,
                        Some(item.item_no),
                        LogLevel::Warn,
                        "session stopped while item was in flight",
                    );
                    outcome_status = SessionStatus::Aborted;
                    aborted_result(session.id, &item)
                }
                result = dispatcher.dispatch(session.id, &item, &map) => result,
            };

            if outcome_status == SessionStatus::Aborted {
                results.push(result.clone());
                let _ = with_retry(|| self.repository.append_result(result.clone())).await;
                break;
            }

            match with_retry(|| self.repository.append_result(result.clone())).await {
                Ok(()) => {}
                Err(err) => {
                    self.telemetry.log(
                        session.id,
                        Some(item.item_no),
                        LogLevel::Error,
                        format!("failed to persist result: {err}"),
                    );
                    results.push(result);
                    outcome_status = SessionStatus::Errored;
                    break;
                }
            }

            map.record(idx, result.result == ResultStatus::Pass, result.measured_value.clone());
            results.push(result.clone());

            {
                let mut snapshot = status.write().await;
                snapshot.current_item = item.item_no;
                snapshot.pass_items = results.iter().filter(|r| r.result == ResultStatus::Pass).count() as u32;
                snapshot.fail_items = results.iter().filter(|r| r.result == ResultStatus::Fail).count() as u32;
                snapshot.error_items = results.iter().filter(|r| r.result == ResultStatus::Error).count() as u32;
            }

            self.telemetry.publish_progress(ProgressUpdate {
                session_id: session.id,
                current_item: item.item_no,
                total_items,
                pass: results.iter().filter(|r| r.result == ResultStatus::Pass).count() as u32,
                fail: results.iter().filter(|r| r.result == ResultStatus::Fail).count() as u32,
                error: results.iter().filter(|r| r.result == ResultStatus::Error).count() as u32,
                partial_elapsed_ms: results.iter().map(|r| r.execution_duration_ms).sum(),
            });

            if result.result == ResultStatus::Fail && self.stop_on_fail {
                outcome_status = SessionStatus::Failed;
                break;
            }
        }

        // Reached the end of the plan without an explicit break: the
        // natural outcome is Completed unless a FAIL slipped through with
        // `stop_on_fail` disabled (spec §4.G.1 "Running -> Failed ... on
        // completion when any item FAILed") or an item ERRORed. Priority
        // matches spec §8's final_result rule ("any ERROR ⇒ not PASS; any
        // FAIL ⇒ FAIL unless Aborted"): FAIL outranks a bare ERROR so a
        // plan with both still reads as Failed, not Errored.
        if outcome_status == SessionStatus::Completed {
            if results.iter().any(|r| r.result == ResultStatus::Fail) {
                outcome_status = SessionStatus::Failed;
            } else if results.iter().any(|r| r.result == ResultStatus::Error) {
                outcome_status = SessionStatus::Errored;
            }
        }

        let finalized = self.finalize(session, outcome_status, results).await;
        status.write().await.status = Some(finalized.status);
        finalized
    }

    /// Compute aggregates, persist the terminal session record, and emit the
    /// CSV report (spec §4.G.3, §4.G.4). A report failure is logged, never
    /// escalated: the session's pass/fail verdict is already decided.
    async fn finalize(
        &self,
        mut session: TestSession,
        status: SessionStatus,
        results: Vec<TestResult>,
    ) -> TestSession {
        session.status = status;
        session.ended_at = Some(Utc::now());
        session.total_items = results.len() as u32;
        session.pass_items = results.iter().filter(|r| r.result == ResultStatus::Pass).count() as u32;
        session.fail_items = results.iter().filter(|r| r.result == ResultStatus::Fail).count() as u32;
        session.error_items = results.iter().filter(|r| r.result == ResultStatus::Error).count() as u32;
        // Sum of per-item execution time, not wall clock (spec §4.G.4).
        session.duration_ms = results.iter().map(|r| r.execution_duration_ms).sum();
        session.final_result = Some(match status {
            SessionStatus::Completed => FinalResult::Pass,
            SessionStatus::Failed => FinalResult::Fail,
            SessionStatus::Aborted => FinalResult::Abort,
            SessionStatus::Errored => FinalResult::Error,
            SessionStatus::Created | SessionStatus::Running => {
                unreachable!("finalize is only called with a terminal status")
            }
        });

        if let Err(err) = with_retry(|| self.repository.finalize_session(session.clone())).await {
            // A repository fault that survives three retries here is
            // exactly the "escapes the per-item block" case spec §7 calls
            // out: there is no further boundary to escalate to, so it is
            // logged and the in-memory session (already carrying its
            // computed verdict) is returned as-is.
            self.telemetry.log(
                session.id,
                None,
                LogLevel::Error,
                format!("failed to persist session finalization: {err}"),
            );
        }

        if let Err(err) = self.write_report(&session, &results).await {
            self.telemetry.log(
                session.id,
                None,
                LogLevel::Warn,
                format!("report generation failed: {err}"),
            );
        }

        session
    }

    async fn write_report(
        &self,
        session: &TestSession,
        results: &[TestResult],
    ) -> Result<std::path::PathBuf, EngineError> {
        let report_root = self.report_root.clone();
        // Name resolution for project/station belongs to the out-of-scope
        // project/station CRUD collaborator; the ids stand in directly for
        // the report path's directory names.
        let project_id = session.project_id.clone();
        let station_id = session.station_id.clone();
        let serial_number = session.serial_number.clone();
        let started_at = session.started_at;
        let completed_at = session.ended_at.unwrap_or(started_at);
        let mut results = results.to_vec();
        results.sort_by_key(|r| r.item_no);

        tokio::task::spawn_blocking(move || {
            crate::report::write_session_report(
                &report_root,
                &project_id,
                &station_id,
                &serial_number,
                started_at,
                completed_at,
                &results,
            )
        })
        .await
        .map_err(|e| EngineError::Internal(format!("report task panicked: {e}")))?
    }
}

fn aborted_result(session_id: Uuid, item: &TestPlanItem) -> TestResult {
    TestResult {
        session_id,
        test_plan_item_id: item.item_key.clone(),
        item_no: item.item_no,
        item_name: item.item_name.clone(),
        measured_value: None,
        lower_limit: item.lower_limit,
        upper_limit: item.upper_limit,
        unit: item.unit.clone(),
        result: ResultStatus::Abort,
        error_message: None,
        execution_duration_ms: 0,
        started_at: Utc::now(),
    }
}

/// Convenience for callers that only need the default per-item deadline
/// expressed as a `Duration` (e.g. building a custom dispatcher in a test).
pub fn default_item_timeout(config: &EngineConfig) -> Duration {
    Duration::from_millis(config.default_item_timeout_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, InstrumentConfig};
    use crate::model::{LimitType, ParameterValue, ValueType};
    use crate::repository::InMemoryRepository;
    use crate::telemetry::Telemetry;
    use std::collections::HashMap;

    fn config() -> EngineConfig {
        EngineConfig {
            instruments: vec![
                InstrumentConfig {
                    id: "wait".to_string(),
                    r#type: "wait".to_string(),
                    connection: ConnectionConfig::Simulated { model: "wait".to_string() },
                    options: HashMap::new(),
                    enabled: true,
                },
                InstrumentConfig {
                    id: "PS1".to_string(),
                    r#type: "Model2303".to_string(),
                    connection: ConnectionConfig::Simulated { model: "2303".to_string() },
                    options: HashMap::new(),
                    enabled: true,
                },
            ],
            report_root: std::env::temp_dir().join("test_orchestrator_engine_tests"),
            default_item_timeout_ms: 5_000,
            stop_on_fail: true,
            simulation: true,
        }
    }

    fn item(no: u32, key: &str, command: &str, instrument: &str) -> TestPlanItem {
        let mut parameters = HashMap::new();
        parameters.insert("instrument".to_string(), ParameterValue::Str(instrument.to_string()));
        TestPlanItem {
            item_no: no,
            item_name: format!("item-{no}"),
            item_key: key.to_string(),
            command: command.to_string(),
            switch_mode: None,
            parameters,
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

    fn engine() -> (SessionEngine, Arc<InMemoryRepository>) {
        let config = config();
        let pool = Arc::new(ConnectionPool::new(config.clone()));
        let repository = InMemoryRepository::shared();
        let telemetry = Telemetry::default();
        let engine = SessionEngine::new(pool, repository.clone(), telemetry, &config);
        (engine, repository)
    }

    #[tokio::test]
    async fn a_fully_passing_plan_completes() {
        let (engine, repository) = engine();
        let session = TestSession::new("SN1".into(), "STA1".into(), "PROJ".into());
        repository.create_session(session.clone()).await.unwrap();

        let mut i1 = item(1, "A", "wait", "wait");
        i1.parameters.insert("wait_ms".into(), ParameterValue::Int(1));
        let i2 = item(2, "B", "wait", "wait");
        let plan = vec![i1, i2];

        let (_stop_tx, stop_rx) = watch::channel(false);
        let status = Arc::new(tokio::sync::RwLock::new(StatusSnapshot::default()));
        let finalized = engine.run(session, plan, stop_rx, status).await;

        assert_eq!(finalized.status, SessionStatus::Completed);
        assert_eq!(finalized.final_result, Some(FinalResult::Pass));
        assert_eq!(finalized.total_items, 2);
        assert_eq!(finalized.pass_items, 2);
    }

    #[tokio::test]
    async fn stop_on_fail_halts_after_the_failing_item() {
        let (engine, repository) = engine();
        let session = TestSession::new("SN2".into(), "STA1".into(), "PROJ".into());
        repository.create_session(session.clone()).await.unwrap();

        let mut failing = item(1, "A", "PowerRead", "PS1");
        failing.limit_type = LimitType::Lower;
        failing.lower_limit = Some(1_000_000.0);
        let never_runs = item(2, "B", "wait", "wait");
        let plan = vec![failing, never_runs];

        let (_stop_tx, stop_rx) = watch::channel(false);
        let status = Arc::new(tokio::sync::RwLock::new(StatusSnapshot::default()));
        let finalized = engine.run(session, plan, stop_rx, status).await;

        assert_eq!(finalized.status, SessionStatus::Failed);
        assert_eq!(finalized.final_result, Some(FinalResult::Fail));
        assert_eq!(finalized.total_items, 1);

        let persisted = repository.list_results(finalized.id).await.unwrap();
        assert_eq!(persisted.len(), 1);
    }

    #[tokio::test]
    async fn stop_signal_set_before_the_loop_starts_aborts_immediately() {
        let (engine, repository) = engine();
        let session = TestSession::new("SN3".into(), "STA1".into(), "PROJ".into());
        repository.create_session(session.clone()).await.unwrap();

        let plan = vec![item(1, "A", "wait", "wait")];
        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();

        let status = Arc::new(tokio::sync::RwLock::new(StatusSnapshot::default()));
        let finalized = engine.run(session, plan, stop_rx, status).await;

        assert_eq!(finalized.status, SessionStatus::Aborted);
        assert_eq!(finalized.final_result, Some(FinalResult::Abort));
    }

    #[tokio::test]
    async fn unknown_instrument_item_finalizes_the_session_without_panicking() {
        let (engine, repository) = engine();
        let session = TestSession::new("SN4".into(), "STA1".into(), "PROJ".into());
        repository.create_session(session.clone()).await.unwrap();

        let plan = vec![item(1, "A", "PowerRead", "NOT_CONFIGURED")];
        let (_stop_tx, stop_rx) = watch::channel(false);
        let status = Arc::new(tokio::sync::RwLock::new(StatusSnapshot::default()));
        let finalized = engine.run(session, plan, stop_rx, status).await;

        // stop_on_fail only fires on FAIL, not ERROR, so the plan runs to
        // its end rather than breaking early; but spec §8's invariant ("any
        // ERROR ⇒ not PASS") still forbids a Completed/Pass verdict, so a
        // plan of exclusively ERROR items finalizes as Errored.
        assert_eq!(finalized.status, SessionStatus::Errored);
        assert_eq!(finalized.final_result, Some(FinalResult::Error));
        assert_eq!(finalized.error_items, 1);
    }

    #[tokio::test]
    async fn a_fail_outranks_a_bare_error_in_the_final_verdict() {
        let (engine, repository) = engine();
        let session = TestSession::new("SN5".into(), "STA1".into(), "PROJ".into());
        repository.create_session(session.clone()).await.unwrap();

        let errored = item(1, "A", "PowerRead", "NOT_CONFIGURED");
        let mut failing = item(2, "B", "PowerRead", "PS1");
        failing.limit_type = LimitType::Lower;
        failing.lower_limit = Some(1_000_000.0);
        let plan = vec![errored, failing];

        let (_stop_tx, stop_rx) = watch::channel(false);
        let status = Arc::new(tokio::sync::RwLock::new(StatusSnapshot::default()));
        let finalized = engine.run(session, plan, stop_rx, status).await;

        assert_eq!(finalized.status, SessionStatus::Failed);
        assert_eq!(finalized.final_result, Some(FinalResult::Fail));
        assert_eq!(finalized.error_items, 1);
        assert_eq!(finalized.fail_items, 1);
    }
}
