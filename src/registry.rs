//! `EngineRegistry`: the control surface spec §6.4 describes sitting between
//! an external caller (a web handler, a CLI) and the running sessions —
//! "global mutable state for session tracking" made explicit as one
//! `tokio::sync::Mutex<HashMap<..>>` rather than left implicit.
//!
//! Grounded on the teacher's `ConnectionManager` (`src/app/mod.rs`), which
//! owns a `Mutex<HashMap<DeviceId, ConnectionHandle>>` and exposes
//! `connect`/`disconnect`/`status` over it; this module applies the same
//! shape one level up, to whole test sessions instead of device handles.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::engine::{SessionEngine, StatusSnapshot, StopSignal};
use crate::error::{EngineError, EngineResult};
use crate::model::{TestPlanItem, TestSession};
use crate::telemetry::ProgressUpdate;

struct RunningSession {
    stop_tx: watch::Sender<bool>,
    status: Arc<RwLock<StatusSnapshot>>,
    task: JoinHandle<TestSession>,
}

/// A live subscription to one session's progress stream, filtering the
/// telemetry bundle's shared broadcast channel down to one `session_id`
/// (spec §6.4 "subscribe(session_id) -> stream").
pub struct ProgressSubscription {
    session_id: Uuid,
    rx: broadcast::Receiver<ProgressUpdate>,
}

impl ProgressSubscription {
    /// Await the next update for this session, silently skipping both
    /// updates for other sessions and a lagged-receiver gap (spec §4.J: the
    /// stream is best-effort, drop-oldest). Returns `None` once the
    /// underlying telemetry channel is gone for good.
    pub async fn recv(&mut self) -> Option<ProgressUpdate> {
        loop {
            match self.rx.recv().await {
                Ok(update) if update.session_id == self.session_id => return Some(update),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Owns every session currently running and arbitrates concurrent
/// start/stop/status/subscribe calls under one mutex (spec §6.4).
pub struct EngineRegistry {
    engine: Arc<SessionEngine>,
    telemetry_subscribe: Box<dyn Fn() -> broadcast::Receiver<ProgressUpdate> + Send + Sync>,
    running: Mutex<HashMap<Uuid, RunningSession>>,
}

impl EngineRegistry {
    pub fn new(engine: Arc<SessionEngine>, telemetry: crate::telemetry::Telemetry) -> Self {
        Self {
            engine,
            telemetry_subscribe: Box::new(move || telemetry.subscribe()),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Start `session` executing `plan_items` on a fresh task. Fails with
    /// `AlreadyRunning` if this session id is already tracked, matching the
    /// teacher's `ConnectionManager::connect` idempotency check (spec §6.4).
    pub async fn start(&self, session: TestSession, plan_items: Vec<TestPlanItem>) -> EngineResult<()> {
        let mut running = self.running.lock().await;
        if running.contains_key(&session.id) {
            return Err(EngineError::AlreadyRunning);
        }

        let (stop_tx, stop_rx): (watch::Sender<bool>, StopSignal) = watch::channel(false);
        let status = Arc::new(RwLock::new(StatusSnapshot {
            status: None,
            current_item: 0,
            total_items: plan_items.len() as u32,
            pass_items: 0,
            fail_items: 0,
            error_items: 0,
        }));

        let engine = self.engine.clone();
        let status_for_task = status.clone();
        let session_id = session.id;
        let task = tokio::spawn(async move { engine.run(session, plan_items, stop_rx, status_for_task).await });

        running.insert(
            session_id,
            RunningSession {
                stop_tx,
                status,
                task,
            },
        );
        Ok(())
    }

    /// Request cooperative cancellation of a running session (spec §6.4,
    /// §5). Returns `NotRunning` if the session id is not tracked; does not
    /// wait for the session to actually reach a terminal state.
    pub async fn stop(&self, session_id: Uuid) -> EngineResult<()> {
        let running = self.running.lock().await;
        let handle = running.get(&session_id).ok_or(EngineError::NotRunning)?;
        handle
            .stop_tx
            .send(true)
            .map_err(|_| EngineError::Internal("session task already gone".to_string()))
    }

    /// Read the current live counters for a running session (spec §6.4
    /// "status").
    pub async fn status(&self, session_id: Uuid) -> EngineResult<StatusSnapshot> {
        let running = self.running.lock().await;
        let handle = running.get(&session_id).ok_or(EngineError::NotFound)?;
        Ok(handle.status.read().await.clone())
    }

    /// Subscribe to this session's progress stream (spec §6.4).
    pub fn subscribe(&self, session_id: Uuid) -> ProgressSubscription {
        ProgressSubscription {
            session_id,
            rx: (self.telemetry_subscribe)(),
        }
    }

    /// Wait for a started session to finish and remove it from the
    /// registry, returning its terminal record. Convenience for callers
    /// (tests, a synchronous CLI path) that want to block on completion
    /// rather than polling `status`.
    pub async fn join(&self, session_id: Uuid) -> EngineResult<TestSession> {
        let handle = {
            let mut running = self.running.lock().await;
            running.remove(&session_id).ok_or(EngineError::NotFound)?
        };
        handle
            .task
            .await
            .map_err(|e| EngineError::Internal(format!("session task panicked: {e}")))
    }

    /// Whether a session is currently tracked as running.
    pub async fn is_running(&self, session_id: Uuid) -> bool {
        self.running.lock().await.contains_key(&session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, EngineConfig, InstrumentConfig};
    use crate::model::{LimitType, ParameterValue, ValueType};
    use crate::pool::ConnectionPool;
    use crate::repository::InMemoryRepository;
    use crate::telemetry::Telemetry;
    use std::collections::HashMap as Map;

    fn config() -> EngineConfig {
        EngineConfig {
            instruments: vec![InstrumentConfig {
                id: "wait".to_string(),
                r#type: "wait".to_string(),
                connection: ConnectionConfig::Simulated { model: "wait".to_string() },
                options: Map::new(),
                enabled: true,
            }],
            report_root: std::env::temp_dir().join("test_orchestrator_registry_tests"),
            default_item_timeout_ms: 5_000,
            stop_on_fail: true,
            simulation: true,
        }
    }

    fn item(no: u32, key: &str, wait_ms: i64) -> TestPlanItem {
        let mut parameters = Map::new();
        parameters.insert("instrument".to_string(), ParameterValue::Str("wait".to_string()));
        parameters.insert("wait_ms".to_string(), ParameterValue::Int(wait_ms));
        TestPlanItem {
            item_no: no,
            item_name: format!("item-{no}"),
            item_key: key.to_string(),
            command: "wait".to_string(),
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

    fn registry() -> EngineRegistry {
        let config = config();
        let pool = Arc::new(ConnectionPool::new(config.clone()));
        let repository = InMemoryRepository::shared();
        let telemetry = Telemetry::default();
        let engine = Arc::new(SessionEngine::new(pool, repository, telemetry.clone(), &config));
        EngineRegistry::new(engine, telemetry)
    }

    #[tokio::test]
    async fn starting_the_same_session_twice_is_rejected() {
        let registry = registry();
        let session = TestSession::new("SN1".into(), "STA1".into(), "PROJ".into());
        registry.start(session.clone(), vec![item(1, "A", 5)]).await.unwrap();
        let err = registry.start(session, vec![]).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning));
    }

    #[tokio::test]
    async fn stopping_an_unknown_session_is_not_running() {
        let registry = registry();
        let err = registry.stop(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotRunning));
    }

    #[tokio::test]
    async fn status_of_unknown_session_is_not_found() {
        let registry = registry();
        let err = registry.status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound));
    }

    #[tokio::test]
    async fn a_started_session_can_be_joined_for_its_terminal_record() {
        let registry = registry();
        let session = TestSession::new("SN2".into(), "STA1".into(), "PROJ".into());
        let session_id = session.id;
        registry.start(session, vec![item(1, "A", 1)]).await.unwrap();
        let finalized = registry.join(session_id).await.unwrap();
        assert!(finalized.status.is_terminal());
        assert!(!registry.is_running(session_id).await);
    }

    #[tokio::test]
    async fn stop_then_join_reports_an_aborted_session() {
        let registry = registry();
        let session = TestSession::new("SN3".into(), "STA1".into(), "PROJ".into());
        let session_id = session.id;
        registry
            .start(session, vec![item(1, "A", 200), item(2, "B", 200)])
            .await
            .unwrap();
        registry.stop(session_id).await.unwrap();
        let finalized = registry.join(session_id).await.unwrap();
        assert_eq!(finalized.status, crate::model::SessionStatus::Aborted);
    }
}
