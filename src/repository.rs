//! Persistence boundary (spec §4.I): the engine depends only on this trait;
//! the relational store that ultimately backs it is explicitly out of scope
//! (spec §1 "Explicitly out of scope ... the relational store (accessed
//! through an abstract Repository)").
//!
//! Grounded on
//! `examples/original_source/backend/app/services/test_engine.py`'s
//! `_save_test_result`/`_finalize_test_session` (one transaction per result
//! row, one for finalization) and
//! `examples/original_source/backend/app/services/report_service.py`'s
//! session/result queries. [`InMemoryRepository`] is the fixture this
//! crate's own tests run against, not a production store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::{TestPlanItem, TestResult, TestSession};

/// Optional filters for `list_sessions` (spec §4.I).
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub station_id: Option<String>,
    pub project_id: Option<String>,
    pub serial_number: Option<String>,
}

impl SessionFilter {
    fn matches(&self, session: &TestSession) -> bool {
        self.station_id
            .as_ref()
            .map_or(true, |v| *v == session.station_id)
            && self
                .project_id
                .as_ref()
                .map_or(true, |v| *v == session.project_id)
            && self
                .serial_number
                .as_ref()
                .map_or(true, |v| *v == session.serial_number)
    }
}

/// Abstract persistence boundary the engine consumes (spec §4.I).
#[async_trait]
pub trait Repository: Send + Sync {
    async fn load_test_plan(
        &self,
        project_id: &str,
        station_id: &str,
        plan_name: Option<&str>,
    ) -> EngineResult<Vec<TestPlanItem>>;

    async fn create_session(&self, session: TestSession) -> EngineResult<TestSession>;

    /// Persist one result row, in its own transaction (spec §4.G.2 step 3).
    async fn append_result(&self, result: TestResult) -> EngineResult<()>;

    /// Transactionally update the session record with final aggregates
    /// (spec §4.G.3).
    async fn finalize_session(&self, session: TestSession) -> EngineResult<()>;

    async fn get_session(&self, id: Uuid) -> EngineResult<TestSession>;

    async fn list_sessions(&self, filter: SessionFilter) -> EngineResult<Vec<TestSession>>;

    async fn list_results(&self, session_id: Uuid) -> EngineResult<Vec<TestResult>>;
}

/// Retry a repository call up to 3 times with exponential backoff on
/// `RepositoryRetryable` (spec §4.I "tolerate transient ... failures by
/// retrying ... up to 3 times with exponential backoff").
pub async fn with_retry<T, F, Fut>(mut call: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    let mut delay_ms = 50u64;
    for attempt in 0..3 {
        match call().await {
            Ok(value) => return Ok(value),
            Err(EngineError::RepositoryRetryable(msg)) if attempt < 2 => {
                tracing::warn!(attempt, error = %msg, "retrying transient repository error");
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                delay_ms *= 2;
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("loop always returns on the final attempt")
}

/// In-memory `Repository` fixture: not for production use, but the store
/// this crate's own integration tests and examples run against.
#[derive(Default)]
pub struct InMemoryRepository {
    plans: RwLock<HashMap<(String, String, Option<String>), Vec<TestPlanItem>>>,
    sessions: RwLock<HashMap<Uuid, TestSession>>,
    results: RwLock<HashMap<Uuid, Vec<TestResult>>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a test plan for `load_test_plan` to return.
    pub async fn seed_plan(
        &self,
        project_id: &str,
        station_id: &str,
        plan_name: Option<&str>,
        items: Vec<TestPlanItem>,
    ) {
        self.plans.write().await.insert(
            (project_id.to_string(), station_id.to_string(), plan_name.map(String::from)),
            items,
        );
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn load_test_plan(
        &self,
        project_id: &str,
        station_id: &str,
        plan_name: Option<&str>,
    ) -> EngineResult<Vec<TestPlanItem>> {
        let key = (
            project_id.to_string(),
            station_id.to_string(),
            plan_name.map(String::from),
        );
        self.plans
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| EngineError::RepositoryFatal(format!("no test plan for {key:?}")))
    }

    async fn create_session(&self, session: TestSession) -> EngineResult<TestSession> {
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        self.results.write().await.insert(session.id, Vec::new());
        Ok(session)
    }

    async fn append_result(&self, result: TestResult) -> EngineResult<()> {
        let mut results = self.results.write().await;
        let bucket = results
            .get_mut(&result.session_id)
            .ok_or_else(|| EngineError::RepositoryFatal("session not created".to_string()))?;
        bucket.push(result);
        Ok(())
    }

    async fn finalize_session(&self, session: TestSession) -> EngineResult<()> {
        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(&session.id) {
            return Err(EngineError::RepositoryFatal("session not created".to_string()));
        }
        sessions.insert(session.id, session);
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> EngineResult<TestSession> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound)
    }

    async fn list_sessions(&self, filter: SessionFilter) -> EngineResult<Vec<TestSession>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect())
    }

    async fn list_results(&self, session_id: Uuid) -> EngineResult<Vec<TestResult>> {
        let mut results = self
            .results
            .read()
            .await
            .get(&session_id)
            .cloned()
            .unwrap_or_default();
        results.sort_by_key(|r| r.item_no);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LimitType, ResultStatus, ValueType};

    fn session() -> TestSession {
        TestSession::new("SN1".into(), "STA1".into(), "PROJ".into())
    }

    fn result(session_id: Uuid, item_no: u32) -> TestResult {
        TestResult {
            session_id,
            test_plan_item_id: format!("item-{item_no}"),
            item_no,
            item_name: format!("item-{item_no}"),
            measured_value: Some("5.0".into()),
            lower_limit: None,
            upper_limit: None,
            unit: None,
            result: ResultStatus::Pass,
            error_message: None,
            execution_duration_ms: 10,
            started_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_then_list_preserves_item_no_order() {
        let repo = InMemoryRepository::new();
        let session = repo.create_session(session()).await.unwrap();
        repo.append_result(result(session.id, 2)).await.unwrap();
        repo.append_result(result(session.id, 1)).await.unwrap();
        let results = repo.list_results(session.id).await.unwrap();
        assert_eq!(results.iter().map(|r| r.item_no).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn append_result_without_session_is_fatal() {
        let repo = InMemoryRepository::new();
        let err = repo.append_result(result(Uuid::new_v4(), 1)).await.unwrap_err();
        assert!(matches!(err, EngineError::RepositoryFatal(_)));
    }

    #[tokio::test]
    async fn get_session_unknown_is_not_found() {
        let repo = InMemoryRepository::new();
        let err = repo.get_session(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound));
    }

    #[tokio::test]
    async fn load_test_plan_returns_seeded_items() {
        let repo = InMemoryRepository::new();
        let item = TestPlanItem {
            item_no: 1,
            item_name: "item".into(),
            item_key: "A".into(),
            command: "wait".into(),
            switch_mode: None,
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
        };
        repo.seed_plan("PROJ", "STA1", None, vec![item.clone()]).await;
        let loaded = repo.load_test_plan("PROJ", "STA1", None).await.unwrap();
        assert_eq!(loaded, vec![item]);
    }

    #[tokio::test]
    async fn with_retry_gives_up_after_three_attempts() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: EngineResult<()> = with_retry(|| async {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(EngineError::RepositoryRetryable("still down".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_retry_succeeds_after_transient_failure() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = with_retry(|| async {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                Err(EngineError::RepositoryRetryable("blip".into()))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
    }
}
