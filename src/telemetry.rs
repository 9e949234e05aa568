//! Telemetry hooks (spec §4.J): a structured-log sink and a per-session,
//! bounded, drop-oldest progress stream.
//!
//! Grounded on the teacher's `broadcast::channel(1024)` sizing convention
//! (`src/instrument/mock.rs`) for the progress stream, and on `tracing`
//! (already the crate's logging backend, spec §0 Ambient Stack) for the
//! structured-log channel: `TelemetrySink` is an injectable seam for
//! collaborators that want events as data rather than formatted log lines.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Severity of a structured log event (spec §4.J channel 1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured log event: `session_id`, `item_no`, `level`, `message`,
/// monotonic timestamp (spec §4.J).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEvent {
    pub session_id: Uuid,
    pub item_no: Option<u32>,
    pub level: LogLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Injectable structured-log sink. The default `TracingSink` forwards to
/// `tracing`; callers that need machine-readable events elsewhere (a web
/// socket, a metrics pipeline) supply their own.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: LogEvent);
}

/// Default sink: every event becomes one `tracing` event at the matching
/// level, with `session_id`/`item_no` as structured fields.
#[derive(Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, event: LogEvent) {
        match event.level {
            LogLevel::Debug => tracing::debug!(
                session_id = %event.session_id,
                item_no = ?event.item_no,
                "{}",
                event.message
            ),
            LogLevel::Info => tracing::info!(
                session_id = %event.session_id,
                item_no = ?event.item_no,
                "{}",
                event.message
            ),
            LogLevel::Warn => tracing::warn!(
                session_id = %event.session_id,
                item_no = ?event.item_no,
                "{}",
                event.message
            ),
            LogLevel::Error => tracing::error!(
                session_id = %event.session_id,
                item_no = ?event.item_no,
                "{}",
                event.message
            ),
        }
    }
}

/// One progress update published after an item terminates (spec §4.J
/// channel 2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub session_id: Uuid,
    pub current_item: u32,
    pub total_items: u32,
    pub pass: u32,
    pub fail: u32,
    pub error: u32,
    pub partial_elapsed_ms: u64,
}

/// Bounded, drop-oldest progress stream for one session (spec §4.J, §5
/// "the progress-stream queue is drop-oldest, never blocking producers").
///
/// `tokio::sync::broadcast` already implements drop-oldest-on-overflow
/// semantics for slow subscribers; publishing never blocks or awaits a
/// reader, satisfying the backpressure contract without a hand-rolled ring
/// buffer.
pub struct ProgressChannel {
    tx: broadcast::Sender<ProgressUpdate>,
}

/// Minimum queue capacity mandated by spec §4.J ("capacity ≥ 1024").
pub const MIN_PROGRESS_CAPACITY: usize = 1024;

impl ProgressChannel {
    pub fn new() -> Self {
        Self::with_capacity(MIN_PROGRESS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(MIN_PROGRESS_CAPACITY));
        Self { tx }
    }

    /// Publish an update. Never blocks; if there are no subscribers the
    /// update is simply dropped (spec §5 "the engine never waits for
    /// subscribers").
    pub fn publish(&self, update: ProgressUpdate) {
        let _ = self.tx.send(update);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.tx.subscribe()
    }
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Bundle of telemetry collaborators a session engine is constructed with.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
    progress: Arc<ProgressChannel>,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            sink,
            progress: Arc::new(ProgressChannel::new()),
        }
    }

    pub fn log(&self, session_id: Uuid, item_no: Option<u32>, level: LogLevel, message: impl Into<String>) {
        self.sink.record(LogEvent {
            session_id,
            item_no,
            level,
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn publish_progress(&self, update: ProgressUpdate) {
        self.progress.publish(update);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.progress.subscribe()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_channel_drops_oldest_when_subscriber_lags() {
        let channel = ProgressChannel::with_capacity(MIN_PROGRESS_CAPACITY);
        let mut rx = channel.subscribe();
        for i in 0..(MIN_PROGRESS_CAPACITY as u32 + 10) {
            channel.publish(ProgressUpdate {
                session_id: Uuid::new_v4(),
                current_item: i,
                total_items: 100,
                pass: 0,
                fail: 0,
                error: 0,
                partial_elapsed_ms: 0,
            });
        }
        // The receiver lagged behind every publish; the next recv reports
        // the lag rather than blocking or erroring some other way.
        let first = rx.try_recv();
        assert!(matches!(first, Err(broadcast::error::TryRecvError::Lagged(_))));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let channel = ProgressChannel::new();
        channel.publish(ProgressUpdate {
            session_id: Uuid::new_v4(),
            current_item: 1,
            total_items: 1,
            pass: 1,
            fail: 0,
            error: 0,
            partial_elapsed_ms: 5,
        });
    }

    #[test]
    fn tracing_sink_does_not_panic_on_any_level() {
        let sink = TracingSink;
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            sink.record(LogEvent {
                session_id: Uuid::new_v4(),
                item_no: Some(1),
                level,
                message: "test".into(),
                at: Utc::now(),
            });
        }
    }
}
