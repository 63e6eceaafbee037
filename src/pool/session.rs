//! Managed session state
//!
//! One session binds one user identity to one worker instance plus the
//! health record the pool maintains for it. The worker slot is replaceable
//! (recovery swaps in a fresh worker under the same profile); everything
//! else is fixed at creation.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::engine::{SessionProfile, WorkerHandle};
use crate::error::{AutomationError, ErrorKind, Result};
use crate::pool::health::{classify, HealthStatus};

/// Errors kept per session; oldest dropped beyond this.
const MAX_TRACKED_ERRORS: usize = 20;

/// Running per-session operation aggregates, updated once per completed
/// operation.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub total_operations: u64,
    pub failed_operations: u64,
    /// Running mean over all operations, milliseconds
    pub average_response_time: f64,
    pub last_response_time: f64,
}

impl SessionMetrics {
    pub fn failure_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }
        self.failed_operations as f64 / self.total_operations as f64
    }
}

/// One observed failure.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
    /// Wall-clock stamp for logs and snapshots
    pub timestamp: DateTime<Utc>,
    /// Monotonic stamp used for recency classification
    pub at: Instant,
}

impl ErrorRecord {
    pub fn from_error(err: &AutomationError, at: Instant) -> Self {
        Self {
            kind: err.kind,
            message: err.message.clone(),
            recoverable: err.is_recoverable(),
            timestamp: Utc::now(),
            at,
        }
    }
}

/// Outcome of one completed scripted operation, reported by consumers.
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub duration: Duration,
    pub success: bool,
    pub error: Option<AutomationError>,
}

impl OperationOutcome {
    pub fn success(duration: Duration) -> Self {
        Self {
            duration,
            success: true,
            error: None,
        }
    }

    pub fn failure(duration: Duration, error: AutomationError) -> Self {
        Self {
            duration,
            success: false,
            error: Some(error),
        }
    }
}

/// Mutable health record, owned exclusively by the pool.
#[derive(Debug, Clone)]
pub struct SessionHealth {
    /// Re-derived via [`classify`] on every recorded outcome; the pool sets
    /// it directly after probes and recovery
    pub status: HealthStatus,
    pub last_check: Option<Instant>,
    pub last_used: Instant,
    pub errors: Vec<ErrorRecord>,
    pub recovery_attempts: u32,
    pub metrics: SessionMetrics,
}

impl SessionHealth {
    pub fn new(now: Instant) -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_check: None,
            last_used: now,
            errors: Vec::new(),
            recovery_attempts: 0,
            metrics: SessionMetrics::default(),
        }
    }

    /// Append an error and re-derive status.
    pub fn record_error(&mut self, record: ErrorRecord, now: Instant) {
        self.errors.push(record);
        if self.errors.len() > MAX_TRACKED_ERRORS {
            self.errors.remove(0);
        }
        self.status = classify(&self.metrics, &self.errors, now);
    }

    /// Fold one completed operation into the running aggregates and
    /// re-derive status.
    pub fn record_operation(&mut self, outcome: &OperationOutcome, now: Instant) {
        let metrics = &mut self.metrics;
        metrics.total_operations += 1;
        if !outcome.success {
            metrics.failed_operations += 1;
        }

        let millis = outcome.duration.as_secs_f64() * 1000.0;
        metrics.last_response_time = millis;
        metrics.average_response_time +=
            (millis - metrics.average_response_time) / metrics.total_operations as f64;

        if let Some(ref err) = outcome.error {
            self.errors.push(ErrorRecord::from_error(err, now));
            if self.errors.len() > MAX_TRACKED_ERRORS {
                self.errors.remove(0);
            }
        }

        self.status = classify(&self.metrics, &self.errors, now);
    }

    /// Successful recovery: healthy again, error history wiped, attempt
    /// counter back to zero. Operation aggregates are kept.
    pub fn reset_after_recovery(&mut self, now: Instant) {
        self.status = HealthStatus::Healthy;
        self.errors.clear();
        self.recovery_attempts = 0;
        self.last_check = Some(now);
    }
}

/// Serializable per-session summary for introspection.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub user_id: String,
    pub status: HealthStatus,
    pub total_operations: u64,
    pub failed_operations: u64,
    pub average_response_time: f64,
    pub error_count: usize,
    pub recovery_attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// One worker session bound to one user identity.
pub struct ManagedSession {
    /// Unique per active session; at most one live session per user
    pub user_id: String,
    pub id: String,
    /// Immutable fingerprint, reused verbatim on recovery
    pub profile: SessionProfile,
    pub created_at: DateTime<Utc>,
    pub(crate) worker: RwLock<Option<Box<dyn WorkerHandle>>>,
    pub(crate) health: RwLock<SessionHealth>,
}

// The worker slot is a trait object, so this skips it.
impl fmt::Debug for ManagedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedSession")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl ManagedSession {
    pub(crate) fn new(
        user_id: String,
        profile: SessionProfile,
        worker: Box<dyn WorkerHandle>,
        now: Instant,
    ) -> Self {
        Self {
            user_id,
            id: format!("session-{}", &Uuid::new_v4().to_string()[..8]),
            profile,
            created_at: Utc::now(),
            worker: RwLock::new(Some(worker)),
            health: RwLock::new(SessionHealth::new(now)),
        }
    }

    /// Snapshot of the current health record.
    pub async fn health(&self) -> SessionHealth {
        self.health.read().await.clone()
    }

    pub async fn info(&self) -> SessionInfo {
        let health = self.health.read().await;
        SessionInfo {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            status: health.status,
            total_operations: health.metrics.total_operations,
            failed_operations: health.metrics.failed_operations,
            average_response_time: health.metrics.average_response_time,
            error_count: health.errors.len(),
            recovery_attempts: health.recovery_attempts,
            created_at: self.created_at,
        }
    }

    fn no_worker() -> AutomationError {
        AutomationError::network("no active worker for session")
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        let worker = self.worker.read().await;
        let worker = worker.as_ref().ok_or_else(Self::no_worker)?;
        worker.navigate(url).await
    }

    pub async fn fill(&self, selector: &str, value: &str) -> Result<()> {
        let worker = self.worker.read().await;
        let worker = worker.as_ref().ok_or_else(Self::no_worker)?;
        worker.fill(selector, value).await
    }

    pub async fn click(&self, selector: &str) -> Result<()> {
        let worker = self.worker.read().await;
        let worker = worker.as_ref().ok_or_else(Self::no_worker)?;
        worker.click(selector).await
    }

    pub async fn click_nth(&self, selector: &str, index: usize) -> Result<()> {
        let worker = self.worker.read().await;
        let worker = worker.as_ref().ok_or_else(Self::no_worker)?;
        worker.click_nth(selector, index).await
    }

    pub async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()> {
        let worker = self.worker.read().await;
        let worker = worker.as_ref().ok_or_else(Self::no_worker)?;
        worker.wait_for_selector(selector, timeout).await
    }

    pub async fn query_one(&self, selector: &str) -> Result<bool> {
        let worker = self.worker.read().await;
        let worker = worker.as_ref().ok_or_else(Self::no_worker)?;
        worker.query_one(selector).await
    }

    pub async fn query_all(&self, selector: &str) -> Result<usize> {
        let worker = self.worker.read().await;
        let worker = worker.as_ref().ok_or_else(Self::no_worker)?;
        worker.query_all(selector).await
    }

    pub async fn ping(&self) -> Result<()> {
        let worker = self.worker.read().await;
        let worker = worker.as_ref().ok_or_else(Self::no_worker)?;
        worker.ping().await
    }

    pub async fn cookie_state(&self) -> Result<String> {
        let worker = self.worker.read().await;
        let worker = worker.as_ref().ok_or_else(Self::no_worker)?;
        worker.cookie_state().await
    }

    /// Best-effort worker teardown; the slot is emptied either way so
    /// later operations fail fast instead of hanging.
    pub(crate) async fn close_worker(&self) {
        let worker = self.worker.write().await.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.close().await {
                warn!("Error closing worker for session {}: {}", self.id, e);
            }
        }
    }
}
