use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::{execute_with_backoff, BackoffConfig};
use crate::clock::Clock;
use crate::engine::{SessionProfile, WorkerEngine};
use crate::error::{AutomationError, ErrorKind, Result};
use crate::rate::RateLimiter;

use super::health::HealthStatus;
use super::session::{ErrorRecord, ManagedSession, OperationOutcome, SessionInfo};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
    /// Retry policy for relaunching a failed session's worker
    pub recovery_backoff: BackoffConfig,
    /// Consecutive failed recoveries before the session is dropped
    pub max_recovery_attempts: u32,
    /// Pause between background health sweeps
    pub monitor_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            recovery_backoff: BackoffConfig::default(),
            max_recovery_attempts: 3,
            monitor_interval: Duration::from_secs(60),
        }
    }
}

/// Owns every live worker session, keyed by user id.
///
/// All mutation goes through `&self`; callers share the pool behind an
/// `Arc`. The background monitor holds its own clone and is stopped by
/// flag plus abort.
pub struct SessionPool {
    config: PoolConfig,
    engine: Arc<dyn WorkerEngine>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    sessions: RwLock<HashMap<String, Arc<ManagedSession>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    monitor_running: Arc<AtomicBool>,
}

impl SessionPool {
    pub fn new(
        config: PoolConfig,
        engine: Arc<dyn WorkerEngine>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            engine,
            limiter,
            clock,
            sessions: RwLock::new(HashMap::new()),
            monitor: Mutex::new(None),
            monitor_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Launches a fresh worker session for `user_id`, replacing any
    /// existing one. Admission is checked first; the concurrency slot is
    /// held only for the duration of the launch.
    pub async fn create_session(&self, user_id: &str) -> Result<Arc<ManagedSession>> {
        if !self.limiter.acquire(user_id) {
            let info = self.limiter.info(user_id);
            warn!(
                "Session creation for {} denied by rate limiter ({} remaining)",
                user_id, info.remaining_requests
            );
            return Err(AutomationError::rate_limit(format!(
                "session creation for {} denied by rate limiter",
                user_id
            )));
        }
        let result = self.create_session_inner(user_id).await;
        self.limiter.release(user_id);
        result
    }

    async fn create_session_inner(&self, user_id: &str) -> Result<Arc<ManagedSession>> {
        if self.sessions.read().await.contains_key(user_id) {
            info!("Replacing existing session for user {}", user_id);
            self.close_session(user_id).await;
        }

        let profile = SessionProfile::generate();
        let worker = match self.engine.launch(&profile).await {
            Ok(worker) => worker,
            Err(err) => {
                // Launch failures count as setup problems unless the
                // engine already said something more specific.
                let err = if err.kind == ErrorKind::Unknown {
                    AutomationError::setup_failed(err.message)
                } else {
                    err
                };
                warn!("Worker launch for user {} failed: {}", user_id, err);
                return Err(err);
            }
        };

        let session = Arc::new(ManagedSession::new(
            user_id.to_string(),
            profile,
            worker,
            self.clock.now(),
        ));
        info!("Created session {} for user {}", session.id, user_id);
        self.sessions
            .write()
            .await
            .insert(user_id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Looks up the live session for `user_id` and refreshes its
    /// last-used stamp.
    pub async fn get_session(&self, user_id: &str) -> Option<Arc<ManagedSession>> {
        let session = self.sessions.read().await.get(user_id).cloned()?;
        session.health.write().await.last_used = self.clock.now();
        Some(session)
    }

    /// Probes the session's worker, re-derives its health, and triggers
    /// recovery when it has failed. Returns `None` when there is no
    /// session for `user_id` or when recovery exhaustion removed it.
    pub async fn check_health(&self, user_id: &str) -> Option<HealthStatus> {
        let session = self.sessions.read().await.get(user_id).cloned()?;
        let now = self.clock.now();

        let status = {
            let mut health = session.health.write().await;
            health.last_check = Some(now);
            match session.ping().await {
                Ok(()) => {
                    // A live worker outweighs accumulated history; the next
                    // recorded operation re-derives the status from scratch.
                    health.status = HealthStatus::Healthy;
                }
                Err(err) => {
                    debug!("Session {} ping failed: {}", session.id, err);
                    health.record_error(ErrorRecord::from_error(&err, now), now);
                }
            }
            health.status
        };

        if status != HealthStatus::Failed {
            return Some(status);
        }

        match self.recover(&session).await {
            Ok(()) => Some(HealthStatus::Healthy),
            Err(err) => {
                warn!("Recovery of session {} failed: {}", session.id, err);
                if self.sessions.read().await.contains_key(user_id) {
                    Some(HealthStatus::Failed)
                } else {
                    None
                }
            }
        }
    }

    /// Tears down the session's worker and relaunches it with the same
    /// profile. Four consecutive failures remove the session entirely.
    async fn recover(&self, session: &Arc<ManagedSession>) -> Result<()> {
        let attempt = {
            let mut health = session.health.write().await;
            health.recovery_attempts += 1;
            health.status = HealthStatus::Recovering;
            health.recovery_attempts
        };

        if attempt > self.config.max_recovery_attempts {
            warn!(
                "Session {} exceeded {} recovery attempts, closing",
                session.id, self.config.max_recovery_attempts
            );
            self.close_session(&session.user_id).await;
            return Err(AutomationError::setup_failed(format!(
                "session {} removed after {} failed recoveries",
                session.id, self.config.max_recovery_attempts
            )));
        }

        info!(
            "Recovering session {} (attempt {}/{})",
            session.id, attempt, self.config.max_recovery_attempts
        );
        session.close_worker().await;

        let relaunch = execute_with_backoff(&self.config.recovery_backoff, "session relaunch", || {
            let engine = Arc::clone(&self.engine);
            let profile = session.profile.clone();
            async move { engine.launch(&profile).await }
        })
        .await;

        match relaunch {
            Ok(worker) => {
                *session.worker.write().await = Some(worker);
                session
                    .health
                    .write()
                    .await
                    .reset_after_recovery(self.clock.now());
                info!("Session {} recovered", session.id);
                Ok(())
            }
            Err(err) => {
                // Worker slot stays empty; the session is kept so the
                // next health check can retry until the attempt ceiling.
                session.health.write().await.status = HealthStatus::Failed;
                Err(err)
            }
        }
    }

    /// Folds one completed operation into the session's health record.
    pub async fn update_session_metrics(&self, user_id: &str, outcome: OperationOutcome) {
        let session = self.sessions.read().await.get(user_id).cloned();
        if let Some(session) = session {
            let now = self.clock.now();
            let mut health = session.health.write().await;
            health.last_used = now;
            health.record_operation(&outcome, now);
        }
    }

    /// Removes the session for `user_id` and tears down its worker.
    /// Returns false when no session existed.
    pub async fn close_session(&self, user_id: &str) -> bool {
        let session = self.sessions.write().await.remove(user_id);
        match session {
            Some(session) => {
                info!("Closing session {} for user {}", session.id, user_id);
                session.close_worker().await;
                true
            }
            None => false,
        }
    }

    /// Stops the monitor and tears every session down concurrently.
    pub async fn close_all_sessions(&self) {
        self.stop_monitoring().await;
        let sessions: Vec<_> = self.sessions.write().await.drain().collect();
        if sessions.is_empty() {
            return;
        }
        info!("Closing {} sessions", sessions.len());
        futures::future::join_all(
            sessions
                .iter()
                .map(|(_, session)| session.close_worker()),
        )
        .await;
    }

    /// Closes sessions idle for longer than `max_inactive`. Returns how
    /// many were removed.
    pub async fn cleanup_inactive_sessions(&self, max_inactive: Duration) -> usize {
        let now = self.clock.now();
        let mut stale = Vec::new();
        for (user_id, session) in self.sessions.read().await.iter() {
            let last_used = session.health.read().await.last_used;
            if now.saturating_duration_since(last_used) > max_inactive {
                stale.push(user_id.clone());
            }
        }
        for user_id in &stale {
            info!("Closing inactive session for user {}", user_id);
            self.close_session(user_id).await;
        }
        stale.len()
    }

    /// Starts the background health sweep. Idempotent.
    pub async fn start_monitoring(self: &Arc<Self>) {
        if self.monitor_running.swap(true, Ordering::SeqCst) {
            debug!("Session monitor already running");
            return;
        }

        let pool = Arc::clone(self);
        let running = Arc::clone(&self.monitor_running);
        let interval = self.config.monitor_interval;
        let handle = tokio::spawn(async move {
            info!("Session monitor started ({:?} interval)", interval);
            while running.load(Ordering::SeqCst) {
                tokio::time::sleep(interval).await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                pool.run_health_sweep().await;
            }
        });
        *self.monitor.lock().await = Some(handle);
    }

    async fn run_health_sweep(&self) {
        let users: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for user_id in users {
            match self.check_health(&user_id).await {
                Some(status) => debug!("Health sweep: user {} is {:?}", user_id, status),
                None => warn!("Health sweep removed session for user {}", user_id),
            }
        }
    }

    pub async fn stop_monitoring(&self) {
        self.monitor_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.monitor.lock().await.take() {
            handle.abort();
            info!("Session monitor stopped");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn session_infos(&self) -> Vec<SessionInfo> {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::mock::{LaunchPlan, MockEngine, MockWorkerSpec};
    use crate::rate::RateLimitConfig;

    fn pool_with(engine: Arc<MockEngine>, clock: Arc<ManualClock>) -> Arc<SessionPool> {
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig {
                max_requests_per_minute: 100,
                max_requests_per_hour: 1000,
                max_concurrent_requests: 10,
                cooldown_period: Duration::ZERO,
            },
            clock.clone() as Arc<dyn Clock>,
        ));
        Arc::new(SessionPool::new(
            PoolConfig {
                monitor_interval: Duration::from_secs(1),
                ..Default::default()
            },
            engine,
            limiter,
            clock,
        ))
    }

    #[tokio::test]
    async fn second_create_replaces_existing_session() {
        let engine = MockEngine::new();
        let clock = ManualClock::new();
        let pool = pool_with(engine.clone(), clock);

        let first = pool.create_session("alice").await.unwrap();
        let second = pool.create_session("alice").await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(pool.session_count().await, 1);
        assert_eq!(engine.closed_count(), 1);
        assert_eq!(
            pool.get_session("alice").await.unwrap().id,
            second.id
        );
    }

    #[tokio::test]
    async fn create_denied_by_rate_limiter() {
        let engine = MockEngine::new();
        let clock = ManualClock::new();
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig {
                max_requests_per_minute: 0,
                ..Default::default()
            },
            clock.clone() as Arc<dyn Clock>,
        ));
        let pool = SessionPool::new(
            PoolConfig::default(),
            engine.clone(),
            limiter,
            clock,
        );

        let err = pool.create_session("alice").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(engine.launch_count(), 0);
        assert_eq!(pool.session_count().await, 0);
    }

    #[tokio::test]
    async fn launch_failure_surfaces_as_setup_error() {
        let engine = MockEngine::new();
        engine.set_fallback(LaunchPlan::Fail);
        let clock = ManualClock::new();
        let pool = pool_with(engine, clock);

        let err = pool.create_session("alice").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SetupFailed);
        assert_eq!(pool.session_count().await, 0);
    }

    #[tokio::test]
    async fn failing_pings_degrade_then_fail_then_remove() {
        let engine = MockEngine::new();
        let mut spec = MockWorkerSpec::healthy();
        spec.fail_ping = true;
        engine.push_plan(LaunchPlan::Worker(spec));
        engine.set_fallback(LaunchPlan::Fail);
        let clock = ManualClock::new();
        let pool = pool_with(engine.clone(), clock);

        pool.create_session("alice").await.unwrap();

        // Errors accumulate until the failed threshold.
        for _ in 0..4 {
            assert_eq!(
                pool.check_health("alice").await,
                Some(HealthStatus::Degraded)
            );
        }

        // Fifth error trips failed; recovery attempts 1-3 fail but the
        // session is retained with an empty worker slot.
        for _ in 0..3 {
            assert_eq!(pool.check_health("alice").await, Some(HealthStatus::Failed));
            assert_eq!(pool.session_count().await, 1);
        }

        // Fourth consecutive recovery failure removes the session.
        assert_eq!(pool.check_health("alice").await, None);
        assert!(pool.get_session("alice").await.is_none());
        assert_eq!(pool.session_count().await, 0);
    }

    #[tokio::test]
    async fn successful_recovery_resets_health() {
        let engine = MockEngine::new();
        let mut spec = MockWorkerSpec::healthy();
        spec.fail_ping = true;
        engine.push_plan(LaunchPlan::Worker(spec));
        engine.set_fallback(LaunchPlan::Worker(MockWorkerSpec::healthy()));
        let clock = ManualClock::new();
        let pool = pool_with(engine.clone(), clock);

        let session = pool.create_session("alice").await.unwrap();

        let mut status = HealthStatus::Healthy;
        for _ in 0..5 {
            status = pool.check_health("alice").await.unwrap();
        }
        assert_eq!(status, HealthStatus::Healthy);
        assert_eq!(engine.launch_count(), 2);

        let health = session.health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.errors.is_empty());
        assert_eq!(health.recovery_attempts, 0);
        // Operation aggregates survive recovery.
        assert_eq!(health.metrics.total_operations, 0);

        assert_eq!(pool.check_health("alice").await, Some(HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn passing_ping_marks_degraded_session_healthy() {
        let engine = MockEngine::new();
        let clock = ManualClock::new();
        let pool = pool_with(engine, clock);

        pool.create_session("alice").await.unwrap();
        for _ in 0..9 {
            pool.update_session_metrics(
                "alice",
                OperationOutcome::success(Duration::from_millis(50)),
            )
            .await;
        }
        pool.update_session_metrics(
            "alice",
            OperationOutcome::failure(
                Duration::from_millis(50),
                AutomationError::network("share click failed"),
            ),
        )
        .await;
        assert_eq!(
            pool.session_infos().await.remove(0).status,
            HealthStatus::Degraded
        );

        assert_eq!(pool.check_health("alice").await, Some(HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn passing_worker_is_not_relaunched_on_bad_metrics() {
        let engine = MockEngine::new();
        let clock = ManualClock::new();
        let pool = pool_with(engine.clone(), clock);

        pool.create_session("alice").await.unwrap();
        pool.update_session_metrics(
            "alice",
            OperationOutcome::success(Duration::from_millis(50)),
        )
        .await;
        pool.update_session_metrics(
            "alice",
            OperationOutcome::failure(
                Duration::from_millis(50),
                AutomationError::network("share click failed"),
            ),
        )
        .await;
        assert_eq!(
            pool.session_infos().await.remove(0).status,
            HealthStatus::Failed
        );

        assert_eq!(pool.check_health("alice").await, Some(HealthStatus::Healthy));
        assert_eq!(engine.launch_count(), 1);
        assert_eq!(engine.closed_count(), 0);
    }

    #[tokio::test]
    async fn metrics_update_moves_status() {
        let engine = MockEngine::new();
        let clock = ManualClock::new();
        let pool = pool_with(engine, clock);

        pool.create_session("alice").await.unwrap();
        for _ in 0..8 {
            pool.update_session_metrics(
                "alice",
                OperationOutcome::success(Duration::from_millis(100)),
            )
            .await;
        }
        for _ in 0..2 {
            pool.update_session_metrics(
                "alice",
                OperationOutcome::failure(
                    Duration::from_millis(200),
                    AutomationError::network("share click failed"),
                ),
            )
            .await;
        }

        let info = pool.session_infos().await.remove(0);
        assert_eq!(info.total_operations, 10);
        assert_eq!(info.failed_operations, 2);
        assert_eq!(info.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn cleanup_removes_only_idle_sessions() {
        let engine = MockEngine::new();
        let clock = ManualClock::new();
        let pool = pool_with(engine.clone(), clock.clone());

        pool.create_session("alice").await.unwrap();
        clock.advance(Duration::from_secs(600));
        pool.create_session("bob").await.unwrap();

        let removed = pool.cleanup_inactive_sessions(Duration::from_secs(300)).await;
        assert_eq!(removed, 1);
        assert!(pool.get_session("alice").await.is_none());
        assert!(pool.get_session("bob").await.is_some());
    }

    #[tokio::test]
    async fn close_all_tears_down_every_worker() {
        let engine = MockEngine::new();
        let clock = ManualClock::new();
        let pool = pool_with(engine.clone(), clock);

        pool.create_session("alice").await.unwrap();
        pool.create_session("bob").await.unwrap();
        pool.close_all_sessions().await;

        assert_eq!(pool.session_count().await, 0);
        assert_eq!(engine.closed_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_sweeps_sessions_and_is_idempotent() {
        let engine = MockEngine::new();
        let mut spec = MockWorkerSpec::healthy();
        spec.fail_ping = true;
        engine.push_plan(LaunchPlan::Worker(spec));
        let clock = ManualClock::new();
        let pool = pool_with(engine, clock);

        pool.create_session("alice").await.unwrap();
        pool.start_monitoring().await;
        pool.start_monitoring().await;

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let health = pool.get_session("alice").await.unwrap().health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.last_check.is_some());

        pool.stop_monitoring().await;
        assert!(pool.monitor.lock().await.is_none());
    }
}
