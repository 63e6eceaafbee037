//! Closet-share workflow
//!
//! Acquires a session for one user, logs in, then shares up to a bounded
//! batch of listings. Network-sensitive steps carry their own retry policy
//! on top of whatever recovery the pool does for the session itself.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backoff::{execute_with_backoff, BackoffConfig};
use crate::error::{AutomationError, ErrorKind, Result};
use crate::pool::{ManagedSession, OperationOutcome, SessionPool};
use crate::storage::SessionStore;

use super::selectors;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShareTaskConfig {
    pub base_url: String,
    pub login_path: String,
    pub closet_path: String,
    /// How long to wait for the logged-in marker after submitting
    pub login_timeout: Duration,
    /// Retry policy for navigations
    pub backoff: BackoffConfig,
    /// Pause between consecutive share clicks
    pub share_pause: Duration,
}

impl Default for ShareTaskConfig {
    fn default() -> Self {
        Self {
            base_url: "https://poshmark.com".to_string(),
            login_path: "/login".to_string(),
            closet_path: "/closet".to_string(),
            login_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            share_pause: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Structured task outcome; failures are data, not panics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub success: bool,
    pub shared: usize,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

/// One run of the share workflow for one user.
pub struct ShareTask {
    user_id: String,
    credentials: Credentials,
    config: ShareTaskConfig,
    pool: Arc<SessionPool>,
    store: Arc<dyn SessionStore>,
    session: Option<Arc<ManagedSession>>,
    initialized: bool,
    cleaned_up: bool,
}

impl ShareTask {
    pub fn new(
        user_id: impl Into<String>,
        credentials: Credentials,
        config: ShareTaskConfig,
        pool: Arc<SessionPool>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            credentials,
            config,
            pool,
            store,
            session: None,
            initialized: false,
            cleaned_up: false,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Obtains a usable session (recreating an unhealthy one) and performs
    /// the login sequence. Any failure after the session exists closes it
    /// before the error surfaces.
    pub async fn initialize(&mut self) -> Result<()> {
        let session = match self.pool.get_session(&self.user_id).await {
            Some(existing) if existing.health().await.status.is_usable() => existing,
            _ => self.pool.create_session(&self.user_id).await?,
        };

        match self.login(&session).await {
            Ok(()) => {
                self.persist_login_state(&session).await;
                info!("Share task for user {} initialized", self.user_id);
                self.session = Some(session);
                self.initialized = true;
                self.cleaned_up = false;
                Ok(())
            }
            Err(err) => {
                warn!(
                    "Login for user {} failed ({}), closing session {}",
                    self.user_id, err, session.id
                );
                self.pool.close_session(&self.user_id).await;
                Err(err)
            }
        }
    }

    async fn login(&self, session: &Arc<ManagedSession>) -> Result<()> {
        let login_url = self.url(&self.config.login_path);
        execute_with_backoff(&self.config.backoff, "login navigation", || {
            let session = Arc::clone(session);
            let url = login_url.clone();
            async move { session.navigate(&url).await }
        })
        .await?;

        session
            .fill(selectors::LOGIN_EMAIL, &self.credentials.username)
            .await?;
        session
            .fill(selectors::LOGIN_PASSWORD, &self.credentials.password)
            .await?;
        session.click(selectors::LOGIN_SUBMIT).await?;

        match session
            .wait_for_selector(selectors::LOGGED_IN_MARKER, self.config.login_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(_) => {
                if session.query_one(selectors::CAPTCHA_CHALLENGE).await? {
                    Err(AutomationError::captcha(format!(
                        "challenge presented during login for user {}",
                        self.user_id
                    )))
                } else {
                    Err(AutomationError::auth_failed(format!(
                        "logged-in marker absent after submit for user {}",
                        self.user_id
                    )))
                }
            }
        }
    }

    /// Cookie state and the verification timestamp are best-effort; a
    /// store hiccup never fails a successful login.
    async fn persist_login_state(&self, session: &Arc<ManagedSession>) {
        match session.cookie_state().await {
            Ok(state) => {
                if let Err(err) = self
                    .store
                    .persist_cookie_state(&self.user_id, &state)
                    .await
                {
                    warn!("Failed to persist cookie state for {}: {}", self.user_id, err);
                }
            }
            Err(err) => warn!("Failed to read cookie state for {}: {}", self.user_id, err),
        }
        if let Err(err) = self.store.touch_last_verified(&self.user_id).await {
            warn!("Failed to touch last-verified for {}: {}", self.user_id, err);
        }
    }

    /// Shares up to `max_items` listings, one click per listing.
    /// Per-listing failures are logged and skipped; the batch keeps going.
    /// Returns how many shares succeeded.
    pub async fn run_batch(&mut self, max_items: usize) -> Result<usize> {
        if !self.initialized {
            return Err(AutomationError::setup_failed(
                "share batch requested before initialize",
            ));
        }

        let usable = matches!(
            self.pool.check_health(&self.user_id).await,
            Some(status) if status.is_usable()
        );
        if !usable {
            info!(
                "Session for user {} unusable before batch, reinitializing",
                self.user_id
            );
            self.session = None;
            self.initialized = false;
            self.initialize().await?;
        }
        let session = match self.session.clone() {
            Some(session) => session,
            None => {
                return Err(AutomationError::setup_failed(
                    "no session available for share batch",
                ))
            }
        };

        let closet_url = self.url(&self.config.closet_path);
        execute_with_backoff(&self.config.backoff, "closet navigation", || {
            let session = Arc::clone(&session);
            let url = closet_url.clone();
            async move { session.navigate(&url).await }
        })
        .await?;

        let available = session.query_all(selectors::SHARE_BUTTON).await?;
        let target = available.min(max_items);
        info!(
            "Sharing {} of {} listings for user {}",
            target, available, self.user_id
        );

        let mut shared = 0;
        for index in 0..target {
            let started = Instant::now();
            match self.share_one(&session, index).await {
                Ok(()) => {
                    shared += 1;
                    self.pool
                        .update_session_metrics(
                            &self.user_id,
                            OperationOutcome::success(started.elapsed()),
                        )
                        .await;
                }
                Err(err) => {
                    warn!(
                        "Share {}/{} for user {} failed: {}",
                        index + 1,
                        target,
                        self.user_id,
                        err
                    );
                    self.pool
                        .update_session_metrics(
                            &self.user_id,
                            OperationOutcome::failure(started.elapsed(), err),
                        )
                        .await;
                }
            }
            if index + 1 < target && !self.config.share_pause.is_zero() {
                tokio::time::sleep(self.config.share_pause).await;
            }
        }

        debug!("Batch for user {} shared {}/{}", self.user_id, shared, target);
        Ok(shared)
    }

    async fn share_one(&self, session: &Arc<ManagedSession>, index: usize) -> Result<()> {
        session.click_nth(selectors::SHARE_BUTTON, index).await?;
        session.click(selectors::SHARE_TO_FOLLOWERS).await
    }

    /// Tears the session down exactly once. Repeat calls are no-ops and
    /// teardown problems are swallowed; cleanup always succeeds.
    pub async fn cleanup(&mut self) {
        if self.cleaned_up {
            debug!("Cleanup for user {} already done", self.user_id);
            return;
        }
        self.cleaned_up = true;
        self.initialized = false;
        if self.session.take().is_some() {
            self.pool.close_session(&self.user_id).await;
            info!("Share task for user {} cleaned up", self.user_id);
        }
    }

    /// Full workflow with guaranteed cleanup.
    pub async fn run(&mut self, max_items: usize) -> TaskReport {
        let outcome = self.run_inner(max_items).await;
        self.cleanup().await;
        match outcome {
            Ok(shared) => TaskReport {
                success: true,
                shared,
                error_kind: None,
                error_message: None,
            },
            Err(err) => TaskReport {
                success: false,
                shared: 0,
                error_kind: Some(err.kind),
                error_message: Some(err.message),
            },
        }
    }

    async fn run_inner(&mut self, max_items: usize) -> Result<usize> {
        self.initialize().await?;
        self.run_batch(max_items).await
    }
}
