//! Credential-state persistence boundary
//!
//! The orchestrator records refreshed cookie state and verification
//! timestamps after a successful login so later runs can observe how
//! stale a user's stored state is. The store is a trait so hosts can
//! plug in their own backend; the in-memory implementation backs tests
//! and single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persists the serialized cookie state captured after login.
    async fn persist_cookie_state(&self, user_id: &str, state: &str) -> Result<()>;

    /// Records that the user's credentials were verified just now.
    async fn touch_last_verified(&self, user_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
struct StoredState {
    cookie_state: Option<String>,
    last_verified: Option<DateTime<Utc>>,
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cookie_state(&self, user_id: &str) -> Option<String> {
        self.entries
            .lock()
            .get(user_id)
            .and_then(|s| s.cookie_state.clone())
    }

    pub fn last_verified(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.entries.lock().get(user_id).and_then(|s| s.last_verified)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn persist_cookie_state(&self, user_id: &str, state: &str) -> Result<()> {
        debug!("Persisting cookie state for user {}", user_id);
        self.entries
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .cookie_state = Some(state.to_string());
        Ok(())
    }

    async fn touch_last_verified(&self, user_id: &str) -> Result<()> {
        self.entries
            .lock()
            .entry(user_id.to_string())
            .or_default()
            .last_verified = Some(Utc::now());
        Ok(())
    }
}
