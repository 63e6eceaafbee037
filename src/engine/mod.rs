//! Worker engine capability boundary
//!
//! The pool and orchestrator drive browser workers only through the
//! `WorkerEngine`/`WorkerHandle` traits. The production implementation is
//! the chromiumoxide-backed adapter; tests script a mock.

mod chromium;
#[cfg(test)]
pub mod mock;
mod profile;

pub use chromium::{ChromiumEngine, EngineConfig};
pub use profile::SessionProfile;

use std::time::Duration;

use crate::error::Result;

/// Asset classes a worker can refuse to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    Document,
    Script,
    Image,
    Stylesheet,
    Font,
    Media,
    Other,
}

/// Predicate-based resource filter injected into the engine adapter.
///
/// Non-essential asset types are aborted at the transport layer to reduce
/// load on the target site.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockPolicy {
    pub blocked: Vec<ResourceKind>,
}

impl Default for BlockPolicy {
    fn default() -> Self {
        Self {
            blocked: vec![
                ResourceKind::Image,
                ResourceKind::Font,
                ResourceKind::Stylesheet,
                ResourceKind::Media,
            ],
        }
    }
}

impl BlockPolicy {
    pub fn should_block(&self, kind: ResourceKind) -> bool {
        self.blocked.contains(&kind)
    }

    /// CDP URL patterns covering the blocked asset classes.
    pub fn url_patterns(&self) -> Vec<String> {
        let mut patterns = Vec::new();
        for kind in &self.blocked {
            let exts: &[&str] = match kind {
                ResourceKind::Image => &["*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.svg", "*.ico"],
                ResourceKind::Font => &[
                    "*.woff",
                    "*.woff2",
                    "*.ttf",
                    "*.otf",
                    "fonts.googleapis.com/*",
                    "fonts.gstatic.com/*",
                ],
                ResourceKind::Stylesheet => &["*.css"],
                ResourceKind::Media => &["*.mp4", "*.webm", "*.ogg", "*.mp3", "*.avi"],
                // Documents and scripts are never worth blocking; pages stop working
                ResourceKind::Document | ResourceKind::Script | ResourceKind::Other => &[],
            };
            patterns.extend(exts.iter().map(|s| s.to_string()));
        }
        patterns
    }
}

/// Launches workers. One engine serves the whole pool.
#[async_trait::async_trait]
pub trait WorkerEngine: Send + Sync {
    /// Instantiate a worker with the given immutable fingerprint.
    async fn launch(&self, profile: &SessionProfile) -> Result<Box<dyn WorkerHandle>>;
}

/// One live browser worker.
///
/// Every operation is subject to the adapter's default operation timeout;
/// expiry surfaces as a `TIMEOUT` error. Closing tears down the underlying
/// resources so in-flight operations resolve to failure instead of hanging.
#[async_trait::async_trait]
pub trait WorkerHandle: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;
    async fn fill(&self, selector: &str, value: &str) -> Result<()>;
    async fn click(&self, selector: &str) -> Result<()>;
    /// Click the `index`-th element matching `selector`.
    async fn click_nth(&self, selector: &str, index: usize) -> Result<()>;
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()>;
    /// Whether at least one element matches.
    async fn query_one(&self, selector: &str) -> Result<bool>;
    /// Number of matching elements.
    async fn query_all(&self, selector: &str) -> Result<usize>;
    /// Cheap round-trip used by the health monitor.
    async fn ping(&self) -> Result<()>;
    /// Serialized cookie/browsing state for persistence after login.
    async fn cookie_state(&self) -> Result<String>;
    async fn close(&self) -> Result<()>;
}
