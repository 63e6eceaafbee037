//! Chromium worker adapter
//!
//! Launches and drives Chrome/Chromium instances over CDP. The fingerprint
//! profile is applied at the protocol level (user agent, timezone,
//! geolocation) and non-essential resources are blocked at the transport
//! layer per the injected [`BlockPolicy`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetGeolocationOverrideParams, SetTimezoneOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::SetBlockedUrLsParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{BlockPolicy, SessionProfile, WorkerEngine, WorkerHandle};
use crate::error::{AutomationError, Result};

/// Chromium adapter configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Explicit Chrome/Chromium executable; auto-discovery when absent
    pub chrome_path: Option<String>,
    pub headless: bool,
    /// Root directory for per-worker user data dirs
    pub data_root: Option<PathBuf>,
    /// Deadline for every scripted operation and health probe
    pub operation_timeout: Duration,
    /// Deadline for browser launch
    pub launch_timeout: Duration,
    pub block_policy: BlockPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: true,
            data_root: None,
            operation_timeout: Duration::from_secs(30),
            launch_timeout: Duration::from_secs(45),
            block_policy: BlockPolicy::default(),
        }
    }
}

impl EngineConfig {
    fn data_dir_for(&self, device_id: &str) -> PathBuf {
        self.data_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("closetshare").join("worker_data"))
            .join(device_id)
    }
}

/// Chromium-backed worker engine.
pub struct ChromiumEngine {
    config: EngineConfig,
}

impl ChromiumEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl WorkerEngine for ChromiumEngine {
    async fn launch(&self, profile: &SessionProfile) -> Result<Box<dyn WorkerHandle>> {
        let worker = ChromiumWorker::launch(&self.config, profile).await?;
        Ok(Box::new(worker))
    }
}

/// One live Chromium instance with a single page.
pub struct ChromiumWorker {
    device_id: String,
    browser: RwLock<Option<Browser>>,
    page: Page,
    alive: Arc<AtomicBool>,
    timeout: Duration,
}

impl ChromiumWorker {
    async fn launch(config: &EngineConfig, profile: &SessionProfile) -> Result<Self> {
        info!(
            "Launching worker {} (headless: {}, viewport: {}x{})",
            profile.device_id, config.headless, profile.viewport_width, profile.viewport_height
        );

        let data_dir = config.data_dir_for(&profile.device_id);
        let _ = std::fs::create_dir_all(&data_dir);

        let mut builder = BrowserConfig::builder()
            .user_data_dir(&data_dir)
            .window_size(profile.viewport_width, profile.viewport_height)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--no-default-browser-check")
            .arg("--no-first-run")
            .arg("--disable-notifications")
            .arg("--disable-session-crashed-bubble");

        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(ref path) = config.chrome_path {
            builder = builder.chrome_executable(path);
        }

        let browser_config = builder
            .build()
            .map_err(AutomationError::setup_failed)?;

        let (browser, mut handler) = tokio::time::timeout(
            config.launch_timeout,
            Browser::launch(browser_config),
        )
        .await
        .map_err(|_| AutomationError::setup_failed("browser launch timed out"))?
        .map_err(|e| AutomationError::setup_failed(e.to_string()))?;

        // When the handler stream ends, Chrome has disconnected or crashed.
        let alive = Arc::new(AtomicBool::new(true));
        let alive_for_handler = alive.clone();
        let handler_id = profile.device_id.clone();
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            warn!("Worker {} disconnected (event handler ended)", handler_id);
            alive_for_handler.store(false, Ordering::Relaxed);
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| AutomationError::setup_failed(e.to_string()))?;

        Self::apply_profile(&page, profile).await?;
        Self::apply_block_policy(&page, &config.block_policy).await?;

        debug!("Worker {} ready", profile.device_id);

        Ok(Self {
            device_id: profile.device_id.clone(),
            browser: RwLock::new(Some(browser)),
            page,
            alive,
            timeout: config.operation_timeout,
        })
    }

    /// CDP-level fingerprint overrides, invisible to page scripts.
    async fn apply_profile(page: &Page, profile: &SessionProfile) -> Result<()> {
        page.execute(SetUserAgentOverrideParams::new(profile.user_agent.clone()))
            .await
            .map_err(|e| AutomationError::setup_failed(format!("user agent override: {}", e)))?;

        page.execute(SetTimezoneOverrideParams::new(profile.timezone.clone()))
            .await
            .map_err(|e| AutomationError::setup_failed(format!("timezone override: {}", e)))?;

        let geo = SetGeolocationOverrideParams::builder()
            .latitude(profile.latitude)
            .longitude(profile.longitude)
            .accuracy(100.0)
            .build();
        page.execute(geo)
            .await
            .map_err(|e| AutomationError::setup_failed(format!("geolocation override: {}", e)))?;

        Ok(())
    }

    /// Abort non-essential asset loads at the transport layer.
    async fn apply_block_policy(page: &Page, policy: &BlockPolicy) -> Result<()> {
        let patterns = policy.url_patterns();
        if patterns.is_empty() {
            return Ok(());
        }
        page.execute(SetBlockedUrLsParams::new(patterns))
            .await
            .map_err(|e| AutomationError::setup_failed(format!("resource blocking: {}", e)))?;
        Ok(())
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(AutomationError::network("worker disconnected"))
        }
    }

    /// Apply the default operation deadline; expiry surfaces as `TIMEOUT`.
    async fn deadline<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        self.ensure_alive()?;
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| {
                AutomationError::timeout(format!(
                    "{} timed out after {}s",
                    what,
                    self.timeout.as_secs()
                ))
            })?
    }
}

#[async_trait::async_trait]
impl WorkerHandle for ChromiumWorker {
    async fn navigate(&self, url: &str) -> Result<()> {
        debug!("Worker {} navigating to {}", self.device_id, url);
        self.deadline("navigation", async {
            self.page
                .goto(url)
                .await
                .map_err(|e| AutomationError::network(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<()> {
        self.deadline("fill", async {
            let element = self
                .page
                .find_element(selector)
                .await
                .map_err(|e| AutomationError::unknown(format!("{}: {}", selector, e)))?;
            element
                .click()
                .await
                .map_err(|e| AutomationError::network(e.to_string()))?;
            element
                .type_str(value)
                .await
                .map_err(|e| AutomationError::network(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.deadline("click", async {
            let element = self
                .page
                .find_element(selector)
                .await
                .map_err(|e| AutomationError::unknown(format!("{}: {}", selector, e)))?;
            element
                .click()
                .await
                .map_err(|e| AutomationError::network(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn click_nth(&self, selector: &str, index: usize) -> Result<()> {
        self.deadline("click", async {
            let elements = self
                .page
                .find_elements(selector)
                .await
                .map_err(|e| AutomationError::unknown(format!("{}: {}", selector, e)))?;
            let element = elements.get(index).ok_or_else(|| {
                AutomationError::unknown(format!("no element #{} for {}", index, selector))
            })?;
            element
                .click()
                .await
                .map_err(|e| AutomationError::network(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()> {
        self.ensure_alive()?;
        let poll = async {
            loop {
                if self.page.find_element(selector).await.is_ok() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.map_err(|_| {
            AutomationError::timeout(format!(
                "selector {} not found within {}ms",
                selector,
                timeout.as_millis()
            ))
        })
    }

    async fn query_one(&self, selector: &str) -> Result<bool> {
        self.deadline("query", async {
            Ok(self.page.find_element(selector).await.is_ok())
        })
        .await
    }

    async fn query_all(&self, selector: &str) -> Result<usize> {
        self.deadline("query", async {
            Ok(self
                .page
                .find_elements(selector)
                .await
                .map(|els| els.len())
                .unwrap_or(0))
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.deadline("health probe", async {
            self.page
                .evaluate("1 + 1")
                .await
                .map_err(|e| AutomationError::network(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn cookie_state(&self) -> Result<String> {
        self.deadline("cookie retrieval", async {
            let cookies = self
                .page
                .get_cookies()
                .await
                .map_err(|e| AutomationError::network(e.to_string()))?;
            serde_json::to_string(&cookies)
                .map_err(|e| AutomationError::unknown(e.to_string()))
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        // Refuse new operations first, then tear down so in-flight CDP calls
        // resolve to failure rather than hang.
        self.alive.store(false, Ordering::Relaxed);

        let _ = self.page.clone().close().await;

        let mut browser = self.browser.write().await;
        if let Some(mut b) = browser.take() {
            let _ = b.close().await;
            // Brief grace period for Chrome child processes to exit
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = b.kill().await;
        }

        info!("Worker {} closed", self.device_id);
        Ok(())
    }
}
