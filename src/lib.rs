//! closetshare
//!
//! Automated listing sharing built on a managed pool of credential-bound
//! browser sessions, with multi-window rate limiting, health-driven
//! recovery, and retry with backoff.

pub mod backoff;
pub mod clock;
pub mod engine;
pub mod error;
pub mod pool;
pub mod rate;
pub mod storage;
pub mod tasks;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use backoff::BackoffConfig;
use clock::{Clock, SystemClock};
use engine::{BlockPolicy, ChromiumEngine, EngineConfig, ResourceKind, WorkerEngine};
use pool::{PoolConfig, SessionPool};
use rate::{RateLimitConfig, RateLimitUpdate, RateLimiter};
use storage::{MemoryStore, SessionStore};
use tasks::{Credentials, ShareTask, ShareTaskConfig};

/// Application configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Target site base URL
    pub base_url: String,

    /// Browser configuration
    pub headless: bool,
    #[serde(default)]
    pub chrome_path: Option<String>,
    /// Asset classes workers refuse to load
    #[serde(default = "default_blocked_resources")]
    pub blocked_resources: Vec<ResourceKind>,
    pub operation_timeout_secs: u64,

    /// Rate limiter configuration
    pub max_requests_per_minute: u32,
    pub max_requests_per_hour: u32,
    pub max_concurrent_requests: u32,
    pub cooldown_ms: u64,

    /// Pool configuration
    pub monitor_interval_secs: u64,
    pub max_recovery_attempts: u32,
    /// Sessions idle longer than this get swept (minutes)
    #[serde(default = "default_inactive_minutes")]
    pub max_inactive_minutes: u64,

    /// Listings shared per batch
    pub share_batch_size: usize,
}

fn default_blocked_resources() -> Vec<ResourceKind> {
    BlockPolicy::default().blocked
}

/// Default inactivity sweep threshold in minutes
fn default_inactive_minutes() -> u64 {
    30
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: "https://poshmark.com".to_string(),
            headless: true,
            chrome_path: None,
            blocked_resources: default_blocked_resources(),
            operation_timeout_secs: 30,
            max_requests_per_minute: 10,
            max_requests_per_hour: 100,
            max_concurrent_requests: 5,
            cooldown_ms: 1000,
            monitor_interval_secs: 60,
            max_recovery_attempts: 3,
            max_inactive_minutes: default_inactive_minutes(),
            share_batch_size: 20,
        }
    }
}

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("closetshare").join("logs"))
}

impl AppConfig {
    /// Get config file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("closetshare").join("config.json"))
    }

    /// Load config from file
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str(&content) {
                        Ok(config) => {
                            info!("Loaded config from {:?}", path);
                            return config;
                        }
                        Err(e) => {
                            warn!("Failed to parse config file: {}", e);
                        }
                    },
                    Err(e) => {
                        warn!("Failed to read config file: {}", e);
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to file
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Failed to create config directory: {}", e);
                    return;
                }
            }

            match serde_json::to_string_pretty(self) {
                Ok(content) => {
                    if let Err(e) = std::fs::write(&path, content) {
                        error!("Failed to save config: {}", e);
                    } else {
                        info!("Config saved to {:?}", path);
                    }
                }
                Err(e) => {
                    error!("Failed to serialize config: {}", e);
                }
            }
        }
    }

    fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests_per_minute: self.max_requests_per_minute,
            max_requests_per_hour: self.max_requests_per_hour,
            max_concurrent_requests: self.max_concurrent_requests,
            cooldown_period: Duration::from_millis(self.cooldown_ms),
        }
    }

    fn engine(&self) -> EngineConfig {
        EngineConfig {
            chrome_path: self.chrome_path.clone(),
            headless: self.headless,
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
            block_policy: BlockPolicy {
                blocked: self.blocked_resources.clone(),
            },
            ..EngineConfig::default()
        }
    }

    fn pool(&self) -> PoolConfig {
        PoolConfig {
            recovery_backoff: BackoffConfig::default(),
            max_recovery_attempts: self.max_recovery_attempts,
            monitor_interval: Duration::from_secs(self.monitor_interval_secs),
        }
    }

    pub fn max_inactive(&self) -> Duration {
        Duration::from_secs(self.max_inactive_minutes * 60)
    }
}

/// Application state shared across the app
pub struct AppState {
    /// Browser worker engine
    pub engine: Arc<dyn WorkerEngine>,
    /// Admission controller
    pub limiter: Arc<RateLimiter>,
    /// Session pool manager
    pub pool: Arc<SessionPool>,
    /// Credential-state store
    pub store: Arc<dyn SessionStore>,
    /// Application configuration
    pub config: Arc<RwLock<AppConfig>>,
}

impl AppState {
    /// Create new application state with loaded config
    pub fn new() -> Self {
        Self::with_config(AppConfig::load())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let engine: Arc<dyn WorkerEngine> = Arc::new(ChromiumEngine::new(config.engine()));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit(), Arc::clone(&clock)));
        let pool = Arc::new(SessionPool::new(
            config.pool(),
            Arc::clone(&engine),
            Arc::clone(&limiter),
            clock,
        ));

        Self {
            engine,
            limiter,
            pool,
            store: Arc::new(MemoryStore::new()),
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Build a share workflow for one user.
    pub async fn share_task(&self, user_id: &str, credentials: Credentials) -> ShareTask {
        let config = self.config.read().await;
        let task_config = ShareTaskConfig {
            base_url: config.base_url.clone(),
            ..ShareTaskConfig::default()
        };
        ShareTask::new(
            user_id,
            credentials,
            task_config,
            Arc::clone(&self.pool),
            Arc::clone(&self.store),
        )
    }

    /// Start the pool's background health monitor.
    pub async fn start(&self) {
        self.pool.start_monitoring().await;
    }

    /// Configure the application with new settings
    pub async fn configure(&self, config: AppConfig) {
        self.limiter.update_config(RateLimitUpdate {
            max_requests_per_minute: Some(config.max_requests_per_minute),
            max_requests_per_hour: Some(config.max_requests_per_hour),
            max_concurrent_requests: Some(config.max_concurrent_requests),
            cooldown_period: Some(Duration::from_millis(config.cooldown_ms)),
        });

        config.save();
        *self.config.write().await = config;

        info!("Application configured");
    }

    /// Stop monitoring and close every session.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.pool.close_all_sessions().await;
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize logging
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "closetshare.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_json() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_requests_per_minute, config.max_requests_per_minute);
        assert_eq!(back.share_batch_size, config.share_batch_size);
        assert_eq!(back.base_url, config.base_url);
    }

    #[test]
    fn missing_optional_fields_use_defaults() {
        let json = r#"{
            "baseUrl": "https://poshmark.com",
            "headless": true,
            "operationTimeoutSecs": 30,
            "maxRequestsPerMinute": 10,
            "maxRequestsPerHour": 100,
            "maxConcurrentRequests": 5,
            "cooldownMs": 1000,
            "monitorIntervalSecs": 60,
            "maxRecoveryAttempts": 3,
            "shareBatchSize": 20
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_inactive_minutes, 30);
        assert!(config.chrome_path.is_none());
        assert!(!config.blocked_resources.is_empty());
    }

    #[test]
    fn derived_configs_track_fields() {
        let config = AppConfig {
            max_requests_per_minute: 3,
            cooldown_ms: 250,
            monitor_interval_secs: 5,
            ..Default::default()
        };
        assert_eq!(config.rate_limit().max_requests_per_minute, 3);
        assert_eq!(
            config.rate_limit().cooldown_period,
            Duration::from_millis(250)
        );
        assert_eq!(config.pool().monitor_interval, Duration::from_secs(5));
        assert_eq!(config.max_inactive(), Duration::from_secs(1800));
    }
}
