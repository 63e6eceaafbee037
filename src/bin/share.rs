//! closetshare - Standalone share runner
//!
//! Logs one user in and shares a batch of their listings.
//! Build: `cargo build --release --bin share`
//!
//! Environment variables:
//! - `CLOSETSHARE_USER_ID` - Pool identity key for the user (required)
//! - `CLOSETSHARE_USERNAME` - Login username/email (required)
//! - `CLOSETSHARE_PASSWORD` - Login password (required)
//! - `CLOSETSHARE_MAX_ITEMS` - Listings to share (default: configured batch size)

use std::sync::Arc;

use tracing::{error, info};

use closetshare::tasks::Credentials;
use closetshare::AppState;

fn required_env(name: &str) -> Result<String, Box<dyn std::error::Error>> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("{} must be set", name).into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = closetshare::init_logging();

    info!("Starting closetshare share runner");
    if let Some(dir) = closetshare::log_dir() {
        info!("Log files saved to: {}", dir.display());
    }

    let user_id = required_env("CLOSETSHARE_USER_ID")?;
    let credentials = Credentials {
        username: required_env("CLOSETSHARE_USERNAME")?,
        password: required_env("CLOSETSHARE_PASSWORD")?,
    };

    let state = Arc::new(AppState::new());
    state.start().await;

    let max_items = match std::env::var("CLOSETSHARE_MAX_ITEMS").ok() {
        Some(raw) => raw.parse()?,
        None => state.config.read().await.share_batch_size,
    };

    let mut task = state.share_task(&user_id, credentials).await;
    let report = task.run(max_items).await;

    state.shutdown().await;

    if report.success {
        info!("Shared {} listings for {}", report.shared, user_id);
        Ok(())
    } else {
        let message = report
            .error_message
            .unwrap_or_else(|| "share task failed".to_string());
        error!("Share task for {} failed: {}", user_id, message);
        Err(message.into())
    }
}
