use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::session::{ErrorRecord, SessionMetrics};

/// Errors older than this no longer count towards the degraded state.
const RECENT_ERROR_WINDOW: Duration = Duration::from_secs(300);

const DEGRADED_FAILURE_RATE: f64 = 0.2;
const FAILED_FAILURE_RATE: f64 = 0.5;
const FAILED_ERROR_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
    Recovering,
}

impl HealthStatus {
    pub fn is_usable(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Classifies a session from its accumulated metrics and error history.
/// Failed takes precedence over degraded, so a session that trips both
/// thresholds is reported as failed.
pub fn classify(metrics: &SessionMetrics, errors: &[ErrorRecord], now: Instant) -> HealthStatus {
    let rate = metrics.failure_rate();
    if rate >= FAILED_FAILURE_RATE || errors.len() >= FAILED_ERROR_COUNT {
        return HealthStatus::Failed;
    }

    let recent_error = errors
        .iter()
        .any(|e| now.saturating_duration_since(e.at) < RECENT_ERROR_WINDOW);
    if rate >= DEGRADED_FAILURE_RATE || recent_error {
        return HealthStatus::Degraded;
    }

    HealthStatus::Healthy
}
