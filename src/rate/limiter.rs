//! Multi-window admission controller
//!
//! Decides whether a new unit of work (session creation or scripted action)
//! may start. Tracks global and per-user concurrency, trailing 60s/3600s
//! request windows, and a per-user cooldown. All decisions happen under one
//! synchronous lock, so counter updates are atomic relative to async
//! boundaries: increment before any await, decrement in the matching
//! `release`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;

const MINUTE_WINDOW: Duration = Duration::from_secs(60);
const HOUR_WINDOW: Duration = Duration::from_secs(3600);

/// Admission controller configuration. Hot-reloadable via
/// [`RateLimiter::update_config`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Per-user requests in any trailing 60s window
    pub max_requests_per_minute: u32,
    /// Per-user requests in any trailing 3600s window
    pub max_requests_per_hour: u32,
    /// Concurrency cap, applied globally and per user
    pub max_concurrent_requests: u32,
    /// Minimum gap between grants to the same user
    pub cooldown_period: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 10,
            max_requests_per_hour: 100,
            max_concurrent_requests: 5,
            cooldown_period: Duration::from_secs(1),
        }
    }
}

/// Partial config for hot reload; `None` fields keep their current value.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitUpdate {
    pub max_requests_per_minute: Option<u32>,
    pub max_requests_per_hour: Option<u32>,
    pub max_concurrent_requests: Option<u32>,
    pub cooldown_period: Option<Duration>,
}

/// Throttling status for one user.
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    /// min(minute remaining, hour remaining)
    pub remaining_requests: u32,
    /// Time until the soonest still-future reset (cooldown or window), if any
    pub next_reset_in: Option<Duration>,
    /// Mirrors what `acquire` would currently return
    pub is_rate_limited: bool,
}

/// One granted admission; the sole source of truth for window counts.
#[derive(Debug, Clone)]
struct RequestRecord {
    at: Instant,
    user_id: String,
}

#[derive(Default)]
struct LimiterState {
    records: Vec<RequestRecord>,
    global_concurrent: u32,
    user_concurrent: HashMap<String, u32>,
    last_request: HashMap<String, Instant>,
}

impl LimiterState {
    /// Drop records older than the hour window. Every counting function runs
    /// after this, so counts never include stale entries.
    fn prune(&mut self, now: Instant) {
        self.records
            .retain(|r| now.duration_since(r.at) < HOUR_WINDOW);
    }

    fn count_within(&self, user_id: &str, now: Instant, window: Duration) -> u32 {
        self.records
            .iter()
            .filter(|r| r.user_id == user_id && now.duration_since(r.at) < window)
            .count() as u32
    }

    fn oldest_within(&self, user_id: &str, now: Instant, window: Duration) -> Option<Instant> {
        self.records
            .iter()
            .filter(|r| r.user_id == user_id && now.duration_since(r.at) < window)
            .map(|r| r.at)
            .min()
    }

    fn outstanding(&self, user_id: &str) -> u32 {
        self.user_concurrent.get(user_id).copied().unwrap_or(0)
    }

    /// Pure admission check; `prune` must have run first.
    fn would_admit(&self, config: &RateLimitConfig, user_id: &str, now: Instant) -> bool {
        if self.global_concurrent >= config.max_concurrent_requests {
            return false;
        }

        let outstanding = self.outstanding(user_id);
        // The per-user cap and the cooldown only apply once the user already
        // holds a grant; a user's very first request is never blocked by
        // either. Deliberate policy, not an oversight.
        if outstanding >= 1 {
            if outstanding >= config.max_concurrent_requests {
                return false;
            }
            if let Some(last) = self.last_request.get(user_id) {
                if now.duration_since(*last) < config.cooldown_period {
                    return false;
                }
            }
        }

        if self.count_within(user_id, now, MINUTE_WINDOW) >= config.max_requests_per_minute {
            return false;
        }
        if self.count_within(user_id, now, HOUR_WINDOW) >= config.max_requests_per_hour {
            return false;
        }

        true
    }
}

/// Multi-window admission controller.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    config: Mutex<RateLimitConfig>,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            config: Mutex::new(config),
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config.lock().clone()
    }

    /// Try to admit one unit of work for `user_id`.
    ///
    /// On success the global and per-user counters are bumped, a request
    /// record is appended, and the user's last-request stamp is updated.
    /// Every `true` must be paired with a [`RateLimiter::release`].
    pub fn acquire(&self, user_id: &str) -> bool {
        let now = self.clock.now();
        let config = self.config.lock().clone();
        let mut state = self.state.lock();
        state.prune(now);

        if !state.would_admit(&config, user_id, now) {
            debug!(
                "Admission denied for {} (global: {}/{}, outstanding: {})",
                user_id,
                state.global_concurrent,
                config.max_concurrent_requests,
                state.outstanding(user_id)
            );
            return false;
        }

        state.global_concurrent += 1;
        *state.user_concurrent.entry(user_id.to_string()).or_insert(0) += 1;
        state.records.push(RequestRecord {
            at: now,
            user_id: user_id.to_string(),
        });
        state.last_request.insert(user_id.to_string(), now);

        debug!(
            "Admission granted for {} (global: {}/{})",
            user_id, state.global_concurrent, config.max_concurrent_requests
        );
        true
    }

    /// Release one previously granted admission.
    pub fn release(&self, user_id: &str) {
        let mut state = self.state.lock();

        if state.global_concurrent == 0 {
            warn!("Release for {} with no outstanding admissions", user_id);
            return;
        }
        state.global_concurrent -= 1;

        if let Some(count) = state.user_concurrent.get_mut(user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.user_concurrent.remove(user_id);
            }
        }
    }

    /// Current throttling status for `user_id`, including a computed
    /// retry-after so callers can wait or fail fast.
    pub fn info(&self, user_id: &str) -> RateLimitInfo {
        let now = self.clock.now();
        let config = self.config.lock().clone();
        let mut state = self.state.lock();
        state.prune(now);

        let minute_used = state.count_within(user_id, now, MINUTE_WINDOW);
        let hour_used = state.count_within(user_id, now, HOUR_WINDOW);
        let minute_remaining = config.max_requests_per_minute.saturating_sub(minute_used);
        let hour_remaining = config.max_requests_per_hour.saturating_sub(hour_used);

        // The hour window is the outer bound: when it is the tighter quota,
        // both the remaining count and the reset time reflect it.
        let mut candidates: Vec<Instant> = Vec::with_capacity(2);
        if hour_remaining < minute_remaining {
            if let Some(oldest) = state.oldest_within(user_id, now, HOUR_WINDOW) {
                candidates.push(oldest + HOUR_WINDOW);
            }
        } else if let Some(oldest) = state.oldest_within(user_id, now, MINUTE_WINDOW) {
            candidates.push(oldest + MINUTE_WINDOW);
        }
        if let Some(last) = state.last_request.get(user_id) {
            candidates.push(*last + config.cooldown_period);
        }

        let next_reset_in = candidates
            .into_iter()
            .filter(|at| *at > now)
            .min()
            .map(|at| at.duration_since(now));

        RateLimitInfo {
            remaining_requests: minute_remaining.min(hour_remaining),
            next_reset_in,
            is_rate_limited: !state.would_admit(&config, user_id, now),
        }
    }

    /// Merge new limits into the live config.
    ///
    /// If any limit was raised (or the cooldown shortened), per-user
    /// last-request stamps are cleared so a cooldown computed under the old,
    /// stricter config cannot block requests that are now compliant.
    pub fn update_config(&self, update: RateLimitUpdate) {
        let mut config = self.config.lock();
        let old = config.clone();

        if let Some(v) = update.max_requests_per_minute {
            config.max_requests_per_minute = v;
        }
        if let Some(v) = update.max_requests_per_hour {
            config.max_requests_per_hour = v;
        }
        if let Some(v) = update.max_concurrent_requests {
            config.max_concurrent_requests = v;
        }
        if let Some(v) = update.cooldown_period {
            config.cooldown_period = v;
        }

        let raised = config.max_requests_per_minute > old.max_requests_per_minute
            || config.max_requests_per_hour > old.max_requests_per_hour
            || config.max_concurrent_requests > old.max_concurrent_requests
            || config.cooldown_period < old.cooldown_period;

        if raised {
            let mut state = self.state.lock();
            state.last_request.clear();
            debug!("Rate limits raised, cleared per-user cooldown stamps");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(config: RateLimitConfig) -> (RateLimiter, Arc<ManualClock>) {
        let clock = ManualClock::new();
        (RateLimiter::new(config, clock.clone()), clock)
    }

    fn relaxed_windows(max_concurrent: u32, cooldown: Duration) -> RateLimitConfig {
        RateLimitConfig {
            max_requests_per_minute: 1000,
            max_requests_per_hour: 10_000,
            max_concurrent_requests: max_concurrent,
            cooldown_period: cooldown,
        }
    }

    #[test]
    fn concurrent_cap_denies_third_token() {
        let (limiter, _clock) = limiter(relaxed_windows(2, Duration::ZERO));

        assert!(limiter.acquire("alice"));
        assert!(limiter.acquire("alice"));
        assert!(!limiter.acquire("alice"));
    }

    #[test]
    fn release_and_cooldown_readmit() {
        let (limiter, clock) = limiter(relaxed_windows(2, Duration::from_secs(5)));

        assert!(limiter.acquire("alice"));
        // Second grant needs the cooldown to elapse first
        clock.advance(Duration::from_secs(5));
        assert!(limiter.acquire("alice"));
        limiter.release("alice");
        limiter.release("alice");

        clock.advance(Duration::from_secs(6));
        assert!(limiter.acquire("alice"));
    }

    #[test]
    fn cooldown_blocks_back_to_back_grants_while_outstanding() {
        let (limiter, clock) = limiter(relaxed_windows(5, Duration::from_secs(5)));

        assert!(limiter.acquire("alice"));
        // Held token, cooldown not yet elapsed
        assert!(!limiter.acquire("alice"));

        clock.advance(Duration::from_secs(5));
        assert!(limiter.acquire("alice"));
    }

    #[test]
    fn first_request_skips_cooldown_and_user_cap() {
        let (limiter, _clock) = limiter(relaxed_windows(5, Duration::from_secs(3600)));

        // Fresh user with an enormous cooldown still gets in
        assert!(limiter.acquire("bob"));
    }

    #[test]
    fn minute_window_admits_three_then_resets() {
        let config = RateLimitConfig {
            max_requests_per_minute: 3,
            max_requests_per_hour: 1000,
            max_concurrent_requests: 10,
            cooldown_period: Duration::ZERO,
        };
        let (limiter, clock) = limiter(config);

        for i in 0..3 {
            assert!(limiter.acquire("alice"), "grant {} should pass", i + 1);
            limiter.release("alice");
        }
        assert!(!limiter.acquire("alice"));

        clock.advance(Duration::from_secs(60));
        assert!(limiter.acquire("alice"));
    }

    #[test]
    fn hour_window_is_the_outer_bound() {
        let config = RateLimitConfig {
            max_requests_per_minute: 10,
            max_requests_per_hour: 2,
            max_concurrent_requests: 10,
            cooldown_period: Duration::ZERO,
        };
        let (limiter, clock) = limiter(config);

        assert!(limiter.acquire("alice"));
        limiter.release("alice");
        assert!(limiter.acquire("alice"));
        limiter.release("alice");
        assert!(!limiter.acquire("alice"));

        let info = limiter.info("alice");
        assert_eq!(info.remaining_requests, 0);
        assert!(info.is_rate_limited);
        // Reset reflects the hour window, not the minute window
        assert_eq!(info.next_reset_in, Some(Duration::from_secs(3600)));

        clock.advance(Duration::from_secs(3600));
        assert!(limiter.acquire("alice"));
    }

    #[test]
    fn windows_are_per_user() {
        let config = RateLimitConfig {
            max_requests_per_minute: 1,
            max_requests_per_hour: 100,
            max_concurrent_requests: 10,
            cooldown_period: Duration::ZERO,
        };
        let (limiter, _clock) = limiter(config);

        assert!(limiter.acquire("alice"));
        limiter.release("alice");
        assert!(!limiter.acquire("alice"));
        assert!(limiter.acquire("bob"));
    }

    #[test]
    fn info_mirrors_acquire() {
        let (limiter, _clock) = limiter(relaxed_windows(1, Duration::ZERO));

        assert!(!limiter.info("alice").is_rate_limited);
        assert!(limiter.acquire("alice"));
        assert!(limiter.info("alice").is_rate_limited);
        limiter.release("alice");
        assert!(!limiter.info("alice").is_rate_limited);
    }

    #[test]
    fn raising_limits_clears_stale_cooldowns() {
        let (limiter, _clock) = limiter(relaxed_windows(5, Duration::from_secs(60)));

        assert!(limiter.acquire("alice"));
        // Outstanding grant + unexpired cooldown
        assert!(!limiter.acquire("alice"));

        limiter.update_config(RateLimitUpdate {
            max_requests_per_minute: Some(2000),
            ..Default::default()
        });
        assert!(limiter.acquire("alice"));
    }

    #[test]
    fn lowering_limits_keeps_cooldowns() {
        let (limiter, _clock) = limiter(relaxed_windows(5, Duration::from_secs(60)));

        assert!(limiter.acquire("alice"));
        limiter.update_config(RateLimitUpdate {
            max_requests_per_minute: Some(1),
            ..Default::default()
        });
        assert!(!limiter.acquire("alice"));
    }

    #[test]
    fn release_without_acquire_is_a_logged_noop() {
        let (limiter, _clock) = limiter(relaxed_windows(2, Duration::ZERO));

        limiter.release("alice");
        assert!(limiter.acquire("alice"));
    }

    #[test]
    fn stale_records_are_pruned() {
        let config = RateLimitConfig {
            max_requests_per_minute: 100,
            max_requests_per_hour: 2,
            max_concurrent_requests: 10,
            cooldown_period: Duration::ZERO,
        };
        let (limiter, clock) = limiter(config);

        assert!(limiter.acquire("alice"));
        limiter.release("alice");
        assert!(limiter.acquire("alice"));
        limiter.release("alice");
        assert!(!limiter.acquire("alice"));

        clock.advance(Duration::from_secs(3601));
        assert_eq!(limiter.info("alice").remaining_requests, 2);
        assert!(limiter.acquire("alice"));
    }
}
