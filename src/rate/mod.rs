//! Admission control module
//!
//! Gates the start of each unit of throttled work: per-user and global
//! concurrency caps, trailing minute/hour windows, and per-user cooldown.

mod limiter;

pub use limiter::{RateLimitConfig, RateLimitInfo, RateLimitUpdate, RateLimiter};
