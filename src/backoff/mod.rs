//! Retry/backoff module
//!
//! Runs fallible operations with bounded retries and exponential,
//! clamped delay between attempts.

mod executor;

pub use executor::{execute_with_backoff, BackoffConfig};
