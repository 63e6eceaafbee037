//! Session pool module
//!
//! Owns creation, health evaluation, recovery, and destruction of worker
//! sessions. Consumers only ever hold `Arc` handles; the pool map and all
//! health bookkeeping stay behind the manager.

mod health;
mod manager;
mod session;

pub use health::{classify, HealthStatus};
pub use manager::{PoolConfig, SessionPool};
pub use session::{
    ErrorRecord, ManagedSession, OperationOutcome, SessionHealth, SessionInfo, SessionMetrics,
};
