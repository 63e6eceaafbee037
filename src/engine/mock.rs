//! Scriptable in-memory engine for tests.
//!
//! Each launch consumes the next scripted plan (or the fallback). Workers
//! report programmed selector presence, element counts, and failures, and
//! count their own closes so teardown can be asserted exactly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{SessionProfile, WorkerEngine, WorkerHandle};
use crate::error::{AutomationError, Result};

/// What the next launch should produce.
#[derive(Clone)]
pub enum LaunchPlan {
    Fail,
    Worker(MockWorkerSpec),
}

/// Behavior of one mock worker.
#[derive(Clone, Default)]
pub struct MockWorkerSpec {
    /// Every ping fails with a network error
    pub fail_ping: bool,
    /// Selectors `query_one`/`wait_for_selector` report as present
    pub present: Vec<String>,
    /// `query_all` counts per selector
    pub counts: HashMap<String, usize>,
    /// `click_nth` indices that fail
    pub failing_clicks: Vec<usize>,
    /// Every navigation fails with a network error
    pub fail_navigation: bool,
}

impl MockWorkerSpec {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn with_present(mut self, selector: &str) -> Self {
        self.present.push(selector.to_string());
        self
    }

    pub fn with_count(mut self, selector: &str, count: usize) -> Self {
        self.counts.insert(selector.to_string(), count);
        self
    }
}

/// Scriptable engine.
pub struct MockEngine {
    plans: Mutex<VecDeque<LaunchPlan>>,
    fallback: Mutex<LaunchPlan>,
    pub launches: AtomicU32,
    /// Total closes across all workers this engine produced
    pub closed_workers: Arc<AtomicU32>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(LaunchPlan::Worker(MockWorkerSpec::healthy())),
            launches: AtomicU32::new(0),
            closed_workers: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Queue a plan for the next unconsumed launch.
    pub fn push_plan(&self, plan: LaunchPlan) {
        self.plans.lock().push_back(plan);
    }

    /// Plan used once the queue is exhausted.
    pub fn set_fallback(&self, plan: LaunchPlan) {
        *self.fallback.lock() = plan;
    }

    pub fn launch_count(&self) -> u32 {
        self.launches.load(Ordering::Relaxed)
    }

    pub fn closed_count(&self) -> u32 {
        self.closed_workers.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl WorkerEngine for MockEngine {
    async fn launch(&self, _profile: &SessionProfile) -> Result<Box<dyn WorkerHandle>> {
        self.launches.fetch_add(1, Ordering::Relaxed);

        let plan = self
            .plans
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().clone());

        match plan {
            LaunchPlan::Fail => Err(AutomationError::setup_failed("scripted launch failure")),
            LaunchPlan::Worker(spec) => Ok(Box::new(MockWorker {
                spec,
                closes: self.closed_workers.clone(),
                own_closes: AtomicU32::new(0),
                pings: AtomicU32::new(0),
                clicks: AtomicUsize::new(0),
            })),
        }
    }
}

/// One scripted worker.
pub struct MockWorker {
    spec: MockWorkerSpec,
    closes: Arc<AtomicU32>,
    own_closes: AtomicU32,
    pub pings: AtomicU32,
    pub clicks: AtomicUsize,
}

impl MockWorker {
    pub fn close_count(&self) -> u32 {
        self.own_closes.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl WorkerHandle for MockWorker {
    async fn navigate(&self, url: &str) -> Result<()> {
        if self.spec.fail_navigation {
            Err(AutomationError::network(format!("navigation to {} refused", url)))
        } else {
            Ok(())
        }
    }

    async fn fill(&self, _selector: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    async fn click(&self, _selector: &str) -> Result<()> {
        Ok(())
    }

    async fn click_nth(&self, _selector: &str, index: usize) -> Result<()> {
        self.clicks.fetch_add(1, Ordering::Relaxed);
        if self.spec.failing_clicks.contains(&index) {
            Err(AutomationError::network(format!("click #{} failed", index)))
        } else {
            Ok(())
        }
    }

    async fn wait_for_selector(&self, selector: &str, _timeout: Duration) -> Result<()> {
        if self.spec.present.iter().any(|s| s == selector) {
            Ok(())
        } else {
            Err(AutomationError::timeout(format!("{} never appeared", selector)))
        }
    }

    async fn query_one(&self, selector: &str) -> Result<bool> {
        Ok(self.spec.present.iter().any(|s| s == selector))
    }

    async fn query_all(&self, selector: &str) -> Result<usize> {
        Ok(self.spec.counts.get(selector).copied().unwrap_or(0))
    }

    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::Relaxed);
        if self.spec.fail_ping {
            Err(AutomationError::network("scripted ping failure"))
        } else {
            Ok(())
        }
    }

    async fn cookie_state(&self) -> Result<String> {
        Ok("[]".to_string())
    }

    async fn close(&self) -> Result<()> {
        // Count every call so double-release shows up in assertions
        self.own_closes.fetch_add(1, Ordering::Relaxed);
        self.closes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
