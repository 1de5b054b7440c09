//! Execution context handed to every supervisor and component.
//!
//! Holds the identity this process uses as a lock owner, the clock all
//! timestamps come from, and the root tracing span. Nothing here is global:
//! two contexts in the same process behave like two server replicas.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::Span;

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Per-process execution context.
#[derive(Clone)]
pub struct Context {
    instance_id: Arc<str>,
    clock: Arc<dyn Clock>,
    span: Span,
}

impl Context {
    pub fn new(instance_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let instance_id: String = instance_id.into();
        let span = tracing::info_span!("shipyard", instance = %instance_id);
        Self {
            instance_id: instance_id.into(),
            clock,
            span,
        }
    }

    /// Context backed by the system clock.
    pub fn system(instance_id: impl Into<String>) -> Self {
        Self::new(instance_id, Arc::new(SystemClock))
    }

    /// Identity used as the owner of reconciliation locks.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Current time in epoch milliseconds.
    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Root span for work done on behalf of this instance.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Child span for one component (a supervisor, the scheduler, ...).
    pub fn component_span(&self, component: &'static str) -> Span {
        tracing::info_span!(parent: &self.span, "component", name = component)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("instance_id", &self.instance_id)
            .field("clock", &self.clock)
            .finish()
    }
}
