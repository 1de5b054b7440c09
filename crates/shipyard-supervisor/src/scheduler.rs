//! Scheduler: drives every supervisor on its own polling loop.
//!
//! Each supervisor runs in a dedicated task:
//! - Fast supervisors tick every `poll_interval` and can be woken early
//! - Slow supervisors (deletion sweep, group rollouts, webhooks) tick every
//!   `slow_poll_interval` and ignore wake-ups
//!
//! A wake-up that arrives while a pass is running is kept as a `Notify`
//! permit, so the next pass starts right after the current one ends.
//! `close()` stops future ticks; a pass already in flight runs to completion,
//! including any provisioner call it is waiting on.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shipyard_core::{Context, ShipyardConfig};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::error::SupervisorResult;

pub type WorkFuture<'a> = Pin<Box<dyn Future<Output = SupervisorResult<()>> + Send + 'a>>;

/// How often a supervisor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Fast,
    Slow,
}

/// One reconciliation loop.
pub trait Supervisor: Send + Sync {
    fn name(&self) -> &'static str;

    fn cadence(&self) -> Cadence {
        Cadence::Fast
    }

    /// One pass over every actionable resource.
    fn do_work(&self) -> WorkFuture<'_>;
}

/// Tick intervals for both cadences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerTiming {
    pub poll_interval: Duration,
    pub slow_poll_interval: Duration,
}

impl SchedulerTiming {
    pub fn from_config(config: &ShipyardConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            slow_poll_interval: config.slow_poll_interval(),
        }
    }

    fn interval(&self, cadence: Cadence) -> Duration {
        match cadence {
            Cadence::Fast => self.poll_interval,
            Cadence::Slow => self.slow_poll_interval,
        }
    }
}

struct Inner {
    wakers: Vec<Arc<Notify>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the running supervisor tasks. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Spawn one task per supervisor. Must be called inside a tokio runtime.
    pub fn start(ctx: &Context, supervisors: Vec<Arc<dyn Supervisor>>, timing: SchedulerTiming) -> Self {
        let cancel = CancellationToken::new();
        let mut wakers = Vec::new();
        let mut tasks = Vec::with_capacity(supervisors.len());

        for supervisor in supervisors {
            let notify = Arc::new(Notify::new());
            if supervisor.cadence() == Cadence::Fast {
                wakers.push(notify.clone());
            }
            let interval = timing.interval(supervisor.cadence());
            let span = ctx.component_span(supervisor.name());
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(
                run_supervisor(supervisor, interval, notify, cancel).instrument(span),
            ));
        }

        info!(
            supervisors = tasks.len(),
            poll_secs = timing.poll_interval.as_secs(),
            slow_poll_secs = timing.slow_poll_interval.as_secs(),
            "scheduler started"
        );

        Self {
            inner: Arc::new(Inner {
                wakers,
                cancel,
                tasks: Mutex::new(tasks),
            }),
        }
    }

    /// Run every fast supervisor as soon as possible.
    pub fn wake(&self) {
        for notify in &self.inner.wakers {
            notify.notify_one();
        }
    }

    /// Stop scheduling new passes.
    pub fn close(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!("scheduler closing");
        }
        self.inner.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Wait for every supervisor task to finish. Call after `close()`.
    pub async fn join(&self) {
        let tasks = {
            let mut guard = self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "supervisor task ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("fast_supervisors", &self.inner.wakers.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn run_supervisor(
    supervisor: Arc<dyn Supervisor>,
    interval: Duration,
    notify: Arc<Notify>,
    cancel: CancellationToken,
) {
    let name = supervisor.name();
    debug!(supervisor = name, interval_secs = interval.as_secs(), "supervisor loop started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if let Err(e) = supervisor.do_work().await {
            warn!(supervisor = name, error = %e, "supervisor pass failed");
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
            _ = notify.notified() => {
                debug!(supervisor = name, "woken");
            }
        }
    }
    debug!(supervisor = name, "supervisor loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        cadence: Cadence,
        runs: AtomicUsize,
        delay: Duration,
    }

    impl Counting {
        fn new(name: &'static str, cadence: Cadence) -> Arc<Self> {
            Arc::new(Self {
                name,
                cadence,
                runs: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    impl Supervisor for Counting {
        fn name(&self) -> &'static str {
            self.name
        }

        fn cadence(&self) -> Cadence {
            self.cadence
        }

        fn do_work(&self) -> WorkFuture<'_> {
            Box::pin(async move {
                self.runs.fetch_add(1, Ordering::SeqCst);
                if !self.delay.is_zero() {
                    sleep(self.delay).await;
                }
                Ok(())
            })
        }
    }

    fn timing() -> SchedulerTiming {
        SchedulerTiming {
            poll_interval: Duration::from_secs(30),
            slow_poll_interval: Duration::from_secs(300),
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_at_each_cadence() {
        let fast = Counting::new("fast", Cadence::Fast);
        let slow = Counting::new("slow", Cadence::Slow);
        let scheduler = Scheduler::start(
            &Context::system("test"),
            vec![fast.clone() as Arc<dyn Supervisor>, slow.clone()],
            timing(),
        );
        settle().await;
        assert_eq!(fast.runs(), 1);
        assert_eq!(slow.runs(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(fast.runs(), 3);
        assert_eq!(slow.runs(), 1);

        scheduler.close();
        scheduler.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn wake_runs_fast_supervisors_only() {
        let fast = Counting::new("fast", Cadence::Fast);
        let slow = Counting::new("slow", Cadence::Slow);
        let scheduler = Scheduler::start(
            &Context::system("test"),
            vec![fast.clone() as Arc<dyn Supervisor>, slow.clone()],
            timing(),
        );
        settle().await;
        scheduler.wake();
        settle().await;
        assert_eq!(fast.runs(), 2);
        assert_eq!(slow.runs(), 1);
        scheduler.close();
        scheduler.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn wake_during_pass_is_not_lost() {
        let busy = Arc::new(Counting {
            name: "busy",
            cadence: Cadence::Fast,
            runs: AtomicUsize::new(0),
            delay: Duration::from_secs(5),
        });
        let scheduler = Scheduler::start(&Context::system("test"), vec![busy.clone() as Arc<dyn Supervisor>], timing());
        settle().await;
        assert_eq!(busy.runs(), 1);
        // The first pass is still sleeping.
        scheduler.wake();
        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(busy.runs(), 2);
        scheduler.close();
        scheduler.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_future_ticks() {
        let fast = Counting::new("fast", Cadence::Fast);
        let scheduler = Scheduler::start(&Context::system("test"), vec![fast.clone() as Arc<dyn Supervisor>], timing());
        settle().await;
        scheduler.close();
        scheduler.join().await;
        assert!(scheduler.is_closed());
        let runs = fast.runs();
        tokio::time::sleep(Duration::from_secs(120)).await;
        scheduler.wake();
        settle().await;
        assert_eq!(fast.runs(), runs);
    }
}
