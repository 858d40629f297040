//! Clock and scheduler seams for the delivery engine
//!
//! Production engines run on [`TokioClock`] and [`TokioScheduler`]; tests
//! swap in [`super::VirtualTime`] to step time by hand.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::hub::ShutdownSignal;

/// Work run when a timer fires
pub type Tick = Box<dyn FnOnce() + Send + 'static>;

/// Monotonic time source
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;
}

/// Runs a tick after a delay
pub trait Scheduler: Send + Sync {
    /// Arrange for `tick` to run once `delay` has passed
    fn schedule(&self, delay: Duration, tick: Tick) -> TimerHandle;
}

/// Cancel handle for one scheduled tick
///
/// Dropping the handle does not cancel the tick.
#[derive(Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    /// Handle over a shared cancel flag, optionally aborting a task too
    #[must_use]
    pub const fn new(cancelled: Arc<AtomicBool>, abort: Option<AbortHandle>) -> Self {
        Self { cancelled, abort }
    }

    /// Prevent the tick from running if it has not started
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    /// Whether `cancel` was called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Tokio's clock; follows `tokio::time::pause` in tests
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// One spawned task per scheduled tick
///
/// When a shutdown signal is attached, a pending timer fires early on
/// shutdown so its owner can observe the signal and stop rescheduling.
/// `schedule` must be called from within a tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct TokioScheduler {
    shutdown: Option<ShutdownSignal>,
}

impl TokioScheduler {
    /// Scheduler whose timers also wake on `shutdown`
    #[must_use]
    pub const fn new(shutdown: Option<ShutdownSignal>) -> Self {
        Self { shutdown }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, tick: Tick) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            match shutdown {
                Some(mut shutdown) => {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = shutdown.wait() => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
            if !flag.load(Ordering::Acquire) {
                tick();
            }
        });

        TimerHandle::new(cancelled, Some(task.abort_handle()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::hub::ShutdownTrigger;

    fn counter_tick(count: &Arc<AtomicUsize>) -> Tick {
        let count = Arc::clone(count);
        Box::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let scheduler = TokioScheduler::default();
        let count = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(Duration::from_millis(100), counter_tick(&count));

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let scheduler = TokioScheduler::default();
        let count = Arc::new(AtomicUsize::new(0));

        let handle = scheduler.schedule(Duration::from_millis(50), counter_tick(&count));
        handle.cancel();
        assert!(handle.is_cancelled());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fires_pending_timer_early() {
        let trigger = ShutdownTrigger::new();
        let scheduler = TokioScheduler::new(Some(trigger.signal()));
        let count = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(Duration::from_secs(3600), counter_tick(&count));
        trigger.trigger();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
