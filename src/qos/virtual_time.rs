//! Hand-stepped clock and scheduler for deterministic tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use super::timer::{Clock, Scheduler, Tick, TimerHandle};

/// Virtual time shared by a clock and a scheduler
///
/// Nothing fires until [`VirtualTime::advance`] moves time forward; due
/// ticks then run in deadline order (ties in scheduling order) with the
/// clock reading exactly their deadline.
#[derive(Clone)]
pub struct VirtualTime {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    origin: Instant,
    elapsed: Duration,
    next_seq: u64,
    timers: BTreeMap<(Duration, u64), (Arc<AtomicBool>, Tick)>,
}

impl Default for VirtualTime {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTime {
    /// Start at elapsed zero
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                origin: Instant::now(),
                elapsed: Duration::ZERO,
                next_seq: 0,
                timers: BTreeMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time advanced so far
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }

    /// Timers scheduled and neither fired nor cancelled
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.lock()
            .timers
            .values()
            .filter(|(cancelled, _)| !cancelled.load(Ordering::Acquire))
            .count()
    }

    /// Move time forward by `by`, running every tick that falls due
    pub fn advance(&self, by: Duration) {
        let target = self.lock().elapsed + by;

        loop {
            let due = {
                let mut inner = self.lock();
                let Some(&key) = inner.timers.keys().next() else {
                    break;
                };
                if key.0 > target {
                    break;
                }
                inner.elapsed = inner.elapsed.max(key.0);
                inner.timers.remove(&key)
            };

            // Run outside the lock: ticks usually schedule the next timer
            if let Some((cancelled, tick)) = due {
                if !cancelled.load(Ordering::Acquire) {
                    tick();
                }
            }
        }

        let mut inner = self.lock();
        inner.elapsed = inner.elapsed.max(target);
    }
}

impl Clock for VirtualTime {
    fn now(&self) -> Instant {
        let inner = self.lock();
        inner.origin + inner.elapsed
    }
}

impl Scheduler for VirtualTime {
    fn schedule(&self, delay: Duration, tick: Tick) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut inner = self.lock();
        let deadline = inner.elapsed + delay;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner
            .timers
            .insert((deadline, seq), (Arc::clone(&cancelled), tick));
        TimerHandle::new(cancelled, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_run_in_deadline_order_at_their_deadline() {
        let time = VirtualTime::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for (name, ms) in [("b", 20_u64), ("a", 10), ("c", 20)] {
            let log = Arc::clone(&log);
            let clock = time.clone();
            time.schedule(
                Duration::from_millis(ms),
                Box::new(move || {
                    let at = clock.elapsed();
                    log.lock().unwrap().push((name, at));
                }),
            );
        }

        time.advance(Duration::from_millis(15));
        assert_eq!(log.lock().unwrap().len(), 1);

        time.advance(Duration::from_millis(100));
        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                ("a", Duration::from_millis(10)),
                ("b", Duration::from_millis(20)),
                ("c", Duration::from_millis(20)),
            ]
        );
        assert_eq!(time.elapsed(), Duration::from_millis(115));
    }

    #[test]
    fn cancelled_ticks_are_skipped() {
        let time = VirtualTime::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        let handle = time.schedule(
            Duration::from_millis(5),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );
        assert_eq!(time.pending_timers(), 1);
        handle.cancel();
        assert_eq!(time.pending_timers(), 0);

        time.advance(Duration::from_secs(1));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn ticks_may_schedule_more_ticks() {
        let time = VirtualTime::new();
        let count = Arc::new(Mutex::new(0_u32));

        fn chain(time: VirtualTime, count: Arc<Mutex<u32>>) {
            let next = time.clone();
            time.schedule(
                Duration::from_millis(10),
                Box::new(move || {
                    *count.lock().unwrap() += 1;
                    chain(next, count);
                }),
            );
        }
        chain(time.clone(), Arc::clone(&count));

        time.advance(Duration::from_millis(55));
        assert_eq!(*count.lock().unwrap(), 5);
    }

    #[test]
    fn clock_tracks_elapsed() {
        let time = VirtualTime::new();
        let start = time.now();
        time.advance(Duration::from_millis(250));
        assert_eq!(time.now() - start, Duration::from_millis(250));
    }
}
