//! Per-endpoint bounded-retry command delivery

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use super::policy::{ConfirmFn, QosPolicy, fields_match};
use super::timer::{Clock, Scheduler, TimerHandle, TokioClock, TokioScheduler};
use crate::hub::ShutdownSignal;
use crate::protocol::{Envelope, Payload};

const EVENT_CAPACITY: usize = 64;

/// Where an engine hands its command envelopes
///
/// Implementations must not call back into the engine synchronously.
pub trait CommandSink: Send + Sync {
    /// Send one command envelope, fire-and-forget
    fn send_command(&self, envelope: &Envelope);
}

/// Observable outcome of a delivery sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// A command went out; `attempt` counts from 1
    Sent { attempt: u32 },
    /// Observed state matched the desired payload
    Confirmed { attempts: u32, elapsed: Duration },
    /// Budget ran out without confirmation
    TimedOut { attempts: u32, elapsed: Duration },
    /// A newer request replaced the sequence
    Superseded { attempts: u32 },
    /// Engine stopped or shutdown observed
    Cancelled { attempts: u32 },
}

/// Coarse engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Nothing outstanding
    Idle,
    /// A sequence is retrying
    Pending { attempts: u32 },
}

struct PendingCommand {
    desired: Payload,
    started_at: Instant,
    attempts: u32,
    retry: Option<TimerHandle>,
}

impl PendingCommand {
    fn cancel_retry(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.cancel();
        }
    }
}

#[derive(Default)]
struct EngineState {
    pending: Option<PendingCommand>,
    // Bumped on every new sequence so stale ticks can tell they are stale
    generation: u64,
    last_desired: Option<Payload>,
}

struct EngineShared {
    device_id: String,
    class: String,
    sink: Arc<dyn CommandSink>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    policy: QosPolicy,
    confirm: ConfirmFn,
    shutdown: Option<ShutdownSignal>,
    state: Mutex<EngineState>,
    events: broadcast::Sender<DeliveryEvent>,
}

/// QoS delivery for one endpoint
///
/// Turns a desired state into a retried command sequence that ends on
/// confirmation, on timeout, on supersession by a newer request, or on
/// shutdown. Confirmation comes from state payloads the owner forwards
/// into [`DeliveryEngine::on_observed_state`].
///
/// Clones share the same pending command.
#[derive(Clone)]
pub struct DeliveryEngine {
    shared: Arc<EngineShared>,
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("device_id", &self.shared.device_id)
            .field("class", &self.shared.class)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Builder for [`DeliveryEngine`]
pub struct DeliveryEngineBuilder {
    device_id: String,
    class: String,
    sink: Arc<dyn CommandSink>,
    policy: QosPolicy,
    clock: Option<Arc<dyn Clock>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    confirm: Option<ConfirmFn>,
    shutdown: Option<ShutdownSignal>,
}

impl DeliveryEngineBuilder {
    /// Retry table and budget
    #[must_use]
    pub fn policy(mut self, policy: QosPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Time source; defaults to tokio's clock
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Timer backend; defaults to a tokio task per retry
    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Replace the default field-by-field confirmation check
    #[must_use]
    pub fn confirm_with(mut self, confirm: ConfirmFn) -> Self {
        self.confirm = Some(confirm);
        self
    }

    /// Stop retrying once this signal fires
    #[must_use]
    pub fn shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Finish the engine
    ///
    /// Without an explicit scheduler the engine spawns tokio tasks, so the
    /// first `request_delivery` must then run inside a tokio runtime.
    #[must_use]
    pub fn build(self) -> DeliveryEngine {
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(TokioScheduler::new(self.shutdown.clone())));
        let clock = self.clock.unwrap_or_else(|| Arc::new(TokioClock));
        let confirm = self.confirm.unwrap_or_else(|| Arc::new(fields_match));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        DeliveryEngine {
            shared: Arc::new(EngineShared {
                device_id: self.device_id,
                class: self.class,
                sink: self.sink,
                clock,
                scheduler,
                policy: self.policy,
                confirm,
                shutdown: self.shutdown,
                state: Mutex::new(EngineState::default()),
                events,
            }),
        }
    }
}

impl DeliveryEngine {
    /// Start building an engine for endpoint `(device_id, class)`
    pub fn builder(
        device_id: impl Into<String>,
        class: impl Into<String>,
        sink: Arc<dyn CommandSink>,
    ) -> DeliveryEngineBuilder {
        DeliveryEngineBuilder {
            device_id: device_id.into(),
            class: class.into(),
            sink,
            policy: QosPolicy::default(),
            clock: None,
            scheduler: None,
            confirm: None,
            shutdown: None,
        }
    }

    /// Device this engine commands
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    /// Endpoint class this engine commands
    #[must_use]
    pub fn class(&self) -> &str {
        &self.shared.class
    }

    /// Stream of delivery outcomes
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.shared.events.subscribe()
    }

    /// Send `desired` now and keep resending until confirmed or out of budget
    ///
    /// Replaces any sequence already in flight. After shutdown the payload is
    /// only recorded as the desired state and nothing is sent.
    pub fn request_delivery(&self, desired: Payload) {
        let shared = &self.shared;
        let mut state = shared.lock_state();
        state.last_desired = Some(desired.clone());

        if let Some(mut old) = state.pending.take() {
            old.cancel_retry();
            tracing::debug!(
                device = %shared.device_id,
                class = %shared.class,
                attempts = old.attempts,
                "command superseded"
            );
            shared.emit(DeliveryEvent::Superseded {
                attempts: old.attempts,
            });
        }
        state.generation += 1;

        if shared.is_shut_down() {
            tracing::debug!(device = %shared.device_id, "shutdown, command not sent");
            return;
        }

        let mut pending = PendingCommand {
            desired,
            started_at: shared.clock.now(),
            attempts: 0,
            retry: None,
        };
        shared.send(&mut pending);
        pending.retry = Some(self.schedule_retry(state.generation, pending.attempts));
        state.pending = Some(pending);
    }

    /// Feed an observed state payload; returns true if it confirmed the pending command
    ///
    /// Only a pending command can be confirmed, so repeated identical
    /// payloads after the first confirmation are no-ops.
    pub fn on_observed_state(&self, observed: &Payload) -> bool {
        let shared = &self.shared;
        let mut state = shared.lock_state();

        let confirmed = state
            .pending
            .as_ref()
            .is_some_and(|pending| (shared.confirm)(&pending.desired, observed));
        if !confirmed {
            return false;
        }

        let Some(mut pending) = state.pending.take() else {
            return false;
        };
        pending.cancel_retry();
        let elapsed = shared.elapsed_since(pending.started_at);
        tracing::debug!(
            device = %shared.device_id,
            class = %shared.class,
            attempts = pending.attempts,
            elapsed_ms = elapsed.as_millis(),
            "command confirmed"
        );
        shared.emit(DeliveryEvent::Confirmed {
            attempts: pending.attempts,
            elapsed,
        });
        true
    }

    /// Cancel any pending sequence without sending anything further
    pub fn stop(&self) {
        let shared = &self.shared;
        let mut state = shared.lock_state();
        state.generation += 1;
        if let Some(mut pending) = state.pending.take() {
            pending.cancel_retry();
            shared.emit(DeliveryEvent::Cancelled {
                attempts: pending.attempts,
            });
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> DeliveryState {
        self.shared
            .lock_state()
            .pending
            .as_ref()
            .map_or(DeliveryState::Idle, |p| DeliveryState::Pending {
                attempts: p.attempts,
            })
    }

    /// Whether a sequence is in flight
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.shared.lock_state().pending.is_some()
    }

    /// Most recently requested payload, kept after confirmation or timeout
    #[must_use]
    pub fn desired(&self) -> Option<Payload> {
        self.shared.lock_state().last_desired.clone()
    }

    fn schedule_retry(&self, generation: u64, attempts: u32) -> TimerHandle {
        let weak: Weak<EngineShared> = Arc::downgrade(&self.shared);
        let delay = self.shared.policy.delay_for_attempt(attempts);
        self.shared.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    DeliveryEngine { shared }.retry_tick(generation);
                }
            }),
        )
    }

    fn retry_tick(&self, generation: u64) {
        let shared = &self.shared;
        let mut guard = shared.lock_state();
        let state = &mut *guard;

        if state.generation != generation {
            return;
        }
        let Some(pending) = state.pending.as_mut() else {
            return;
        };

        if shared.is_shut_down() {
            let attempts = pending.attempts;
            state.pending = None;
            tracing::debug!(device = %shared.device_id, attempts, "shutdown, retries cancelled");
            shared.emit(DeliveryEvent::Cancelled { attempts });
            return;
        }

        let elapsed = shared.elapsed_since(pending.started_at);
        if elapsed > shared.policy.max_total {
            let attempts = pending.attempts;
            state.pending = None;
            tracing::warn!(
                device = %shared.device_id,
                class = %shared.class,
                attempts,
                elapsed_ms = elapsed.as_millis(),
                "command not confirmed within budget"
            );
            shared.emit(DeliveryEvent::TimedOut { attempts, elapsed });
            return;
        }

        shared.send(pending);
        pending.retry = Some(self.schedule_retry(generation, pending.attempts));
    }
}

impl EngineShared {
    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.as_ref().is_some_and(ShutdownSignal::is_shutdown)
    }

    fn elapsed_since(&self, start: Instant) -> Duration {
        self.clock.now().saturating_duration_since(start)
    }

    fn send(&self, pending: &mut PendingCommand) {
        pending.attempts += 1;
        let envelope = Envelope::command(&self.device_id, &self.class, pending.desired.clone());
        tracing::trace!(
            device = %self.device_id,
            class = %self.class,
            attempt = pending.attempts,
            "sending command"
        );
        self.sink.send_command(&envelope);
        self.emit(DeliveryEvent::Sent {
            attempt: pending.attempts,
        });
    }

    fn emit(&self, event: DeliveryEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}
