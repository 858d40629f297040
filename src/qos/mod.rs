//! At-least-once command delivery over the unreliable bus
//!
//! Every controllable endpoint owns one [`DeliveryEngine`]. A request sends
//! the full desired state immediately, then resends it on the
//! [`QosPolicy`] delay table until a matching state report arrives or the
//! time budget runs out:
//!
//! ```text
//! Idle --request_delivery--> Pending --confirmed / timed out / stop--> Idle
//!                             |   ^
//!                             +---+ retry tick, or newer request
//! ```
//!
//! Timing goes through the [`Clock`] and [`Scheduler`] traits so tests can
//! drive it with [`VirtualTime`].

mod engine;
mod policy;
mod timer;
mod virtual_time;

pub use engine::{CommandSink, DeliveryEngine, DeliveryEngineBuilder, DeliveryEvent, DeliveryState};
pub use policy::{ConfirmFn, QOS_MAX_TOTAL, QOS_RETRY_DELAYS, QosPolicy, fields_match};
pub use timer::{Clock, Scheduler, Tick, TimerHandle, TokioClock, TokioScheduler};
pub use virtual_time::VirtualTime;
