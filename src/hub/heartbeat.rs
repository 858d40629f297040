//! Periodic ping and liveness sweep

use tokio::time::{Instant, MissedTickBehavior};

use super::{Hub, ShutdownSignal};

/// Run until shutdown: every ping interval, ping the bus then sweep liveness
///
/// The first tick comes one full period after start.
pub(super) async fn run(hub: Hub, mut shutdown: ShutdownSignal) {
    let period = hub.config().ping_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(period_secs = period.as_secs(), "heartbeat started");

    loop {
        tokio::select! {
            () = shutdown.wait() => break,
            _ = ticker.tick() => tick(&hub),
        }
    }

    tracing::debug!("heartbeat stopped");
}

fn tick(hub: &Hub) {
    hub.ping();

    for transition in hub.sweep_liveness() {
        if transition.online {
            tracing::warn!(device = %transition.id, "device online");
        } else {
            tracing::warn!(
                device = %transition.id,
                silent_secs = transition.silent_for.as_secs(),
                "device offline"
            );
        }
    }
}
