//! Periodic signal-strength sampling for the active connection.
//!
//! Starts with an immediate read so observers aren't blind for the first
//! interval, then samples on a fixed cadence. Each tick re-checks the phase
//! before touching the transport, and failed reads are skipped without
//! retry or backoff; the last good value stays published until the next
//! success or the link is torn down.

use std::sync::Arc;

use log::trace;
use tokio::time::MissedTickBehavior;

use crate::config::SIGNAL_POLL_INTERVAL;
use crate::session::Subscription;
use crate::state::StateStore;
use crate::transport::Transport;
use crate::DeviceId;

pub(crate) struct SignalPoller {
    // Dropping the poller aborts the sampling task, so a scheduled tick
    // can't run after the owning link is torn down
    _sampler: Subscription,
}

impl SignalPoller {
    pub(crate) fn start(transport: Arc<dyn Transport>, state: StateStore, id: DeviceId)
                        -> Self {
        let sampler = Subscription::spawn(async move {
            let mut ticks = tokio::time::interval(SIGNAL_POLL_INTERVAL);
            // A missed cadence shouldn't cause a read burst afterwards
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                // The first tick completes immediately
                ticks.tick().await;
                if !state.is_connected() {
                    break;
                }
                match transport.read_signal(&id).await {
                    Ok(signal) => state.set_signal(signal),
                    Err(err) => trace!("Skipping failed signal read for {id}: {err}"),
                }
            }
        });
        SignalPoller { _sampler: sampler }
    }
}
