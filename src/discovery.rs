//! The scan engine: drives discovery of nearby peripherals.
//!
//! One scan at a time. Starting clears the discovered set and arms the
//! timeout inside the scan task itself, so timeout, transport error and
//! explicit stop all converge on the same stop path, guarded by one lock for
//! idempotence. Sightings are recorded by full replacement keyed on device
//! id; the ranked view over them is derived by the state store on read.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::StreamExt;
use log::{trace, warn};
use tokio::sync::{broadcast, Mutex};

use crate::config;
use crate::session::Subscription;
use crate::state::StateStore;
use crate::transport::{ScanFilter, Transport};
use crate::{Error, Event, Result, TransportError};

pub(crate) struct Scanner {
    inner: Arc<ScannerInner>,
}

struct ScannerInner {
    transport: Arc<dyn Transport>,
    state: StateStore,
    event_bus: broadcast::Sender<Event>,

    // Holds the handle for the active scan task. Start and stop both take
    // this lock, so overlapping calls serialize and stop is idempotent.
    active: Mutex<Option<Subscription>>,
}

impl Scanner {
    pub(crate) fn new(transport: Arc<dyn Transport>, state: StateStore,
                      event_bus: broadcast::Sender<Event>)
                      -> Self {
        Scanner { inner: Arc::new(ScannerInner { transport,
                                                 state,
                                                 event_bus,
                                                 active: Mutex::new(None) }) }
    }

    /// Starts a scan that stops itself after `timeout` (zero means scan
    /// until stopped). Any scan already active is stopped first, and the
    /// discovered set is cleared so stale sightings never linger.
    ///
    /// With `filter_known` the transport only reports devices advertising
    /// the well-known primary service.
    pub(crate) async fn start_scan(&self, timeout: Duration, filter_known: bool)
                                   -> Result<()> {
        let mut active = self.inner.active.lock().await;

        if !self.inner.state.is_adapter_ready() {
            return Err(Error::Other(anyhow!("Adapter is not powered on")));
        }

        if active.is_some() {
            trace!("Stopping previous scan before starting a new one");
            stop_locked(&self.inner, &mut active, false, None).await;
        }

        self.inner.state.clear_sightings();

        let mut filter = ScanFilter::new();
        if filter_known {
            filter.add_service(config::UART_SERVICE_UUID);
        }
        let mut sightings = self.inner.transport.start_scan(&filter).await?;
        self.inner.state.set_scanning(true);

        let weak = Arc::downgrade(&self.inner);
        let task = Subscription::spawn(async move {
            let deadline = async move {
                if timeout.is_zero() {
                    futures::future::pending::<()>().await
                } else {
                    tokio::time::sleep(timeout).await
                }
            };
            tokio::pin!(deadline);

            let stop_error = loop {
                tokio::select! {
                    _ = &mut deadline => {
                        trace!("Scan timeout expired");
                        break None;
                    }
                    item = sightings.next() => {
                        match item {
                            Some(Ok(sighting)) => {
                                match weak.upgrade() {
                                    Some(inner) => inner.state.upsert_sighting(sighting),
                                    None => return,
                                }
                            }
                            Some(Err(err)) => {
                                warn!("Scan failed: {err}");
                                break Some(err);
                            }
                            None => {
                                trace!("Sighting stream ended");
                                break None;
                            }
                        }
                    }
                }
            };

            if let Some(inner) = weak.upgrade() {
                let mut active = inner.active.lock().await;
                stop_locked(&inner, &mut active, true, stop_error).await;
            }
        });
        *active = Some(task);

        Ok(())
    }

    /// Stops any active scan. Stopping twice is a no-op; a transport error
    /// while stopping is logged and the scan state cleared regardless.
    pub(crate) async fn stop_scan(&self) {
        let mut active = self.inner.active.lock().await;
        stop_locked(&self.inner, &mut active, false, None).await;
    }
}

/// The single stop path shared by explicit stop, timeout and scan error.
/// Callers must hold the `active` lock.
async fn stop_locked(inner: &Arc<ScannerInner>, active: &mut Option<Subscription>,
                     from_task: bool, error: Option<TransportError>) {
    match (active.take(), from_task) {
        // The scan task can't be allowed another tick once stop is underway
        (Some(task), false) => task.cancel(),
        // We *are* the scan task; it returns right after this
        (Some(task), true) => task.detach(),
        (None, _) => {
            if !inner.state.is_scanning() {
                return;
            }
        }
    }

    if let Err(err) = inner.transport.stop_scan().await {
        warn!("Error stopping scan (clearing scan state anyway): {err}");
    }
    inner.state.set_scanning(false);
    let _ = inner.event_bus.send(Event::ScanStopped { error });
}
