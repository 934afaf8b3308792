//! The shared, observable state that every component reads and mutates.
//!
//! Each observable lives behind a `tokio::sync::watch` channel so readers
//! always see a consistent snapshot and can await changes. Mutations only
//! happen through the named operations here; there are no ad-hoc field
//! writes, which keeps the invariants checkable:
//!
//! - the connection and phase are published as one [`LinkSnapshot`] value,
//!   so "service graph present iff phase is Connected" holds atomically
//!   from an observer's point of view;
//! - the ranked device list is a pure derivation over the discovered set,
//!   recomputed on read and never stored redundantly.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::watch;

use crate::notifications::{push_bounded, InboundNotification, OutgoingMessage};
use crate::service::ServiceInfo;
use crate::{AdapterState, ConnectionPhase, DeviceId, DeviceSighting};

/// The single live connection. At most one exists process-wide; it is
/// created on a successful connect and destroyed on any disconnect.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub id: DeviceId,
    /// Captured verbatim from discovery; immutable for this connection.
    pub services: Vec<ServiceInfo>,
    pub transfer_unit: u16,
}

/// Phase and connection, published together.
#[derive(Clone, Debug)]
pub struct LinkSnapshot {
    pub phase: ConnectionPhase,
    pub connection: Option<ConnectionInfo>,
}

impl LinkSnapshot {
    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }
}

/// Sorts by signal strength descending with unknown signal last, and drops
/// devices with neither an advertised nor a local name.
pub fn ranked(sightings: &HashMap<DeviceId, DeviceSighting>) -> Vec<DeviceSighting> {
    let mut list: Vec<DeviceSighting> = sightings.values()
                                                 .filter(|s| s.display_name().is_some())
                                                 .cloned()
                                                 .collect();
    list.sort_by(|a, b| compare_signal(b.signal, a.signal));
    list
}

fn compare_signal(a: Option<i16>, b: Option<i16>) -> Ordering {
    a.unwrap_or(i16::MIN).cmp(&b.unwrap_or(i16::MIN))
}

#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    adapter: watch::Sender<AdapterState>,
    scanning: watch::Sender<bool>,
    sightings: watch::Sender<HashMap<DeviceId, DeviceSighting>>,
    link: watch::Sender<LinkSnapshot>,
    signal: watch::Sender<Option<i16>>,
    inbound: watch::Sender<VecDeque<InboundNotification>>,
    outgoing: watch::Sender<Vec<OutgoingMessage>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (adapter, _) = watch::channel(AdapterState::Unknown);
        let (scanning, _) = watch::channel(false);
        let (sightings, _) = watch::channel(HashMap::new());
        let (link, _) = watch::channel(LinkSnapshot { phase: ConnectionPhase::Disconnected,
                                                      connection: None });
        let (signal, _) = watch::channel(None);
        let (inbound, _) = watch::channel(VecDeque::new());
        let (outgoing, _) = watch::channel(Vec::new());
        StateStore { inner: Arc::new(StoreInner { adapter,
                                                  scanning,
                                                  sightings,
                                                  link,
                                                  signal,
                                                  inbound,
                                                  outgoing }) }
    }

    // Adapter

    pub fn set_adapter_state(&self, state: AdapterState) {
        self.inner.adapter.send_if_modified(|current| {
                              let changed = *current != state;
                              *current = state;
                              changed
                          });
    }

    pub fn adapter_state(&self) -> AdapterState {
        *self.inner.adapter.borrow()
    }

    pub fn is_adapter_ready(&self) -> bool {
        self.adapter_state() == AdapterState::PoweredOn
    }

    pub fn watch_adapter(&self) -> watch::Receiver<AdapterState> {
        self.inner.adapter.subscribe()
    }

    // Scanning / discovered set

    pub(crate) fn set_scanning(&self, scanning: bool) {
        self.inner.scanning.send_replace(scanning);
    }

    pub fn is_scanning(&self) -> bool {
        *self.inner.scanning.borrow()
    }

    pub fn watch_scanning(&self) -> watch::Receiver<bool> {
        self.inner.scanning.subscribe()
    }

    pub(crate) fn clear_sightings(&self) {
        self.inner.sightings.send_modify(|map| map.clear());
    }

    /// Full replacement keyed by device id: a later sighting with a weaker
    /// signal overwrites a stronger earlier one, since only the latest
    /// reading is meaningful.
    pub(crate) fn upsert_sighting(&self, sighting: DeviceSighting) {
        self.inner.sightings.send_modify(|map| {
                                map.insert(sighting.id.clone(), sighting);
                            });
    }

    pub fn sightings(&self) -> HashMap<DeviceId, DeviceSighting> {
        self.inner.sightings.borrow().clone()
    }

    /// The ranked live list, derived on read.
    pub fn ranked_sightings(&self) -> Vec<DeviceSighting> {
        ranked(&self.inner.sightings.borrow())
    }

    pub fn watch_sightings(&self) -> watch::Receiver<HashMap<DeviceId, DeviceSighting>> {
        self.inner.sightings.subscribe()
    }

    // Link

    pub fn link(&self) -> LinkSnapshot {
        self.inner.link.borrow().clone()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.link.borrow().phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Connected
    }

    pub fn watch_link(&self) -> watch::Receiver<LinkSnapshot> {
        self.inner.link.subscribe()
    }

    pub(crate) fn set_connecting(&self) {
        self.inner.link.send_modify(|link| {
                            link.phase = ConnectionPhase::Connecting;
                            link.connection = None;
                        });
    }

    pub(crate) fn set_connected(&self, connection: ConnectionInfo) {
        self.inner.link.send_modify(|link| {
                            link.phase = ConnectionPhase::Connected;
                            link.connection = Some(connection);
                        });
    }

    pub(crate) fn set_disconnecting(&self) {
        self.inner.link.send_modify(|link| {
                            link.phase = ConnectionPhase::Disconnecting;
                            link.connection = None;
                        });
    }

    pub(crate) fn set_disconnected(&self) {
        self.inner.link.send_modify(|link| {
                            link.phase = ConnectionPhase::Disconnected;
                            link.connection = None;
                        });
        self.clear_signal();
    }

    // Signal strength

    pub(crate) fn set_signal(&self, signal: i16) {
        self.inner.signal.send_replace(Some(signal));
    }

    pub(crate) fn clear_signal(&self) {
        self.inner.signal.send_replace(None);
    }

    pub fn signal(&self) -> Option<i16> {
        *self.inner.signal.borrow()
    }

    pub fn watch_signal(&self) -> watch::Receiver<Option<i16>> {
        self.inner.signal.subscribe()
    }

    // Notification history

    pub(crate) fn push_inbound(&self, notification: InboundNotification) {
        self.inner.inbound.send_modify(|history| push_bounded(history, notification));
    }

    /// Bounded history, newest first.
    pub fn history(&self) -> Vec<InboundNotification> {
        self.inner.inbound.borrow().iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.inner.inbound.send_modify(|history| history.clear());
    }

    pub fn watch_history(&self) -> watch::Receiver<VecDeque<InboundNotification>> {
        self.inner.inbound.subscribe()
    }

    // Outgoing message log

    pub(crate) fn push_outgoing(&self, message: OutgoingMessage) {
        self.inner.outgoing.send_modify(|log| log.push(message));
    }

    pub fn messages(&self) -> Vec<OutgoingMessage> {
        self.inner.outgoing.borrow().clone()
    }

    pub fn clear_messages(&self) {
        self.inner.outgoing.send_modify(|log| log.clear());
    }

    pub fn watch_messages(&self) -> watch::Receiver<Vec<OutgoingMessage>> {
        self.inner.outgoing.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sighting(id: &str, name: Option<&str>, signal: Option<i16>) -> DeviceSighting {
        DeviceSighting { id: id.parse().unwrap(),
                         advertised_name: name.map(str::to_string),
                         local_name: None,
                         signal,
                         connectable: Some(true),
                         service_ids: vec![] }
    }

    #[test]
    fn resighting_replaces_not_merges() {
        let store = StateStore::new();
        store.upsert_sighting(sighting("AA:00:00:00:00:01", Some("a"), Some(-40)));
        store.upsert_sighting(sighting("AA:00:00:00:00:01", Some("a"), Some(-70)));

        let map = store.sightings();
        assert_eq!(map.len(), 1);
        assert_eq!(map.values().next().unwrap().signal, Some(-70));
    }

    #[test]
    fn ranked_filters_nameless_and_sorts_nulls_last() {
        let store = StateStore::new();
        store.upsert_sighting(sighting("AA:00:00:00:00:01", Some("weak"), Some(-90)));
        store.upsert_sighting(sighting("AA:00:00:00:00:02", Some("strong"), Some(-40)));
        store.upsert_sighting(sighting("AA:00:00:00:00:03", None, Some(-10)));
        store.upsert_sighting(sighting("AA:00:00:00:00:04", Some("silent"), None));

        let names: Vec<_> = store.ranked_sightings()
                                 .iter()
                                 .map(|s| s.display_name().unwrap().to_string())
                                 .collect();
        assert_eq!(names, vec!["strong", "weak", "silent"]);
    }

    #[test]
    fn link_publishes_connection_and_phase_together() {
        let store = StateStore::new();
        let mut rx = store.watch_link();

        store.set_connecting();
        let snap = rx.borrow_and_update().clone();
        assert_eq!(snap.phase, ConnectionPhase::Connecting);
        assert!(snap.connection.is_none());

        store.set_connected(ConnectionInfo { id: "AA:00:00:00:00:01".parse().unwrap(),
                                             services: vec![],
                                             transfer_unit: 23 });
        let snap = rx.borrow_and_update().clone();
        assert!(snap.is_connected());
        assert!(snap.connection.is_some());

        store.set_signal(-55);
        store.set_disconnected();
        let snap = rx.borrow_and_update().clone();
        assert_eq!(snap.phase, ConnectionPhase::Disconnected);
        assert!(snap.connection.is_none());
        assert_eq!(store.signal(), None);
    }
}
