//! The opaque radio/transport capability the session consumes.
//!
//! The session never talks to an OS Bluetooth stack directly; it is handed a
//! boxed [`Transport`] at construction and everything radio-shaped flows
//! through these primitives. Every fallible call returns an explicit
//! [`TransportError`]; none panic or throw past this boundary.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::service::ServiceInfo;
use crate::{AdapterState, DeviceId, DeviceSighting, TransportError};

/// Advertisement sightings while a scan is active. A scan error terminates
/// the scan; the stream yields it and then ends.
pub type SightingStream = BoxStream<'static, Result<DeviceSighting, TransportError>>;

/// Raw notification payloads for one subscribed characteristic. Dropping
/// the stream cancels the subscription.
pub type NotificationStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// Adapter availability changes. Subscribing yields the current state
/// immediately, then changes as they happen.
pub type AdapterStream = BoxStream<'static, AdapterState>;

/// Link-severed events for one device, however the link was severed.
pub type DisconnectStream = BoxStream<'static, DisconnectEvent>;

#[derive(Clone, Debug)]
pub struct DisconnectEvent {
    pub id: DeviceId,
    pub error: Option<TransportError>,
}

/// Restricts a scan to devices advertising particular services.
/// An empty filter matches everything.
#[derive(Clone, Debug)]
pub struct ScanFilter {
    pub(crate) service_uuids: HashSet<Uuid>,
}

impl ScanFilter {
    pub fn new() -> Self {
        Self { service_uuids: HashSet::new() }
    }

    pub fn add_service(&mut self, uuid: Uuid) -> &mut Self {
        self.service_uuids.insert(uuid);
        self
    }

    /// Whether a sighting advertises at least one of the filtered services.
    pub fn matches(&self, sighting: &DeviceSighting) -> bool {
        self.service_uuids.is_empty()
        || sighting.service_ids.iter().any(|id| self.service_uuids.contains(id))
    }
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// The primitives a radio driver must expose.
///
/// All operations may suspend for unbounded time up to the transport's own
/// timeouts; the session deliberately imposes no additional watchdog on
/// `connect`/`discover_services`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn start_scan(&self, filter: &ScanFilter) -> Result<SightingStream, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, id: &DeviceId) -> Result<(), TransportError>;

    async fn cancel_connection(&self, id: &DeviceId) -> Result<(), TransportError>;

    /// Enumerates the full service/characteristic graph of a connected
    /// device, preserving on-device order.
    async fn discover_services(&self, id: &DeviceId) -> Result<Vec<ServiceInfo>, TransportError>;

    /// Asks the peer to negotiate a larger per-exchange payload size.
    /// Returns the unit actually granted.
    async fn request_transfer_unit(&self, id: &DeviceId, unit: u16)
                                   -> Result<u16, TransportError>;

    async fn read_signal(&self, id: &DeviceId) -> Result<i16, TransportError>;

    async fn write_without_response(&self, id: &DeviceId, service: Uuid, characteristic: Uuid,
                                    data: &[u8])
                                    -> Result<(), TransportError>;

    async fn subscribe_notifications(&self, id: &DeviceId, service: Uuid, characteristic: Uuid)
                                     -> Result<NotificationStream, TransportError>;

    fn adapter_events(&self) -> AdapterStream;

    fn disconnect_events(&self, id: &DeviceId) -> DisconnectStream;
}
