//! A deterministic in-memory [`Transport`] implementation.
//!
//! Tests script it from the outside: add devices, emit sightings and
//! notifications, flip the adapter state, inject failures for individual
//! operations, then assert on call counters and the recorded writes. It
//! also tracks how many notification subscriptions are currently alive so
//! tests can prove teardown released everything exactly once.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use uuid::Uuid;

use crate::characteristic::{CharacteristicInfo, CharacteristicProps};
use crate::config;
use crate::service::ServiceInfo;
use crate::transport::{AdapterStream, DisconnectEvent, DisconnectStream, NotificationStream,
                       ScanFilter, SightingStream, Transport};
use crate::{AdapterState, DeviceId, DeviceSighting, TransportError};

/// The service graph a typical UART-style peripheral exposes: the vendor
/// UART service plus a standard battery service.
pub fn uart_services() -> Vec<ServiceInfo> {
    const BATTERY_SERVICE: Uuid = config::short_uuid(0x180F);
    const BATTERY_LEVEL: Uuid = config::short_uuid(0x2A19);

    vec![ServiceInfo { uuid: config::UART_SERVICE_UUID,
                       characteristics: vec![
                           CharacteristicInfo { uuid: config::UART_RX_CHARACTERISTIC_UUID,
                                                service_uuid: config::UART_SERVICE_UUID,
                                                props: CharacteristicProps::WRITE
                                                       | CharacteristicProps::WRITE_WITHOUT_RESPONSE },
                           CharacteristicInfo { uuid: config::UART_TX_CHARACTERISTIC_UUID,
                                                service_uuid: config::UART_SERVICE_UUID,
                                                props: CharacteristicProps::NOTIFY },
                       ] },
         ServiceInfo { uuid: BATTERY_SERVICE,
                       characteristics: vec![CharacteristicInfo { uuid: BATTERY_LEVEL,
                                                                  service_uuid: BATTERY_SERVICE,
                                                                  props:
                                                                      CharacteristicProps::READ }] }]
}

/// One accepted `write_without_response`, for test assertions.
#[derive(Clone, Debug)]
pub struct WriteRecord {
    pub id: DeviceId,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub data: Vec<u8>,
}

#[derive(Clone)]
pub struct FakeTransport {
    inner: Arc<FakeInner>,
}

struct FakeInner {
    devices: Mutex<HashMap<DeviceId, Vec<ServiceInfo>>>,

    connect_failure: Mutex<Option<TransportError>>,
    discovery_failure: Mutex<Option<TransportError>>,
    subscribe_failure: Mutex<Option<TransportError>>,
    write_failure: Mutex<Option<TransportError>>,
    signal_result: Mutex<Result<i16, TransportError>>,
    // None grants whatever was requested
    transfer_unit_result: Mutex<Option<Result<u16, TransportError>>>,
    // Stalls cancel_connection, to widen teardown race windows in tests
    cancel_delay: Mutex<Option<Duration>>,

    scan_tx: Mutex<Option<mpsc::UnboundedSender<Result<DeviceSighting, TransportError>>>>,
    scan_filter: Mutex<Option<ScanFilter>>,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>>>,

    adapter_state: Mutex<AdapterState>,
    adapter_tx: broadcast::Sender<AdapterState>,
    disconnect_tx: broadcast::Sender<DisconnectEvent>,

    writes: Mutex<Vec<WriteRecord>>,
    active_subscriptions: Arc<AtomicUsize>,

    connects: AtomicUsize,
    connection_cancels: AtomicUsize,
    scan_stops: AtomicUsize,
    signal_reads: AtomicUsize,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        let (adapter_tx, _) = broadcast::channel(16);
        let (disconnect_tx, _) = broadcast::channel(16);
        FakeTransport { inner:
                            Arc::new(FakeInner { devices: Mutex::new(HashMap::new()),
                                                 connect_failure: Mutex::new(None),
                                                 discovery_failure: Mutex::new(None),
                                                 subscribe_failure: Mutex::new(None),
                                                 write_failure: Mutex::new(None),
                                                 signal_result: Mutex::new(Ok(-60)),
                                                 transfer_unit_result: Mutex::new(None),
                                                 cancel_delay: Mutex::new(None),
                                                 scan_tx: Mutex::new(None),
                                                 scan_filter: Mutex::new(None),
                                                 notify_tx: Mutex::new(None),
                                                 adapter_state:
                                                     Mutex::new(AdapterState::PoweredOn),
                                                 adapter_tx,
                                                 disconnect_tx,
                                                 writes: Mutex::new(Vec::new()),
                                                 active_subscriptions:
                                                     Arc::new(AtomicUsize::new(0)),
                                                 connects: AtomicUsize::new(0),
                                                 connection_cancels: AtomicUsize::new(0),
                                                 scan_stops: AtomicUsize::new(0),
                                                 signal_reads: AtomicUsize::new(0) }) }
    }

    // Scripting

    /// Registers a connectable device exposing the standard UART graph.
    pub fn add_device(&self, id: DeviceId) {
        self.add_device_with_services(id, uart_services());
    }

    pub fn add_device_with_services(&self, id: DeviceId, services: Vec<ServiceInfo>) {
        self.inner.devices.lock().unwrap().insert(id, services);
    }

    pub fn set_connect_failure(&self, error: TransportError) {
        *self.inner.connect_failure.lock().unwrap() = Some(error);
    }

    pub fn set_discovery_failure(&self, error: TransportError) {
        *self.inner.discovery_failure.lock().unwrap() = Some(error);
    }

    pub fn set_subscribe_failure(&self, error: TransportError) {
        *self.inner.subscribe_failure.lock().unwrap() = Some(error);
    }

    pub fn set_write_failure(&self, error: TransportError) {
        *self.inner.write_failure.lock().unwrap() = Some(error);
    }

    pub fn set_signal(&self, signal: i16) {
        *self.inner.signal_result.lock().unwrap() = Ok(signal);
    }

    pub fn set_signal_failure(&self, error: TransportError) {
        *self.inner.signal_result.lock().unwrap() = Err(error);
    }

    pub fn set_transfer_unit(&self, unit: u16) {
        *self.inner.transfer_unit_result.lock().unwrap() = Some(Ok(unit));
    }

    pub fn set_transfer_unit_failure(&self, error: TransportError) {
        *self.inner.transfer_unit_result.lock().unwrap() = Some(Err(error));
    }

    /// Makes `cancel_connection` stall for `delay` before completing.
    pub fn set_cancel_delay(&self, delay: Duration) {
        *self.inner.cancel_delay.lock().unwrap() = Some(delay);
    }

    // Driving

    pub fn set_adapter_state(&self, state: AdapterState) {
        *self.inner.adapter_state.lock().unwrap() = state;
        let _ = self.inner.adapter_tx.send(state);
    }

    /// Delivers a sighting to the active scan, if one is running. Sightings
    /// the scan's filter rejects are silently dropped, as a radio would.
    pub fn emit_sighting(&self, sighting: DeviceSighting) {
        let passes = self.inner
                         .scan_filter
                         .lock()
                         .unwrap()
                         .as_ref()
                         .map_or(true, |filter| filter.matches(&sighting));
        if !passes {
            return;
        }
        if let Some(tx) = self.inner.scan_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(sighting));
        }
    }

    /// Fails the active scan; the sighting stream yields the error and ends.
    pub fn fail_scan(&self, error: TransportError) {
        if let Some(tx) = self.inner.scan_tx.lock().unwrap().take() {
            let _ = tx.send(Err(error));
        }
    }

    /// Delivers a notification payload on the subscribed characteristic.
    pub fn emit_notification(&self, data: Vec<u8>) {
        if let Some(tx) = self.inner.notify_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(data));
        }
    }

    /// Delivers an error on the notification stream without ending it.
    pub fn fail_notification(&self, error: TransportError) {
        if let Some(tx) = self.inner.notify_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Err(error));
        }
    }

    /// Announces that the link to `id` was severed on the peripheral's side.
    pub fn emit_disconnect(&self, id: DeviceId, error: Option<TransportError>) {
        let _ = self.inner.disconnect_tx.send(DisconnectEvent { id, error });
    }

    // Observations

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.inner.connection_cancels.load(Ordering::SeqCst)
    }

    pub fn stop_scan_count(&self) -> usize {
        self.inner.scan_stops.load(Ordering::SeqCst)
    }

    pub fn signal_read_count(&self) -> usize {
        self.inner.signal_reads.load(Ordering::SeqCst)
    }

    /// How many notification subscriptions are currently alive (streams
    /// handed out and not yet dropped).
    pub fn active_notification_subscriptions(&self) -> usize {
        self.inner.active_subscriptions.load(Ordering::SeqCst)
    }

    /// The service uuids the most recent scan was filtered to, sorted.
    pub fn last_scan_services(&self) -> Vec<Uuid> {
        let mut services: Vec<Uuid> = self.inner
                                          .scan_filter
                                          .lock()
                                          .unwrap()
                                          .as_ref()
                                          .map(|f| f.service_uuids.iter().copied().collect())
                                          .unwrap_or_default();
        services.sort();
        services
    }

    /// Every write accepted so far, in order.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.inner.writes.lock().unwrap().clone()
    }
}

/// Decrements the live-subscription count when the wrapped stream is
/// dropped, wherever that drop happens.
struct CountedStream<S> {
    inner: S,
    count: Arc<AtomicUsize>,
}

impl<S> Drop for CountedStream<S> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<S: Stream + Unpin> Stream for CountedStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn start_scan(&self, filter: &ScanFilter) -> Result<SightingStream, TransportError> {
        *self.inner.scan_filter.lock().unwrap() = Some(filter.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.scan_tx.lock().unwrap() = Some(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.inner.scan_stops.fetch_add(1, Ordering::SeqCst);
        self.inner.scan_tx.lock().unwrap().take();
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> Result<(), TransportError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.inner.connect_failure.lock().unwrap().clone() {
            return Err(error);
        }
        if !self.inner.devices.lock().unwrap().contains_key(id) {
            return Err(TransportError::Unknown(format!("no such device: {id}")));
        }
        Ok(())
    }

    async fn cancel_connection(&self, _id: &DeviceId) -> Result<(), TransportError> {
        self.inner.connection_cancels.fetch_add(1, Ordering::SeqCst);
        let delay = *self.inner.cancel_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn discover_services(&self, id: &DeviceId) -> Result<Vec<ServiceInfo>, TransportError> {
        if let Some(error) = self.inner.discovery_failure.lock().unwrap().clone() {
            return Err(error);
        }
        self.inner
            .devices
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::Unknown(format!("no such device: {id}")))
    }

    async fn request_transfer_unit(&self, _id: &DeviceId, unit: u16)
                                   -> Result<u16, TransportError> {
        match self.inner.transfer_unit_result.lock().unwrap().clone() {
            Some(result) => result,
            None => Ok(unit),
        }
    }

    async fn read_signal(&self, _id: &DeviceId) -> Result<i16, TransportError> {
        self.inner.signal_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.signal_result.lock().unwrap().clone()
    }

    async fn write_without_response(&self, id: &DeviceId, service: Uuid, characteristic: Uuid,
                                    data: &[u8])
                                    -> Result<(), TransportError> {
        if let Some(error) = self.inner.write_failure.lock().unwrap().clone() {
            return Err(error);
        }
        self.inner.writes.lock().unwrap().push(WriteRecord { id: id.clone(),
                                                             service,
                                                             characteristic,
                                                             data: data.to_vec() });
        Ok(())
    }

    async fn subscribe_notifications(&self, _id: &DeviceId, _service: Uuid,
                                     _characteristic: Uuid)
                                     -> Result<NotificationStream, TransportError> {
        if let Some(error) = self.inner.subscribe_failure.lock().unwrap().clone() {
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.notify_tx.lock().unwrap() = Some(tx);

        let count = Arc::clone(&self.inner.active_subscriptions);
        count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(CountedStream { inner: UnboundedReceiverStream::new(rx), count }))
    }

    fn adapter_events(&self) -> AdapterStream {
        // Subscribe before snapshotting so a concurrent change is never
        // missed; a duplicated state is harmless to consumers
        let rx = self.inner.adapter_tx.subscribe();
        let current = *self.inner.adapter_state.lock().unwrap();
        let changes = BroadcastStream::new(rx).filter_map(|x| async move { x.ok() });
        Box::pin(stream::once(async move { current }).chain(changes))
    }

    fn disconnect_events(&self, id: &DeviceId) -> DisconnectStream {
        let rx = self.inner.disconnect_tx.subscribe();
        let id = id.clone();
        Box::pin(BroadcastStream::new(rx).filter_map(move |x| {
                                             let id = id.clone();
                                             async move {
                                                 match x {
                                                     Ok(event) if event.id == id => Some(event),
                                                     _ => None,
                                                 }
                                             }
                                         }))
    }
}
