//! The session manager: the single owner of connection state.
//!
//! A [`Session`] arbitrates the `Disconnected → Connecting → Connected →
//! Disconnecting` state machine, multiplexes one-shot requests (connect,
//! write, signal reads) against long-lived subscriptions (adapter events,
//! notification streams, disconnect events), and guarantees that every
//! subscription opened while a connection exists is closed exactly once, no
//! matter which path triggered the disconnection: an explicit
//! [`Session::disconnect`], a peripheral-initiated drop, the adapter
//! powering off, or a failure partway through [`Session::connect`].
//!
//! All phase transitions happen under one internal mutex together with
//! their side effects, so two concurrent callers can never interleave a
//! guard check with a transition. Idempotence does the rest: connect on a
//! connected link and disconnect on a disconnected one are trivial no-ops.

use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::anyhow;
use futures::{Stream, StreamExt};
use log::{debug, error, trace, warn};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;

use crate::config;
use crate::discovery::Scanner;
use crate::notifications::{InboundNotification, OutgoingMessage};
use crate::permission::{self, Authorizer};
use crate::poller::SignalPoller;
use crate::service::find_characteristic;
use crate::state::{ConnectionInfo, StateStore};
use crate::transport::{NotificationStream, Transport};
use crate::{AdapterState, ConnectionPhase, DeviceId, Error, Event, Result, TransportError};

/// A typed handle to a background task that owns one logical event stream
/// or timer.
///
/// Exactly one live subscription exists per channel: replacing a
/// subscription drops (and thereby aborts) the previous one before the new
/// handle is stored, so two can never run in parallel for the same channel.
/// Cancellation is synchronous-before-next-action: an aborted task cannot
/// reach its next tick.
#[derive(Debug)]
pub(crate) struct Subscription {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn spawn<F>(future: F) -> Self
        where F: Future<Output = ()> + Send + 'static
    {
        Subscription { task: Some(tokio::spawn(future)) }
    }

    pub(crate) fn cancel(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Releases ownership without aborting, for the case where the owning
    /// task is tearing itself down and must finish its current step.
    pub(crate) fn detach(mut self) {
        self.task.take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

pub struct SessionConfig {
    transport: Arc<dyn Transport>,
    authorizer: Arc<dyn Authorizer>,
}

impl SessionConfig {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        SessionConfig { transport,
                        authorizer: Arc::new(permission::AlwaysGranted) }
    }

    /// Installs a platform permission flow; without one, radio access is
    /// assumed to be granted.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub async fn start(self) -> Result<Session> {
        Session::start(self).await
    }
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Deref for Session {
    type Target = SessionInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

// Public for the sake of implementing Deref for ergonomics; no members are
// public so nothing leaks.
pub struct SessionInner {
    transport: Arc<dyn Transport>,
    authorizer: Arc<dyn Authorizer>,
    state: StateStore,
    scanner: Scanner,

    // The public-facing event stream
    event_bus: broadcast::Sender<Event>,

    // Every phase transition and its side effects happen while holding this
    // lock; the guard-check and the transition can't be interleaved by two
    // concurrent callers.
    link: Mutex<LinkGuard>,

    adapter_watch: StdMutex<Option<Subscription>>,
}

/// Everything owned on behalf of the current (or in-progress) link.
#[derive(Default)]
struct LinkGuard {
    /// The device we are connecting/connected to. Cleared on teardown.
    target: Option<DeviceId>,
    notifications: Option<Subscription>,
    disconnect_listener: Option<Subscription>,
    poller: Option<SignalPoller>,
}

impl Session {
    // Tasks spawned by the session hold a Weak reference to the inner state
    // and re`wrap()` it while handling an event, so they never keep the
    // session alive on their own (and exit when it's dropped).
    fn wrap(inner: Arc<SessionInner>) -> Self {
        Session { inner }
    }

    async fn start(config: SessionConfig) -> Result<Session> {
        let (event_bus, _) = broadcast::channel(16);
        let state = StateStore::new();
        let scanner = Scanner::new(Arc::clone(&config.transport), state.clone(),
                                   event_bus.clone());

        let session = Session { inner: Arc::new(SessionInner { transport: config.transport,
                                                               authorizer: config.authorizer,
                                                               state,
                                                               scanner,
                                                               event_bus,
                                                               link: Mutex::new(
                                                                   LinkGuard::default()),
                                                               adapter_watch: StdMutex::new(
                                                                   None) }) };

        // The adapter-state stream yields the current state immediately, so
        // the store is seeded as soon as this task first polls it.
        let weak = Arc::downgrade(&session.inner);
        let mut adapter_events = session.transport.adapter_events();
        let watch = Subscription::spawn(async move {
            while let Some(adapter_state) = adapter_events.next().await {
                let session = match weak.upgrade() {
                    Some(inner) => Session::wrap(inner),
                    None => break,
                };
                session.on_adapter_state(adapter_state).await;
            }
        });
        *session.adapter_watch.lock().unwrap() = Some(watch);

        Ok(session)
    }

    /// Read-only access to all observable state (phase, discovered set,
    /// signal strength, notification history, message log).
    pub fn state(&self) -> &StateStore {
        &self.inner.state
    }

    /// A stream of session events. Every subscriber sees every event.
    pub fn events(&self) -> impl Stream<Item = Event> {
        let receiver = self.event_bus.subscribe();
        BroadcastStream::new(receiver).filter_map(|x| async move { x.ok() })
    }

    /// Runs the platform permission flow and maps the outcome onto the
    /// error taxonomy.
    pub async fn request_access(&self) -> Result<()> {
        permission::ensure_granted(self.authorizer.request_permission().await)
    }

    pub fn open_system_settings(&self) {
        self.authorizer.open_system_settings();
    }

    /// Starts a time-bounded scan. A zero timeout scans until stopped.
    ///
    /// Starting while a scan is active stops the previous scan first; the
    /// discovered set is cleared on every start.
    pub async fn start_scan(&self, timeout: std::time::Duration, filter_known: bool)
                            -> Result<()> {
        self.scanner.start_scan(timeout, filter_known).await
    }

    /// Stops any active scan. Stopping twice is a no-op.
    pub async fn stop_scan(&self) {
        self.scanner.stop_scan().await;
    }

    /// Connects to a device and captures its service graph.
    ///
    /// Scanning is stopped first (connecting and scanning are mutually
    /// exclusive on most radios). On success the connection and service
    /// graph are published atomically, the disconnect listener and the
    /// notification subscription on the well-known inbound characteristic
    /// are installed, and the signal poller starts. On failure at any step
    /// the phase returns to `Disconnected` with every partially-acquired
    /// subscription released; no partial state is retained.
    ///
    /// Calling while already connecting/connected to the same device
    /// trivially succeeds; to a *different* device it fails with
    /// [`Error::AlreadyConnected`] — the session never drops an existing
    /// link implicitly.
    pub async fn connect(&self, id: DeviceId) -> Result<()> {
        let mut guard = self.link.lock().await;

        if self.state.phase() != ConnectionPhase::Disconnected {
            return if guard.target.as_ref() == Some(&id) {
                       Ok(())
                   } else {
                       Err(Error::AlreadyConnected)
                   };
        }

        trace!("Connecting to {id}...");
        guard.target = Some(id.clone());
        self.state.set_connecting();
        self.emit_phase();

        self.scanner.stop_scan().await;

        if let Err(err) = self.transport.connect(&id).await {
            warn!("Failed to connect to {id}: {err}");
            self.abandon_connect(&mut guard);
            return Err(err.into());
        }

        let services = match self.transport.discover_services(&id).await {
            Ok(services) => services,
            Err(err) => {
                warn!("Service discovery failed for {id}: {err}");
                // Don't leave a half-open transport connection behind
                if let Err(cancel_err) = self.transport.cancel_connection(&id).await {
                    debug!("Cancel after failed discovery also failed: {cancel_err}");
                }
                self.abandon_connect(&mut guard);
                return Err(err.into());
            }
        };

        // Negotiation failure is non-fatal; keep the protocol default
        let transfer_unit = match self.transport
                                      .request_transfer_unit(&id,
                                                             config::PREFERRED_TRANSFER_UNIT)
                                      .await
        {
            Ok(unit) => unit,
            Err(err) => {
                warn!("Transfer unit negotiation failed, keeping default: {err}");
                config::DEFAULT_TRANSFER_UNIT
            }
        };

        self.install_disconnect_listener(&mut guard, &id);

        // A missing or non-notifiable inbound characteristic, like a
        // subscription failure, is logged but not fatal to the connection
        match find_characteristic(&services, config::UART_SERVICE_UUID,
                                  config::UART_TX_CHARACTERISTIC_UUID)
        {
            Some(inbound) if inbound.is_notifiable() => {
                match self.transport
                          .subscribe_notifications(&id, config::UART_SERVICE_UUID,
                                                   config::UART_TX_CHARACTERISTIC_UUID)
                          .await
                {
                    Ok(stream) => self.install_notification_pump(&mut guard, &id, stream),
                    Err(err) => warn!("Couldn't subscribe to inbound notifications: {err}"),
                }
            }
            Some(_) => warn!("Inbound characteristic on {id} is not notifiable; skipping \
                              subscription"),
            None => warn!("{id} exposes no inbound characteristic; skipping subscription"),
        }

        // Seed the connected signal strength from the last sighting, if any
        if let Some(signal) = self.state.sightings().get(&id).and_then(|s| s.signal) {
            self.state.set_signal(signal);
        }

        self.state.set_connected(ConnectionInfo { id: id.clone(),
                                                  services: services.clone(),
                                                  transfer_unit });
        self.emit_phase();
        let _ = self.event_bus.send(Event::ServicesDiscovered { services });

        guard.poller = Some(SignalPoller::start(Arc::clone(&self.transport),
                                                self.state.clone(), id.clone()));

        trace!("Connected to {id}");
        Ok(())
    }

    /// Tears down the current link. A no-op when already disconnected.
    ///
    /// The notification subscription and the disconnect listener are closed
    /// *before* the transport is asked to cancel the connection, so we
    /// never process a disconnect event for a link we are tearing down
    /// ourselves. The transport call's outcome is logged either way and
    /// never blocks the teardown.
    pub async fn disconnect(&self) -> Result<()> {
        let mut guard = self.link.lock().await;

        if self.state.phase() == ConnectionPhase::Disconnected {
            return Ok(());
        }

        let id = match guard.target.clone() {
            Some(id) => id,
            None => {
                // Shouldn't happen: a non-Disconnected phase always has a
                // target. Normalize anyway.
                self.state.set_disconnected();
                self.emit_phase();
                return Ok(());
            }
        };

        trace!("Disconnecting from {id}...");
        self.state.set_disconnecting();
        self.emit_phase();

        guard.notifications.take();
        guard.disconnect_listener.take();
        guard.poller.take();

        match self.transport.cancel_connection(&id).await {
            Ok(()) => trace!("Transport cancelled connection to {id}"),
            Err(err) => warn!("Transport cancel failed (continuing teardown): {err}"),
        }

        guard.target = None;
        self.state.set_disconnected();
        self.emit_phase();
        let _ = self.event_bus.send(Event::Disconnected { id, error: None });

        Ok(())
    }

    /// Writes an opaque payload to the well-known outbound characteristic.
    ///
    /// Always issued without response, for latency: success means the
    /// transport accepted the write request. Fails with
    /// [`Error::NotConnected`] unless the phase is `Connected`, and fails
    /// when the captured service graph doesn't expose the outbound
    /// characteristic as writable-without-response; a failed write never
    /// changes the phase. Concurrent writes are independent —
    /// delivery ordering is the transport's responsibility.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        // Snapshot rather than lock: an unbounded transport write must not
        // block connect/disconnect. A phase change mid-write surfaces as
        // the transport's error.
        let link = self.state.link();
        let connection = match link.connection {
            Some(ref connection) if link.is_connected() => connection,
            _ => return Err(Error::NotConnected),
        };

        match find_characteristic(&connection.services, config::UART_SERVICE_UUID,
                                  config::UART_RX_CHARACTERISTIC_UUID)
        {
            Some(outbound) if outbound.is_writable_without_response() => {}
            _ => {
                return Err(Error::Other(anyhow!("peripheral exposes no writable outbound \
                                                 characteristic")))
            }
        }

        self.transport
            .write_without_response(&connection.id, config::UART_SERVICE_UUID,
                                    config::UART_RX_CHARACTERISTIC_UUID, data)
            .await?;
        Ok(())
    }

    /// Writes a text payload and records it in the outgoing message log
    /// once the transport accepts it.
    pub async fn write_text(&self, text: &str) -> Result<OutgoingMessage> {
        self.write(text.as_bytes()).await?;
        let message = OutgoingMessage::new(text);
        self.state.push_outgoing(message.clone());
        Ok(message)
    }

    fn emit_phase(&self) {
        let _ = self.event_bus.send(Event::PhaseChanged { phase: self.state.phase() });
    }

    /// Unwinds a partially-built connection: everything acquired so far is
    /// released and the phase returns to `Disconnected`.
    fn abandon_connect(&self, guard: &mut LinkGuard) {
        guard.notifications.take();
        guard.disconnect_listener.take();
        guard.poller.take();
        guard.target = None;
        self.state.set_disconnected();
        self.emit_phase();
    }

    fn install_disconnect_listener(&self, guard: &mut LinkGuard, id: &DeviceId) {
        let weak = Arc::downgrade(&self.inner);
        let mut events = self.transport.disconnect_events(id);
        let listener = Subscription::spawn(async move {
            // One shot: a link dies at most once
            if let Some(event) = events.next().await {
                if let Some(inner) = weak.upgrade() {
                    Session::wrap(inner).on_remote_disconnect(event.id, event.error)
                                        .await;
                }
            }
        });
        // Replacing drops (aborts) any listener left over from a prior link
        guard.disconnect_listener = Some(listener);
    }

    fn install_notification_pump(&self, guard: &mut LinkGuard, id: &DeviceId,
                                 mut stream: NotificationStream) {
        let weak = Arc::downgrade(&self.inner);
        let id = id.clone();
        let pump = Subscription::spawn(async move {
            while let Some(item) = stream.next().await {
                let session = match weak.upgrade() {
                    Some(inner) => Session::wrap(inner),
                    None => break,
                };
                match item {
                    Ok(bytes) => {
                        let notification = InboundNotification::new(bytes, id.clone());
                        session.state.push_inbound(notification.clone());
                        let _ = session.event_bus
                                       .send(Event::NotificationReceived { notification });
                    }
                    Err(err) => {
                        // Cancellation churn is expected during teardown;
                        // an unknown error on a dead link is the same race
                        // arriving late
                        if err.is_teardown_churn() || !session.state.is_connected() {
                            trace!("Ignoring notification churn during teardown: {err}");
                        } else {
                            error!("Notification stream error: {err}");
                        }
                    }
                }
            }
        });
        guard.notifications = Some(pump);
    }

    /// The peripheral (or the transport on its behalf) severed the link.
    ///
    /// Mutually exclusive in effect with an explicit [`Session::disconnect`]:
    /// both take the link lock, and whichever finds the phase still live
    /// performs the teardown — the other becomes a no-op. The
    /// `Disconnecting` phase is skipped since the link is already gone.
    async fn on_remote_disconnect(&self, id: DeviceId, error: Option<TransportError>) {
        let mut guard = self.link.lock().await;

        if self.state.phase() == ConnectionPhase::Disconnected {
            trace!("Ignoring disconnect event for already-torn-down link");
            return;
        }
        if guard.target.as_ref() != Some(&id) {
            trace!("Ignoring disconnect event for stale link {id}");
            return;
        }

        debug!("Peripheral {id} disconnected (error: {error:?})");

        guard.notifications.take();
        guard.poller.take();
        // The listener task is the one delivering this event and ends right
        // after; detach so we don't abort it mid-teardown
        if let Some(listener) = guard.disconnect_listener.take() {
            listener.detach();
        }
        guard.target = None;

        self.state.set_disconnected();
        self.emit_phase();
        let _ = self.event_bus.send(Event::Disconnected { id, error });
    }

    async fn on_adapter_state(&self, adapter_state: AdapterState) {
        trace!("Adapter state changed: {adapter_state:?}");
        self.state.set_adapter_state(adapter_state);
        let _ = self.event_bus.send(Event::AdapterStateChanged { state: adapter_state });

        // Neither a scan nor a link survives the radio going away
        if adapter_state != AdapterState::PoweredOn {
            self.scanner.stop_scan().await;
            self.on_link_lost().await;
        }
    }

    async fn on_link_lost(&self) {
        let mut guard = self.link.lock().await;

        if self.state.phase() == ConnectionPhase::Disconnected {
            return;
        }
        let id = match guard.target.take() {
            Some(id) => id,
            None => {
                self.state.set_disconnected();
                self.emit_phase();
                return;
            }
        };

        debug!("Link to {id} lost (adapter no longer powered on)");

        guard.notifications.take();
        guard.disconnect_listener.take();
        guard.poller.take();

        self.state.set_disconnected();
        self.emit_phase();
        let _ = self.event_bus.send(Event::Disconnected { id, error: None });
    }
}
