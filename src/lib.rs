//! Single-link GATT session management.
//!
//! `tether` owns the lifecycle of one wireless link to a peripheral over a
//! connection-oriented, service/characteristic-addressed protocol: scanning
//! for nearby peripherals, connecting and tearing down, enumerating the
//! service graph, exchanging opaque byte payloads through writes and
//! notification streams, and exposing derived state (phase, signal strength,
//! notification history) to observers.
//!
//! The radio itself is an injected [`transport::Transport`] capability; the
//! crate ships a scriptable [`fake::FakeTransport`] for testing without
//! hardware.

use std::fmt;
use std::str::FromStr;

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

pub mod config;

pub mod service;
use service::ServiceInfo;

pub mod characteristic;

pub mod transport;

pub mod permission;

pub mod state;

pub mod discovery;

pub mod session;
pub use session::{Session, SessionConfig};

pub mod poller;

pub mod notifications;
use notifications::InboundNotification;

pub mod fake;

/// The local radio adapter's availability state.
///
/// Process-wide; only the transport's adapter-state stream mutates it.
/// Scanning and connecting require `PoweredOn`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

/// The authoritative connection state-machine variable.
///
/// Legal transitions are `Disconnected → Connecting → Connected →
/// Disconnecting → Disconnected`, plus the direct `Connected/Connecting →
/// Disconnected` edge taken when the peripheral (or the adapter powering
/// off) severs the link before we ask for a disconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Mac(u64);
impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = u64::to_le_bytes(self.0);
        write!(f,
               "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
               bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5])
    }
}

/// A unique identifier for a peripheral device.
///
/// The underlying hardware MAC address is exposed directly on transports
/// where that's supported; other transports hand out opaque string ids.
///
/// A `DeviceId` can be serialized/deserialized so applications can save the
/// id of a known device and later reconnect without re-scanning.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeviceId {
    Mac(Mac),
    String(String),
}
impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceId::Mac(mac) => write!(f, "{}", mac),
            DeviceId::String(s) => write!(f, "{}", s),
        }
    }
}
impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceId::Mac(mac) => write!(f, "MAC:{}", mac),
            DeviceId::String(s) => write!(f, "String:{}", s),
        }
    }
}

// Note: no Result return since a valid id that isn't a MAC address is not an
// error, and we don't want allocations on that path.
fn try_u64_from_mac48_str(s: &str) -> Option<u64> {
    if s.contains(':') {
        let mut parts = ArrayVec::<_, 6>::new();
        for part in s.split(':') {
            if parts.try_push(part).is_err() {
                return None;
            }
        }
        if parts.len() != 6 {
            return None;
        }
        let mut bytes = [0u8; 8];
        for i in 0..6 {
            bytes[i] = match u8::from_str_radix(parts[i], 16) {
                Ok(v) => v,
                Err(_e) => {
                    return None;
                }
            };
        }
        Some(u64::from_le_bytes(bytes))
    } else {
        None
    }
}

impl FromStr for DeviceId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, std::convert::Infallible> {
        match try_u64_from_mac48_str(s) {
            Some(val) => Ok(DeviceId::Mac(Mac(val))),
            None => Ok(DeviceId::String(s.to_string())),
        }
    }
}

#[test]
fn device_id_two_way() {
    let id = DeviceId::from_str("F1:E2:D3:C4:B5:A6").unwrap();
    assert!(matches!(id, DeviceId::Mac(_)));
    // Octets must format as uppercase: some platforms are particular about
    // this and we rely on it when handing ids back to the transport.
    assert_eq!(id.to_string(), "F1:E2:D3:C4:B5:A6");

    let id = DeviceId::from_str("18c2a267-a539-4423-aecc-edeeb2784bcc").unwrap();
    assert!(matches!(id, DeviceId::String(_)));
    assert_eq!(id.to_string(), "18c2a267-a539-4423-aecc-edeeb2784bcc");
}

/// A single advertisement observation during a scan.
///
/// Ephemeral: re-sighting the same device replaces the whole record rather
/// than merging fields, since only the latest reading is meaningful.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceSighting {
    pub id: DeviceId,
    pub advertised_name: Option<String>,
    pub local_name: Option<String>,
    pub signal: Option<i16>,
    pub connectable: Option<bool>,
    pub service_ids: Vec<::uuid::Uuid>,
}

impl DeviceSighting {
    /// The name to show for this device, preferring the advertised name.
    pub fn display_name(&self) -> Option<&str> {
        self.advertised_name
            .as_deref()
            .or(self.local_name.as_deref())
    }
}

/// Transient transport/radio failures, as reported by the underlying driver.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Operation Cancelled")]
    OperationCancelled,

    #[error("Device Disconnected")]
    DeviceDisconnected,

    #[error("Transport Failure: {0}")]
    Unknown(String),
}

impl TransportError {
    /// Whether this error is expected churn from racing a subscription
    /// cancellation against in-flight notification delivery. Anything else
    /// arriving on a live link is a real stream error.
    pub fn is_teardown_churn(&self) -> bool {
        matches!(self,
                 TransportError::OperationCancelled
                 | TransportError::DeviceDisconnected)
    }
}

#[test]
fn churn_is_limited_to_cancellation_codes() {
    assert!(TransportError::OperationCancelled.is_teardown_churn());
    assert!(TransportError::DeviceDisconnected.is_teardown_churn());
    assert!(!TransportError::Unknown("gatt error 133".to_string()).is_teardown_churn());
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("There was a transport-level communication error")]
    Transport(#[from] TransportError),

    #[error("No active connection")]
    NotConnected,

    #[error("Another peripheral is already connected")]
    AlreadyConnected,

    #[error("Radio access not granted")]
    PermissionDenied,

    #[error("Radio access permanently denied; user must grant it from system settings")]
    PermissionPermanentlyDenied,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Session-level happenings, broadcast to any number of observers.
///
/// State snapshots (phase, discovered set, signal, history) are available
/// through [`state::StateStore`] watch channels; events carry the
/// edge-triggered information that snapshots can't, such as the error a
/// peripheral-initiated disconnect arrived with.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum Event {
    #[non_exhaustive]
    AdapterStateChanged { state: AdapterState },

    /// Scanning stopped, either by request, by timeout, or because the
    /// transport raised a scan error (carried here; never retried).
    #[non_exhaustive]
    ScanStopped { error: Option<TransportError> },

    #[non_exhaustive]
    PhaseChanged { phase: ConnectionPhase },

    /// The link was severed by the peripheral, the adapter powering off, or
    /// an explicit `disconnect()`. Once this fires all subscriptions for
    /// the connection have been torn down.
    #[non_exhaustive]
    Disconnected {
        id: DeviceId,
        error: Option<TransportError>,
    },

    /// The service graph captured for the active connection.
    #[non_exhaustive]
    ServicesDiscovered { services: Vec<ServiceInfo> },

    #[non_exhaustive]
    NotificationReceived { notification: InboundNotification },
}
