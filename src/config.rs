//! Well-known identifiers and tuning constants for the UART-style link.

use std::time::Duration;

use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expands a 16-bit assigned number onto the Bluetooth base uuid. Const so
/// well-known ids can be declared as constants.
pub const fn short_uuid(v: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}

/// The vendor UART service the session looks for on a peripheral.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// Writes from us to the peripheral land on this characteristic.
pub const UART_RX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// The peripheral pushes notifications to us over this characteristic.
pub const UART_TX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// The transfer unit we ask the transport to negotiate after connecting.
/// Negotiation failure is non-fatal; the link keeps [`DEFAULT_TRANSFER_UNIT`].
pub const PREFERRED_TRANSFER_UNIT: u16 = 517;

/// The protocol-default transfer unit before any negotiation.
pub const DEFAULT_TRANSFER_UNIT: u16 = 23;

pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(30);

pub const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Bounded inbound-notification history; oldest entries past this are dropped.
pub const NOTIFICATION_HISTORY_CAPACITY: usize = 100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_uuids_expand_onto_the_bluetooth_base() {
        assert_eq!(short_uuid(0x180F).to_string(),
                   "0000180f-0000-1000-8000-00805f9b34fb");
        assert_ne!(short_uuid(0x180F), short_uuid(0x2A19));
    }
}
