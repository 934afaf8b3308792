//! Inbound/outbound payload records and the bounded notification history.
//!
//! Payloads are opaque byte strings; no framing is applied above them. Each
//! inbound payload is wrapped once, immutably, with a generated id and a
//! monotonic receive timestamp, then kept newest-first in a history capped
//! at [`NOTIFICATION_HISTORY_CAPACITY`] entries.

use std::collections::VecDeque;
use std::time::Instant;

use uuid::Uuid;

use crate::config::NOTIFICATION_HISTORY_CAPACITY;
use crate::DeviceId;

/// An asynchronous payload pushed by the peripheral over a subscribed
/// characteristic. Immutable once created.
#[derive(Clone, Debug)]
pub struct InboundNotification {
    pub id: Uuid,
    pub raw: Vec<u8>,
    /// Lossy UTF-8 view of `raw`, for consumers that treat the link as a
    /// text channel.
    pub decoded: String,
    pub received_at: Instant,
    pub source: DeviceId,
}

impl InboundNotification {
    pub fn new(raw: Vec<u8>, source: DeviceId) -> Self {
        let decoded = String::from_utf8_lossy(&raw).into_owned();
        InboundNotification { id: Uuid::new_v4(),
                              raw,
                              decoded,
                              received_at: Instant::now(),
                              source }
    }
}

/// A message accepted for transmission by `Session::write_text`.
/// Never mutated after creation.
#[derive(Clone, Debug)]
pub struct OutgoingMessage {
    pub id: Uuid,
    pub text: String,
    pub sent_at: Instant,
}

impl OutgoingMessage {
    pub fn new(text: impl Into<String>) -> Self {
        OutgoingMessage { id: Uuid::new_v4(),
                          text: text.into(),
                          sent_at: Instant::now() }
    }
}

/// Inserts at the head and evicts the oldest entries past capacity.
pub(crate) fn push_bounded(history: &mut VecDeque<InboundNotification>,
                           notification: InboundNotification) {
    history.push_front(notification);
    history.truncate(NOTIFICATION_HISTORY_CAPACITY);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceId {
        "AA:BB:CC:DD:EE:FF".parse().unwrap()
    }

    #[test]
    fn history_is_bounded_newest_first() {
        let mut history = VecDeque::new();
        for i in 0..=NOTIFICATION_HISTORY_CAPACITY {
            push_bounded(&mut history,
                         InboundNotification::new(format!("msg {i}").into_bytes(), device()));
        }

        assert_eq!(history.len(), NOTIFICATION_HISTORY_CAPACITY);
        // Entry 0 was evicted; the newest entry sits at the head.
        assert_eq!(history.front().unwrap().decoded, "msg 100");
        assert_eq!(history.back().unwrap().decoded, "msg 1");
        assert!(!history.iter().any(|n| n.decoded == "msg 0"));
    }

    #[test]
    fn non_utf8_payloads_decode_lossily() {
        let n = InboundNotification::new(vec![0x68, 0x69, 0xFF], device());
        assert_eq!(n.raw, vec![0x68, 0x69, 0xFF]);
        assert_eq!(n.decoded, "hi\u{FFFD}");
    }
}
