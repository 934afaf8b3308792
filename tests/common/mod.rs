#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tether::fake::FakeTransport;
use tether::{AdapterState, DeviceId, DeviceSighting, Event, Session, SessionConfig};

pub fn device(s: &str) -> DeviceId {
    s.parse().unwrap()
}

pub fn sighting(id: &str, name: Option<&str>, signal: Option<i16>) -> DeviceSighting {
    DeviceSighting { id: device(id),
                     advertised_name: name.map(str::to_string),
                     local_name: None,
                     signal,
                     connectable: Some(true),
                     service_ids: vec![tether::config::UART_SERVICE_UUID] }
}

/// Starts a session over the fake and waits until the adapter-state seed
/// has propagated, so tests begin from a known adapter state.
pub async fn start_session(fake: &FakeTransport) -> Session {
    let _ = pretty_env_logger::try_init();
    let session = SessionConfig::new(Arc::new(fake.clone())).start()
                                                            .await
                                                            .unwrap();
    session.state()
           .watch_adapter()
           .wait_for(|s| *s != AdapterState::Unknown)
           .await
           .unwrap();
    session
}

/// Polls a condition until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), deadline).await
                                                          .unwrap_or_else(|_| {
                                                              panic!("timed out waiting for {what}")
                                                          });
}

/// Reads events until one matches, failing the test after five seconds.
pub async fn next_event(events: &mut (impl Stream<Item = Event> + Unpin),
                        what: &str, mut pred: impl FnMut(&Event) -> bool)
                        -> Event {
    let matching = async {
        loop {
            match events.next().await {
                Some(event) if pred(&event) => break event,
                Some(_) => continue,
                None => panic!("event stream ended while waiting for {what}"),
            }
        }
    };
    match tokio::time::timeout(Duration::from_secs(5), matching).await {
        Ok(event) => event,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}
