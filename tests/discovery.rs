mod common;

use std::time::Duration;

use common::{device, next_event, sighting, start_session, wait_until};
use tether::config::{DEFAULT_SCAN_TIMEOUT, UART_SERVICE_UUID};
use tether::fake::FakeTransport;
use tether::{AdapterState, Event, TransportError};

#[tokio::test]
async fn sightings_are_ranked_and_replaced() {
    let fake = FakeTransport::new();
    let session = start_session(&fake).await;

    session.start_scan(Duration::ZERO, false).await.unwrap();
    assert!(session.state().is_scanning());

    fake.emit_sighting(sighting("AA:00:00:00:00:01", Some("Nova"), Some(-50)));
    fake.emit_sighting(sighting("AA:00:00:00:00:02", None, Some(-30)));
    fake.emit_sighting(sighting("AA:00:00:00:00:03", Some("Edge"), None));
    wait_until("three sightings", || session.state().sightings().len() == 3).await;

    // Nameless devices don't rank; unknown signal ranks last
    let names: Vec<_> = session.state()
                               .ranked_sightings()
                               .iter()
                               .map(|s| s.display_name().unwrap().to_string())
                               .collect();
    assert_eq!(names, vec!["Nova", "Edge"]);

    // A re-sighting replaces the record outright, weaker signal included
    fake.emit_sighting(sighting("AA:00:00:00:00:01", Some("Nova"), Some(-80)));
    wait_until("replaced sighting", || {
        session.state()
               .sightings()
               .get(&device("AA:00:00:00:00:01"))
               .and_then(|s| s.signal)
            == Some(-80)
    }).await;
    assert_eq!(session.state().sightings().len(), 3);
}

#[tokio::test]
async fn stopping_twice_stops_the_transport_once() {
    let fake = FakeTransport::new();
    let session = start_session(&fake).await;

    session.start_scan(Duration::ZERO, false).await.unwrap();
    session.stop_scan().await;

    assert!(!session.state().is_scanning());
    assert_eq!(fake.stop_scan_count(), 1);

    session.stop_scan().await;
    assert_eq!(fake.stop_scan_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn scan_times_out_exactly_once() {
    let fake = FakeTransport::new();
    let session = start_session(&fake).await;
    let mut events = Box::pin(session.events());

    session.start_scan(DEFAULT_SCAN_TIMEOUT, false).await.unwrap();
    fake.emit_sighting(sighting("AA:00:00:00:00:01", Some("Nova"), Some(-50)));
    wait_until("sighting recorded", || session.state().sightings().len() == 1).await;

    tokio::time::sleep(DEFAULT_SCAN_TIMEOUT + Duration::from_secs(1)).await;
    wait_until("scan flag cleared", || !session.state().is_scanning()).await;
    let event = next_event(&mut events, "scan stop",
                           |e| matches!(e, Event::ScanStopped { .. })).await;
    assert!(matches!(event, Event::ScanStopped { error: None, .. }));
    assert_eq!(fake.stop_scan_count(), 1);

    // Results persist, read-only, after the scan ends
    assert_eq!(session.state().ranked_sightings().len(), 1);

    session.stop_scan().await;
    assert_eq!(fake.stop_scan_count(), 1);
}

#[tokio::test]
async fn scan_errors_surface_and_end_the_scan() {
    let fake = FakeTransport::new();
    let session = start_session(&fake).await;
    let mut events = Box::pin(session.events());

    session.start_scan(Duration::ZERO, false).await.unwrap();
    fake.fail_scan(TransportError::Unknown("scan registration failed".to_string()));

    let event = next_event(&mut events, "scan failure",
                           |e| matches!(e, Event::ScanStopped { .. })).await;
    assert!(matches!(event,
                     Event::ScanStopped { error: Some(TransportError::Unknown(_)), .. }));
    assert!(!session.state().is_scanning());
}

#[tokio::test]
async fn restarting_clears_previous_results() {
    let fake = FakeTransport::new();
    let session = start_session(&fake).await;

    session.start_scan(Duration::ZERO, false).await.unwrap();
    fake.emit_sighting(sighting("AA:00:00:00:00:01", Some("Nova"), Some(-50)));
    wait_until("first scan's sighting", || session.state().sightings().len() == 1).await;

    // The restart stops the previous scan and starts from an empty set
    session.start_scan(Duration::ZERO, false).await.unwrap();
    assert_eq!(fake.stop_scan_count(), 1);
    assert_eq!(session.state().sightings().len(), 0);
    assert!(session.state().is_scanning());

    fake.emit_sighting(sighting("AA:00:00:00:00:02", Some("Edge"), Some(-60)));
    wait_until("second scan's sighting", || session.state().sightings().len() == 1).await;
    assert!(session.state()
                   .sightings()
                   .contains_key(&device("AA:00:00:00:00:02")));
}

#[tokio::test]
async fn filtered_scans_pass_the_primary_service() {
    let fake = FakeTransport::new();
    let session = start_session(&fake).await;

    session.start_scan(Duration::ZERO, true).await.unwrap();
    assert_eq!(fake.last_scan_services(), vec![UART_SERVICE_UUID]);

    session.stop_scan().await;
    session.start_scan(Duration::ZERO, false).await.unwrap();
    assert!(fake.last_scan_services().is_empty());
}

#[tokio::test]
async fn filtered_scans_drop_unmatched_sightings() {
    let fake = FakeTransport::new();
    let session = start_session(&fake).await;

    session.start_scan(Duration::ZERO, true).await.unwrap();

    // Advertises the primary service (the helper fills it in)
    fake.emit_sighting(sighting("AA:00:00:00:00:01", Some("Nova"), Some(-50)));
    // Advertises something else entirely
    let mut stranger = sighting("AA:00:00:00:00:02", Some("Other"), Some(-40));
    stranger.service_ids = vec![];
    fake.emit_sighting(stranger);

    wait_until("matching sighting", || session.state().sightings().len() == 1).await;
    assert!(session.state()
                   .sightings()
                   .contains_key(&device("AA:00:00:00:00:01")));
}

#[tokio::test]
async fn scanning_needs_a_powered_adapter() {
    let fake = FakeTransport::new();
    fake.set_adapter_state(AdapterState::PoweredOff);
    let session = start_session(&fake).await;

    assert!(session.start_scan(Duration::ZERO, false).await.is_err());
    assert!(!session.state().is_scanning());
}
