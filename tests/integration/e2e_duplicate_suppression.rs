//! Inbound duplicate suppression.
//!
//! # Scenarios
//! 1. The same `button_press` (mId 777) twice within the window → two ACKs
//!    on the wire, exactly one `ButtonPress` on the bus.
//! 2. Distinct mIds → two events, two ACKs.
//! 3. A message without an mId is dispatched but never acked (legacy
//!    firmware interop).

use std::sync::Arc;
use std::time::Duration;

use gl_test_utils::{MockPoster, MockTransport};
use link_core::storage::MemoryStore;
use link_core::{LinkConfig, LinkEvent, LinkHandle, LinkManager, PeerKind, PublicState};

fn spawn_link(
    transport: Arc<MockTransport>,
    events: tokio::sync::mpsc::Receiver<link_core::TransportEvent>,
) -> LinkHandle {
    LinkManager {
        transport,
        transport_events: events,
        http: MockPoster::ok(),
        store: Arc::new(MemoryStore::new()),
        config: LinkConfig::default(),
    }
    .spawn()
}

async fn connect(handle: &LinkHandle) {
    handle
        .connect(PeerKind::K900, Some("AA:BB:CC:DD:EE:FF".into()))
        .unwrap();
    let mut watch = handle.state_watch();
    tokio::time::timeout(Duration::from_secs(60), async {
        while *watch.borrow_and_update() != PublicState::Connected {
            watch.changed().await.expect("link task alive");
        }
    })
    .await
    .expect("connected within the window");
}

fn button_press(m_id: u64) -> serde_json::Value {
    serde_json::json!({
        "type": "button_press",
        "buttonId": "main",
        "pressType": "short",
        "mId": m_id,
    })
}

fn count_button_events(events: &mut tokio::sync::broadcast::Receiver<LinkEvent>) -> usize {
    let mut presses = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, LinkEvent::ButtonPress { .. }) {
            presses += 1;
        }
    }
    presses
}

#[tokio::test(start_paused = true)]
async fn duplicate_yields_two_acks_one_dispatch() {
    let (transport, events_rx) = MockTransport::with_defaults();
    let handle = spawn_link(transport.clone(), events_rx);
    let mut events = handle.events();
    connect(&handle).await;

    transport.send_json_from_device(&button_press(777)).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    transport.send_json_from_device(&button_press(777)).await;

    // Let the host's paced ACK writes drain.
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(
        transport.host_acks(),
        vec![777, 777],
        "every receipt is acked, duplicate included"
    );
    assert_eq!(count_button_events(&mut events), 1, "handler runs once");
}

#[tokio::test(start_paused = true)]
async fn distinct_ids_both_dispatch() {
    let (transport, events_rx) = MockTransport::with_defaults();
    let handle = spawn_link(transport.clone(), events_rx);
    let mut events = handle.events();
    connect(&handle).await;

    transport.send_json_from_device(&button_press(1001)).await;
    transport.send_json_from_device(&button_press(1002)).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(transport.host_acks(), vec![1001, 1002]);
    assert_eq!(count_button_events(&mut events), 2);
}

#[tokio::test(start_paused = true)]
async fn message_without_m_id_is_dispatched_unacked() {
    let (transport, events_rx) = MockTransport::with_defaults();
    let handle = spawn_link(transport.clone(), events_rx);
    let mut events = handle.events();
    connect(&handle).await;

    transport
        .send_json_from_device(&serde_json::json!({
            "type": "button_press",
            "buttonId": "main",
            "pressType": "long",
        }))
        .await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(transport.host_acks().is_empty(), "no mId, no ack");
    assert_eq!(count_button_events(&mut events), 1);
}
