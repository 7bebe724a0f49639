//! Reliable messaging under ACK loss.
//!
//! # Scenarios
//! 1. Two lost ACKs → two timed retries → third transmission acked;
//!    no `DeliveryFailed`, exactly three transmissions on the wire.
//! 2. All ACKs lost → retries cap at three → `DeliveryFailed` with four
//!    transmissions total (initial + 3 retries), link stays up.
//! 3. An unmatched ACK is ignored without side effects.

use std::sync::Arc;
use std::time::Duration;

use gl_test_utils::{MockDeviceBehavior, MockPoster, MockTransport};
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

fn mic_writes(transport: &MockTransport) -> Vec<serde_json::Value> {
    transport
        .decoded_writes()
        .into_iter()
        .filter(|m| m.get("type").and_then(|t| t.as_str()) == Some("set_mic_state"))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn lost_acks_are_retried_until_one_lands() {
    let (transport, events_rx) = MockTransport::start(MockDeviceBehavior {
        drop_acks_first_n: 2,
        ..MockDeviceBehavior::default()
    });
    let handle = spawn_link(transport.clone(), events_rx);
    let mut events = handle.events();
    connect(&handle).await;

    let m_id = handle
        .set_mic_state(true)
        .await
        .unwrap()
        .expect("modern firmware gets an mId");

    // Past the full retry budget: 3 × ack_timeout plus slack.
    tokio::time::sleep(Duration::from_secs(10)).await;

    let transmissions = mic_writes(&transport);
    assert_eq!(
        transmissions.len(),
        3,
        "initial send plus exactly two retries"
    );
    // Retries resend the same serialized bytes, same mId included.
    for t in &transmissions {
        assert_eq!(t["mId"].as_u64(), Some(m_id));
        assert_eq!(t["enabled"], serde_json::json!(true));
    }

    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, LinkEvent::DeliveryFailed { .. }),
            "delivery succeeded; no failure event expected"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_delivery_failure() {
    let (transport, events_rx) = MockTransport::start(MockDeviceBehavior {
        drop_acks_first_n: u32::MAX,
        ..MockDeviceBehavior::default()
    });
    let handle = spawn_link(transport.clone(), events_rx);
    let mut events = handle.events();
    connect(&handle).await;

    let m_id = handle
        .set_mic_state(false)
        .await
        .unwrap()
        .expect("modern firmware gets an mId");

    let failed = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            if let LinkEvent::DeliveryFailed { m_id } = events.recv().await.expect("bus open") {
                return m_id;
            }
        }
    })
    .await
    .expect("failure within ack_timeout * (max_retries + 1)");
    assert_eq!(failed, m_id);

    assert_eq!(
        mic_writes(&transport).len(),
        4,
        "initial send plus three retries"
    );
    assert_eq!(handle.state(), PublicState::Connected, "link stays up");
}

#[tokio::test(start_paused = true)]
async fn unmatched_ack_is_ignored() {
    let (transport, events_rx) = MockTransport::with_defaults();
    let handle = spawn_link(transport.clone(), events_rx);
    let mut events = handle.events();
    connect(&handle).await;

    transport
        .send_json_from_device(&serde_json::json!({"type": "msg_ack", "mId": 123456}))
        .await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(handle.state(), PublicState::Connected);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, LinkEvent::DeliveryFailed { .. }));
    }
}
