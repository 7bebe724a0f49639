//! Link loss, cleanup, and the exponential reconnect loop.
//!
//! # Scenarios
//! 1. Link-down while CONNECTED → pending ACK entries fail fast, state
//!    drops, and the link re-establishes on the first backoff attempt.
//! 2. A peer that never answers connects stops draining attempts after
//!    the configured budget.
//! 3. Forget clears the persisted identity: the next connect cycle for
//!    that kind starts with a scan instead of a targeted connect.
//! 4. A burst of undecodable packets on a connected link is treated as
//!    transport corruption and recycles the link.
//! 5. Device shutdown (`sr_shut`) disconnects without reconnecting.

use std::sync::Arc;
use std::time::Duration;

use gl_test_utils::{MockDeviceBehavior, MockPoster, MockTransport};
use link_core::storage::MemoryStore;
use link_core::{LinkConfig, LinkEvent, LinkHandle, LinkManager, PeerKind, PublicState};

fn spawn_link(
    transport: Arc<MockTransport>,
    events: tokio::sync::mpsc::Receiver<link_core::TransportEvent>,
    config: LinkConfig,
    store: Arc<MemoryStore>,
) -> LinkHandle {
    LinkManager {
        transport,
        transport_events: events,
        http: MockPoster::ok(),
        store,
        config,
    }
    .spawn()
}

async fn wait_for_state(handle: &LinkHandle, wanted: PublicState) {
    let mut watch = handle.state_watch();
    tokio::time::timeout(Duration::from_secs(120), async {
        while *watch.borrow_and_update() != wanted {
            watch.changed().await.expect("link task alive");
        }
    })
    .await
    .expect("state change within the window");
}

#[tokio::test(start_paused = true)]
async fn link_down_fails_pending_acks_and_reconnects() {
    let (transport, events_rx) = MockTransport::start(MockDeviceBehavior {
        auto_ack: false,
        ..MockDeviceBehavior::default()
    });
    let handle = spawn_link(
        transport.clone(),
        events_rx,
        LinkConfig::default(),
        Arc::new(MemoryStore::new()),
    );
    let mut events = handle.events();

    handle
        .connect(PeerKind::K900, Some("AA:BB:CC:DD:EE:FF".into()))
        .unwrap();
    wait_for_state(&handle, PublicState::Connected).await;

    // A reliable message the device will never ack.
    let m_id = handle
        .set_mic_state(true)
        .await
        .unwrap()
        .expect("modern firmware gets an mId");

    transport.emit_link_down("supervision timeout").await;
    wait_for_state(&handle, PublicState::Disconnected).await;

    // Teardown converts the pending entry into an immediate failure.
    let failed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let LinkEvent::DeliveryFailed { m_id } = events.recv().await.expect("bus open") {
                return m_id;
            }
        }
    })
    .await
    .expect("pending entry fails on teardown");
    assert_eq!(failed, m_id);

    // First backoff attempt lands and the handshake re-runs.
    wait_for_state(&handle, PublicState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_attempts_stop_at_the_budget() {
    let config = LinkConfig {
        max_reconnect_attempts: 3,
        ..LinkConfig::default()
    };
    let (transport, events_rx) = MockTransport::start(MockDeviceBehavior {
        fail_connect_times: u32::MAX,
        ..MockDeviceBehavior::default()
    });
    let handle = spawn_link(
        transport.clone(),
        events_rx,
        config,
        Arc::new(MemoryStore::new()),
    );

    handle
        .connect(PeerKind::K900, Some("AA:BB:CC:DD:EE:FF".into()))
        .unwrap();

    // Initial attempt + 3 backoff attempts (1 s, 2 s, 4 s), then nothing.
    // Give the loop far more simulated time than it needs.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(handle.state(), PublicState::Disconnected);
    assert_eq!(
        transport.connect_attempts(),
        4,
        "initial attempt plus the three budgeted retries"
    );
}

#[tokio::test(start_paused = true)]
async fn forget_then_connect_starts_with_a_scan() {
    let store = Arc::new(MemoryStore::new());
    let (transport, events_rx) = MockTransport::with_defaults();
    let handle = spawn_link(
        transport.clone(),
        events_rx,
        LinkConfig::default(),
        store.clone(),
    );

    handle
        .connect(PeerKind::K900, Some("AA:BB:CC:DD:EE:FF".into()))
        .unwrap();
    wait_for_state(&handle, PublicState::Connected).await;

    // The identity was persisted on ready.
    assert!(
        link_core::registry::PeerRegistry::new(store.clone())
            .get(PeerKind::K900)
            .unwrap()
            .is_some()
    );

    handle.forget().unwrap();
    wait_for_state(&handle, PublicState::Disconnected).await;
    assert!(
        link_core::registry::PeerRegistry::new(store.clone())
            .get(PeerKind::K900)
            .unwrap()
            .is_none(),
        "forget clears the persisted identity"
    );

    // No address supplied and nothing persisted → scan first, then the
    // sighting drives a fresh connect.
    handle.connect(PeerKind::K900, None).unwrap();
    wait_for_state(&handle, PublicState::Connected).await;
    assert!(transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn decode_corruption_burst_forces_disconnect() {
    let (transport, events_rx) = MockTransport::with_defaults();
    let handle = spawn_link(
        transport.clone(),
        events_rx,
        LinkConfig::default(),
        Arc::new(MemoryStore::new()),
    );

    handle
        .connect(PeerKind::K900, Some("AA:BB:CC:DD:EE:FF".into()))
        .unwrap();
    wait_for_state(&handle, PublicState::Connected).await;

    // A sustained burst of checksum failures reads as transport corruption.
    let mut wire = glasslink::k900::encode_file_packet(
        &[1u8; 100],
        0,
        100,
        "x.jpg",
        0,
        glasslink::k900::CmdType::Photo,
    )
    .unwrap();
    wire[glasslink::k900::FILE_HEADER_LEN] ^= 0xFF;
    for _ in 0..30 {
        transport.send_raw_from_device(wire.clone()).await;
    }

    wait_for_state(&handle, PublicState::Disconnected).await;
    // Corruption is transient: the backoff loop brings the link back.
    wait_for_state(&handle, PublicState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn device_shutdown_disconnects_without_reconnect() {
    let (transport, events_rx) = MockTransport::with_defaults();
    let handle = spawn_link(
        transport.clone(),
        events_rx,
        LinkConfig::default(),
        Arc::new(MemoryStore::new()),
    );

    handle
        .connect(PeerKind::K900, Some("AA:BB:CC:DD:EE:FF".into()))
        .unwrap();
    wait_for_state(&handle, PublicState::Connected).await;

    transport.send_system_from_device("sr_shut", None).await;
    wait_for_state(&handle, PublicState::Disconnected).await;

    // Long after every backoff horizon, still down.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(handle.state(), PublicState::Disconnected);
}
