//! Readiness handshake and post-ready heartbeat cadence.
//!
//! # Scenarios
//! 1. Device answers `glasses_ready` on the third probe → CONNECTED;
//!    probing stops; heartbeat pings begin on the 30 s cadence with a
//!    battery poll on every 10th beat.
//! 2. Un-ready device below the battery floor → `PairingBatteryTooLow`,
//!    bring-up aborted without reconnect.
//! 3. No ready within the probe budget → `ReadinessFailed`, disconnect.

use std::sync::Arc;
use std::time::Duration;

use gl_test_utils::{MockDeviceBehavior, MockPoster, MockTransport};
use link_core::storage::MemoryStore;
use link_core::{LinkConfig, LinkEvent, LinkHandle, LinkManager, PeerKind, PublicState};

fn spawn_link(
    transport: Arc<MockTransport>,
    events: tokio::sync::mpsc::Receiver<link_core::TransportEvent>,
    config: LinkConfig,
) -> LinkHandle {
    LinkManager {
        transport,
        transport_events: events,
        http: MockPoster::ok(),
        store: Arc::new(MemoryStore::new()),
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
async fn ready_on_third_probe_then_heartbeats() {
    let (transport, events_rx) = MockTransport::start(MockDeviceBehavior {
        auto_ready_after_probes: Some(3),
        ..MockDeviceBehavior::default()
    });
    let handle = spawn_link(transport.clone(), events_rx, LinkConfig::default());

    handle
        .connect(PeerKind::K900, Some("AA:BB:CC:DD:EE:FF".into()))
        .unwrap();
    wait_for_state(&handle, PublicState::Connected).await;

    assert_eq!(transport.probes_seen(), 3, "ready arrived on probe #3");

    // Probing must stop once connected.
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(transport.probes_seen(), 3, "no probes after CONNECTED");

    // Ten heartbeat intervals: ten pings and one batched battery poll.
    tokio::time::sleep(Duration::from_secs(310)).await;
    let writes = transport.decoded_writes();
    let pings = writes
        .iter()
        .filter(|m| m.get("type").and_then(|t| t.as_str()) == Some("ping"))
        .count();
    assert!(
        (10..=11).contains(&pings),
        "expected ~10 pings over 310 s, saw {pings}"
    );
    let battery_polls = writes
        .iter()
        .filter(|m| m.as_str() == Some("cs_batv"))
        .count();
    assert_eq!(battery_polls, 1, "battery rides every 10th heartbeat");
}

#[tokio::test(start_paused = true)]
async fn low_battery_unready_peer_aborts_pairing() {
    let (transport, events_rx) = MockTransport::start(MockDeviceBehavior {
        auto_ready_after_probes: None,
        respond_heartbeat: true,
        heartbeat_ready: false,
        battery_level: 15,
        ..MockDeviceBehavior::default()
    });
    let handle = spawn_link(transport.clone(), events_rx, LinkConfig::default());
    let mut events = handle.events();

    handle
        .connect(PeerKind::K900, Some("AA:BB:CC:DD:EE:FF".into()))
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let event = events.recv().await.expect("bus open");
            if matches!(event, LinkEvent::PairingBatteryTooLow { .. }) {
                return event;
            }
        }
    })
    .await
    .expect("low-battery abort within the window");
    match event {
        LinkEvent::PairingBatteryTooLow { level } => assert_eq!(level, 15),
        other => panic!("unexpected event {other:?}"),
    }

    wait_for_state(&handle, PublicState::Disconnected).await;
    // Aborted bring-up does not retry on its own.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(handle.state(), PublicState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn silent_device_exhausts_probe_budget() {
    let config = LinkConfig {
        readiness_max_probes: 4,
        max_reconnect_attempts: 0,
        ..LinkConfig::default()
    };
    let (transport, events_rx) = MockTransport::start(MockDeviceBehavior {
        auto_ready_after_probes: None,
        respond_heartbeat: false,
        ..MockDeviceBehavior::default()
    });
    let handle = spawn_link(transport.clone(), events_rx, config);
    let mut events = handle.events();

    handle
        .connect(PeerKind::K900, Some("AA:BB:CC:DD:EE:FF".into()))
        .unwrap();

    let failed = tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            if let LinkEvent::ReadinessFailed { probes } = events.recv().await.expect("bus open") {
                return probes;
            }
        }
    })
    .await
    .expect("readiness failure within the window");
    assert_eq!(failed, 4);
    assert_eq!(transport.probes_seen(), 4);

    wait_for_state(&handle, PublicState::Disconnected).await;
}
