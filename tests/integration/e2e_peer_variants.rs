//! Peer-variant behavior: inventory scans, constrained display peers,
//! and outbound file transfers.
//!
//! # Scenarios
//! 1. An inventory scan publishes every matching sighting on the bus and
//!    does not connect to anything.
//! 2. A display peer speaks bare JSON (no C-wrap), probes readiness with
//!    `phone_ready`, and sheds stale frames beyond its queue cap.
//! 3. An outbound file lands on the device as ordered, checksummed
//!    packets clamped to the peer's pack size.
//! 4. Typed device messages from the fixture round-trip into bus events.
//! 5. Raw audio frames stream to the bus without JSON routing.

use std::sync::Arc;
use std::time::Duration;

use gl_protocol::DeviceMessage;
use gl_protocol::messages::ButtonPress;
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

async fn wait_for_state(handle: &LinkHandle, wanted: PublicState) {
    let mut watch = handle.state_watch();
    tokio::time::timeout(Duration::from_secs(60), async {
        while *watch.borrow_and_update() != wanted {
            watch.changed().await.expect("link task alive");
        }
    })
    .await
    .expect("state change within the window");
}

#[tokio::test(start_paused = true)]
async fn inventory_scan_publishes_all_sightings() {
    let (transport, events_rx) = MockTransport::start(MockDeviceBehavior {
        advertised: vec![
            ("XyGlasses-1F2A".to_owned(), "AA:AA:AA:AA:AA:01".to_owned()),
            ("XyGlasses-9B0C".to_owned(), "AA:AA:AA:AA:AA:02".to_owned()),
            ("SomeOtherThing".to_owned(), "AA:AA:AA:AA:AA:03".to_owned()),
        ],
        ..MockDeviceBehavior::default()
    });
    let handle = spawn_link(transport.clone(), events_rx);
    let mut events = handle.events();

    handle.scan_inventory().unwrap();

    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while seen.len() < 2 {
            if let LinkEvent::PeerDiscovered { address, .. } =
                events.recv().await.expect("bus open")
            {
                seen.push(address);
            }
        }
    })
    .await
    .expect("both sightings within the window");
    assert_eq!(seen, vec!["AA:AA:AA:AA:AA:01", "AA:AA:AA:AA:AA:02"]);

    // Sightings never auto-connect during inventory.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!transport.is_connected());
    assert_eq!(handle.state(), PublicState::Connecting);

    // The window closes on its own.
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(handle.state(), PublicState::Disconnected);
    assert!(!transport.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn display_peer_uses_bare_json_and_phone_ready() {
    let (transport, events_rx) = MockTransport::start(MockDeviceBehavior {
        advertised: vec![("XyDisplay-0001".to_owned(), "BB:BB:BB:BB:BB:01".to_owned())],
        auto_ready_after_probes: Some(2),
        ..MockDeviceBehavior::default()
    });
    let handle = spawn_link(transport.clone(), events_rx);

    handle.connect(PeerKind::Display, None).unwrap();
    wait_for_state(&handle, PublicState::Connected).await;
    assert_eq!(transport.probes_seen(), 2, "phone_ready probes counted");

    // Bare JSON on the wire: no C-wrap around display traffic.
    handle.send_json(serde_json::json!({"type": "display_text", "text": "hi"}), false).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let raw = transport.writes();
    let bare = raw.iter().any(|w| {
        glasslink::k900::decode_frame(w, glasslink::k900::Direction::HostToDevice)
            .ok()
            .and_then(|f| serde_json::from_slice::<serde_json::Value>(&f.payload).ok())
            .is_some_and(|v| v.get("C").is_none() && v["type"] == "display_text")
    });
    assert!(bare, "display peers get unwrapped JSON frames");
}

#[tokio::test(start_paused = true)]
async fn constrained_queue_sheds_stale_frames() {
    let (transport, events_rx) = MockTransport::start(MockDeviceBehavior {
        advertised: vec![("XyDisplay-0001".to_owned(), "BB:BB:BB:BB:BB:01".to_owned())],
        ..MockDeviceBehavior::default()
    });
    let handle = spawn_link(transport.clone(), events_rx);
    let mut events = handle.events();

    handle.connect(PeerKind::Display, None).unwrap();
    wait_for_state(&handle, PublicState::Connected).await;

    let before = transport.decoded_writes().len();
    // Burst ten renders into a 3-slot queue while pacing holds them back.
    for i in 0..10 {
        handle
            .send_json(serde_json::json!({"type": "display_text", "text": format!("frame-{i}")}), false)
            .unwrap();
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    let texts: Vec<String> = transport
        .decoded_writes()
        .into_iter()
        .skip(before)
        .filter_map(|m| m.get("text").and_then(|t| t.as_str()).map(str::to_owned))
        .collect();
    assert!(texts.len() < 10, "stale frames were shed");
    assert_eq!(
        texts.last().map(String::as_str),
        Some("frame-9"),
        "the freshest frame always survives"
    );

    let dropped = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, LinkEvent::QueueDropped { .. }))
        .count();
    assert!(dropped > 0, "drops are observable on the bus");
}

#[tokio::test(start_paused = true)]
async fn outbound_file_arrives_as_ordered_packets() {
    let (transport, events_rx) = MockTransport::with_defaults();
    let handle = spawn_link(transport.clone(), events_rx);

    handle
        .connect(PeerKind::K900, Some("AA:BB:CC:DD:EE:FF".into()))
        .unwrap();
    wait_for_state(&handle, PublicState::Connected).await;

    let blob: Vec<u8> = (0..900u32).map(|i| (i % 253) as u8).collect();
    let total = handle
        .send_file("cfg.bin", blob.clone(), glasslink::k900::CmdType::Data)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let packets = transport.file_writes();
    assert_eq!(packets.len() as u32, total);
    let mut reassembled = Vec::new();
    for (i, pkt) in packets.iter().enumerate() {
        assert_eq!(pkt.pack_index as usize, i);
        assert_eq!(pkt.file_name, "cfg.bin");
        // The 247-byte MTU clamps chunks below the configured 400.
        assert!(pkt.data.len() <= glasslink::k900::max_data_for_mtu(247) as usize);
        reassembled.extend_from_slice(&pkt.data);
    }
    assert_eq!(reassembled, blob);
}

#[tokio::test(start_paused = true)]
async fn raw_audio_frames_stream_to_the_bus() {
    let (transport, events_rx) = MockTransport::with_defaults();
    let handle = spawn_link(transport.clone(), events_rx);
    let mut events = handle.events();

    handle
        .connect(PeerKind::K900, Some("AA:BB:CC:DD:EE:FF".into()))
        .unwrap();
    wait_for_state(&handle, PublicState::Connected).await;

    let frame = glasslink::k900::encode_raw(
        &[0x10; 160],
        glasslink::k900::CmdType::Audio,
        glasslink::k900::Direction::DeviceToHost,
    )
    .unwrap();
    transport.send_raw_from_device(frame).await;

    let event = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("bus open");
            if matches!(event, LinkEvent::MicAudioChunk { .. }) {
                return event;
            }
        }
    })
    .await
    .expect("audio chunk within the window");
    match event {
        LinkEvent::MicAudioChunk { data } => assert_eq!(data, vec![0x10; 160]),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn typed_device_messages_reach_the_bus() {
    let (transport, events_rx) = MockTransport::with_defaults();
    let handle = spawn_link(transport.clone(), events_rx);
    let mut events = handle.events();

    handle
        .connect(PeerKind::K900, Some("AA:BB:CC:DD:EE:FF".into()))
        .unwrap();
    wait_for_state(&handle, PublicState::Connected).await;

    transport
        .send_message_from_device(&DeviceMessage::ButtonPress(ButtonPress {
            button_id: "camera".into(),
            press_type: "long".into(),
        }))
        .await;

    let event = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("bus open");
            if matches!(event, LinkEvent::ButtonPress { .. }) {
                return event;
            }
        }
    })
    .await
    .expect("button press within the window");
    match event {
        LinkEvent::ButtonPress {
            button_id,
            press_type,
        } => {
            assert_eq!(button_id, "camera");
            assert_eq!(press_type, "long");
        }
        other => panic!("unexpected event {other:?}"),
    }
}
