//! Happy-path photo: request with webhook, BLE transfer, upload.
//!
//! # Scenarios
//! 1. `take_photo` with a webhook → device signals ready → 7 file packets
//!    (packSize 400, fileSize 2700) → webhook receives all 2700 bytes with
//!    the auth header → `PhotoComplete` carries the timings.
//! 2. Webhook failure → `WebhookUploadFailed`, link unaffected.
//! 3. A non-photo file completion lands on the bus as `FileReceived`.

use std::sync::Arc;
use std::time::Duration;

use gl_test_utils::{MockPoster, MockTransport};
use link_core::storage::MemoryStore;
use link_core::{LinkConfig, LinkEvent, LinkHandle, LinkManager, PeerKind, PublicState};

fn spawn_link(
    transport: Arc<MockTransport>,
    events: tokio::sync::mpsc::Receiver<link_core::TransportEvent>,
    poster: Arc<gl_test_utils::MockPoster>,
) -> LinkHandle {
    LinkManager {
        transport,
        transport_events: events,
        http: poster,
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

async fn wait_for_event<F>(
    events: &mut tokio::sync::broadcast::Receiver<LinkEvent>,
    mut pred: F,
) -> LinkEvent
where
    F: FnMut(&LinkEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let event = events.recv().await.expect("bus open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event within the window")
}

fn photo_request() -> gl_protocol::messages::TakePhoto {
    gl_protocol::messages::TakePhoto {
        request_id: "R1".into(),
        webhook_url: Some("https://ex/cb".into()),
        size: "medium".into(),
        ble_img_id: "I000000001".into(),
        transfer_method: "auto".into(),
    }
}

#[tokio::test(start_paused = true)]
async fn photo_lands_on_webhook_with_timings() {
    let (transport, events_rx) = MockTransport::with_defaults();
    let poster = MockPoster::ok();
    let handle = spawn_link(transport.clone(), events_rx, poster.clone());
    let mut events = handle.events();

    handle
        .connect(PeerKind::K900, Some("AA:BB:CC:DD:EE:FF".into()))
        .unwrap();
    wait_for_state(&handle, PublicState::Connected).await;

    handle
        .take_photo(photo_request(), Some("tok".into()))
        .await
        .unwrap();

    // Device: compression done, then the chunked transfer.
    transport
        .send_json_from_device(&serde_json::json!({
            "type": "ble_photo_ready",
            "bleImgId": "I000000001",
            "compressionDurationMs": 820,
        }))
        .await;

    let blob: Vec<u8> = (0..2700u32).map(|i| (i % 256) as u8).collect();
    transport
        .send_file_from_device("I000000001.jpg", &blob, 400, glasslink::k900::CmdType::Photo)
        .await;

    let complete = wait_for_event(&mut events, |e| {
        matches!(e, LinkEvent::PhotoComplete { .. } | LinkEvent::WebhookUploadFailed { .. })
    })
    .await;

    match complete {
        LinkEvent::PhotoComplete {
            request_id,
            size_bytes,
            compression_ms,
            ..
        } => {
            assert_eq!(request_id, "R1");
            assert_eq!(size_bytes, 2700);
            assert_eq!(compression_ms, Some(820));
        }
        other => panic!("expected PhotoComplete, got {other:?}"),
    }

    let posts = poster.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].url, "https://ex/cb");
    assert_eq!(posts[0].body, blob);
    assert!(
        posts[0]
            .headers
            .iter()
            .any(|(n, v)| n == "Authorization" && v == "Bearer tok"),
        "auth header must accompany the upload"
    );
}

#[tokio::test(start_paused = true)]
async fn webhook_failure_reports_and_keeps_link() {
    let (transport, events_rx) = MockTransport::with_defaults();
    let poster = MockPoster::failing(503);
    let handle = spawn_link(transport.clone(), events_rx, poster.clone());
    let mut events = handle.events();

    handle
        .connect(PeerKind::K900, Some("AA:BB:CC:DD:EE:FF".into()))
        .unwrap();
    wait_for_state(&handle, PublicState::Connected).await;

    handle
        .take_photo(photo_request(), Some("tok".into()))
        .await
        .unwrap();
    transport
        .send_json_from_device(&serde_json::json!({
            "type": "ble_photo_ready",
            "bleImgId": "I000000001",
        }))
        .await;
    transport
        .send_file_from_device(
            "I000000001.jpg",
            &[9u8; 800],
            400,
            glasslink::k900::CmdType::Photo,
        )
        .await;

    let failure = wait_for_event(&mut events, |e| {
        matches!(e, LinkEvent::WebhookUploadFailed { .. })
    })
    .await;
    match failure {
        LinkEvent::WebhookUploadFailed { request_id, .. } => assert_eq!(request_id, "R1"),
        other => panic!("expected failure event, got {other:?}"),
    }

    // The link survives a webhook outage.
    assert_eq!(handle.state(), PublicState::Connected);
}

#[tokio::test(start_paused = true)]
async fn non_photo_file_is_delivered_on_the_bus() {
    let (transport, events_rx) = MockTransport::with_defaults();
    let poster = MockPoster::ok();
    let handle = spawn_link(transport.clone(), events_rx, poster.clone());
    let mut events = handle.events();

    handle
        .connect(PeerKind::K900, Some("AA:BB:CC:DD:EE:FF".into()))
        .unwrap();
    wait_for_state(&handle, PublicState::Connected).await;

    let blob = vec![3u8; 1000];
    transport
        .send_file_from_device("voice.pcm", &blob, 400, glasslink::k900::CmdType::Audio)
        .await;

    let received = wait_for_event(&mut events, |e| matches!(e, LinkEvent::FileReceived { .. })).await;
    match received {
        LinkEvent::FileReceived { name, data, .. } => {
            assert_eq!(name, "voice.pcm");
            assert_eq!(data, blob);
        }
        other => panic!("expected FileReceived, got {other:?}"),
    }
    assert!(poster.posts().is_empty(), "no webhook for non-photo files");
}
