//! Built-in command handlers.
//!
//! Each one deserializes its typed payload and republishes it as a bus
//! event. State-coupled commands (`glasses_ready`, `ble_photo_ready`,
//! `version_info`) are also observed by the link task before dispatch;
//! their handlers here only do the bus half.

use serde_json::Value;
use tracing::debug;

use gl_protocol::messages::{
    BatteryStatus, BlePhotoReady, ButtonPress, OtaDownloadProgress, OtaInstallationProgress,
    PairFailure, SensorData, StreamStatus, VersionInfo, WifiScanResult, WifiStatus,
};

use crate::bus::{EventBus, LinkEvent};
use crate::dispatch::{Dispatcher, HandlerError};

fn parse<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T, HandlerError> {
    serde_json::from_value(payload.clone()).map_err(|e| HandlerError::Malformed(e.to_string()))
}

/// Register the core's built-in handler set.
pub fn install_builtin_handlers(dispatcher: &mut Dispatcher, bus: &EventBus) {
    let b = bus.clone();
    dispatcher.register("battery_status", move |payload: &Value| {
        let status: BatteryStatus = parse(payload)?;
        b.publish(LinkEvent::BatteryChanged {
            level: status.level,
            charging: status.charging,
        });
        Ok(())
    });

    let b = bus.clone();
    dispatcher.register("wifi_status", move |payload: &Value| {
        let status: WifiStatus = parse(payload)?;
        b.publish(LinkEvent::WifiStatusChanged {
            connected: status.connected,
            ssid: status.ssid,
        });
        Ok(())
    });

    let b = bus.clone();
    dispatcher.register("wifi_scan_result", move |payload: &Value| {
        let result: WifiScanResult = parse(payload)?;
        b.publish(LinkEvent::WifiScanResult {
            networks: result.networks,
        });
        Ok(())
    });

    let b = bus.clone();
    dispatcher.register("ble_photo_ready", move |payload: &Value| {
        let ready: BlePhotoReady = parse(payload)?;
        b.publish(LinkEvent::PhotoReady {
            ble_img_id: ready.ble_img_id,
            request_id: ready.request_id,
        });
        Ok(())
    });

    dispatcher.register("ble_photo_complete", |payload: &Value| {
        // Host-side assembly is authoritative; this is device bookkeeping.
        debug!(?payload, "device reported photo transfer complete");
        Ok(())
    });

    let b = bus.clone();
    dispatcher.register("version_info", move |payload: &Value| {
        let info: VersionInfo = parse(payload)?;
        b.publish(LinkEvent::VersionInfo {
            app_version: info.app_version,
            build_number: info.build_number,
        });
        Ok(())
    });

    let b = bus.clone();
    dispatcher.register("ota_download_progress", move |payload: &Value| {
        let progress: OtaDownloadProgress = parse(payload)?;
        b.publish(LinkEvent::OtaDownloadProgress {
            status: progress.status,
            progress: progress.progress,
        });
        Ok(())
    });

    let b = bus.clone();
    dispatcher.register("ota_installation_progress", move |payload: &Value| {
        let progress: OtaInstallationProgress = parse(payload)?;
        b.publish(LinkEvent::OtaInstallationProgress {
            status: progress.status,
        });
        Ok(())
    });

    dispatcher.register(gl_protocol::TYPE_PONG, |_: &Value| {
        debug!("heartbeat pong");
        Ok(())
    });

    dispatcher.register("keep_alive_ack", |payload: &Value| {
        debug!(?payload, "stream keep-alive acknowledged");
        Ok(())
    });

    let b = bus.clone();
    dispatcher.register("rtmp_stream_status", move |payload: &Value| {
        let status: StreamStatus = parse(payload)?;
        b.publish(LinkEvent::StreamStatus {
            status: status.status,
            stream_id: status.stream_id,
        });
        Ok(())
    });

    let b = bus.clone();
    dispatcher.register("button_press", move |payload: &Value| {
        let press: ButtonPress = parse(payload)?;
        b.publish(LinkEvent::ButtonPress {
            button_id: press.button_id,
            press_type: press.press_type,
        });
        Ok(())
    });

    let b = bus.clone();
    dispatcher.register("sensor_data", move |payload: &Value| {
        let data: SensorData = parse(payload)?;
        b.publish(LinkEvent::SensorData {
            sensor: data.sensor,
            values: data.values,
        });
        Ok(())
    });

    dispatcher.register(gl_protocol::TYPE_GLASSES_READY, |_: &Value| {
        // The state machine transitions on this before dispatch.
        Ok(())
    });

    let b = bus.clone();
    dispatcher.register("pair_failure", move |payload: &Value| {
        let failure: PairFailure = parse(payload)?;
        b.publish(LinkEvent::PairFailure {
            error: failure.error,
        });
        Ok(())
    });
}

/// Aliases for type strings the previous firmware generation used.
/// Kept as a separate pass so a future cleanup can drop them in one place.
pub fn install_legacy_aliases(dispatcher: &mut Dispatcher) {
    dispatcher.add_alias("battery_state", "battery_status");
    dispatcher.add_alias("wifi_state", "wifi_status");
    dispatcher.add_alias("photo_ready", "ble_photo_ready");
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
