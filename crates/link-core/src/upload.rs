//! Webhook upload relay for BLE photo transfers.
//!
//! When the host requests a photo with a webhook URL, a transfer record is
//! opened under the photo's `bleImgId`. The device's `ble_photo_ready`
//! signal enriches it with compression timing, the reassembler's
//! completion consumes it, and the assembled JPEG is POSTed to the webhook
//! with the owner's auth token. Success and failure both land on the
//! event bus; either way the record is cleared.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::bus::{EventBus, LinkEvent};

// ---------------------------------------------------------------------------
// HTTP capability
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum HttpError {
    /// Request never completed (DNS, TLS, timeout).
    Network(String),
    /// Server answered with a non-success status.
    Status(u16),
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::Network(s) => write!(f, "network error: {}", s),
            HttpError::Status(code) => write!(f, "HTTP status {}", code),
        }
    }
}

impl std::error::Error for HttpError {}

/// Injected HTTP client; the relay is its only consumer.
#[async_trait]
pub trait HttpPoster: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<u16, HttpError>;
}

/// Production [`HttpPoster`] over reqwest.
pub struct ReqwestPoster {
    client: reqwest::Client,
}

impl ReqwestPoster {
    pub fn new() -> ReqwestPoster {
        ReqwestPoster {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestPoster {
    fn default() -> Self {
        ReqwestPoster::new()
    }
}

#[async_trait]
impl HttpPoster for ReqwestPoster {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<u16, HttpError> {
        let mut request = self.client.post(url).body(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        if response.status().is_success() {
            Ok(status)
        } else {
            Err(HttpError::Status(status))
        }
    }
}

// ---------------------------------------------------------------------------
// Transfer records
// ---------------------------------------------------------------------------

/// One in-flight photo-with-webhook request.
#[derive(Debug, Clone)]
pub struct BlePhotoTransfer {
    pub ble_img_id: String,
    pub request_id: String,
    pub webhook_url: String,
    pub auth_token: Option<String>,
    /// When the host issued `take_photo`.
    pub requested_at: Instant,
    /// When the device said compression finished and packets were coming.
    pub transfer_started_at: Option<Instant>,
    /// Device-reported compression duration.
    pub compression_ms: Option<u64>,
}

/// Transfer records keyed by `bleImgId` (the file stem on the wire).
#[derive(Debug, Default)]
pub struct PhotoTransferTable {
    transfers: HashMap<String, BlePhotoTransfer>,
}

impl PhotoTransferTable {
    pub fn new() -> PhotoTransferTable {
        PhotoTransferTable::default()
    }

    pub fn open(&mut self, transfer: BlePhotoTransfer) {
        self.transfers.insert(transfer.ble_img_id.clone(), transfer);
    }

    /// Record the device's `ble_photo_ready` signal.
    pub fn mark_ready(&mut self, ble_img_id: &str, compression_ms: Option<u64>) -> bool {
        match self.transfers.get_mut(ble_img_id) {
            Some(t) => {
                t.transfer_started_at = Some(Instant::now());
                t.compression_ms = compression_ms;
                true
            }
            None => false,
        }
    }

    /// Take the record matching a completed session, if any.
    pub fn take(&mut self, ble_img_id: &str) -> Option<BlePhotoTransfer> {
        self.transfers.remove(ble_img_id)
    }

    pub fn clear(&mut self) {
        self.transfers.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlePhotoTransfer> {
        self.transfers.values()
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

/// POST an assembled photo to its webhook and report on the bus.
///
/// Runs as a spawned task so the link task never blocks on HTTP.
pub async fn upload_photo(
    poster: Arc<dyn HttpPoster>,
    transfer: BlePhotoTransfer,
    data: Vec<u8>,
    bus: EventBus,
) {
    let size_bytes = data.len();
    let now = Instant::now();
    let ble_transfer_ms = transfer
        .transfer_started_at
        .map(|t| now.duration_since(t).as_millis() as u64)
        .unwrap_or(0);
    let total_ms = now.duration_since(transfer.requested_at).as_millis() as u64;

    let mut headers = vec![("Content-Type".to_owned(), "image/jpeg".to_owned())];
    if let Some(token) = &transfer.auth_token {
        headers.push(("Authorization".to_owned(), format!("Bearer {token}")));
    }

    match poster
        .post(&transfer.webhook_url, &headers, data)
        .await
    {
        Ok(status) => {
            info!(
                request_id = %transfer.request_id,
                status,
                size_bytes,
                ble_transfer_ms,
                total_ms,
                "photo uploaded to webhook"
            );
            bus.publish(LinkEvent::PhotoComplete {
                request_id: transfer.request_id,
                size_bytes,
                compression_ms: transfer.compression_ms,
                ble_transfer_ms,
                total_ms,
            });
        }
        Err(e) => {
            warn!(request_id = %transfer.request_id, error = %e, "webhook upload failed");
            bus.publish(LinkEvent::WebhookUploadFailed {
                request_id: transfer.request_id,
                reason: e.to_string(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
