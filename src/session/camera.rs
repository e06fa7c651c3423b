//! Camera server address handling.
//!
//! The camera server announces itself on the broker either as a bare URL
//! (`http://10.0.0.7:5000`) or as JSON (`{"camera_ip": "http://..."}`).
//! The HTTP endpoints themselves belong to the camera server; only the
//! status check is consumed here.

use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::error::SessionError;

const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct Announcement {
    camera_ip: Option<String>,
}

fn looks_like_http(value: &str) -> bool {
    value.starts_with("http")
}

/// Extracts a camera URL from a broker message, if it carries one.
pub fn extract_camera_url(payload: &str) -> Option<String> {
    let payload = payload.trim();
    if let Ok(announcement) = serde_json::from_str::<Announcement>(payload) {
        return announcement
            .camera_ip
            .map(|ip| ip.trim().to_string())
            .filter(|ip| looks_like_http(ip));
    }
    if looks_like_http(payload) {
        return Some(payload.to_string());
    }
    None
}

/// Normalizes operator input into a URL (`10.0.0.7:5000` → `http://10.0.0.7:5000`).
pub fn format_input_url(input: &str) -> String {
    let url = input.trim();
    if url.is_empty() {
        return String::new();
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CameraStatus {
    pub status: String,
    pub camera: bool,
    #[serde(default)]
    pub test_mode: Option<bool>,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub local_ip: Option<String>,
    #[serde(default)]
    pub network_interfaces: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraEndpoint {
    base: String,
}

impl CameraEndpoint {
    /// Accepts either the server root or its `/video` stream URL.
    pub fn from_url(url: &str) -> Self {
        let url = format_input_url(url);
        let url = url.trim_end_matches('/');
        let base = url.strip_suffix("/video").unwrap_or(url);
        Self {
            base: base.to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn status_url(&self) -> String {
        format!("{}/status", self.base)
    }

    pub fn video_url(&self) -> String {
        format!("{}/video", self.base)
    }

    pub fn camera_normal_url(&self) -> String {
        format!("{}/camera_normal", self.base)
    }

    pub fn camera_ia_url(&self) -> String {
        format!("{}/camera_ia", self.base)
    }

    /// The timestamp query defeats caches between consecutive captures.
    pub fn capture_url(&self, timestamp_ms: i64) -> String {
        format!("{}/camera_ia/capture?t={}", self.base, timestamp_ms)
    }

    pub async fn fetch_status(&self) -> Result<CameraStatus, SessionError> {
        let url = self.status_url();
        debug!("Fetching camera status at {}", url);

        let client = reqwest::Client::builder()
            .timeout(STATUS_TIMEOUT)
            .build()
            .map_err(|e| SessionError::Camera(e.to_string()))?;

        let response = client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                warn!("Camera server not responding at {}: {}", url, e);
                SessionError::Camera(format!("server not responding: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(SessionError::Camera(format!(
                "status endpoint returned {}",
                response.status()
            )));
        }

        response
            .json::<CameraStatus>()
            .await
            .map_err(|e| SessionError::Camera(format!("invalid status payload: {}", e)))
    }
}
