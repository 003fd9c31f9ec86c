//! API Module
//!
//! HTTP communication with the tracking backend: sign-in and the REST
//! location ingestion endpoint.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::auth::resolver;

/// API client for the tracking backend
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Sign in with user credentials and device identity.
    ///
    /// Returns the raw response body: the resolver owns the extraction of
    /// token and profile fields from the server's assorted response shapes.
    pub async fn sign_in(
        &self,
        username: &str,
        password: &str,
        device: &DeviceInfo,
    ) -> Result<serde_json::Value, ApiError> {
        let url = format!("{}/auth/signin", self.base_url);

        debug!("Signing in at: {}", url);

        let response = self
            .client
            .post(&url)
            .json(&SignInRequest {
                username,
                password,
                platform: &device.platform,
                device_info: device,
            })
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = resolver::resolve_error_message(&body, status.as_u16());
            return Err(ApiError::Server(message));
        }

        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;

        info!("Sign-in succeeded");
        Ok(body)
    }

    /// Report one location sample over REST.
    pub async fn send_location(
        &self,
        access_token: &str,
        update: &LocationUpdate,
    ) -> Result<(), ApiError> {
        let url = format!("{}/location/update", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", access_token))
            .json(update)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = resolver::resolve_error_message(&body, status.as_u16());
            return Err(ApiError::Server(message));
        }

        debug!("Location accepted by REST endpoint");
        Ok(())
    }
}

// Request types

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInRequest<'a> {
    username: &'a str,
    password: &'a str,
    platform: &'a str,
    device_info: &'a DeviceInfo,
}

/// Identity of the device running the engine, sent with sign-in.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub platform: String,
    pub model: String,
    pub version: String,
}

impl DeviceInfo {
    /// Gather identity from the host.
    pub fn collect() -> Self {
        let device_id = whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string());

        Self {
            device_id,
            platform: std::env::consts::OS.to_string(),
            model: whoami::devicename(),
            version: whoami::distro(),
        }
    }
}

/// One outbound REST location report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub user_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f32>,
    pub timestamp: i64,
}

/// API errors
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
