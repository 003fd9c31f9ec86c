//! Authentication Module
//!
//! Login/logout orchestration and the resolver that digs a usable session
//! out of the server's assorted login-response shapes.

use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{ApiClient, ApiError, DeviceInfo};
use crate::session::{AuthSession, SessionStore};
use crate::storage::StorageError;

/// Extraction of session fields from loosely-shaped login responses.
///
/// The backend has shipped several response layouts across endpoints and
/// versions; each accessor probes an ordered list of candidate fields and
/// the first non-blank match wins. The orders are part of the server
/// contract and must not be rearranged.
pub mod resolver {
    use serde_json::Value;

    /// Bearer token: top-level `accessToken`/`access_token`/`token`, then
    /// the same spellings under `data`, then under `user`.
    pub fn resolve_token(body: &Value) -> Option<String> {
        ["accessToken", "access_token", "token"]
            .iter()
            .find_map(|key| non_blank_string(body, key))
            .or_else(|| {
                let data = body.get("data")?;
                ["accessToken", "token", "access_token"]
                    .iter()
                    .find_map(|key| non_blank_string(data, key))
            })
            .or_else(|| {
                let user = body.get("user")?;
                ["token", "access_token", "accessToken"]
                    .iter()
                    .find_map(|key| non_blank_string(user, key))
            })
    }

    /// Display name, or `None` when no candidate matches; the caller is
    /// responsible for falling back to the login identifier.
    pub fn resolve_display_name(body: &Value) -> Option<String> {
        non_blank_string(body, "name")
            .or_else(|| nested(body, "data").and_then(|d| non_blank_string(d, "name")))
            .or_else(|| nested(body, "data").and_then(|d| non_blank_string(d, "username")))
            .or_else(|| {
                nested(body, "data")
                    .and_then(|d| nested(d, "user"))
                    .and_then(|u| non_blank_string(u, "name"))
            })
            .or_else(|| {
                nested(body, "data")
                    .and_then(|d| nested(d, "user"))
                    .and_then(|u| non_blank_string(u, "username"))
            })
            .or_else(|| nested(body, "user").and_then(|u| non_blank_string(u, "name")))
            .or_else(|| nested(body, "user").and_then(|u| non_blank_string(u, "username")))
    }

    /// User id comes from `data.id` only. Absence means the identity is
    /// not yet known, not that the response is invalid.
    pub fn resolve_user_id(body: &Value) -> Option<String> {
        let id = body.get("data")?.get("id")?;
        match id {
            Value::String(s) => {
                let s = s.trim();
                (!s.is_empty()).then(|| s.to_string())
            }
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Refresh token: top-level `refreshToken`, else `data.refreshToken`.
    pub fn resolve_refresh_token(body: &Value) -> Option<String> {
        non_blank_string(body, "refreshToken")
            .or_else(|| nested(body, "data").and_then(|d| non_blank_string(d, "refreshToken")))
    }

    /// Human-readable message for a non-success response body: JSON
    /// `message`, else `error`, else a line synthesized from the status.
    pub fn resolve_error_message(raw: &str, status: u16) -> String {
        serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|body| {
                non_blank_string(&body, "message").or_else(|| non_blank_string(&body, "error"))
            })
            .unwrap_or_else(|| format!("Error {}", status))
    }

    fn non_blank_string(value: &Value, key: &str) -> Option<String> {
        let s = value.get(key)?.as_str()?.trim();
        (!s.is_empty()).then(|| s.to_string())
    }

    fn nested<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
        value.get(key).filter(|v| v.is_object())
    }
}

/// Orchestrates login and logout over the API client, the resolver and the
/// session store. Holds no session state of its own.
pub struct AuthSessionController {
    api: Arc<ApiClient>,
    store: Arc<SessionStore>,
    device: DeviceInfo,
}

impl AuthSessionController {
    pub fn new(api: Arc<ApiClient>, store: Arc<SessionStore>, device: DeviceInfo) -> Self {
        Self { api, store, device }
    }

    /// Sign in and persist the resulting session.
    ///
    /// Blank credentials are rejected locally before any network call.
    /// Remote failures carry the server's message verbatim.
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<AuthSession, AuthError> {
        let identifier = identifier.trim();
        if identifier.is_empty() || secret.is_empty() {
            return Err(AuthError::Validation(
                "Username and password must not be blank",
            ));
        }

        let body = self
            .api
            .sign_in(identifier, secret, &self.device)
            .await
            .map_err(|e| match e {
                ApiError::Server(message) => AuthError::Remote(message),
                other => AuthError::Remote(other.to_string()),
            })?;

        let Some(token) = resolver::resolve_token(&body) else {
            warn!("Sign-in response carried no token");
            return Err(AuthError::InvalidCredentialsResponse);
        };

        let session = AuthSession {
            token,
            refresh_token: resolver::resolve_refresh_token(&body),
            display_name: resolver::resolve_display_name(&body)
                .unwrap_or_else(|| identifier.to_string()),
            raw_profile: body.to_string(),
            login_identifier: identifier.to_string(),
            secret: Some(secret.to_string()),
            user_id: resolver::resolve_user_id(&body),
        };

        self.store.save(&session)?;
        info!("Logged in as: {}", session.display_name);
        Ok(session)
    }

    /// Clear the persisted session unconditionally.
    pub async fn logout(&self) -> Result<(), AuthError> {
        self.store.clear()?;
        Ok(())
    }
}

/// Authentication errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Rejected locally; the network was never touched.
    #[error("{0}")]
    Validation(&'static str),

    /// The server answered success but no token could be resolved.
    #[error("Invalid credentials response: no token in server reply")]
    InvalidCredentialsResponse,

    /// The remote call failed; carries the server's message verbatim.
    #[error("{0}")]
    Remote(String),

    #[error("Session persistence failed: {0}")]
    Persistence(#[from] StorageError),
}
