//! Session Module
//!
//! Owns the authenticated session: durable persistence plus a hot,
//! replay-latest stream for the rest of the engine.

use crate::storage::{Storage, StorageError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

/// An authenticated session, created on login and replaced wholesale on
/// re-login. A session always carries a non-empty token; "no session" is
/// modeled as `None`, never as a session with an empty token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub token: String,
    pub refresh_token: Option<String>,
    pub display_name: String,
    /// Verbatim server profile body, kept opaque.
    pub raw_profile: String,
    pub login_identifier: String,
    /// Remembered login secret.
    pub secret: Option<String>,
    pub user_id: Option<String>,
}

mod keys {
    pub const TOKEN: &str = "token";
    pub const REFRESH_TOKEN: &str = "refresh_token";
    pub const DISPLAY_NAME: &str = "display_name";
    pub const PROFILE: &str = "profile";
    pub const LOGIN_IDENTIFIER: &str = "login_identifier";
    pub const SECRET: &str = "secret";
    pub const USER_ID: &str = "user_id";

    pub const ALL: &[&str] = &[
        TOKEN,
        REFRESH_TOKEN,
        DISPLAY_NAME,
        PROFILE,
        LOGIN_IDENTIFIER,
        SECRET,
        USER_ID,
    ];
}

/// Durable session store with a replay-latest observer stream.
///
/// All fields are written together on save and removed together on clear;
/// observers only ever see complete snapshots, published after the disk
/// write succeeds.
pub struct SessionStore {
    storage: Storage,
    tx: watch::Sender<Option<AuthSession>>,
}

impl SessionStore {
    /// Open the store, seeding the stream with whatever the backing store
    /// holds so a fresh process observes the persisted session first.
    pub fn open(storage: Storage) -> Self {
        let initial = read_session(&storage);
        if initial.is_some() {
            debug!("Restored persisted session");
        }
        let (tx, _rx) = watch::channel(initial);
        Self { storage, tx }
    }

    /// Persist a session and publish it to observers.
    pub fn save(&self, session: &AuthSession) -> Result<(), StorageError> {
        self.storage.save(keys::TOKEN, &session.token)?;
        save_optional(&self.storage, keys::REFRESH_TOKEN, &session.refresh_token)?;
        self.storage.save(keys::DISPLAY_NAME, &session.display_name)?;
        self.storage.save(keys::PROFILE, &session.raw_profile)?;
        self.storage
            .save(keys::LOGIN_IDENTIFIER, &session.login_identifier)?;
        save_optional(&self.storage, keys::SECRET, &session.secret)?;
        save_optional(&self.storage, keys::USER_ID, &session.user_id)?;

        info!("Session saved for user: {}", session.login_identifier);
        self.tx.send_replace(Some(session.clone()));
        Ok(())
    }

    /// Remove the persisted session and publish the absence to observers.
    pub fn clear(&self) -> Result<(), StorageError> {
        for key in keys::ALL {
            self.storage.delete(key)?;
        }

        info!("Session cleared");
        self.tx.send_replace(None);
        Ok(())
    }

    /// Subscribe to session changes. Emits the current value immediately,
    /// then on every save/clear.
    pub fn observe(&self) -> watch::Receiver<Option<AuthSession>> {
        self.tx.subscribe()
    }

    /// Snapshot of the current session.
    pub fn snapshot(&self) -> Option<AuthSession> {
        self.tx.borrow().clone()
    }
}

fn read_session(storage: &Storage) -> Option<AuthSession> {
    let token: String = storage.load(keys::TOKEN).ok()?;
    if token.trim().is_empty() {
        return None;
    }

    Some(AuthSession {
        token,
        refresh_token: storage.load(keys::REFRESH_TOKEN).ok(),
        display_name: storage.load(keys::DISPLAY_NAME).unwrap_or_default(),
        raw_profile: storage.load(keys::PROFILE).unwrap_or_default(),
        login_identifier: storage.load(keys::LOGIN_IDENTIFIER).unwrap_or_default(),
        secret: storage.load(keys::SECRET).ok(),
        user_id: storage.load(keys::USER_ID).ok(),
    })
}

fn save_optional(
    storage: &Storage,
    key: &str,
    value: &Option<String>,
) -> Result<(), StorageError> {
    match value {
        Some(value) => storage.save(key, value),
        // A replaced session must not inherit stale optional fields.
        None => storage.delete(key),
    }
}
