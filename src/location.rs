//! Location Module
//!
//! Wraps the device positioning capability behind a narrow driver trait:
//! one-shot fixes plus a single continuous-update subscription, both gated
//! by the permission state the driver reports.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One position fix. Immutable once produced, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f32>,
    pub captured_at_ms: i64,
}

impl LocationSample {
    /// Build a sample stamped with the current wall-clock time.
    pub fn now(latitude: f64, longitude: f64, accuracy: Option<f32>) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            captured_at_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Opaque identifier of one active continuous-update subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchHandle(u32);

/// The device positioning capability, implemented by the host application.
#[async_trait]
pub trait PositioningDriver: Send + Sync {
    /// Current permission state. Callers re-read this on every operation
    /// rather than trusting a cached value.
    fn permission_granted(&self) -> bool;

    /// Request one position fix. Dropping the returned future cancels the
    /// request; neither success nor failure surfaces afterwards.
    async fn current_position(&self) -> Result<LocationSample, LocationError>;

    /// Begin pushing fixes into `updates` until `stop_updates` is called.
    fn start_updates(
        &self,
        updates: mpsc::UnboundedSender<LocationSample>,
    ) -> Result<(), LocationError>;

    /// Stop the continuous updates started by `start_updates`.
    fn stop_updates(&self);
}

/// Permission-gated facade over a [`PositioningDriver`].
///
/// At most one watch may be outstanding at a time; asking for a second
/// while one is active is a caller error.
pub struct LocationSource {
    driver: Arc<dyn PositioningDriver>,
    watch_counter: AtomicU32,
    active_watch: Mutex<Option<u32>>,
}

impl LocationSource {
    pub fn new(driver: Arc<dyn PositioningDriver>) -> Self {
        Self {
            driver,
            watch_counter: AtomicU32::new(1),
            active_watch: Mutex::new(None),
        }
    }

    /// Snapshot of the driver's permission state.
    pub fn permission_granted(&self) -> bool {
        self.driver.permission_granted()
    }

    /// Fetch one sample, re-checking permission first.
    pub async fn fetch_current(&self) -> Result<LocationSample, LocationError> {
        if !self.driver.permission_granted() {
            return Err(LocationError::PermissionDenied);
        }
        self.driver.current_position().await
    }

    /// Open the continuous-update subscription.
    pub fn start_watch(
        &self,
    ) -> Result<(WatchHandle, mpsc::UnboundedReceiver<LocationSample>), LocationError> {
        if !self.driver.permission_granted() {
            return Err(LocationError::PermissionDenied);
        }

        let mut active = self.active_watch.lock().unwrap();
        if active.is_some() {
            return Err(LocationError::WatchActive);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.driver.start_updates(tx)?;

        let id = self.watch_counter.fetch_add(1, Ordering::Relaxed);
        *active = Some(id);
        debug!("Location watch {} started", id);
        Ok((WatchHandle(id), rx))
    }

    /// Close the subscription identified by `handle`. Handles from an
    /// already-stopped watch are ignored.
    pub fn stop_watch(&self, handle: WatchHandle) {
        let mut active = self.active_watch.lock().unwrap();
        if *active == Some(handle.0) {
            self.driver.stop_updates();
            *active = None;
            debug!("Location watch {} stopped", handle.0);
        } else {
            warn!("Ignoring stale location watch handle {}", handle.0);
        }
    }
}

/// Location errors
#[derive(Debug, thiserror::Error)]
pub enum LocationError {
    #[error("Location permission not granted")]
    PermissionDenied,

    #[error("A location watch is already active")]
    WatchActive,

    #[error("Location fetch failed: {0}")]
    Fetch(String),
}


#[cfg(test)]
mod tests {
    use super::testing::FakeDriver;
    use super::*;
    use std::sync::atomic::Ordering as AtomicOrdering;

    #[tokio::test]
    async fn fetch_respects_permission() {
        let driver = Arc::new(FakeDriver::new());
        let source = LocationSource::new(driver.clone());

        driver.permission.store(false, AtomicOrdering::SeqCst);
        assert!(matches!(
            source.fetch_current().await,
            Err(LocationError::PermissionDenied)
        ));

        driver.permission.store(true, AtomicOrdering::SeqCst);
        let sample = source.fetch_current().await.unwrap();
        assert_eq!(sample.latitude, 10.0);
    }

    #[tokio::test]
    async fn only_one_watch_may_be_outstanding() {
        let driver = Arc::new(FakeDriver::new());
        let source = LocationSource::new(driver.clone());

        let (handle, _rx) = source.start_watch().unwrap();
        assert!(matches!(
            source.start_watch(),
            Err(LocationError::WatchActive)
        ));

        source.stop_watch(handle);
        assert!(!driver.has_subscriber());

        // A new watch is allowed once the previous one is stopped.
        let (_handle, _rx) = source.start_watch().unwrap();
        assert_eq!(driver.subscribe_count.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_handles_do_not_kill_the_active_watch() {
        let driver = Arc::new(FakeDriver::new());
        let source = LocationSource::new(driver.clone());

        let (stale, _rx) = source.start_watch().unwrap();
        source.stop_watch(stale);

        let (_active, _rx2) = source.start_watch().unwrap();
        source.stop_watch(stale);
        assert!(driver.has_subscriber());
    }

    #[tokio::test]
    async fn pushed_samples_arrive_on_the_subscription() {
        let driver = Arc::new(FakeDriver::new());
        let source = LocationSource::new(driver.clone());

        let (_handle, mut rx) = source.start_watch().unwrap();
        driver.push(LocationSample::now(1.0, 2.0, None));

        let sample = rx.recv().await.unwrap();
        assert_eq!((sample.latitude, sample.longitude), (1.0, 2.0));
    }
}
