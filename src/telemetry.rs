//! Telemetry Module
//!
//! Bridges location acquisition to the realtime connection: one-shot
//! reports plus a continuous mode that feeds the outbound channel from two
//! producers — the driver's push subscription and a fixed-interval poll.
//! The poll guarantees a minimum reporting cadence even when the push
//! source goes quiet.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::location::{LocationError, LocationSample, LocationSource, WatchHandle};
use crate::session::AuthSession;
use crate::socket::{ConnectionManager, OutboundEvent};

/// Observable loop state, derived from the streams feeding the loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryState {
    pub is_sending_continuously: bool,
    pub last_sample: Option<LocationSample>,
    pub last_error: Option<String>,
}

/// One active continuous run: its producers and the subscription they
/// drain.
struct ContinuousRun {
    cancel: CancellationToken,
    watch_handle: WatchHandle,
    pump: JoinHandle<()>,
    poller: JoinHandle<()>,
}

/// Drives location reporting over the realtime connection, gated by
/// permission state and the client-local continuous-sending intent. The
/// server-pushed tracking flag stays observable on the connection manager
/// and does not gate client sends.
pub struct TelemetryLoop {
    source: Arc<LocationSource>,
    connection: Arc<ConnectionManager>,
    session: watch::Receiver<Option<AuthSession>>,
    report_interval: Duration,
    state: Arc<watch::Sender<TelemetryState>>,
    running: Mutex<Option<ContinuousRun>>,
}

impl TelemetryLoop {
    pub fn new(
        source: Arc<LocationSource>,
        connection: Arc<ConnectionManager>,
        session: watch::Receiver<Option<AuthSession>>,
        report_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(TelemetryState::default());
        Self {
            source,
            connection,
            session,
            report_interval,
            state: Arc::new(state),
            running: Mutex::new(None),
        }
    }

    /// Stream of loop state changes.
    pub fn state(&self) -> watch::Receiver<TelemetryState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> TelemetryState {
        self.state.borrow().clone()
    }

    /// Fetch one sample and report it.
    ///
    /// Permission is re-read on every call. A missing identity is a
    /// distinct error — the sample is still recorded, never silently
    /// dropped on the floor.
    pub async fn fetch_once(&self) -> Result<LocationSample, TelemetryError> {
        let sample = match self.source.fetch_current().await {
            Ok(sample) => sample,
            Err(e) => {
                let e = TelemetryError::from(e);
                self.report_error(e.to_string());
                return Err(e);
            }
        };

        self.state.send_modify(|s| {
            s.last_sample = Some(sample);
            s.last_error = None;
        });

        let Some(user_id) = self.user_id() else {
            let e = TelemetryError::IdentityUnavailable;
            self.report_error(e.to_string());
            return Err(e);
        };

        // send() itself drops the event with a warning when disconnected.
        self.connection.send(OutboundEvent::LocationUpdate {
            user_id,
            sample,
        });
        Ok(sample)
    }

    /// Begin continuous reporting. A second call while running is a no-op.
    pub fn start_continuous(&self) -> Result<(), TelemetryError> {
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            debug!("Continuous sending already active");
            return Ok(());
        }

        if !self.source.permission_granted() {
            let e = TelemetryError::Permission;
            self.report_error(e.to_string());
            return Err(e);
        }

        let Some(user_id) = self.user_id() else {
            let e = TelemetryError::IdentityUnavailable;
            self.report_error(e.to_string());
            return Err(e);
        };

        if !self.connection.is_connected() {
            self.connection.connect();
        }

        let (watch_handle, mut updates) = self.source.start_watch()?;
        let cancel = CancellationToken::new();

        self.state.send_modify(|s| {
            s.is_sending_continuously = true;
            s.last_error = None;
        });
        info!("Continuous location sending started");

        // Producer (a): the driver's push subscription.
        let pump = {
            let cancel = cancel.clone();
            let connection = self.connection.clone();
            let state = self.state.clone();
            let user_id = user_id.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sample = updates.recv() => {
                            let Some(sample) = sample else { return };
                            state.send_modify(|s| s.last_sample = Some(sample));
                            if cancel.is_cancelled() {
                                return;
                            }
                            connection.send(OutboundEvent::LocationUpdate {
                                user_id: user_id.clone(),
                                sample,
                            });
                        }
                    }
                }
            })
        };

        // Producer (b): the fixed-interval poll.
        let poller = {
            let cancel = cancel.clone();
            let connection = self.connection.clone();
            let source = self.source.clone();
            let state = self.state.clone();
            let report_interval = self.report_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(report_interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = interval.tick() => {
                            match source.fetch_current().await {
                                Ok(sample) => {
                                    state.send_modify(|s| s.last_sample = Some(sample));
                                    if cancel.is_cancelled() {
                                        return;
                                    }
                                    connection.send(OutboundEvent::LocationUpdate {
                                        user_id: user_id.clone(),
                                        sample,
                                    });
                                }
                                Err(e) => {
                                    // One bad fetch never stops the loop.
                                    warn!("Periodic location fetch failed: {}", e);
                                }
                            }
                        }
                    }
                }
            })
        };

        *running = Some(ContinuousRun {
            cancel,
            watch_handle,
            pump,
            poller,
        });
        Ok(())
    }

    /// Stop continuous reporting. Always succeeds; once this returns, no
    /// further sends originate from the stopped run.
    pub fn stop_continuous(&self) {
        let mut running = self.running.lock().unwrap();
        let Some(run) = running.take() else {
            debug!("Continuous sending not active");
            return;
        };

        run.cancel.cancel();
        run.pump.abort();
        run.poller.abort();
        self.source.stop_watch(run.watch_handle);

        self.state
            .send_modify(|s| s.is_sending_continuously = false);
        info!("Continuous location sending stopped");
    }

    fn user_id(&self) -> Option<String> {
        self.session
            .borrow()
            .as_ref()
            .and_then(|s| s.user_id.clone())
    }

    fn report_error(&self, message: String) {
        warn!("{}", message);
        self.state.send_modify(|s| s.last_error = Some(message));
    }
}

impl Drop for TelemetryLoop {
    fn drop(&mut self) {
        self.stop_continuous();
    }
}

/// Telemetry errors
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Location permission not granted")]
    Permission,

    #[error("No user identity available; sign in first")]
    IdentityUnavailable,

    #[error("Location fetch failed: {0}")]
    Fetch(String),
}

impl From<LocationError> for TelemetryError {
    fn from(e: LocationError) -> Self {
        match e {
            LocationError::PermissionDenied => TelemetryError::Permission,
            other => TelemetryError::Fetch(other.to_string()),
        }
    }
}
