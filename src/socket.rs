//! Realtime Channel Module
//!
//! Owns the single connection to the realtime ingestion endpoint: a state
//! machine with automatic reconnection, a server-pushed tracking flag, and
//! fire-and-forget outbound sends.

use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::location::LocationSample;

/// Lifecycle of the realtime connection. Exactly one value holds at any
/// time; disconnect reasons are logged, not modeled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// Messages the engine emits over the realtime channel.
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    LocationUpdate {
        user_id: String,
        sample: LocationSample,
    },
    TrackingStatusRequest,
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::LocationUpdate { .. } => "location:update",
            OutboundEvent::TrackingStatusRequest => "tracking:getStatus",
        }
    }

    fn to_frame(&self) -> String {
        match self {
            OutboundEvent::LocationUpdate { user_id, sample } => {
                let mut data = serde_json::json!({
                    "userId": user_id,
                    "latitude": sample.latitude,
                    "longitude": sample.longitude,
                    "timestamp": sample.captured_at_ms,
                });
                if let Some(accuracy) = sample.accuracy {
                    data["accuracy"] = serde_json::json!(accuracy);
                }
                serde_json::json!({"event": self.name(), "data": data}).to_string()
            }
            OutboundEvent::TrackingStatusRequest => {
                serde_json::json!({"event": self.name()}).to_string()
            }
        }
    }
}

/// Endpoint and timing knobs plus the observable state the driver task
/// publishes into.
struct Shared {
    socket_url: String,
    connect_timeout: Duration,
    reconnect_initial_delay: Duration,
    reconnect_max_delay: Duration,
    state_tx: watch::Sender<ConnectionState>,
    tracking_tx: watch::Sender<bool>,
    server_error_tx: watch::Sender<Option<String>>,
}

/// One live connection attempt/session: its cancel token, its outbound
/// queue and the driver task that owns the transport.
struct Driver {
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<OutboundEvent>,
    task: JoinHandle<()>,
}

/// Manages the one logical connection to the realtime endpoint.
///
/// The transport is owned exclusively by a driver task; `connect` calls
/// arriving while one is live are folded into it, so two transports never
/// coexist.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    driver: Mutex<Option<Driver>>,
}

impl ConnectionManager {
    pub fn new(config: &EngineConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (tracking_tx, _) = watch::channel(false);
        let (server_error_tx, _) = watch::channel(None);

        Self {
            shared: Arc::new(Shared {
                socket_url: normalize_ws_url(&config.socket_url),
                connect_timeout: config.connect_timeout,
                reconnect_initial_delay: config.reconnect_initial_delay,
                reconnect_max_delay: config.reconnect_max_delay,
                state_tx,
                tracking_tx,
                server_error_tx,
            }),
            driver: Mutex::new(None),
        }
    }

    /// Open the connection. A no-op while a connect attempt or session is
    /// already live; reconnection after that point is the driver task's
    /// job, with unbounded retries under a capped backoff.
    pub fn connect(&self) {
        let mut driver = self.driver.lock().unwrap();
        if let Some(d) = driver.as_ref() {
            if !d.task.is_finished() {
                debug!("connect() ignored: connection driver already active");
                return;
            }
        }

        info!("Opening realtime connection to {}", self.shared.socket_url);
        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_driver(self.shared.clone(), outbound_rx, cancel.clone()));

        *driver = Some(Driver {
            cancel,
            outbound: outbound_tx,
            task,
        });
    }

    /// Tear down the transport and force `Disconnected`. Safe to call when
    /// already disconnected.
    pub fn disconnect(&self) {
        if let Some(d) = self.driver.lock().unwrap().take() {
            d.cancel.cancel();
            d.task.abort();
        }

        self.shared
            .state_tx
            .send_replace(ConnectionState::Disconnected);
        self.shared.tracking_tx.send_replace(false);
        info!("Realtime connection closed");
    }

    /// Emit a message over the channel. Dropped with a warning unless the
    /// connection is up; never blocks the caller.
    pub fn send(&self, event: OutboundEvent) {
        if !self.is_connected() {
            warn!("Not connected; dropping outbound {} event", event.name());
            return;
        }

        if let Some(d) = self.driver.lock().unwrap().as_ref() {
            let _ = d.outbound.send(event);
        }
    }

    /// Stream of connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Stream of the server-pushed tracking flag. Defaults to `false` and
    /// resets to `false` on every disconnect.
    pub fn tracking_enabled(&self) -> watch::Receiver<bool> {
        self.shared.tracking_tx.subscribe()
    }

    /// Stream of the latest server-reported error, if any.
    pub fn server_error(&self) -> watch::Receiver<Option<String>> {
        self.shared.server_error_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.state_tx.borrow() == ConnectionState::Connected
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(d) = self.driver.lock().unwrap().take() {
            d.cancel.cancel();
            d.task.abort();
        }
    }
}

fn normalize_ws_url(url: &str) -> String {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        url.to_string()
    } else {
        format!("ws://{}", url)
    }
}

/// Why a session ended; reasons are logged, never surfaced as state.
enum SessionEnd {
    Cancelled,
    Closed(String),
    Transport(String),
}

async fn run_driver(
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundEvent>,
    cancel: CancellationToken,
) {
    let mut delay = shared.reconnect_initial_delay;

    loop {
        shared.state_tx.send_replace(ConnectionState::Connecting);

        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            attempt = timeout(shared.connect_timeout, connect_async(shared.socket_url.as_str())) => attempt,
        };

        match attempt {
            Ok(Ok((stream, _response))) => {
                info!("Connected to realtime endpoint");
                delay = shared.reconnect_initial_delay;
                shared.state_tx.send_replace(ConnectionState::Connected);

                let end = run_session(&shared, stream, &mut outbound_rx, &cancel).await;

                shared
                    .state_tx
                    .send_replace(ConnectionState::Disconnected);
                shared.tracking_tx.send_replace(false);

                match end {
                    SessionEnd::Cancelled => return,
                    SessionEnd::Closed(reason) => {
                        warn!("Disconnected from realtime endpoint: {}", reason);
                    }
                    SessionEnd::Transport(detail) => {
                        error!("Realtime session error: {}", detail);
                    }
                }
            }
            Ok(Err(e)) => {
                error!("Realtime connect failed: {}", e);
                shared
                    .state_tx
                    .send_replace(ConnectionState::Error(e.to_string()));
            }
            Err(_elapsed) => {
                error!(
                    "Realtime connect attempt timed out after {:?}",
                    shared.connect_timeout
                );
                shared
                    .state_tx
                    .send_replace(ConnectionState::Error("connect attempt timed out".into()));
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }
        delay = (delay * 2).min(shared.reconnect_max_delay);
    }
}

/// A single connected session: one dispatcher selecting over the outbound
/// queue and the inbound stream until either side ends it.
async fn run_session(
    shared: &Shared,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundEvent>,
    cancel: &CancellationToken,
) -> SessionEnd {
    let (mut write, mut read) = stream.split();

    // Ask the server for the current tracking flag right away.
    let status_request = OutboundEvent::TrackingStatusRequest.to_frame();
    if let Err(e) = write.send(Message::Text(status_request)).await {
        return SessionEnd::Transport(e.to_string());
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            event = outbound_rx.recv() => {
                let Some(event) = event else {
                    return SessionEnd::Cancelled;
                };
                debug!("Sending {} event", event.name());
                if let Err(e) = write.send(Message::Text(event.to_frame())).await {
                    return SessionEnd::Transport(e.to_string());
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch_inbound(shared, &text),
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            return SessionEnd::Transport(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                        return SessionEnd::Closed(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Transport(e.to_string()),
                    None => return SessionEnd::Closed("stream ended".to_string()),
                }
            }
        }
    }
}

fn dispatch_inbound(shared: &Shared, text: &str) {
    let Ok(frame) = serde_json::from_str::<serde_json::Value>(text) else {
        warn!("Unparseable inbound frame: {}", text);
        return;
    };

    let event = frame["event"].as_str().unwrap_or("");
    let data = &frame["data"];

    match event {
        // Three spellings of the same server-side signal.
        "tracking:statusChanged" | "tracking:status" | "tracking:statusResponse" => {
            let active = data["active"].as_bool().unwrap_or(false);
            debug!("Tracking status: {}", active);
            shared.tracking_tx.send_replace(active);
        }
        "location:confirmed" => {
            debug!("Location confirmed: {}", data);
        }
        "location:error" => {
            let message = data["message"]
                .as_str()
                .unwrap_or("Unknown location error")
                .to_string();
            error!("Server rejected location: {}", message);
            shared.server_error_tx.send_replace(Some(message));
        }
        "welcome" => {
            debug!("Server welcome: {}", data);
        }
        "error" => {
            let message = data
                .as_str()
                .map(str::to_string)
                .or_else(|| data["message"].as_str().map(str::to_string))
                .unwrap_or_else(|| "Unknown server error".to_string());
            error!("Server error: {}", message);
            shared.server_error_tx.send_replace(Some(message));
        }
        other => {
            debug!("Ignoring inbound event: {}", other);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;

    /// Minimal realtime peer: accepts connections one at a time, records
    /// every inbound frame and forwards scripted frames to the client.
    pub struct TestServer {
        pub url: String,
        pub accepted: Arc<AtomicU32>,
        pub inbound: mpsc::UnboundedReceiver<serde_json::Value>,
        push_tx: mpsc::UnboundedSender<String>,
    }

    impl TestServer {
        pub async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let accepted = Arc::new(AtomicU32::new(0));
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();

            let accept_counter = accepted.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((tcp, _)) = listener.accept().await else {
                        return;
                    };
                    accept_counter.fetch_add(1, Ordering::SeqCst);
                    let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
                        continue;
                    };
                    let (mut write, mut read) = ws.split();

                    loop {
                        tokio::select! {
                            frame = push_rx.recv() => {
                                let Some(text) = frame else { return };
                                if write.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        if let Ok(value) = serde_json::from_str(&text) {
                                            let _ = in_tx.send(value);
                                        }
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                        }
                    }
                }
            });

            Self {
                url: format!("ws://{}", addr),
                accepted,
                inbound: in_rx,
                push_tx,
            }
        }

        pub fn push(&self, event: &str, data: serde_json::Value) {
            let frame = serde_json::json!({"event": event, "data": data}).to_string();
            self.push_tx.send(frame).unwrap();
        }
    }

    pub fn fast_config(socket_url: &str) -> EngineConfig {
        EngineConfig {
            socket_url: socket_url.to_string(),
            connect_timeout: Duration::from_secs(2),
            reconnect_initial_delay: Duration::from_millis(50),
            reconnect_max_delay: Duration::from_millis(200),
            ..EngineConfig::default()
        }
    }

    /// Wait until a watched value satisfies the predicate.
    pub async fn wait_until<T>(rx: &mut watch::Receiver<T>, pred: impl Fn(&T) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if pred(&rx.borrow_and_update()) {
                    return;
                }
                rx.changed().await.expect("watch closed");
            }
        })
        .await
        .expect("condition not reached in time");
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{fast_config, wait_until, TestServer};
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn connect_reaches_connected_and_requests_tracking_status() {
        let mut server = TestServer::start().await;
        let manager = ConnectionManager::new(&fast_config(&server.url));

        manager.connect();
        let mut state = manager.state();
        wait_until(&mut state, |s| *s == ConnectionState::Connected).await;

        let first = server.inbound.recv().await.unwrap();
        assert_eq!(first["event"], "tracking:getStatus");
    }

    #[tokio::test]
    async fn duplicate_connect_calls_fold_into_one_transport() {
        let server = TestServer::start().await;
        let manager = ConnectionManager::new(&fast_config(&server.url));

        manager.connect();
        manager.connect();

        let mut state = manager.state();
        wait_until(&mut state, |s| *s == ConnectionState::Connected).await;
        manager.connect();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tracking_pushes_flip_the_flag_in_any_spelling() {
        let server = TestServer::start().await;
        let manager = ConnectionManager::new(&fast_config(&server.url));

        manager.connect();
        let mut state = manager.state();
        wait_until(&mut state, |s| *s == ConnectionState::Connected).await;

        let mut tracking = manager.tracking_enabled();
        assert!(!*tracking.borrow());

        server.push("tracking:statusChanged", serde_json::json!({"active": true}));
        wait_until(&mut tracking, |active| *active).await;

        server.push("tracking:status", serde_json::json!({"active": false}));
        wait_until(&mut tracking, |active| !*active).await;

        server.push("tracking:statusResponse", serde_json::json!({"active": true}));
        wait_until(&mut tracking, |active| *active).await;
    }

    #[tokio::test]
    async fn disconnect_forces_disconnected_and_tracking_off() {
        let server = TestServer::start().await;
        let manager = ConnectionManager::new(&fast_config(&server.url));

        manager.connect();
        let mut state = manager.state();
        wait_until(&mut state, |s| *s == ConnectionState::Connected).await;

        server.push("tracking:statusChanged", serde_json::json!({"active": true}));
        let mut tracking = manager.tracking_enabled();
        wait_until(&mut tracking, |active| *active).await;

        manager.disconnect();
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        assert!(!*manager.tracking_enabled().borrow());

        // Idempotent.
        manager.disconnect();
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn send_while_disconnected_is_dropped() {
        let server = TestServer::start().await;
        let manager = ConnectionManager::new(&fast_config(&server.url));

        manager.send(OutboundEvent::TrackingStatusRequest);
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        drop(server);
    }

    #[tokio::test]
    async fn send_when_connected_delivers_the_envelope() {
        let mut server = TestServer::start().await;
        let manager = ConnectionManager::new(&fast_config(&server.url));

        manager.connect();
        let mut state = manager.state();
        wait_until(&mut state, |s| *s == ConnectionState::Connected).await;

        let sample = LocationSample {
            latitude: 4.5,
            longitude: -74.1,
            accuracy: Some(8.0),
            captured_at_ms: 1_700_000_000_000,
        };
        manager.send(OutboundEvent::LocationUpdate {
            user_id: "42".into(),
            sample,
        });

        // First frame is the tracking-status request sent on connect.
        let first = server.inbound.recv().await.unwrap();
        assert_eq!(first["event"], "tracking:getStatus");

        let frame = server.inbound.recv().await.unwrap();
        assert_eq!(frame["event"], "location:update");
        assert_eq!(frame["data"]["userId"], "42");
        assert_eq!(frame["data"]["latitude"], 4.5);
        assert_eq!(frame["data"]["timestamp"], 1_700_000_000_000_i64);
        assert_eq!(frame["data"]["accuracy"], 8.0);
    }

    #[tokio::test]
    async fn accuracy_is_omitted_when_unknown() {
        let event = OutboundEvent::LocationUpdate {
            user_id: "42".into(),
            sample: LocationSample {
                latitude: 1.0,
                longitude: 2.0,
                accuracy: None,
                captured_at_ms: 7,
            },
        };
        let frame: serde_json::Value = serde_json::from_str(&event.to_frame()).unwrap();
        assert!(frame["data"].get("accuracy").is_none());
    }

    #[tokio::test]
    async fn unanswered_connect_times_out_then_retries() {
        // Hold a listener open but never accept: the TCP connect lands in
        // the kernel backlog and the websocket handshake never completes,
        // so each attempt runs into the per-attempt timeout.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = fast_config(&format!("ws://{}", addr));
        config.connect_timeout = Duration::from_millis(300);
        let manager = ConnectionManager::new(&config);

        manager.connect();
        let mut state = manager.state();
        wait_until(&mut state, |s| {
            matches!(s, ConnectionState::Error(m) if m.contains("timed out"))
        })
        .await;

        // The backoff elapses and the driver heads back into Connecting.
        wait_until(&mut state, |s| *s == ConnectionState::Connecting).await;
        manager.disconnect();
        drop(listener);
    }

    #[tokio::test]
    async fn server_errors_are_published() {
        let server = TestServer::start().await;
        let manager = ConnectionManager::new(&fast_config(&server.url));

        manager.connect();
        let mut state = manager.state();
        wait_until(&mut state, |s| *s == ConnectionState::Connected).await;

        server.push("location:error", serde_json::json!({"message": "out of zone"}));
        let mut errors = manager.server_error();
        wait_until(&mut errors, |e| e.as_deref() == Some("out of zone")).await;
    }
}
