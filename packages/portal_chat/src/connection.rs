//! ConnectionManager: one realtime channel bound to one session.
//!
//! The manager hides reconnect logic from its owner. It reports everything it
//! observes as [`ConnectionEvent`]s on a queue, tagged with the manager's
//! [`ChannelId`] so the owner can drop events from a manager it has already
//! replaced.
//!
//! State machine:
//!
//! ```text
//!   idle ──connect()──▶ connecting ──open──▶ open
//!                          │                  │
//!                        failure          remote close / drop
//!                          ▼                  ▼
//!                        closed ◀─────────────┘
//!                          │
//!                 abnormal code and budget left: backoff, then connecting
//!
//!   disconnect() from any state: idle, terminal for this instance
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::ChatError;
use crate::protocol::{self, ClientFrame, ServerFrame};
use crate::transport::{ABNORMAL_CLOSURE, Channel, Connector, Incoming, NORMAL_CLOSURE, Outgoing};
use crate::types::Message;

/// Identifies one manager instance for its whole lifetime.
pub type ChannelId = u64;

/// Error text surfaced when the channel fails to open.
pub const CONNECTION_ERROR: &str = "Connection error";
/// Error text surfaced for an inbound frame that is not a valid envelope.
pub const PARSE_ERROR: &str = "Failed to parse message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// What a manager reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Message(Message),
    Typing { is_typing: bool, user_id: Option<i64> },
    Error(String),
    ConnectionChanged(bool),
}

/// Events from a manager, tagged with its id for routing.
pub type ChannelEvent = (ChannelId, ConnectionEvent);

struct Inner {
    state: ConnectionState,
    /// Reconnect attempts made since the channel was last open.
    attempts: u32,
    /// Present only while `state == Open`.
    writer: Option<mpsc::UnboundedSender<Outgoing>>,
    /// Token of the running connect/reconnect loop, if any.
    run: Option<CancellationToken>,
}

struct Shared {
    id: ChannelId,
    binding_id: String,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    events: mpsc::UnboundedSender<ChannelEvent>,
    /// Cancelled by `disconnect()`; parent of every run token.
    cancel: CancellationToken,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Callers hold the lock and have checked their run token, so nothing is
    /// emitted once `disconnect()` has returned.
    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send((self.id, event));
    }
}

/// Owns one realtime channel for one session binding id.
///
/// Dropping the manager disconnects it.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        id: ChannelId,
        binding_id: impl Into<String>,
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                binding_id: binding_id.into(),
                connector,
                config,
                events,
                cancel: CancellationToken::new(),
                inner: Mutex::new(Inner {
                    state: ConnectionState::Idle,
                    attempts: 0,
                    writer: None,
                    run: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn binding_id(&self) -> &str {
        &self.shared.binding_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Reconnect attempts made since the channel was last open.
    pub fn attempts(&self) -> u32 {
        self.shared.lock().attempts
    }

    /// Start connecting.
    ///
    /// The returned future resolves once the channel is open, or with the
    /// error of the first attempt if that one fails (reconnects continue in
    /// the background either way). It does not borrow the manager, so the
    /// owner can keep the manager while awaiting elsewhere.
    ///
    /// While already connecting or open this is a no-op that resolves
    /// immediately. From `closed` it resets the attempt counter and cancels
    /// any pending reconnect timer before trying again.
    pub fn connect(&self) -> impl Future<Output = Result<(), ChatError>> + Send + 'static {
        let started = self.start();
        async move {
            match started? {
                None => Ok(()),
                // The sender is dropped if we are disconnected mid-attempt.
                Some(ready) => ready.await.unwrap_or(Err(ChatError::Disconnected)),
            }
        }
    }

    fn start(&self) -> Result<Option<oneshot::Receiver<Result<(), ChatError>>>, ChatError> {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if shared.cancel.is_cancelled() {
            return Err(ChatError::Disconnected);
        }
        match inner.state {
            ConnectionState::Connecting | ConnectionState::Open => return Ok(None),
            ConnectionState::Idle | ConnectionState::Closed => {}
        }

        if let Some(pending) = inner.run.take() {
            pending.cancel();
        }
        let run = shared.cancel.child_token();
        inner.run = Some(run.clone());
        inner.attempts = 0;
        inner.state = ConnectionState::Connecting;
        drop(inner);

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(run_channel(shared.clone(), run, ready_tx));
        Ok(Some(ready_rx))
    }

    /// Send a chat message. Only valid while open; otherwise an error event
    /// is queued and nothing is sent. Returns whether the frame was written.
    pub fn send(&self, content: &str) -> bool {
        let frame = ClientFrame::Message {
            content: content.to_string(),
        };
        let inner = self.shared.lock();
        if self.write(&inner, &frame) {
            return true;
        }
        warn!(binding = %self.shared.binding_id, "chat channel is not connected");
        self.shared.emit(ConnectionEvent::Error(ChatError::NotConnected.to_string()));
        false
    }

    /// Best effort; silently dropped when not open.
    pub fn send_typing(&self, is_typing: bool) {
        let inner = self.shared.lock();
        if !self.write(&inner, &ClientFrame::Typing { is_typing }) {
            debug!(binding = %self.shared.binding_id, "dropping typing signal");
        }
    }

    fn write(&self, inner: &Inner, frame: &ClientFrame) -> bool {
        if inner.state != ConnectionState::Open {
            return false;
        }
        let Some(writer) = &inner.writer else {
            return false;
        };
        match frame.to_json() {
            Ok(text) => writer.send(Outgoing::Text(text)).is_ok(),
            Err(e) => {
                warn!("failed to encode chat frame: {}", e);
                false
            }
        }
    }

    /// Tear the channel down for good. Cancels any pending attempt or
    /// reconnect timer; no further events are emitted. Idempotent.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if shared.cancel.is_cancelled() {
            return;
        }
        shared.cancel.cancel();
        inner.run = None;
        inner.state = ConnectionState::Idle;
        if let Some(writer) = inner.writer.take() {
            let _ = writer.send(Outgoing::normal_close());
        }
        info!(binding = %shared.binding_id, channel = shared.id, "chat channel disconnected");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Connect, pump, and reconnect until told to stop or out of attempts.
async fn run_channel(
    shared: Arc<Shared>,
    run: CancellationToken,
    ready: oneshot::Sender<Result<(), ChatError>>,
) {
    let mut ready = Some(ready);
    loop {
        debug!(binding = %shared.binding_id, "opening chat channel");
        let opened = tokio::select! {
            _ = run.cancelled() => return,
            opened = shared.connector.open(&shared.binding_id) => opened,
        };

        let close_code = match opened {
            Ok(channel) => {
                {
                    let mut inner = shared.lock();
                    if run.is_cancelled() {
                        let _ = channel.outgoing.send(Outgoing::normal_close());
                        return;
                    }
                    inner.state = ConnectionState::Open;
                    inner.attempts = 0;
                    inner.writer = Some(channel.outgoing.clone());
                    shared.emit(ConnectionEvent::ConnectionChanged(true));
                }
                info!(binding = %shared.binding_id, "chat channel open");
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
                match pump(&shared, &run, channel).await {
                    Some(code) => code,
                    None => return,
                }
            }
            Err(err) => {
                warn!(binding = %shared.binding_id, error = %err, "chat channel failed to open");
                {
                    let mut inner = shared.lock();
                    if run.is_cancelled() {
                        return;
                    }
                    inner.state = ConnectionState::Closed;
                    shared.emit(ConnectionEvent::Error(CONNECTION_ERROR.to_string()));
                    shared.emit(ConnectionEvent::ConnectionChanged(false));
                }
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(err));
                }
                ABNORMAL_CLOSURE
            }
        };

        if close_code == NORMAL_CLOSURE {
            return;
        }

        let delay = {
            let mut inner = shared.lock();
            if run.is_cancelled() {
                return;
            }
            if inner.attempts >= shared.config.max_attempts {
                warn!(
                    binding = %shared.binding_id,
                    attempts = inner.attempts,
                    "reconnect budget exhausted, giving up"
                );
                inner.run = None;
                return;
            }
            inner.attempts += 1;
            let delay = shared.config.backoff_delay(inner.attempts);
            info!(
                binding = %shared.binding_id,
                attempt = inner.attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling chat channel reconnect"
            );
            delay
        };

        tokio::select! {
            _ = run.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let mut inner = shared.lock();
        if run.is_cancelled() {
            return;
        }
        inner.state = ConnectionState::Connecting;
    }
}

/// Deliver inbound frames until the channel closes. Returns the close code,
/// or `None` if the run was cancelled.
async fn pump(shared: &Shared, run: &CancellationToken, mut channel: Channel) -> Option<u16> {
    loop {
        let incoming = tokio::select! {
            _ = run.cancelled() => {
                let _ = channel.outgoing.send(Outgoing::normal_close());
                return None;
            }
            incoming = channel.incoming.recv() => incoming,
        };

        let (code, reason) = match incoming {
            Some(Incoming::Text(text)) => {
                dispatch(shared, run, &text);
                continue;
            }
            Some(Incoming::Closed { code, reason }) => (code, reason),
            None => (ABNORMAL_CLOSURE, String::new()),
        };

        let mut inner = shared.lock();
        if run.is_cancelled() {
            return None;
        }
        info!(binding = %shared.binding_id, code, reason = %reason, "chat channel closed");
        inner.writer = None;
        inner.state = ConnectionState::Closed;
        shared.emit(ConnectionEvent::ConnectionChanged(false));
        return Some(code);
    }
}

fn dispatch(shared: &Shared, run: &CancellationToken, text: &str) {
    let decoded = protocol::decode(text);
    let _inner = shared.lock();
    if run.is_cancelled() {
        return;
    }
    match decoded {
        Ok(Some(ServerFrame::Message(message))) => {
            shared.emit(ConnectionEvent::Message(message));
        }
        Ok(Some(ServerFrame::Typing { is_typing, user_id })) => {
            shared.emit(ConnectionEvent::Typing { is_typing, user_id });
        }
        Ok(Some(ServerFrame::Error(error))) => {
            shared.emit(ConnectionEvent::Error(error));
        }
        Ok(Some(ServerFrame::Unknown(kind))) => {
            warn!(binding = %shared.binding_id, kind = %kind, "dropping unknown chat frame");
        }
        Ok(None) => {
            debug!(binding = %shared.binding_id, "message frame without payload");
        }
        Err(e) => {
            warn!(binding = %shared.binding_id, error = %e, "malformed chat frame");
            shared.emit(ConnectionEvent::Error(PARSE_ERROR.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::Instant;

    use super::*;
    use crate::test_helpers::{MockConnector, Step};

    fn manager(
        connector: Arc<MockConnector>,
    ) -> (ConnectionManager, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mgr = ConnectionManager::new(7, "bind-a", connector, ConnectionConfig::default(), tx);
        (mgr, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Vec<ConnectionEvent> {
        let mut out = Vec::new();
        while let Ok((channel, event)) = rx.try_recv() {
            assert_eq!(channel, 7);
            out.push(event);
        }
        out
    }

    /// Let spawned tasks run without moving the paused clock.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_and_delivers_frames_in_order() {
        let (connector, mut servers) = MockConnector::new();
        let (mgr, mut rx) = manager(connector.clone());

        mgr.connect().await.unwrap();
        assert_eq!(mgr.state(), ConnectionState::Open);
        let server = servers.recv().await.unwrap();
        assert_eq!(server.binding_id, "bind-a");

        for i in 1..=3 {
            server.send_message(i, "assistant", &format!("m{i}"));
        }
        server.send_json(json!({"type": "typing", "is_typing": true, "user_id": 5}));
        settle().await;

        let events = drain(&mut rx);
        assert_eq!(events[0], ConnectionEvent::ConnectionChanged(true));
        let contents: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::Message(m) => Some(m.content.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(contents, vec!["m1", "m2", "m3"]);
        assert_eq!(
            events.last(),
            Some(&ConnectionEvent::Typing {
                is_typing: true,
                user_id: Some(5)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_frames_are_dropped_and_malformed_frames_surface_an_error() {
        let (connector, mut servers) = MockConnector::new();
        let (mgr, mut rx) = manager(connector);
        mgr.connect().await.unwrap();
        let server = servers.recv().await.unwrap();

        server.send_json(json!({"type": "presence", "users": [1, 2]}));
        server.send_text("{not json");
        server.send_json(json!({"type": "error", "error": "Chat session not found"}));
        settle().await;

        assert_eq!(
            drain(&mut rx),
            vec![
                ConnectionEvent::ConnectionChanged(true),
                ConnectionEvent::Error(PARSE_ERROR.into()),
                ConnectionEvent::Error("Chat session not found".into()),
            ]
        );
        // Neither kind of error touches the connection.
        assert_eq!(mgr.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn send_writes_envelopes_while_open() {
        let (connector, mut servers) = MockConnector::new();
        let (mgr, _rx) = manager(connector);
        mgr.connect().await.unwrap();
        let mut server = servers.recv().await.unwrap();

        assert!(mgr.send("hello"));
        mgr.send_typing(true);

        assert_eq!(
            server.recv().await,
            Some(Outgoing::Text(r#"{"type":"message","content":"hello"}"#.into()))
        );
        assert_eq!(
            server.recv().await,
            Some(Outgoing::Text(r#"{"type":"typing","is_typing":true}"#.into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_when_not_open_reports_error_but_typing_is_silent() {
        let (connector, _servers) = MockConnector::new();
        let (mgr, mut rx) = manager(connector);

        assert!(!mgr.send("hello"));
        mgr.send_typing(true);

        assert_eq!(
            drain(&mut rx),
            vec![ConnectionEvent::Error(ChatError::NotConnected.to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reentrant_connect_is_a_noop() {
        let (connector, _servers) = MockConnector::new();
        let (mgr, _rx) = manager(connector.clone());

        mgr.connect().await.unwrap();
        mgr.connect().await.unwrap();
        mgr.connect().await.unwrap();
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_reconnects_after_base_delay_and_resets_attempts() {
        let (connector, mut servers) = MockConnector::new();
        let (mgr, mut rx) = manager(connector.clone());
        mgr.connect().await.unwrap();
        let server = servers.recv().await.unwrap();

        server.close(ABNORMAL_CLOSURE);
        settle().await;
        assert_eq!(mgr.state(), ConnectionState::Closed);
        assert_eq!(mgr.attempts(), 1);

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(connector.open_count(), 1);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(connector.open_count(), 2);
        assert_eq!(mgr.state(), ConnectionState::Open);
        assert_eq!(mgr.attempts(), 0);

        assert_eq!(
            drain(&mut rx),
            vec![
                ConnectionEvent::ConnectionChanged(true),
                ConnectionEvent::ConnectionChanged(false),
                ConnectionEvent::ConnectionChanged(true),
            ]
        );

        // A later drop starts again from the base delay.
        let second = servers.recv().await.unwrap();
        second.close(ABNORMAL_CLOSURE);
        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(connector.open_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn normal_close_does_not_reconnect() {
        let (connector, mut servers) = MockConnector::new();
        let (mgr, _rx) = manager(connector.clone());
        mgr.connect().await.unwrap();
        servers.recv().await.unwrap().close(NORMAL_CLOSURE);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.open_count(), 1);
        assert_eq!(mgr.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_until_budget_is_exhausted() {
        let (connector, _servers) = MockConnector::new();
        for _ in 0..6 {
            connector.push(Step::Refuse);
        }
        let (mgr, mut rx) = manager(connector.clone());

        assert!(mgr.connect().await.is_err());
        tokio::time::sleep(Duration::from_secs(300)).await;

        let opens = connector.open_times();
        assert_eq!(opens.len(), 6);
        let gaps: Vec<u64> = opens
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis() as u64)
            .collect();
        assert_eq!(gaps, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(mgr.state(), ConnectionState::Closed);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 12);
        assert_eq!(events.last(), Some(&ConnectionEvent::ConnectionChanged(false)));

        // A manual connect after giving up starts over.
        mgr.connect().await.unwrap();
        assert_eq!(connector.open_count(), 7);
        assert_eq!(mgr.attempts(), 0);
        assert_eq!(mgr.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_connect_during_backoff_cancels_pending_timer() {
        let (connector, _servers) = MockConnector::new();
        connector.push(Step::Refuse);
        let (mgr, _rx) = manager(connector.clone());

        assert!(mgr.connect().await.is_err());
        assert_eq!(mgr.attempts(), 1);

        mgr.connect().await.unwrap();
        assert_eq!(connector.open_count(), 2);

        // The cancelled timer must not open a second channel.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_connecting_silences_the_attempt() {
        let (connector, _servers) = MockConnector::new();
        let gate = connector.hold();
        let (mgr, mut rx) = manager(connector.clone());

        let pending = mgr.connect();
        settle().await;
        assert_eq!(mgr.state(), ConnectionState::Connecting);

        mgr.disconnect();
        let _ = gate.send(());
        assert!(matches!(pending.await, Err(ChatError::Disconnected)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(mgr.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_normally_and_is_terminal() {
        let (connector, mut servers) = MockConnector::new();
        let (mgr, mut rx) = manager(connector.clone());
        mgr.connect().await.unwrap();
        let mut server = servers.recv().await.unwrap();
        drain(&mut rx);

        mgr.disconnect();
        mgr.disconnect();
        assert_eq!(server.recv().await, Some(Outgoing::normal_close()));

        // Frames racing the teardown are discarded.
        server.send_message(1, "assistant", "late");
        settle().await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        assert!(matches!(mgr.connect().await, Err(ChatError::Disconnected)));
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_disconnects() {
        let (connector, mut servers) = MockConnector::new();
        let (mgr, _rx) = manager(connector);
        mgr.connect().await.unwrap();
        let mut server = servers.recv().await.unwrap();

        drop(mgr);
        assert_eq!(server.recv().await, Some(Outgoing::normal_close()));
    }
}
