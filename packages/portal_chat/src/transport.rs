//! Realtime channel abstraction and its WebSocket implementation.
//!
//! A [`Channel`] is just a pair of queues. The connection manager never sees
//! sockets, which lets tests drive it with in-memory channels.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, warn};

use crate::error::ChatError;

/// Deliberate local closure. Any other code counts as abnormal.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close frame without a status code.
pub const NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Client → server traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Close { code: u16, reason: String },
}

impl Outgoing {
    pub fn normal_close() -> Self {
        Self::Close {
            code: NORMAL_CLOSURE,
            reason: "User disconnected".to_string(),
        }
    }
}

/// Server → client traffic. `Closed` is always the last item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    Closed { code: u16, reason: String },
}

/// An established channel.
pub struct Channel {
    pub outgoing: mpsc::UnboundedSender<Outgoing>,
    pub incoming: mpsc::UnboundedReceiver<Incoming>,
}

/// Opens channels bound to a session binding id.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, binding_id: &str) -> Result<Channel, ChatError>;
}

/// Realtime endpoint for `binding_id`, rewriting an HTTP base URL to its
/// WebSocket scheme.
pub fn websocket_url(base_url: &str, binding_id: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/ws/chat/{binding_id}/")
}

/// [`Connector`] backed by `tokio-tungstenite`.
pub struct WebSocketConnector {
    base_url: String,
    api_token: Option<String>,
}

impl WebSocketConnector {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token,
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, binding_id: &str) -> Result<Channel, ChatError> {
        let url = websocket_url(&self.base_url, binding_id);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(ChatError::from_tungstenite)?;
        if let Some(token) = &self.api_token {
            let value = HeaderValue::from_str(&format!("Token {token}"))
                .map_err(|e| ChatError::Transport(format!("invalid api token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        debug!(url = %url, "opening websocket");
        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(ChatError::from_tungstenite)?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Incoming>();

        // Writer: drain outgoing queue → socket. Stops after sending a close.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                match msg {
                    Outgoing::Text(text) => {
                        if let Err(e) = ws_write.send(tungstenite::Message::Text(text.into())).await
                        {
                            debug!("websocket write error: {}", e);
                            break;
                        }
                    }
                    Outgoing::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = ws_write.send(tungstenite::Message::Close(Some(frame))).await;
                        break;
                    }
                }
            }
            let _ = ws_write.close().await;
        });

        // Reader: socket → incoming queue, always terminated by `Closed`.
        tokio::spawn(async move {
            let (code, reason) = loop {
                match ws_read.next().await {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if in_tx.send(Incoming::Text(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                            None => (NO_STATUS, String::new()),
                        };
                    }
                    Some(Ok(_)) => {
                        // Ping/pong are answered by tungstenite; binary is not part of the protocol.
                    }
                    Some(Err(e)) => {
                        warn!("websocket read error: {}", e);
                        break (ABNORMAL_CLOSURE, e.to_string());
                    }
                    None => break (ABNORMAL_CLOSURE, String::new()),
                }
            };
            let _ = in_tx.send(Incoming::Closed { code, reason });
        });

        Ok(Channel {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
