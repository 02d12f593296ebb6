use tokio_tungstenite::tungstenite;

/// Errors produced by the chat client.
///
/// Expected failures never cross the coordinator boundary as `Err`; they are
/// rendered into the error slot of [`crate::ChatSnapshot`] instead. The
/// variants still matter internally and at the transport/service seams.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The channel could not be opened or was lost.
    #[error("transport error: {0}")]
    Transport(String),

    /// An inbound frame was not a valid envelope.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The data service answered with a non-success status.
    #[error("chat api returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A channel send while the channel is not open. The display text is
    /// what the error slot shows.
    #[error("Not connected to chat server")]
    NotConnected,

    /// A send with no current session. The display text is what the error
    /// slot shows.
    #[error("No active chat session")]
    NoActiveSession,

    /// The connection manager was torn down; it cannot be reused.
    #[error("connection manager has been disconnected")]
    Disconnected,

    #[error("session coordinator has stopped")]
    CoordinatorStopped,
}

impl ChatError {
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Io(io_err) => match io_err.kind() {
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted => {
                    Self::Transport("chat server is unavailable".to_string())
                }
                _ => Self::Transport(io_err.to_string()),
            },
            tungstenite::Error::Http(response) => {
                let status = response.status();
                Self::Api {
                    status: status.as_u16(),
                    message: status
                        .canonical_reason()
                        .unwrap_or("handshake rejected")
                        .to_string(),
                }
            }
            other => Self::Transport(other.to_string()),
        }
    }

    /// Whether the failure came from the channel or the wire format rather
    /// than from the application.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Protocol(_))
    }
}
