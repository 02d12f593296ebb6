//! # Portal Chat
//!
//! Client side of the portal's realtime chat: a session-bound WebSocket
//! channel that reconnects on its own, a REST data service for history and
//! a fallback send path, and a coordinator that keeps one consistent view of
//! "the current session and its transcript".
//!
//! ## Layers
//!
//! ```text
//! SessionCoordinator ──▶ ChatService (REST)        list / create / get / send / end
//!        │
//!        └──▶ ConnectionManager ──▶ Connector      one channel per selected session
//!                    │
//!                    └── ConnectionEvent queue ──▶ back into the coordinator
//! ```
//!
//! - [`connection::ConnectionManager`] owns exactly one channel and hides
//!   reconnect with exponential backoff from its owner.
//! - [`coordinator::SessionCoordinator`] is an actor. All mutations go through
//!   its task, and the UI observes a [`coordinator::ChatSnapshot`] through a
//!   `watch` channel.
//! - [`transport::Connector`] and [`service::ChatService`] are the seams tests
//!   replace with in-memory doubles.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use portal_chat::{CoordinatorConfig, HttpChatService, SessionCoordinator, WebSocketConnector};
//!
//! # async fn demo() -> Result<(), portal_chat::ChatError> {
//! let service = Arc::new(HttpChatService::new("http://localhost:8000", Some("token".into()))?);
//! let connector = Arc::new(WebSocketConnector::new("http://localhost:8000", Some("token".into())));
//! let chat = SessionCoordinator::spawn(service, connector, CoordinatorConfig::default());
//!
//! let Some(session) = chat.create_session("Support").await? else {
//!     return Ok(());
//! };
//! chat.select_session(session.id).await?;
//! chat.send_message("hello").await?;
//!
//! let mut updates = chat.subscribe();
//! while updates.changed().await.is_ok() {
//!     for message in &updates.borrow().messages {
//!         println!("{}: {}", message.message_type.as_str(), message.content);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_helpers;

pub use config::{ClientDirs, ConnectionConfig, CoordinatorConfig, FileConfig, load_config};
pub use connection::{ChannelEvent, ChannelId, ConnectionEvent, ConnectionManager, ConnectionState};
pub use coordinator::{ChatSnapshot, SessionCoordinator};
pub use error::ChatError;
pub use service::{ChatService, HttpChatService};
pub use transport::{Channel, Connector, WebSocketConnector};
pub use types::{Message, MessageOrigin, SendMessageResponse, Session, SessionId, SessionPage};
