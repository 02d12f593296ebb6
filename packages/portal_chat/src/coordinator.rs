//! SessionCoordinator: the single source of truth for which session is
//! current and what it has said.
//!
//! All state lives in one task. Commands from the handle, events from the
//! current [`ConnectionManager`], and completions of data-service calls are
//! queued to that task and applied one at a time, so nothing needs a lock.
//!
//! Data-service calls run concurrently with everything else, so their
//! results can arrive after the state they were issued against has moved on.
//! A session fetch carries the select epoch it was issued under and is
//! dropped if another select (or an end) superseded it. A fallback send
//! carries the session id it was sent to and only lands in the transcript of
//! that session. While a select of that same session is still loading, the
//! reply is held back and merged into the fetched history.

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::connection::{ChannelEvent, ChannelId, ConnectionEvent, ConnectionManager};
use crate::error::ChatError;
use crate::service::ChatService;
use crate::transport::Connector;
use crate::types::{Message, SendMessageResponse, Session, SessionId, SessionPage};

pub const LOAD_SESSIONS_FAILED: &str = "Failed to load chat sessions";
pub const CREATE_SESSION_FAILED: &str = "Failed to create chat session";
pub const LOAD_SESSION_FAILED: &str = "Failed to load chat session";
pub const SEND_FAILED: &str = "Failed to send message";
pub const END_SESSION_FAILED: &str = "Failed to end chat session";
pub const CONNECT_FAILED: &str = "Failed to connect to chat server";

/// Everything the UI renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatSnapshot {
    /// Known sessions, in the order the service returned them.
    pub sessions: Vec<Session>,
    /// The current session. Its history lives in `messages`, not here.
    pub current_session: Option<Session>,
    /// Transcript of the current session, in arrival order.
    pub messages: Vec<Message>,
    pub is_connected: bool,
    pub is_typing: bool,
    pub is_loading: bool,
    /// Most recent error, until replaced or cleared.
    pub error: Option<String>,
}

enum Command {
    ListSessions {
        reply: oneshot::Sender<Vec<Session>>,
    },
    CreateSession {
        title: String,
        reply: oneshot::Sender<Option<Session>>,
    },
    SelectSession {
        id: SessionId,
        reply: oneshot::Sender<()>,
    },
    SendMessage {
        content: String,
        reply: oneshot::Sender<()>,
    },
    SendTyping {
        is_typing: bool,
    },
    EndSession {
        id: SessionId,
        reply: oneshot::Sender<()>,
    },
    ClearError,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Results of data-service calls and connect attempts, fed back into the loop.
enum Completion {
    Listed {
        result: Result<SessionPage, ChatError>,
        reply: oneshot::Sender<Vec<Session>>,
    },
    Created {
        result: Result<Session, ChatError>,
        reply: oneshot::Sender<Option<Session>>,
    },
    Fetched {
        epoch: u64,
        result: Result<Session, ChatError>,
        reply: oneshot::Sender<()>,
    },
    Sent {
        session: SessionId,
        result: Result<SendMessageResponse, ChatError>,
        reply: oneshot::Sender<()>,
    },
    Ended {
        id: SessionId,
        result: Result<(), ChatError>,
        reply: oneshot::Sender<()>,
    },
    ConnectFailed {
        channel: ChannelId,
        error: ChatError,
    },
}

/// Handle to the coordinator task. Cheap to clone.
///
/// Expected failures (service errors, no current session, channel trouble)
/// are reported through [`ChatSnapshot::error`]. The `Err` side of these
/// methods only means the coordinator task is gone.
#[derive(Clone)]
pub struct SessionCoordinator {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ChatSnapshot>,
}

impl SessionCoordinator {
    /// Spawn the coordinator task on the current runtime.
    pub fn spawn(
        service: Arc<dyn ChatService>,
        connector: Arc<dyn Connector>,
        config: CoordinatorConfig,
    ) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let (published, snapshot) = watch::channel(ChatSnapshot::default());

        let task = CoordinatorTask {
            service,
            connector,
            config,
            commands,
            events_tx,
            events,
            completions_tx,
            completions,
            published,
            view: ChatSnapshot::default(),
            in_flight_loads: 0,
            connection: None,
            next_channel: 1,
            epoch: 0,
            pending_select: None,
            held_replies: Vec::new(),
            typing_deadline: None,
        };
        tokio::spawn(task.run());

        Self {
            commands: commands_tx,
            snapshot,
        }
    }

    /// Receiver that is notified whenever the snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Reload the known sessions and return them.
    pub async fn list_sessions(&self) -> Result<Vec<Session>, ChatError> {
        self.request(|reply| Command::ListSessions { reply }).await
    }

    pub async fn refresh_sessions(&self) -> Result<(), ChatError> {
        self.list_sessions().await.map(|_| ())
    }

    /// Create a session and prepend it to the known sessions. The new
    /// session is not made current. `None` if the service refused.
    pub async fn create_session(&self, title: &str) -> Result<Option<Session>, ChatError> {
        let title = title.to_string();
        self.request(|reply| Command::CreateSession { title, reply })
            .await
    }

    /// Make `id` the current session: drop the old channel, load the
    /// history, and open a channel for the new session.
    pub async fn select_session(&self, id: SessionId) -> Result<(), ChatError> {
        self.request(|reply| Command::SelectSession { id, reply })
            .await
    }

    /// Send over the channel if it is open, otherwise through the data
    /// service. In the first case the transcript only grows when the
    /// backend echoes the message back.
    pub async fn send_message(&self, content: &str) -> Result<(), ChatError> {
        let content = content.to_string();
        self.request(|reply| Command::SendMessage { content, reply })
            .await
    }

    /// Best effort typing signal over the channel.
    pub fn send_typing(&self, is_typing: bool) -> Result<(), ChatError> {
        self.commands
            .send(Command::SendTyping { is_typing })
            .map_err(|_| ChatError::CoordinatorStopped)
    }

    pub async fn end_session(&self, id: SessionId) -> Result<(), ChatError> {
        self.request(|reply| Command::EndSession { id, reply })
            .await
    }

    pub fn clear_error(&self) -> Result<(), ChatError> {
        self.commands
            .send(Command::ClearError)
            .map_err(|_| ChatError::CoordinatorStopped)
    }

    /// Tear down the channel and stop the task.
    pub async fn shutdown(&self) -> Result<(), ChatError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| ChatError::CoordinatorStopped)?;
        rx.await.map_err(|_| ChatError::CoordinatorStopped)
    }
}

struct CoordinatorTask {
    service: Arc<dyn ChatService>,
    connector: Arc<dyn Connector>,
    config: CoordinatorConfig,

    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    published: watch::Sender<ChatSnapshot>,

    /// Working copy of the published state.
    view: ChatSnapshot,
    in_flight_loads: usize,
    connection: Option<ConnectionManager>,
    next_channel: ChannelId,
    /// Bumped by every select, and by ending a session that is being selected.
    epoch: u64,
    /// Session a select is loading, while its fetch is in flight.
    pending_select: Option<SessionId>,
    /// Fallback replies for `pending_select` that arrived before its history.
    held_replies: Vec<Message>,
    typing_deadline: Option<Instant>,
}

impl CoordinatorTask {
    async fn run(mut self) {
        loop {
            let typing_deadline = self.typing_deadline;
            // Biased so channel events queued before a completion are
            // applied before it.
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).is_break() {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(completion) = self.completions.recv() => self.handle_completion(completion),
                _ = tokio::time::sleep_until(typing_deadline.unwrap_or_else(Instant::now)),
                    if typing_deadline.is_some() =>
                {
                    self.typing_deadline = None;
                    self.view.is_typing = false;
                }
            }
            self.publish();
        }
        self.teardown_connection();
        debug!("session coordinator stopped");
    }

    fn publish(&mut self) {
        self.view.is_loading = self.in_flight_loads > 0;
        self.published.send_if_modified(|current| {
            if *current == self.view {
                false
            } else {
                *current = self.view.clone();
                true
            }
        });
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::ListSessions { reply } => {
                self.in_flight_loads += 1;
                let service = self.service.clone();
                self.complete(async move {
                    Completion::Listed {
                        result: service.list_sessions().await,
                        reply,
                    }
                });
            }
            Command::CreateSession { title, reply } => {
                self.in_flight_loads += 1;
                let service = self.service.clone();
                self.complete(async move {
                    Completion::Created {
                        result: service.create_session(&title).await,
                        reply,
                    }
                });
            }
            Command::SelectSession { id, reply } => {
                // Superseded from here on: the old channel goes away now and
                // any in-flight fetch or send for the old session is stale.
                self.epoch += 1;
                self.teardown_connection();
                if self.pending_select != Some(id) {
                    self.held_replies.clear();
                }
                self.pending_select = Some(id);
                self.in_flight_loads += 1;
                let epoch = self.epoch;
                let service = self.service.clone();
                self.complete(async move {
                    Completion::Fetched {
                        epoch,
                        result: service.get_session(id).await,
                        reply,
                    }
                });
            }
            Command::SendMessage { content, reply } => {
                let Some(session_id) = self.current_id() else {
                    self.set_error(&ChatError::NoActiveSession.to_string());
                    self.reply(reply, ());
                    return ControlFlow::Continue(());
                };
                if let Some(connection) = self.connection.as_ref().filter(|c| c.is_open()) {
                    connection.send(&content);
                    self.reply(reply, ());
                    return ControlFlow::Continue(());
                }
                debug!(session = session_id, "channel not open, sending through the api");
                let service = self.service.clone();
                self.complete(async move {
                    Completion::Sent {
                        session: session_id,
                        result: service.send_message(session_id, &content).await,
                        reply,
                    }
                });
            }
            Command::SendTyping { is_typing } => {
                if let Some(connection) = &self.connection {
                    connection.send_typing(is_typing);
                }
            }
            Command::EndSession { id, reply } => {
                let service = self.service.clone();
                self.complete(async move {
                    Completion::Ended {
                        id,
                        result: service.end_session(id).await,
                        reply,
                    }
                });
            }
            Command::ClearError => self.view.error = None,
            Command::Shutdown { reply } => {
                info!("shutting down session coordinator");
                self.teardown_connection();
                self.reply(reply, ());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Listed { result, reply } => {
                self.in_flight_loads -= 1;
                match result {
                    Ok(page) => {
                        debug!(count = page.count, "loaded chat sessions");
                        self.view.sessions = page.results;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to load chat sessions");
                        self.set_error(LOAD_SESSIONS_FAILED);
                    }
                }
                let sessions = self.view.sessions.clone();
                self.reply(reply, sessions);
            }
            Completion::Created { result, reply } => {
                self.in_flight_loads -= 1;
                let created = match result {
                    Ok(session) => {
                        info!(session = session.id, title = %session.title, "created chat session");
                        self.view.sessions.insert(0, session.clone());
                        Some(session)
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to create chat session");
                        self.set_error(CREATE_SESSION_FAILED);
                        None
                    }
                };
                self.reply(reply, created);
            }
            Completion::Fetched {
                epoch,
                result,
                reply,
            } => {
                self.in_flight_loads -= 1;
                if epoch != self.epoch {
                    debug!(epoch, current = self.epoch, "dropping stale session fetch");
                } else {
                    let requested = self.pending_select.take();
                    let held = std::mem::take(&mut self.held_replies);
                    match result {
                        Ok(mut session) => {
                            info!(session = session.id, "selected chat session");
                            self.view.messages = std::mem::take(&mut session.messages);
                            self.view.current_session = Some(session);
                            self.merge_replies(held);
                            self.open_connection();
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to load chat session");
                            self.set_error(LOAD_SESSION_FAILED);
                            if self.current_id().is_some() && self.current_id() == requested {
                                self.merge_replies(held);
                            }
                            // Keep the previous session usable.
                            if self.view.current_session.is_some() {
                                self.open_connection();
                            }
                        }
                    }
                }
                self.reply(reply, ());
            }
            Completion::Sent {
                session,
                result,
                reply,
            } => {
                match result {
                    Ok(response) => {
                        let replies = vec![response.user_message, response.assistant_message];
                        if self.pending_select.is_some() {
                            if self.pending_select == Some(session) {
                                debug!(session, "holding fallback reply until history loads");
                                self.held_replies.extend(replies);
                            } else {
                                debug!(session, "dropping fallback reply for superseded session");
                            }
                        } else if self.current_id() == Some(session) {
                            self.merge_replies(replies);
                        } else {
                            debug!(session, "dropping fallback reply for superseded session");
                        }
                    }
                    Err(e) => {
                        warn!(session, error = %e, "fallback send failed");
                        self.set_error(SEND_FAILED);
                    }
                }
                self.reply(reply, ());
            }
            Completion::Ended { id, result, reply } => {
                match result {
                    Ok(()) => {
                        info!(session = id, "ended chat session");
                        if let Some(session) = self.view.sessions.iter_mut().find(|s| s.id == id) {
                            session.is_active = false;
                        }
                        if self.current_id() == Some(id) {
                            self.view.current_session = None;
                            self.view.messages.clear();
                            self.teardown_connection();
                        }
                        if self.pending_select == Some(id) {
                            self.epoch += 1;
                            self.pending_select = None;
                            self.held_replies.clear();
                        }
                    }
                    Err(e) => {
                        warn!(session = id, error = %e, "failed to end chat session");
                        self.set_error(END_SESSION_FAILED);
                    }
                }
                self.reply(reply, ());
            }
            Completion::ConnectFailed { channel, error } => {
                if self.active_channel() == Some(channel) {
                    warn!(channel, error = %error, "chat channel failed to connect");
                    self.set_error(CONNECT_FAILED);
                }
            }
        }
    }

    fn handle_event(&mut self, (channel, event): ChannelEvent) {
        if self.active_channel() != Some(channel) {
            debug!(channel, "dropping event from superseded channel");
            return;
        }
        match event {
            ConnectionEvent::Message(message) => self.append_message(message),
            ConnectionEvent::Typing { is_typing, .. } => {
                self.view.is_typing = is_typing;
                self.typing_deadline =
                    is_typing.then(|| Instant::now() + self.config.typing_timeout);
            }
            ConnectionEvent::Error(error) => self.view.error = Some(error),
            ConnectionEvent::ConnectionChanged(connected) => self.view.is_connected = connected,
        }
    }

    fn append_message(&mut self, message: Message) {
        let Some(current) = &self.view.current_session else {
            return;
        };
        let current_id = current.id;
        if let Some(summary) = self.view.sessions.iter_mut().find(|s| s.id == current_id) {
            summary.record_message(&message);
        }
        self.view.messages.push(message);
    }

    /// Append replies from the data service, skipping any the transcript
    /// already has.
    fn merge_replies(&mut self, replies: Vec<Message>) {
        for message in replies {
            if !self.view.messages.iter().any(|m| m.id == message.id) {
                self.append_message(message);
            }
        }
    }

    fn current_id(&self) -> Option<SessionId> {
        self.view.current_session.as_ref().map(|s| s.id)
    }

    fn active_channel(&self) -> Option<ChannelId> {
        self.connection.as_ref().map(ConnectionManager::id)
    }

    /// Build a fresh manager for the current session and start connecting.
    fn open_connection(&mut self) {
        let Some(session) = &self.view.current_session else {
            return;
        };
        let channel = self.next_channel;
        self.next_channel += 1;
        let manager = ConnectionManager::new(
            channel,
            session.binding_id(),
            self.connector.clone(),
            self.config.connection.clone(),
            self.events_tx.clone(),
        );
        let connect = manager.connect();
        self.connection = Some(manager);

        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            if let Err(error) = connect.await {
                let _ = completions.send(Completion::ConnectFailed { channel, error });
            }
        });
    }

    fn teardown_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.disconnect();
        }
        self.view.is_connected = false;
        self.view.is_typing = false;
        self.typing_deadline = None;
    }

    fn set_error(&mut self, error: &str) {
        self.view.error = Some(error.to_string());
    }

    /// Publish before replying so the caller observes the result.
    fn reply<T>(&mut self, reply: oneshot::Sender<T>, value: T) {
        self.publish();
        let _ = reply.send(value);
    }

    fn complete(&self, work: impl std::future::Future<Output = Completion> + Send + 'static) {
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let _ = completions.send(work.await);
        });
    }
}
