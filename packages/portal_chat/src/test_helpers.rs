//! In-memory test doubles for the channel and the data service.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::ChatError;
use crate::service::ChatService;
use crate::transport::{Channel, Connector, Incoming, Outgoing};
use crate::types::{Message, MessageOrigin, SendMessageResponse, Session, SessionId, SessionPage};

/// What the next `open()` call does.
pub enum Step {
    Accept,
    Refuse,
    /// Wait for the sender to fire (or drop), then accept.
    Hold(oneshot::Receiver<()>),
}

/// Scripted [`Connector`]. Unscripted opens accept unless
/// [`MockConnector::refuse_by_default`] was called.
pub struct MockConnector {
    script: Mutex<VecDeque<Step>>,
    refuse_by_default: AtomicBool,
    opens: Mutex<Vec<(String, Instant)>>,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            refuse_by_default: AtomicBool::new(false),
            opens: Mutex::new(Vec::new()),
            servers,
        });
        (connector, rx)
    }

    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn hold(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.push(Step::Hold(rx));
        tx
    }

    pub fn refuse_by_default(&self) {
        self.refuse_by_default.store(true, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    pub fn opened_bindings(&self) -> Vec<String> {
        self.opens.lock().unwrap().iter().map(|(b, _)| b.clone()).collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, binding_id: &str) -> Result<Channel, ChatError> {
        self.opens
            .lock()
            .unwrap()
            .push((binding_id.to_string(), Instant::now()));

        let step = self.script.lock().unwrap().pop_front();
        let step = step.unwrap_or_else(|| {
            if self.refuse_by_default.load(Ordering::SeqCst) {
                Step::Refuse
            } else {
                Step::Accept
            }
        });
        match step {
            Step::Accept => {}
            Step::Refuse => return Err(ChatError::Transport("connection refused".into())),
            Step::Hold(gate) => {
                let _ = gate.await;
            }
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.servers.send(ServerEnd {
            binding_id: binding_id.to_string(),
            to_client: in_tx,
            from_client: out_rx,
        });
        Ok(Channel {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// The backend's side of one accepted channel.
pub struct ServerEnd {
    pub binding_id: String,
    to_client: mpsc::UnboundedSender<Incoming>,
    from_client: mpsc::UnboundedReceiver<Outgoing>,
}

impl ServerEnd {
    pub fn send_text(&self, text: &str) {
        let _ = self.to_client.send(Incoming::Text(text.to_string()));
    }

    pub fn send_json(&self, value: serde_json::Value) {
        self.send_text(&value.to_string());
    }

    /// Push a message frame the way the backend's consumer does.
    pub fn send_message(&self, id: i64, origin: &str, content: &str) {
        self.send_json(json!({
            "type": "message",
            "message": {
                "id": id,
                "type": origin,
                "content": content,
                "timestamp": "2024-05-01T10:00:00+00:00",
            }
        }));
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(Incoming::Closed {
            code,
            reason: String::new(),
        });
    }

    pub async fn recv(&mut self) -> Option<Outgoing> {
        self.from_client.recv().await
    }
}

pub fn message(id: i64, origin: MessageOrigin, content: &str) -> Message {
    Message {
        id,
        message_type: origin,
        content: content.to_string(),
        metadata: serde_json::Value::Null,
        created_at: Utc::now(),
    }
}

pub fn session(id: SessionId, title: &str) -> Session {
    let now = Utc::now();
    Session {
        id,
        session_id: format!("binding-{id}"),
        title: title.to_string(),
        is_active: true,
        created_at: now,
        updated_at: now,
        messages: Vec::new(),
        message_count: None,
        last_message: None,
    }
}

/// In-memory [`ChatService`]. Operations can be made to fail or to wait on a
/// gate, keyed by operation name (`"list_sessions"`, `"create_session"`,
/// `"get_session"`, `"send_message"`, `"end_session"`).
pub struct MockChatService {
    sessions: Mutex<Vec<Session>>,
    next_id: AtomicI64,
    failures: Mutex<HashSet<&'static str>>,
    holds: Mutex<HashMap<&'static str, oneshot::Receiver<()>>>,
    calls: Mutex<Vec<String>>,
}

impl MockChatService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(100),
            failures: Mutex::new(HashSet::new()),
            holds: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn insert(&self, session: Session) {
        self.sessions.lock().unwrap().push(session);
    }

    pub fn fail(&self, op: &'static str) {
        self.failures.lock().unwrap().insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.failures.lock().unwrap().remove(op);
    }

    /// The next call of `op` waits until the returned sender fires.
    pub fn hold(&self, op: &'static str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.holds.lock().unwrap().insert(op, rx);
        tx
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stored(&self, id: SessionId) -> Option<Session> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    async fn enter(&self, op: &'static str) -> Result<(), ChatError> {
        self.calls.lock().unwrap().push(op.to_string());
        let gate = self.holds.lock().unwrap().remove(op);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.failures.lock().unwrap().contains(op) {
            return Err(ChatError::Api {
                status: 500,
                message: format!("{op} failed"),
            });
        }
        Ok(())
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn not_found() -> ChatError {
        ChatError::Api {
            status: 404,
            message: "Not found.".into(),
        }
    }
}

#[async_trait]
impl ChatService for MockChatService {
    async fn list_sessions(&self) -> Result<SessionPage, ChatError> {
        self.enter("list_sessions").await?;
        let sessions = self.sessions.lock().unwrap();
        let results: Vec<Session> = sessions
            .iter()
            .rev()
            .map(|s| Session {
                messages: Vec::new(),
                message_count: Some(s.messages.len() as u64),
                last_message: s.messages.last().cloned(),
                ..s.clone()
            })
            .collect();
        Ok(SessionPage {
            count: results.len() as u64,
            next: None,
            previous: None,
            results,
        })
    }

    async fn create_session(&self, title: &str) -> Result<Session, ChatError> {
        self.enter("create_session").await?;
        let created = session(self.next_id(), title);
        self.insert(created.clone());
        Ok(created)
    }

    async fn get_session(&self, id: SessionId) -> Result<Session, ChatError> {
        self.enter("get_session").await?;
        self.stored(id).ok_or_else(Self::not_found)
    }

    async fn send_message(
        &self,
        id: SessionId,
        content: &str,
    ) -> Result<SendMessageResponse, ChatError> {
        self.enter("send_message").await?;
        let user_message = message(self.next_id(), MessageOrigin::User, content);
        let assistant_message = message(
            self.next_id(),
            MessageOrigin::Assistant,
            &format!("You said: {content}"),
        );
        let mut sessions = self.sessions.lock().unwrap();
        let stored = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(Self::not_found)?;
        stored.messages.push(user_message.clone());
        stored.messages.push(assistant_message.clone());
        Ok(SendMessageResponse {
            user_message,
            assistant_message,
        })
    }

    async fn end_session(&self, id: SessionId) -> Result<(), ChatError> {
        self.enter("end_session").await?;
        let mut sessions = self.sessions.lock().unwrap();
        let stored = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(Self::not_found)?;
        stored.is_active = false;
        Ok(())
    }
}
