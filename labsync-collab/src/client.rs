//! WebSocket client for a lab session.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, resume)
//! - Request/reply correlation over a single socket
//! - Duplicate suppression by action sequence
//! - A local vector clock merged from every action it sees
//!
//! The first `connect` joins the session. Later calls resume with the last
//! sequence seen, so the server replays exactly what was missed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use labsync_core::{
    ActionId, ActionKind, CollaborativeAction, CursorPosition, Role, SessionId, UserId,
    VectorClock,
};

use crate::event::{EphemeralSignal, HubEvent};
use crate::hub::SessionSnapshot;
use crate::protocol::{Command, Frame, Hello, MessageType, ProtocolError, Reply};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    Hub(HubEvent),
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// State shared with the reader task.
struct Shared {
    state: RwLock<ConnectionState>,
    /// Highest action sequence seen
    last_sequence: AtomicU64,
    clock: RwLock<VectorClock>,
    pending: PendingReplies,
}

impl Shared {
    /// Dedup and clock bookkeeping. Returns false for duplicates.
    async fn observe(&self, event: &HubEvent) -> bool {
        match event {
            HubEvent::ActionReceived { action } => {
                let seen = self.last_sequence.fetch_max(action.sequence, Ordering::SeqCst);
                if action.sequence <= seen {
                    return false;
                }
                self.clock.write().await.merge(&action.vector_clock);
            }
            HubEvent::PresenceSync { last_sequence, .. } => {
                self.last_sequence.fetch_max(*last_sequence, Ordering::SeqCst);
            }
            _ => {}
        }
        true
    }
}

pub struct SyncClient {
    session_id: SessionId,
    user_id: UserId,
    role: Role,
    server_url: String,
    shared: Arc<Shared>,
    /// Set after the first accepted Hello; later connects resume
    joined: AtomicBool,
    next_request: AtomicU64,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(
        session_id: SessionId,
        user_id: UserId,
        role: Role,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            session_id,
            user_id,
            role,
            server_url: server_url.into(),
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                last_sequence: AtomicU64::new(0),
                clock: RwLock::new(VectorClock::new()),
                pending: Arc::new(Mutex::new(HashMap::new())),
            }),
            joined: AtomicBool::new(false),
            next_request: AtomicU64::new(1),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Open the socket and send `Hello`. Resolves once the server accepts.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.shared.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::debug!("Connect to {} failed: {e}", self.server_url);
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket, close on drop.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });
        self.outgoing_tx = Some(out_tx);

        // Reader task: route replies and events.
        let shared = Arc::clone(&self.shared);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let data = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                let Ok(frame) = Frame::decode(&data) else {
                    log::warn!("Undecodable frame from server");
                    continue;
                };
                match frame.msg_type {
                    MessageType::Reply => {
                        let waiter = shared.pending.lock().await.remove(&frame.request_id);
                        match (waiter, frame.reply_payload()) {
                            (Some(tx), Ok(reply)) => {
                                let _ = tx.send(reply);
                            }
                            (_, Err(e)) => log::warn!("Bad reply payload: {e}"),
                            (None, Ok(_)) => {
                                log::debug!("Reply for unknown request {}", frame.request_id)
                            }
                        }
                    }
                    MessageType::Event => match frame.event_payload() {
                        Ok(event) => {
                            if shared.observe(&event).await {
                                let _ = event_tx.send(SyncEvent::Hub(event)).await;
                            }
                        }
                        Err(e) => log::warn!("Bad event payload: {e}"),
                    },
                    _ => {}
                }
            }

            *shared.state.write().await = ConnectionState::Disconnected;
            // Dropping the senders fails every outstanding request.
            shared.pending.lock().await.clear();
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        let resume_after = if self.joined.load(Ordering::SeqCst) {
            Some(self.last_sequence())
        } else {
            None
        };
        let hello = Hello { role: self.role, resume_after };
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let frame = Frame::hello(self.session_id, self.user_id, request_id, &hello)?;
        if let Err(e) = self.roundtrip(request_id, frame).await {
            self.disconnect();
            *self.shared.state.write().await = ConnectionState::Disconnected;
            return Err(e);
        }

        self.joined.store(true, Ordering::SeqCst);
        *self.shared.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        log::info!(
            "Connected to session {} as {} (resume_after={resume_after:?})",
            self.session_id,
            self.user_id
        );
        Ok(())
    }

    /// Close the socket. Membership is kept; `connect` again to resume.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    async fn roundtrip(&self, request_id: u64, frame: Frame) -> Result<serde_json::Value, ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(request_id, reply_tx);
        tx.send(Message::Binary(frame.encode()?.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let reply = tokio::time::timeout(REQUEST_TIMEOUT, reply_rx)
            .await
            .map_err(|_| ProtocolError::Timeout)?
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        reply.into_body()
    }

    /// Send a command and wait for its reply body.
    pub async fn request(&self, command: &Command) -> Result<serde_json::Value, ProtocolError> {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let frame = Frame::command(self.session_id, self.user_id, request_id, command)?;
        self.roundtrip(request_id, frame).await
    }

    async fn request_as<T: DeserializeOwned>(&self, command: &Command) -> Result<T, ProtocolError> {
        let body = self.request(command).await?;
        serde_json::from_value(body).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Own actions are not echoed, so the clock is merged from the reply.
    async fn merge_own(&self, action: &CollaborativeAction) {
        self.shared.clock.write().await.merge(&action.vector_clock);
    }

    pub async fn execute(&self, kind: ActionKind) -> Result<CollaborativeAction, ProtocolError> {
        let action: CollaborativeAction = self.request_as(&Command::Execute { action: kind }).await?;
        self.merge_own(&action).await;
        Ok(action)
    }

    pub async fn undo(&self, action_id: ActionId) -> Result<CollaborativeAction, ProtocolError> {
        let undo: CollaborativeAction = self.request_as(&Command::Undo { action_id }).await?;
        self.merge_own(&undo).await;
        Ok(undo)
    }

    pub async fn approve(&self, action_id: ActionId) -> Result<CollaborativeAction, ProtocolError> {
        self.request_as(&Command::Approve { action_id }).await
    }

    pub async fn touch(&self) -> Result<(), ProtocolError> {
        self.request(&Command::Touch).await.map(|_| ())
    }

    pub async fn send_signal(&self, signal: EphemeralSignal) -> Result<(), ProtocolError> {
        self.request(&Command::Signal { signal }).await.map(|_| ())
    }

    pub async fn move_cursor(&self, x: f32, y: f32) -> Result<(), ProtocolError> {
        self.send_signal(EphemeralSignal::Cursor { position: CursorPosition::new(x, y) }).await
    }

    pub async fn fetch_since(&self, after: u64) -> Result<Vec<CollaborativeAction>, ProtocolError> {
        self.request_as(&Command::FetchSince { after }).await
    }

    /// Report the local clock so the server can merge it.
    pub async fn sync_clock(&self) -> Result<(), ProtocolError> {
        let clock = self.clock().await;
        self.request(&Command::ObserveClock { clock }).await.map(|_| ())
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, ProtocolError> {
        self.request_as(&Command::Snapshot).await
    }

    /// Leave the session for good and close the socket.
    pub async fn leave(&mut self) -> Result<(), ProtocolError> {
        self.request(&Command::Leave).await?;
        self.joined.store(false, Ordering::SeqCst);
        self.disconnect();
        Ok(())
    }

    /// Heartbeat ping; the server touches presence and answers with a pong.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        let frame = Frame::ping(self.session_id, self.user_id);
        tx.send(Message::Binary(frame.encode()?.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn last_sequence(&self) -> u64 {
        self.shared.last_sequence.load(Ordering::SeqCst)
    }

    pub async fn clock(&self) -> VectorClock {
        self.shared.clock.read().await.clone()
    }
}
