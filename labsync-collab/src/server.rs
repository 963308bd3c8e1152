//! WebSocket front door for session hubs.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── SessionHub (session 1) ── SessionStore
//!             ├── CollabServer ── SessionRegistry
//! Client B ──┘        │              └── SessionHub (session 2)
//!                     │
//!          one task per socket:
//!          select { socket frame → dispatch → Reply,
//!                   subscription event → Event frame }
//! ```
//!
//! The first frame on a socket must be `Hello`. It joins the session, or
//! resumes an existing membership when `resume_after` is set. A socket that
//! closes without `Leave` is a transport drop: the member goes offline but
//! keeps their seat.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use labsync_core::CollabError;

use crate::config::ServerConfig;
use crate::hub::{HubServices, Subscription};
use crate::protocol::{Command, Frame, MessageType, ProtocolError, Reply};
use crate::registry::SessionRegistry;
use crate::storage::BlobError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
}

/// A socket that has completed `Hello`.
struct Attached {
    subscription: Subscription,
    left: bool,
}

pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    pub fn new(config: ServerConfig, services: HubServices) -> Result<Self, CollabError> {
        config.validate()?;
        let registry = Arc::new(SessionRegistry::new(services, config.hub.clone())?);
        Ok(Self::with_registry(config, registry))
    }

    pub fn with_registry(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        Self { config, registry, stats: Arc::new(RwLock::new(ServerStats::default())) }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let recovered = self.registry.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} sessions from storage");
        }
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = Arc::clone(&self.registry);
            let stats = Arc::clone(&self.stats);
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn send_frame(sink: &mut WsSink, frame: &Frame) -> Result<(), BoxError> {
        sink.send(Message::Binary(frame.encode()?.into())).await?;
        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut attached: Option<Attached> = None;
        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let frame = match Frame::decode_bounded(&data, config.max_frame_bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Dropping frame from {addr}: {e}");
                                    stats.write().await.rejected_frames += 1;
                                    Self::reject_frame(&mut ws_sender, &data, e).await?;
                                    continue;
                                }
                            };
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let done = Self::handle_frame(
                                &mut ws_sender, frame, &mut attached, &registry, &config,
                            )
                            .await?;
                            if done {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    },

                    event = async {
                        match attached.as_mut() {
                            Some(a) => a.subscription.recv().await,
                            // Nothing to forward before Hello
                            None => std::future::pending().await,
                        }
                    } => match (event, attached.as_ref()) {
                        (Some(event), Some(a)) => {
                            let sub = &a.subscription;
                            let frame = Frame::event(sub.hub().session_id(), sub.user_id(), &event)?;
                            Self::send_frame(&mut ws_sender, &frame).await?;
                        }
                        _ => {
                            // Kicked, or the session was closed.
                            log::info!("Subscription for {addr} closed by hub");
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                    },
                }
            }
            Ok(())
        }
        .await;

        if let Some(a) = attached {
            if !a.left {
                let sub = &a.subscription;
                sub.hub().drop_connection(sub.user_id(), sub.connection_id()).await;
            }
        }
        stats.write().await.active_connections -= 1;
        result
    }

    /// Answer an undecodable request with an error `Reply` when its header
    /// is still readable, so the client does not wait for a timeout.
    async fn reject_frame(sink: &mut WsSink, data: &[u8], error: ProtocolError) -> Result<(), BoxError> {
        let Ok(header) = Frame::peek_header(data) else {
            return Ok(());
        };
        if !matches!(header.msg_type, MessageType::Hello | MessageType::Command) {
            return Ok(());
        }
        let reply = Reply::error(&CollabError::from(error));
        let out = Frame::reply(header.session_id, header.user_id, header.request_id, &reply)?;
        Self::send_frame(sink, &out).await
    }

    /// Returns true when the socket should be closed.
    async fn handle_frame(
        sink: &mut WsSink,
        frame: Frame,
        attached: &mut Option<Attached>,
        registry: &SessionRegistry,
        config: &ServerConfig,
    ) -> Result<bool, BoxError> {
        match frame.msg_type {
            MessageType::Hello => {
                let reply = if attached.is_some() {
                    Reply::error(&CollabError::InvalidAction("already attached".into()))
                } else {
                    match Self::hello(registry, &frame).await {
                        Ok(subscription) => {
                            let body = serde_json::json!({
                                "connection_id": subscription.connection_id(),
                            });
                            *attached = Some(Attached { subscription, left: false });
                            Reply::Ok { body }
                        }
                        Err(e) => {
                            log::debug!("Hello from {} rejected: {e}", frame.user_id);
                            Reply::error(&e)
                        }
                    }
                };
                let out = Frame::reply(frame.session_id, frame.user_id, frame.request_id, &reply)?;
                Self::send_frame(sink, &out).await?;
                Ok(false)
            }
            MessageType::Command => {
                let Some(a) = attached.as_mut() else {
                    let reply = Reply::error(&CollabError::InvalidAction("send Hello first".into()));
                    let out = Frame::reply(frame.session_id, frame.user_id, frame.request_id, &reply)?;
                    Self::send_frame(sink, &out).await?;
                    return Ok(false);
                };
                let reply = match frame.command_payload() {
                    Ok(command) => {
                        let leaving = matches!(command, Command::Leave);
                        let reply = Self::dispatch(&a.subscription, command, registry, config).await;
                        a.left = leaving && reply.is_ok();
                        reply
                    }
                    Err(e) => Reply::error(&CollabError::from(e)),
                };
                let sub = &a.subscription;
                let out = Frame::reply(sub.hub().session_id(), sub.user_id(), frame.request_id, &reply)?;
                Self::send_frame(sink, &out).await?;
                Ok(a.left)
            }
            MessageType::Ping => {
                if let Some(a) = attached.as_ref() {
                    let sub = &a.subscription;
                    if let Err(e) = sub.hub().touch(sub.user_id()).await {
                        log::debug!("Heartbeat from {} ignored: {e}", sub.user_id());
                    }
                }
                Self::send_frame(sink, &Frame::pong(frame.session_id, frame.user_id)).await?;
                Ok(false)
            }
            other => {
                log::debug!("Unhandled frame type: {other:?}");
                Ok(false)
            }
        }
    }

    async fn hello(registry: &SessionRegistry, frame: &Frame) -> Result<Subscription, CollabError> {
        let hello = frame.hello_payload()?;
        match hello.resume_after {
            Some(after) => {
                registry.hub(frame.session_id).await?.subscribe(frame.user_id, Some(after)).await
            }
            None => registry.join_session(frame.session_id, frame.user_id, hello.role).await,
        }
    }

    async fn dispatch(
        sub: &Subscription,
        command: Command,
        registry: &SessionRegistry,
        config: &ServerConfig,
    ) -> Reply {
        let hub = Arc::clone(sub.hub());
        let caller = sub.caller();
        let user = caller.user_id;
        log::debug!("{user} -> {}", command.name());

        match command {
            Command::Execute { action } => Reply::from_result(hub.execute(caller, action).await),
            Command::Undo { action_id } => Reply::from_result(hub.undo(caller, action_id).await),
            Command::Approve { action_id } => {
                Reply::from_result(hub.approve(caller, action_id).await)
            }
            Command::Touch => Reply::from_result(hub.touch(user).await),
            Command::Signal { signal } => Reply::from_result(hub.broadcast_ephemeral(caller, signal)),
            Command::VoiceNote { audio, duration_ms } => {
                if audio.len() > config.max_upload_bytes {
                    let err = BlobError::TooLarge { size: audio.len(), limit: config.max_upload_bytes };
                    return Reply::error(&CollabError::InvalidAction(err.to_string()));
                }
                let duration = std::time::Duration::from_millis(duration_ms);
                Reply::from_result(hub.share_voice_note(caller, audio, duration).await)
            }
            Command::Annotation { shape, geometry } => {
                Reply::from_result(hub.share_annotation(caller, shape, &geometry).await)
            }
            Command::ChangeRole { user_id, role } => {
                Reply::from_result(hub.change_user_role(caller, user_id, role).await)
            }
            Command::Kick { user_id } => Reply::from_result(hub.kick_user(caller, user_id).await),
            Command::CreateGroup { name, members } => {
                Reply::from_result(hub.create_group(caller, name, members).await)
            }
            Command::JoinGroup { user_id, group_id } => {
                Reply::from_result(hub.join_group(caller, user_id, group_id).await)
            }
            Command::LeaveGroup { user_id } => {
                Reply::from_result(hub.leave_group(caller, user_id).await)
            }
            Command::MoveToGroup { user_id, group_id } => {
                Reply::from_result(hub.move_user_to_group(caller, user_id, group_id).await)
            }
            Command::CloseGroup { group_id } => {
                Reply::from_result(hub.close_group(caller, group_id).await)
            }
            Command::CloseAllGroups => Reply::from_result(hub.close_all_groups(caller).await),
            Command::AutoAssign { group_size } => {
                Reply::from_result(hub.auto_assign_groups(caller, group_size).await)
            }
            Command::PassTurn { user_id } => Reply::from_result(hub.pass_turn(caller, user_id).await),
            Command::Pause => Reply::from_result(hub.pause(caller).await),
            Command::Resume => Reply::from_result(hub.resume(caller).await),
            Command::Close => {
                Reply::from_result(registry.close_session(caller, hub.session_id()).await)
            }
            Command::UpdateSettings { settings } => {
                Reply::from_result(hub.update_settings(caller, settings).await)
            }
            Command::FetchSince { after } => Reply::from_result(hub.actions_since(after).await),
            Command::ObserveClock { clock } => {
                Reply::from_result(hub.observe_clock(user, &clock).await)
            }
            Command::Snapshot => Reply::from_result(Ok::<_, CollabError>(hub.snapshot().await)),
            Command::Leave => Reply::from_result(hub.leave(user).await),
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}
