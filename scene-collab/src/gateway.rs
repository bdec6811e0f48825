//! WebSocket front door for the coordinator.
//!
//! ```text
//! Client A ──┐   binary frames    ┌── Session ──┐
//!             ├── (ClientMessage) ─┤             ├── WorkspaceCoordinator
//! Client B ──┘                    └── Session ──┘        │
//!      ▲                                                  │
//!      └──── ServerMessage::Event ◄── EventSubscriber ◄───┘
//! ```
//!
//! Every connection runs one task that multiplexes its socket with the
//! event stream of the workspace it joined. Request replies go only to
//! the requesting socket; everything others need to see arrives as an
//! event.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::EventSubscriber;
use crate::config::GatewayConfig;
use crate::coordinator::{WorkspaceCoordinator, WorkspaceHandle};
use crate::error::{CollabError, CollabResult};
use crate::permissions::Capability;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::workspace::WorkspaceSpec;

/// Connection counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Requests answered with `Rejected`
    pub rejected: u64,
}

pub struct CollabGateway {
    config: GatewayConfig,
    coordinator: WorkspaceCoordinator,
    stats: Arc<RwLock<GatewayStats>>,
}

impl CollabGateway {
    pub fn new(config: GatewayConfig) -> Self {
        let coordinator = WorkspaceCoordinator::new(config.engine.clone());
        Self::with_coordinator(config, coordinator)
    }

    /// Serve an existing coordinator, e.g. one also driven in-process.
    pub fn with_coordinator(config: GatewayConfig, coordinator: WorkspaceCoordinator) -> Self {
        Self {
            config,
            coordinator,
            stats: Arc::new(RwLock::new(GatewayStats::default())),
        }
    }

    pub fn coordinator(&self) -> &WorkspaceCoordinator {
        &self.coordinator
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> GatewayStats {
        self.stats.read().await.clone()
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration gateway listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let coordinator = self.coordinator.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, coordinator, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// What a connection is bound to.
#[derive(Default)]
struct Session {
    participant: Option<Uuid>,
    workspace: Option<WorkspaceHandle>,
    events: Option<EventSubscriber>,
}

impl Session {
    fn bound(&self) -> CollabResult<(Uuid, &WorkspaceHandle)> {
        match (self.participant, self.workspace.as_ref()) {
            (Some(participant), Some(workspace)) => Ok((participant, workspace)),
            _ => Err(CollabError::invalid("join a workspace first")),
        }
    }

    fn unbind(&mut self) {
        self.workspace = None;
        self.events = None;
    }

    /// Execute one request. `None` means no reply is sent.
    async fn handle(
        &mut self,
        coordinator: &WorkspaceCoordinator,
        message: ClientMessage,
    ) -> CollabResult<Option<ServerMessage>> {
        let reply = match message {
            ClientMessage::CreateWorkspace {
                participant_id,
                name,
                participants,
                overrides,
            } => {
                let spec = WorkspaceSpec::new(name, participant_id)
                    .with_participants(participants)
                    .with_overrides(overrides);
                let info = coordinator.create_workspace(spec).await?;
                ServerMessage::Created {
                    workspace_id: info.id,
                }
            }
            ClientMessage::Join {
                workspace_id,
                participant_id,
            } => {
                let workspace = coordinator.workspace(workspace_id).await?;
                let events = workspace.subscribe(participant_id).await?;
                let snapshot = workspace.snapshot(participant_id).await?;
                log::info!("Participant {participant_id} connected to workspace {workspace_id}");
                self.participant = Some(participant_id);
                self.workspace = Some(workspace);
                self.events = Some(events);
                ServerMessage::Snapshot(Box::new(snapshot))
            }
            ClientMessage::Edit(request) => {
                let (participant, workspace) = self.bound()?;
                ServerMessage::Applied(workspace.apply_edit(participant, request).await?)
            }
            ClientMessage::Undo => {
                let (participant, workspace) = self.bound()?;
                workspace.undo(participant).await?;
                ServerMessage::Ack
            }
            ClientMessage::Redo => {
                let (participant, workspace) = self.bound()?;
                workspace.redo(participant).await?;
                ServerMessage::Ack
            }
            ClientMessage::AcquireLock { object_id } => {
                let (participant, workspace) = self.bound()?;
                workspace.acquire_lock(participant, object_id).await?;
                ServerMessage::Ack
            }
            ClientMessage::ReleaseLock { object_id } => {
                let (participant, workspace) = self.bound()?;
                workspace.release_lock(participant, object_id).await?;
                ServerMessage::Ack
            }
            ClientMessage::Cursor {
                position,
                orientation,
            } => {
                let (participant, workspace) = self.bound()?;
                workspace.update_cursor(participant, position, orientation)?;
                return Ok(None);
            }
            ClientMessage::Selection { object_ids, mode } => {
                let (participant, workspace) = self.bound()?;
                workspace.update_selection(participant, object_ids, mode).await?;
                ServerMessage::Ack
            }
            ClientMessage::Snapshot => {
                let (participant, workspace) = self.bound()?;
                ServerMessage::Snapshot(Box::new(workspace.snapshot(participant).await?))
            }
            ClientMessage::AddParticipant {
                participant_id,
                overrides,
            } => {
                let (participant, workspace) = self.bound()?;
                let permissions = workspace
                    .add_participant(participant, participant_id, overrides)
                    .await?;
                ServerMessage::Permissions(permissions)
            }
            ClientMessage::RemoveParticipant { participant_id } => {
                let (participant, workspace) = self.bound()?;
                workspace.remove_participant(participant, participant_id).await?;
                if participant_id == participant {
                    self.unbind();
                }
                ServerMessage::Ack
            }
            ClientMessage::UpdatePermissions {
                participant_id,
                overrides,
            } => {
                let (participant, workspace) = self.bound()?;
                let permissions = workspace
                    .update_permissions(participant, participant_id, overrides)
                    .await?;
                ServerMessage::Permissions(permissions)
            }
            ClientMessage::EndWorkspace => {
                let (participant, workspace) = self.bound()?;
                let stats = workspace.stats().await?;
                if stats.info.creator != participant {
                    return Err(CollabError::PermissionDenied {
                        participant,
                        capability: Capability::Manage,
                    });
                }
                coordinator.end_workspace(stats.info.id).await?;
                ServerMessage::Ack
            }
            ClientMessage::Leave => {
                self.unbind();
                ServerMessage::Ack
            }
        };
        Ok(Some(reply))
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    coordinator: WorkspaceCoordinator,
    stats: Arc<RwLock<GatewayStats>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let result = run_session(&mut ws_sender, &mut ws_receiver, addr, &coordinator, &stats).await;
    stats.write().await.active_connections -= 1;
    result
}

type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

async fn run_session(
    ws_sender: &mut futures_util::stream::SplitSink<WsStream, Message>,
    ws_receiver: &mut futures_util::stream::SplitStream<WsStream>,
    addr: SocketAddr,
    coordinator: &WorkspaceCoordinator,
    stats: &RwLock<GatewayStats>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut session = Session::default();
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += bytes.len() as u64;
                        }

                        let request = match ClientMessage::decode(&bytes) {
                            Ok(request) => request,
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };

                        let reply = match session.handle(coordinator, request).await {
                            Ok(reply) => reply,
                            Err(error) => {
                                log::warn!("Request from {addr} rejected: {error}");
                                stats.write().await.rejected += 1;
                                Some(ServerMessage::Rejected { error })
                            }
                        };
                        if let Some(reply) = reply {
                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
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
                }
            }

            event = async {
                match session.events.as_mut() {
                    Some(events) => events.recv().await,
                    // Not joined yet: wait forever
                    None => std::future::pending().await,
                }
            } => {
                match event {
                    Some(event) => {
                        let frame = ServerMessage::Event(event).encode()?;
                        ws_sender.send(Message::Binary(frame.into())).await?;
                    }
                    None => {
                        log::debug!("Workspace of {addr} is gone; detaching");
                        session.unbind();
                    }
                }
            }
        }
    }
    Ok(())
}
