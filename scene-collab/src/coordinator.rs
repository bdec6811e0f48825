//! Workspace registry and per-workspace actors.
//!
//! ```text
//! caller ──► WorkspaceCoordinator ──► WorkspaceHandle ──mpsc──► actor task
//!                  (registry)               │                      │
//!                                           │ oneshot reply ◄──────┤ Workspace (state machine)
//!                                           │                      │
//!                                  subscribe ──► BroadcastGroup ◄──┘ events, after mutation
//!                                                                  │
//!                          lock expiry / cursor flush timers ──────┘ (send back into the mailbox)
//! ```
//!
//! Every command for one workspace is drained from a single mailbox by a
//! single task, so the arrival order at the mailbox is the order in which
//! edits are applied and versioned. Timers never touch state directly;
//! they post a command and take their place in that order.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats, EventSubscriber};
use crate::config::EngineConfig;
use crate::error::{CollabError, CollabResult};
use crate::history::EditRecord;
use crate::locks::Lock;
use crate::permissions::{PermissionOverrides, Permissions};
use crate::presence::{Selection, SelectionMode};
use crate::protocol::{EditRequest, EditResult, WorkspaceInfo, WorkspaceSnapshot};
use crate::scene::{ObjectId, Vec3};
use crate::workspace::{Outbox, Timer, Workspace, WorkspaceSpec};

type Reply<T> = oneshot::Sender<CollabResult<T>>;

/// Runtime statistics of one workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceStats {
    pub info: WorkspaceInfo,
    pub participant_count: usize,
    pub active_locks: usize,
    pub history_len: usize,
    pub redo_len: usize,
    pub broadcast: BroadcastStats,
}

enum Command {
    ApplyEdit {
        participant: Uuid,
        request: EditRequest,
        reply: Reply<EditResult>,
    },
    Undo {
        participant: Uuid,
        reply: Reply<EditRecord>,
    },
    Redo {
        participant: Uuid,
        reply: Reply<EditRecord>,
    },
    Snapshot {
        participant: Uuid,
        reply: Reply<WorkspaceSnapshot>,
    },
    AcquireLock {
        participant: Uuid,
        object_id: ObjectId,
        reply: Reply<Lock>,
    },
    ReleaseLock {
        participant: Uuid,
        object_id: ObjectId,
        reply: Reply<bool>,
    },
    ExpireLock {
        object_id: ObjectId,
        token: u64,
    },
    UpdateCursor {
        participant: Uuid,
        position: Vec3,
        orientation: Vec3,
    },
    FlushCursor {
        participant: Uuid,
    },
    UpdateSelection {
        participant: Uuid,
        object_ids: Vec<ObjectId>,
        mode: SelectionMode,
        reply: Reply<Selection>,
    },
    AddParticipant {
        by: Uuid,
        participant: Uuid,
        overrides: PermissionOverrides,
        reply: Reply<Permissions>,
    },
    RemoveParticipant {
        by: Uuid,
        participant: Uuid,
        reply: Reply<()>,
    },
    UpdatePermissions {
        by: Uuid,
        participant: Uuid,
        overrides: PermissionOverrides,
        reply: Reply<Permissions>,
    },
    Subscribe {
        participant: Uuid,
        reply: Reply<EventSubscriber>,
    },
    Stats {
        reply: Reply<WorkspaceStats>,
    },
    End {
        reply: Reply<WorkspaceInfo>,
    },
}

/// Cloneable address of a running workspace actor.
#[derive(Clone)]
pub struct WorkspaceHandle {
    id: Uuid,
    sender: mpsc::Sender<Command>,
}

impl WorkspaceHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the actor is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> CollabResult<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(make(reply))
            .await
            .map_err(|_| CollabError::WorkspaceNotFound(self.id))?;
        response
            .await
            .map_err(|_| CollabError::WorkspaceNotFound(self.id))?
    }

    /// Queue an edit behind every command already in the mailbox and wait
    /// for its outcome.
    pub async fn apply_edit(&self, participant: Uuid, request: EditRequest) -> CollabResult<EditResult> {
        self.call(|reply| Command::ApplyEdit {
            participant,
            request,
            reply,
        })
        .await
    }

    pub async fn undo(&self, participant: Uuid) -> CollabResult<EditRecord> {
        self.call(|reply| Command::Undo { participant, reply }).await
    }

    pub async fn redo(&self, participant: Uuid) -> CollabResult<EditRecord> {
        self.call(|reply| Command::Redo { participant, reply }).await
    }

    /// Members only.
    pub async fn snapshot(&self, participant: Uuid) -> CollabResult<WorkspaceSnapshot> {
        self.call(|reply| Command::Snapshot { participant, reply }).await
    }

    /// Never waits for the lock: succeeds or fails with `ObjectLocked`.
    pub async fn acquire_lock(&self, participant: Uuid, object_id: ObjectId) -> CollabResult<Lock> {
        self.call(|reply| Command::AcquireLock {
            participant,
            object_id,
            reply,
        })
        .await
    }

    /// `Ok(false)` when the participant did not hold the lock.
    pub async fn release_lock(&self, participant: Uuid, object_id: ObjectId) -> CollabResult<bool> {
        self.call(|reply| Command::ReleaseLock {
            participant,
            object_id,
            reply,
        })
        .await
    }

    /// Cursor moves are fire-and-forget and are dropped when the
    /// mailbox is full.
    pub fn update_cursor(&self, participant: Uuid, position: Vec3, orientation: Vec3) -> CollabResult<()> {
        let command = Command::UpdateCursor {
            participant,
            position,
            orientation,
        };
        match self.sender.try_send(command) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::trace!("Workspace {}: mailbox full, dropping cursor of {participant}", self.id);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CollabError::WorkspaceNotFound(self.id)),
        }
    }

    pub async fn update_selection(
        &self,
        participant: Uuid,
        object_ids: Vec<ObjectId>,
        mode: SelectionMode,
    ) -> CollabResult<Selection> {
        self.call(|reply| Command::UpdateSelection {
            participant,
            object_ids,
            mode,
            reply,
        })
        .await
    }

    pub async fn add_participant(
        &self,
        by: Uuid,
        participant: Uuid,
        overrides: PermissionOverrides,
    ) -> CollabResult<Permissions> {
        self.call(|reply| Command::AddParticipant {
            by,
            participant,
            overrides,
            reply,
        })
        .await
    }

    pub async fn remove_participant(&self, by: Uuid, participant: Uuid) -> CollabResult<()> {
        self.call(|reply| Command::RemoveParticipant {
            by,
            participant,
            reply,
        })
        .await
    }

    pub async fn update_permissions(
        &self,
        by: Uuid,
        participant: Uuid,
        overrides: PermissionOverrides,
    ) -> CollabResult<Permissions> {
        self.call(|reply| Command::UpdatePermissions {
            by,
            participant,
            overrides,
            reply,
        })
        .await
    }

    /// Event stream as seen by `participant`. Only members may subscribe.
    pub async fn subscribe(&self, participant: Uuid) -> CollabResult<EventSubscriber> {
        self.call(|reply| Command::Subscribe { participant, reply }).await
    }

    pub async fn stats(&self) -> CollabResult<WorkspaceStats> {
        self.call(|reply| Command::Stats { reply }).await
    }

    async fn end(&self) -> CollabResult<WorkspaceInfo> {
        self.call(|reply| Command::End { reply }).await
    }
}

/// Registry of live workspaces.
#[derive(Clone)]
pub struct WorkspaceCoordinator {
    config: Arc<EngineConfig>,
    workspaces: Arc<RwLock<HashMap<Uuid, WorkspaceHandle>>>,
}

impl Default for WorkspaceCoordinator {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl WorkspaceCoordinator {
    /// Empty registry; every workspace it creates shares `config`.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(config),
            workspaces: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open a workspace and start its actor. Must be called from within
    /// a tokio runtime.
    pub async fn create_workspace(&self, spec: WorkspaceSpec) -> CollabResult<WorkspaceInfo> {
        let id = Uuid::new_v4();
        let workspace = Workspace::new(id, spec, self.config.clone())?;
        let info = workspace.info();

        let (sender, inbox) = mpsc::channel(self.config.command_queue_capacity.max(1));
        let actor = WorkspaceActor {
            workspace,
            broadcast: BroadcastGroup::new(self.config.broadcast_capacity),
            mailbox: sender.downgrade(),
            inbox,
        };
        tokio::spawn(actor.run());

        self.workspaces
            .write()
            .await
            .insert(id, WorkspaceHandle { id, sender });
        log::info!(
            "Workspace {id} ({}) created by {} with {} participants",
            info.name,
            info.creator,
            info.participants.len()
        );
        Ok(info)
    }

    /// Handle to a running workspace, or `WorkspaceNotFound`.
    pub async fn workspace(&self, id: Uuid) -> CollabResult<WorkspaceHandle> {
        self.workspaces
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(CollabError::WorkspaceNotFound(id))
    }

    pub async fn workspace_ids(&self) -> Vec<Uuid> {
        self.workspaces.read().await.keys().copied().collect()
    }

    pub async fn workspace_count(&self) -> usize {
        self.workspaces.read().await.len()
    }

    pub async fn apply_edit(
        &self,
        workspace_id: Uuid,
        participant: Uuid,
        request: EditRequest,
    ) -> CollabResult<EditResult> {
        self.workspace(workspace_id)
            .await?
            .apply_edit(participant, request)
            .await
    }

    pub async fn undo(&self, workspace_id: Uuid, participant: Uuid) -> CollabResult<EditRecord> {
        self.workspace(workspace_id).await?.undo(participant).await
    }

    pub async fn redo(&self, workspace_id: Uuid, participant: Uuid) -> CollabResult<EditRecord> {
        self.workspace(workspace_id).await?.redo(participant).await
    }

    pub async fn snapshot(&self, workspace_id: Uuid, participant: Uuid) -> CollabResult<WorkspaceSnapshot> {
        self.workspace(workspace_id).await?.snapshot(participant).await
    }

    pub async fn acquire_lock(
        &self,
        workspace_id: Uuid,
        participant: Uuid,
        object_id: impl Into<ObjectId>,
    ) -> CollabResult<Lock> {
        self.workspace(workspace_id)
            .await?
            .acquire_lock(participant, object_id.into())
            .await
    }

    pub async fn release_lock(
        &self,
        workspace_id: Uuid,
        participant: Uuid,
        object_id: impl Into<ObjectId>,
    ) -> CollabResult<bool> {
        self.workspace(workspace_id)
            .await?
            .release_lock(participant, object_id.into())
            .await
    }

    pub async fn update_cursor(
        &self,
        workspace_id: Uuid,
        participant: Uuid,
        position: Vec3,
        orientation: Vec3,
    ) -> CollabResult<()> {
        self.workspace(workspace_id)
            .await?
            .update_cursor(participant, position, orientation)
    }

    pub async fn update_selection(
        &self,
        workspace_id: Uuid,
        participant: Uuid,
        object_ids: Vec<ObjectId>,
        mode: SelectionMode,
    ) -> CollabResult<Selection> {
        self.workspace(workspace_id)
            .await?
            .update_selection(participant, object_ids, mode)
            .await
    }

    pub async fn add_participant(
        &self,
        workspace_id: Uuid,
        by: Uuid,
        participant: Uuid,
        overrides: PermissionOverrides,
    ) -> CollabResult<Permissions> {
        self.workspace(workspace_id)
            .await?
            .add_participant(by, participant, overrides)
            .await
    }

    pub async fn remove_participant(&self, workspace_id: Uuid, by: Uuid, participant: Uuid) -> CollabResult<()> {
        self.workspace(workspace_id)
            .await?
            .remove_participant(by, participant)
            .await
    }

    pub async fn update_permissions(
        &self,
        workspace_id: Uuid,
        by: Uuid,
        participant: Uuid,
        overrides: PermissionOverrides,
    ) -> CollabResult<Permissions> {
        self.workspace(workspace_id)
            .await?
            .update_permissions(by, participant, overrides)
            .await
    }

    /// Event stream for a member, filtered to what they are meant to see.
    pub async fn subscribe(&self, workspace_id: Uuid, participant: Uuid) -> CollabResult<EventSubscriber> {
        self.workspace(workspace_id).await?.subscribe(participant).await
    }

    pub async fn stats(&self, workspace_id: Uuid) -> CollabResult<WorkspaceStats> {
        self.workspace(workspace_id).await?.stats().await
    }

    /// Release every lock, clear presence and discard the workspace.
    /// Subscribers receive `workspaceEnded` and then see their stream close.
    pub async fn end_workspace(&self, workspace_id: Uuid) -> CollabResult<WorkspaceInfo> {
        let handle = self
            .workspaces
            .write()
            .await
            .remove(&workspace_id)
            .ok_or(CollabError::WorkspaceNotFound(workspace_id))?;
        handle.end().await
    }
}

struct WorkspaceActor {
    workspace: Workspace,
    broadcast: BroadcastGroup,
    /// Weak so pending timers don't keep an abandoned workspace alive
    mailbox: mpsc::WeakSender<Command>,
    inbox: mpsc::Receiver<Command>,
}

impl WorkspaceActor {
    async fn run(mut self) {
        let id = self.workspace.id();
        log::debug!("Workspace {id}: actor started");

        while let Some(command) = self.inbox.recv().await {
            let mut out = Outbox::default();
            let done = self.handle(command, &mut out);
            self.dispatch(out);
            if done {
                break;
            }
        }

        log::debug!("Workspace {id}: actor stopped");
    }

    /// Apply one command. Returns `true` when the actor should stop.
    fn handle(&mut self, command: Command, out: &mut Outbox) -> bool {
        let ws = &mut self.workspace;
        match command {
            Command::ApplyEdit {
                participant,
                request,
                reply,
            } => {
                let result = ws.apply_edit(participant, &request, out);
                if let Err(e) = &result {
                    log::debug!("Workspace {}: edit by {participant} rejected: {e}", ws.id());
                }
                let _ = reply.send(result);
            }
            Command::Undo { participant, reply } => {
                let _ = reply.send(ws.undo(participant, out));
            }
            Command::Redo { participant, reply } => {
                let _ = reply.send(ws.redo(participant, out));
            }
            Command::Snapshot { participant, reply } => {
                let _ = reply.send(ws.snapshot(participant));
            }
            Command::AcquireLock {
                participant,
                object_id,
                reply,
            } => {
                let _ = reply.send(ws.acquire_lock(participant, &object_id, Instant::now(), out));
            }
            Command::ReleaseLock {
                participant,
                object_id,
                reply,
            } => {
                let _ = reply.send(ws.release_lock(participant, &object_id, out));
            }
            Command::ExpireLock { object_id, token } => {
                ws.expire_lock(&object_id, token, out);
            }
            Command::UpdateCursor {
                participant,
                position,
                orientation,
            } => {
                if let Err(e) = ws.update_cursor(participant, position, orientation, Instant::now(), out) {
                    log::trace!("Workspace {}: cursor from {participant} ignored: {e}", ws.id());
                }
            }
            Command::FlushCursor { participant } => {
                ws.flush_cursor(participant, Instant::now(), out);
            }
            Command::UpdateSelection {
                participant,
                object_ids,
                mode,
                reply,
            } => {
                let _ = reply.send(ws.update_selection(participant, &object_ids, mode, out));
            }
            Command::AddParticipant {
                by,
                participant,
                overrides,
                reply,
            } => {
                let _ = reply.send(ws.add_participant(by, participant, &overrides, out));
            }
            Command::RemoveParticipant {
                by,
                participant,
                reply,
            } => {
                let _ = reply.send(ws.remove_participant(by, participant, out));
            }
            Command::UpdatePermissions {
                by,
                participant,
                overrides,
                reply,
            } => {
                let _ = reply.send(ws.update_permissions(by, participant, &overrides, out));
            }
            Command::Subscribe { participant, reply } => {
                let result = ws
                    .snapshot(participant)
                    .map(|_| self.broadcast.subscribe(participant));
                let _ = reply.send(result);
            }
            Command::Stats { reply } => {
                let info = ws.info();
                let (history_len, redo_len) = ws.history_depth();
                let _ = reply.send(Ok(WorkspaceStats {
                    participant_count: info.participants.len(),
                    info,
                    active_locks: ws.lock_count(),
                    history_len,
                    redo_len,
                    broadcast: self.broadcast.stats(),
                }));
            }
            Command::End { reply } => {
                ws.end(out);
                let _ = reply.send(Ok(ws.info()));
                return true;
            }
        }
        false
    }

    /// Publish events and arm timers produced by the last command.
    fn dispatch(&mut self, out: Outbox) {
        for (audience, event) in out.events {
            self.broadcast.send(audience, event);
        }

        for timer in out.timers {
            match timer {
                Timer::LockExpiry {
                    object_id,
                    token,
                    deadline,
                } => {
                    let mailbox = self.mailbox.clone();
                    let command = Command::ExpireLock {
                        object_id: object_id.clone(),
                        token,
                    };
                    let task = tokio::spawn(post_at(mailbox, deadline, command));
                    self.workspace
                        .attach_lock_timer(&object_id, token, task.abort_handle());
                }
                Timer::CursorFlush { participant, at } => {
                    let mailbox = self.mailbox.clone();
                    tokio::spawn(post_at(mailbox, at, Command::FlushCursor { participant }));
                }
            }
        }
    }
}

async fn post_at(mailbox: mpsc::WeakSender<Command>, at: Instant, command: Command) {
    tokio::time::sleep_until(at).await;
    if let Some(sender) = mailbox.upgrade() {
        // A closed mailbox means the workspace is gone; nothing to do.
        let _ = sender.send(command).await;
    }
}
