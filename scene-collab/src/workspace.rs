//! Authoritative state of one workspace.
//!
//! [`Workspace`] is a plain state machine: every call runs to completion
//! without awaiting, checks before it mutates, and reports its side
//! effects (events to broadcast, timers to arm) through an [`Outbox`]
//! instead of performing them. The coordinator's actor owns it and
//! drains the outbox after each call.
//!
//! Edit pipeline:
//!
//! ```text
//! resolve ─► capability ─► OT transform ─► lock gate ─► store ─► OT log ─► history ─► outbox
//!    │            │              │              │          │
//!    └────────────┴──────────────┴──────────────┴──────────┴── any failure: no state change
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::broadcast::Audience;
use crate::config::EngineConfig;
use crate::error::{CollabError, CollabResult};
use crate::history::{EditRecord, HistoryManager, SceneState};
use crate::locks::{Lock, LockManager};
use crate::ot::OperationalTransformEngine;
use crate::permissions::{Capability, PermissionManager, PermissionOverrides, Permissions};
use crate::presence::{CursorDecision, PresenceTracker, Selection, SelectionMode};
use crate::protocol::{
    EditOp, EditRequest, EditResult, OperationKind, WorkspaceEvent, WorkspaceInfo,
    WorkspaceSnapshot, ENVIRONMENT_TARGET,
};
use crate::scene::{
    now_millis, Camera, Environment, NewObject, ObjectId, SceneObjectStore, Vec3,
};

/// Transform-log entries retained per workspace.
const OT_LOG_CAPACITY: usize = 1024;

/// Everything needed to open a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSpec {
    pub name: String,
    pub creator: Uuid,
    pub participants: Vec<Uuid>,
    /// Applied on top of the participant defaults for everyone but the creator
    pub overrides: PermissionOverrides,
    pub initial_objects: Vec<(ObjectId, NewObject)>,
    pub environment: Option<Environment>,
    pub camera: Option<Camera>,
}

impl WorkspaceSpec {
    /// Empty workspace owned by `creator`, who holds every capability.
    pub fn new(name: impl Into<String>, creator: Uuid) -> Self {
        Self {
            name: name.into(),
            creator,
            participants: Vec::new(),
            overrides: PermissionOverrides::default(),
            initial_objects: Vec::new(),
            environment: None,
            camera: None,
        }
    }

    /// Invite participants up front with the default capabilities.
    pub fn with_participants(mut self, participants: impl IntoIterator<Item = Uuid>) -> Self {
        self.participants.extend(participants);
        self
    }

    pub fn with_overrides(mut self, overrides: PermissionOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Seed an object. Seeded objects are not part of the edit history.
    pub fn with_object(mut self, id: impl Into<ObjectId>, object: NewObject) -> Self {
        self.initial_objects.push((id.into(), object));
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_camera(mut self, camera: Camera) -> Self {
        self.camera = Some(camera);
        self
    }
}

/// Timer the caller must arm on the workspace's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Timer {
    LockExpiry {
        object_id: ObjectId,
        token: u64,
        deadline: Instant,
    },
    CursorFlush {
        participant: Uuid,
        at: Instant,
    },
}

/// Side effects of one call.
#[derive(Debug, Default)]
pub struct Outbox {
    pub events: Vec<(Audience, WorkspaceEvent)>,
    pub timers: Vec<Timer>,
}

impl Outbox {
    fn emit(&mut self, audience: Audience, event: WorkspaceEvent) {
        self.events.push((audience, event));
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.timers.is_empty()
    }
}

pub struct Workspace {
    id: Uuid,
    name: String,
    created_at: u64,
    last_modified: u64,
    total_edits: u64,
    config: Arc<EngineConfig>,
    store: SceneObjectStore,
    locks: LockManager,
    permissions: PermissionManager,
    ot: OperationalTransformEngine,
    history: HistoryManager,
    presence: PresenceTracker,
}

impl Workspace {
    /// Open a workspace at version 0.
    ///
    /// Fails when the seeded objects repeat an id.
    pub fn new(id: Uuid, spec: WorkspaceSpec, config: Arc<EngineConfig>) -> CollabResult<Self> {
        let now = now_millis();
        let mut store = SceneObjectStore::new(spec.environment.unwrap_or_default());
        if let Some(camera) = spec.camera {
            store.set_camera(camera);
        }
        for (object_id, object) in &spec.initial_objects {
            store.create_object(object_id.clone(), object, spec.creator, now)?;
        }

        Ok(Self {
            id,
            name: spec.name,
            created_at: now,
            last_modified: now,
            total_edits: 0,
            store,
            locks: LockManager::new(),
            permissions: PermissionManager::new(spec.creator, &spec.participants, &spec.overrides),
            ot: OperationalTransformEngine::new(OT_LOG_CAPACITY),
            history: HistoryManager::new(config.history_capacity),
            presence: PresenceTracker::new(config.cursor_throttle, config.connectivity_radius),
            config,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Version of the last applied edit, undo or redo.
    pub fn version(&self) -> u64 {
        self.ot.version()
    }

    pub fn store(&self) -> &SceneObjectStore {
        &self.store
    }

    /// Summary with participants ordered by id.
    pub fn info(&self) -> WorkspaceInfo {
        let mut participants: Vec<Uuid> = self.permissions.participants().copied().collect();
        participants.sort();
        WorkspaceInfo {
            id: self.id,
            name: self.name.clone(),
            creator: self.permissions.creator(),
            participants,
            version: self.ot.version(),
            created_at: self.created_at,
            last_modified: self.last_modified,
            total_edits: self.total_edits,
        }
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// `(undo, redo)` stack depths.
    pub fn history_depth(&self) -> (usize, usize) {
        (self.history.len(), self.history.redo_len())
    }

    // ── Edits ────────────────────────────────────────────────────

    /// Run one edit through the full pipeline and assign it the next version.
    ///
    /// Order of checks: the request must resolve to a known operation, the
    /// participant must hold the operation's capability, the client version
    /// must not be ahead of the workspace, and edits to an existing object
    /// must not hit someone else's lock. Any failure leaves the workspace
    /// untouched. On success the edit is logged for reconciliation, pushed
    /// onto the undo stack (clearing redo) and announced as `editApplied`.
    pub fn apply_edit(
        &mut self,
        participant: Uuid,
        request: &EditRequest,
        out: &mut Outbox,
    ) -> CollabResult<EditResult> {
        let op = request.resolve()?;
        let kind = op.kind();
        self.permissions.require(&participant, kind.required_capability())?;
        let op = self.ot.transform(&request.object_id, op, request.client_version)?;
        if kind.touches_existing_object() {
            self.locks.check(&request.object_id, &participant)?;
        }

        let now = now_millis();
        let (target, before, after) = self.execute(participant, &request.object_id, &op, now)?;

        let transform = match &op {
            EditOp::Transform(patch) => Some(*patch),
            _ => None,
        };
        let version = self.ot.record(target.clone(), kind, transform, participant);
        self.total_edits += 1;
        self.last_modified = now;

        if kind == OperationKind::Delete {
            self.forget_object(&target, out);
        }

        self.history.append(EditRecord {
            operation: kind,
            object_id: target.clone(),
            op,
            before,
            after: after.clone(),
            participant,
            version,
            timestamp: now,
        });

        let result = EditResult {
            object_id: target,
            operation: kind,
            participant,
            result: after,
            server_version: version,
            server_timestamp: now,
        };
        log::debug!(
            "Workspace {}: {} applied {} on {} at v{version}",
            self.id,
            participant,
            kind,
            result.object_id
        );

        // Creators already hold the object locally.
        let audience = if kind == OperationKind::Create {
            Audience::AllExcept(participant)
        } else {
            Audience::All
        };
        out.emit(audience, WorkspaceEvent::EditApplied(result.clone()));
        Ok(result)
    }

    /// Mutate the store. Fails before touching anything.
    fn execute(
        &mut self,
        participant: Uuid,
        object_id: &ObjectId,
        op: &EditOp,
        now: u64,
    ) -> CollabResult<(ObjectId, SceneState, SceneState)> {
        let capture = |store: &SceneObjectStore, id: &ObjectId| SceneState::capture_object(store, id);

        match op {
            EditOp::Create(spec) => {
                let before = capture(&self.store, object_id);
                self.store.create_object(object_id.clone(), spec, participant, now)?;
                Ok((object_id.clone(), before, capture(&self.store, object_id)))
            }
            EditOp::Transform(patch) => {
                let before = capture(&self.store, object_id);
                self.store.update_transform(object_id, patch, participant, now)?;
                Ok((object_id.clone(), before, capture(&self.store, object_id)))
            }
            EditOp::Material(props) => {
                let before = capture(&self.store, object_id);
                self.store.update_material(object_id, props, participant, now)?;
                Ok((object_id.clone(), before, capture(&self.store, object_id)))
            }
            EditOp::Delete => {
                let removed = self.store.delete_object(object_id)?;
                let before = SceneState::Object {
                    id: object_id.clone(),
                    state: Some(removed),
                };
                Ok((object_id.clone(), before, capture(&self.store, object_id)))
            }
            EditOp::Clone { offset, new_id } => {
                let new_id = new_id.clone().unwrap_or_else(ObjectId::generate);
                let offset: Vec3 = offset.unwrap_or(self.config.clone_offset);
                let before = capture(&self.store, &new_id);
                self.store
                    .clone_object(object_id, new_id.clone(), offset, participant, now)?;
                let after = capture(&self.store, &new_id);
                Ok((new_id, before, after))
            }
            EditOp::Environment(patch) => {
                let before = SceneState::Environment(self.store.environment().clone());
                let after = SceneState::Environment(self.store.update_environment(patch).clone());
                Ok((ObjectId::from(ENVIRONMENT_TARGET), before, after))
            }
            EditOp::Light(light) => {
                let before = SceneState::capture_light(&self.store, &light.id);
                self.store.upsert_light(light.clone());
                let after = SceneState::capture_light(&self.store, &light.id);
                Ok((light.id.clone(), before, after))
            }
        }
    }

    /// An object left the live store: its lock and selections go with it.
    fn forget_object(&mut self, object_id: &ObjectId, out: &mut Outbox) {
        if let Some(lock) = self.locks.drop_object(object_id) {
            out.emit(
                Audience::All,
                WorkspaceEvent::LockReleased {
                    object_id: lock.object_id,
                    holder: lock.holder,
                    expired: false,
                },
            );
        }
        for (participant, selection) in self.presence.forget_object(object_id) {
            out.emit(
                Audience::All,
                WorkspaceEvent::SelectionChanged {
                    participant,
                    selection,
                },
            );
        }
    }

    // ── Undo / redo ──────────────────────────────────────────────

    /// Revert the most recent edit, whoever made it.
    ///
    /// The caller needs the capability of the inverse operation and must not
    /// be blocked by a lock on the affected object. Bumps the version.
    pub fn undo(&mut self, participant: Uuid, out: &mut Outbox) -> CollabResult<EditRecord> {
        let top = self.history.peek_undo().ok_or(CollabError::NoHistoryToUndo)?;
        self.permissions
            .require(&participant, top.inverse_kind().required_capability())?;
        if let Some(id) = top.guarded_object() {
            self.locks.check(id, &participant)?;
        }

        let record = self
            .history
            .undo(&mut self.store)
            .ok_or(CollabError::NoHistoryToUndo)?;
        let version = self.finish_replay(participant, &record.before, &record, out);
        log::debug!(
            "Workspace {}: {} undid {} on {} (v{version})",
            self.id,
            participant,
            record.operation,
            record.object_id
        );
        out.emit(
            Audience::All,
            WorkspaceEvent::Undo {
                participant,
                edit: record.clone(),
                server_version: version,
            },
        );
        Ok(record)
    }

    /// Reapply the most recently undone edit exactly as it was captured.
    pub fn redo(&mut self, participant: Uuid, out: &mut Outbox) -> CollabResult<EditRecord> {
        let top = self.history.peek_redo().ok_or(CollabError::NoHistoryToRedo)?;
        self.permissions
            .require(&participant, top.operation.required_capability())?;
        if let Some(id) = top.guarded_object() {
            self.locks.check(id, &participant)?;
        }

        let record = self
            .history
            .redo(&mut self.store)
            .ok_or(CollabError::NoHistoryToRedo)?;
        let version = self.finish_replay(participant, &record.after, &record, out);
        log::debug!(
            "Workspace {}: {} redid {} on {} (v{version})",
            self.id,
            participant,
            record.operation,
            record.object_id
        );
        out.emit(
            Audience::All,
            WorkspaceEvent::Redo {
                participant,
                edit: record.clone(),
                server_version: version,
            },
        );
        Ok(record)
    }

    /// Shared bookkeeping after an undo/redo restored `restored`.
    fn finish_replay(
        &mut self,
        participant: Uuid,
        restored: &SceneState,
        record: &EditRecord,
        out: &mut Outbox,
    ) -> u64 {
        if let SceneState::Object { id, state: None } = restored {
            self.forget_object(id, out);
        }
        self.last_modified = now_millis();
        self.ot
            .record(record.object_id.clone(), OperationKind::Restore, None, participant)
    }

    // ── Locks ────────────────────────────────────────────────────

    /// Take or refresh an exclusive lock on an existing object.
    ///
    /// A granted lock asks the caller to arm an expiry timer. When someone
    /// else holds it, the requester alone receives `lockConflict` and the
    /// call fails with `ObjectLocked`.
    pub fn acquire_lock(
        &mut self,
        participant: Uuid,
        object_id: &ObjectId,
        now: Instant,
        out: &mut Outbox,
    ) -> CollabResult<Lock> {
        self.permissions.require(&participant, Capability::Edit)?;
        if !self.store.contains(object_id) {
            return Err(CollabError::ObjectNotFound(object_id.clone()));
        }

        match self
            .locks
            .try_acquire(object_id, participant, self.config.lock_ttl, now, now_millis())
        {
            Ok(grant) => {
                log::debug!(
                    "Workspace {}: {} {} lock on {}",
                    self.id,
                    participant,
                    if grant.refreshed { "refreshed" } else { "acquired" },
                    object_id
                );
                out.timers.push(Timer::LockExpiry {
                    object_id: object_id.clone(),
                    token: grant.token,
                    deadline: grant.deadline,
                });
                out.emit(Audience::All, WorkspaceEvent::LockAcquired(grant.lock.clone()));
                Ok(grant.lock)
            }
            Err(err) => {
                if let CollabError::ObjectLocked { holder, .. } = &err {
                    out.emit(
                        Audience::Only(participant),
                        WorkspaceEvent::LockConflict {
                            object_id: object_id.clone(),
                            requester: participant,
                            holder: *holder,
                        },
                    );
                }
                Err(err)
            }
        }
    }

    /// Returns whether a lock was actually released.
    pub fn release_lock(
        &mut self,
        participant: Uuid,
        object_id: &ObjectId,
        out: &mut Outbox,
    ) -> CollabResult<bool> {
        self.permissions.require_member(&participant)?;
        let Some(lock) = self.locks.release(object_id, &participant) else {
            return Ok(false);
        };
        out.emit(
            Audience::All,
            WorkspaceEvent::LockReleased {
                object_id: lock.object_id,
                holder: lock.holder,
                expired: false,
            },
        );
        Ok(true)
    }

    /// Timer-driven release. Stale tokens are ignored.
    pub fn expire_lock(&mut self, object_id: &ObjectId, token: u64, out: &mut Outbox) -> bool {
        let Some(lock) = self.locks.expire(object_id, token) else {
            return false;
        };
        log::debug!("Workspace {}: lock on {} held by {} expired", self.id, object_id, lock.holder);
        out.emit(
            Audience::All,
            WorkspaceEvent::LockReleased {
                object_id: lock.object_id,
                holder: lock.holder,
                expired: true,
            },
        );
        true
    }

    /// Hand a freshly spawned expiry task to the lock table.
    pub fn attach_lock_timer(
        &mut self,
        object_id: &ObjectId,
        token: u64,
        timer: tokio::task::AbortHandle,
    ) {
        self.locks.attach_timer(object_id, token, timer);
    }

    // ── Presence ─────────────────────────────────────────────────

    /// Store the participant's cursor and broadcast it, subject to the
    /// per-participant throttle window.
    pub fn update_cursor(
        &mut self,
        participant: Uuid,
        position: Vec3,
        orientation: Vec3,
        now: Instant,
        out: &mut Outbox,
    ) -> CollabResult<()> {
        self.permissions.require_member(&participant)?;
        match self
            .presence
            .update_cursor(participant, position, orientation, now, now_millis())
        {
            CursorDecision::Broadcast(cursor) => {
                out.emit(
                    Audience::AllExcept(participant),
                    WorkspaceEvent::CursorUpdate { participant, cursor },
                );
            }
            CursorDecision::Deferred { flush_at } => {
                out.timers.push(Timer::CursorFlush {
                    participant,
                    at: flush_at,
                });
            }
            CursorDecision::Coalesced => {}
        }
        Ok(())
    }

    /// Send the cursor held back by the throttle, if it is still pending.
    pub fn flush_cursor(&mut self, participant: Uuid, now: Instant, out: &mut Outbox) {
        if let Some(cursor) = self.presence.flush_cursor(&participant, now) {
            out.emit(
                Audience::AllExcept(participant),
                WorkspaceEvent::CursorUpdate { participant, cursor },
            );
        }
    }

    /// Replace the participant's selection and tell everyone else.
    pub fn update_selection(
        &mut self,
        participant: Uuid,
        object_ids: &[ObjectId],
        mode: SelectionMode,
        out: &mut Outbox,
    ) -> CollabResult<Selection> {
        self.permissions.require_member(&participant)?;
        let selection =
            self.presence
                .update_selection(participant, object_ids, mode, &self.store, now_millis());
        out.emit(
            Audience::AllExcept(participant),
            WorkspaceEvent::SelectionChanged {
                participant,
                selection: selection.clone(),
            },
        );
        Ok(selection)
    }

    // ── Membership ───────────────────────────────────────────────

    /// Invite someone. Requires `invite`; inviting a member again is a no-op
    /// that returns their current capabilities.
    pub fn add_participant(
        &mut self,
        by: Uuid,
        participant: Uuid,
        overrides: &PermissionOverrides,
        out: &mut Outbox,
    ) -> CollabResult<Permissions> {
        self.permissions.require(&by, Capability::Invite)?;
        if let Some(existing) = self.permissions.permissions(&participant) {
            return Ok(*existing);
        }
        let permissions = self.permissions.add_participant(participant, overrides);
        log::info!("Workspace {}: {} joined (invited by {})", self.id, participant, by);
        out.emit(
            Audience::All,
            WorkspaceEvent::ParticipantJoined {
                participant,
                permissions,
            },
        );
        Ok(permissions)
    }

    /// Participants may always leave; removing someone else needs `manage`.
    pub fn remove_participant(
        &mut self,
        by: Uuid,
        participant: Uuid,
        out: &mut Outbox,
    ) -> CollabResult<()> {
        if by == participant {
            self.permissions.require_member(&by)?;
        } else {
            self.permissions.require(&by, Capability::Manage)?;
        }
        if participant == self.permissions.creator() {
            return Err(CollabError::invalid("the creator cannot leave their workspace"));
        }
        if self.permissions.remove_participant(&participant).is_none() {
            return Err(CollabError::invalid(format!("{participant} is not a participant")));
        }

        for lock in self.locks.release_all_for(&participant) {
            out.emit(
                Audience::All,
                WorkspaceEvent::LockReleased {
                    object_id: lock.object_id,
                    holder: lock.holder,
                    expired: false,
                },
            );
        }
        self.presence.remove_participant(&participant);
        log::info!("Workspace {}: {} left", self.id, participant);
        out.emit(Audience::All, WorkspaceEvent::ParticipantLeft { participant });
        Ok(())
    }

    /// Apply capability overrides to a member. Requires `manage`.
    pub fn update_permissions(
        &mut self,
        by: Uuid,
        participant: Uuid,
        overrides: &PermissionOverrides,
        out: &mut Outbox,
    ) -> CollabResult<Permissions> {
        let permissions = self
            .permissions
            .update_permissions(&by, &participant, overrides)?;
        out.emit(
            Audience::All,
            WorkspaceEvent::PermissionsChanged {
                participant,
                permissions,
            },
        );
        Ok(permissions)
    }

    // ── Snapshot & teardown ──────────────────────────────────────

    /// Full state for a member. Every list is in a stable order so equal
    /// states produce equal snapshots.
    pub fn snapshot(&self, participant: Uuid) -> CollabResult<WorkspaceSnapshot> {
        self.permissions.require_member(&participant)?;
        let permissions = self
            .permissions
            .permissions(&participant)
            .copied()
            .unwrap_or_else(Permissions::participant_default);

        let mut objects: Vec<_> = self.store.objects().cloned().collect();
        objects.sort_by(|a, b| a.id.cmp(&b.id));
        let mut lights: Vec<_> = self.store.lights().cloned().collect();
        lights.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(WorkspaceSnapshot {
            workspace: self.info(),
            objects,
            materials: self.store.live_materials(),
            lights,
            environment: self.store.environment().clone(),
            camera: *self.store.camera(),
            locks: self.locks.locks(),
            permissions,
            selection: self.presence.selection(&participant).cloned(),
            cursor: self.presence.cursor(&participant).copied(),
            selections: self.presence.selections(),
            cursors: self.presence.cursors(),
            history: self.history.recent(self.config.snapshot_history_len),
        })
    }

    /// Release all locks and presence ahead of disposal.
    pub fn end(&mut self, out: &mut Outbox) {
        let released = self.locks.clear();
        self.presence.clear();
        log::info!(
            "Workspace {} ({}) ended after {} edits, {released} locks released",
            self.id,
            self.name,
            self.total_edits
        );
        out.emit(
            Audience::All,
            WorkspaceEvent::WorkspaceEnded {
                workspace_id: self.id,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{MaterialProps, ObjectType, TransformPatch};

    struct Fixture {
        ws: Workspace,
        alice: Uuid,
        bob: Uuid,
        out: Outbox,
    }

    impl Fixture {
        fn new() -> Self {
            let alice = Uuid::new_v4();
            let bob = Uuid::new_v4();
            let spec = WorkspaceSpec::new("Studio", alice).with_participants([bob]);
            let ws = Workspace::new(Uuid::new_v4(), spec, Arc::new(EngineConfig::default())).unwrap();
            Self {
                ws,
                alice,
                bob,
                out: Outbox::default(),
            }
        }

        fn create(&mut self, id: &str, x: f32) -> EditResult {
            let v = self.ws.version();
            let request = EditRequest::create(id, NewObject::new(ObjectType::Box).at(Vec3::new(x, 0.0, 0.0)), v);
            self.ws.apply_edit(self.alice, &request, &mut self.out).unwrap()
        }

        fn position(&self, id: &str) -> Vec3 {
            self.ws.store().object(&ObjectId::from(id)).unwrap().transform.position
        }

        fn drain(&mut self) -> Vec<(Audience, WorkspaceEvent)> {
            std::mem::take(&mut self.out.events)
        }
    }

    #[test]
    fn test_initial_objects_do_not_enter_history() {
        let alice = Uuid::new_v4();
        let spec = WorkspaceSpec::new("Seeded", alice)
            .with_object("floor", NewObject::new(ObjectType::Plane));
        let ws = Workspace::new(Uuid::new_v4(), spec, Arc::new(EngineConfig::default())).unwrap();
        assert_eq!(ws.version(), 0);
        assert_eq!(ws.store().len(), 1);
        assert_eq!(ws.history_depth(), (0, 0));
    }

    #[test]
    fn test_duplicate_initial_objects_rejected() {
        let spec = WorkspaceSpec::new("Dup", Uuid::new_v4())
            .with_object("a", NewObject::new(ObjectType::Box))
            .with_object("a", NewObject::new(ObjectType::Box));
        assert!(Workspace::new(Uuid::new_v4(), spec, Arc::new(EngineConfig::default())).is_err());
    }

    #[test]
    fn test_create_excludes_originator() {
        let mut f = Fixture::new();
        let result = f.create("obj1", 0.0);
        assert_eq!(result.server_version, 1);
        let events = f.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, Audience::AllExcept(f.alice));
    }

    #[test]
    fn test_failed_edit_changes_nothing() {
        let mut f = Fixture::new();
        f.create("obj1", 0.0);
        f.drain();

        let err = f
            .ws
            .apply_edit(f.bob, &EditRequest::delete("obj1", 1), &mut f.out)
            .unwrap_err();
        assert!(matches!(err, CollabError::PermissionDenied { .. }));
        assert_eq!(f.ws.version(), 1);
        assert!(f.ws.store().contains(&ObjectId::from("obj1")));
        assert!(f.out.is_empty());
        assert_eq!(f.ws.history_depth(), (1, 0));
    }

    #[test]
    fn test_transform_missing_object_keeps_version() {
        let mut f = Fixture::new();
        let err = f
            .ws
            .apply_edit(
                f.alice,
                &EditRequest::transform("ghost", TransformPatch::position(Vec3::ONE), 0),
                &mut f.out,
            )
            .unwrap_err();
        assert_eq!(err, CollabError::ObjectNotFound(ObjectId::from("ghost")));
        assert_eq!(f.ws.version(), 0);
    }

    #[test]
    fn test_concurrent_transforms_accumulate() {
        let mut f = Fixture::new();
        f.create("obj1", 0.0);
        let base = f.ws.version();

        let a = EditRequest::transform("obj1", TransformPatch::position(Vec3::new(1.0, 0.0, 0.0)), base);
        let b = EditRequest::transform("obj1", TransformPatch::position(Vec3::new(0.0, 2.0, 0.0)), base);
        f.ws.apply_edit(f.alice, &a, &mut f.out).unwrap();
        f.ws.apply_edit(f.bob, &b, &mut f.out).unwrap();

        assert_eq!(f.position("obj1"), Vec3::new(1.0, 2.0, 0.0));
    }

    #[test]
    fn test_lock_blocks_other_participant() {
        let mut f = Fixture::new();
        f.create("obj1", 0.0);
        let now = Instant::now();
        f.ws.acquire_lock(f.alice, &ObjectId::from("obj1"), now, &mut f.out).unwrap();
        assert!(matches!(f.out.timers[0], Timer::LockExpiry { .. }));

        let request = EditRequest::transform("obj1", TransformPatch::position(Vec3::ONE), f.ws.version());
        let err = f.ws.apply_edit(f.bob, &request, &mut f.out).unwrap_err();
        assert!(matches!(err, CollabError::ObjectLocked { holder, .. } if holder == f.alice));

        // Holder still edits freely.
        f.ws.apply_edit(f.alice, &request, &mut f.out).unwrap();
    }

    #[test]
    fn test_lock_conflict_event_targets_requester() {
        let mut f = Fixture::new();
        f.create("obj1", 0.0);
        let id = ObjectId::from("obj1");
        f.ws.acquire_lock(f.alice, &id, Instant::now(), &mut f.out).unwrap();
        f.drain();

        assert!(f.ws.acquire_lock(f.bob, &id, Instant::now(), &mut f.out).is_err());
        let events = f.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, Audience::Only(f.bob));
        assert_eq!(events[0].1.name(), "lockConflict");
    }

    #[test]
    fn test_lock_missing_object() {
        let mut f = Fixture::new();
        let err = f
            .ws
            .acquire_lock(f.alice, &ObjectId::from("ghost"), Instant::now(), &mut f.out)
            .unwrap_err();
        assert!(matches!(err, CollabError::ObjectNotFound(_)));
    }

    #[test]
    fn test_delete_drops_lock_and_selection() {
        let mut f = Fixture::new();
        f.create("obj1", 0.0);
        let id = ObjectId::from("obj1");
        f.ws.acquire_lock(f.alice, &id, Instant::now(), &mut f.out).unwrap();
        f.ws
            .update_selection(f.bob, &[id.clone()], SelectionMode::Single, &mut f.out)
            .unwrap();
        f.drain();

        f.ws
            .apply_edit(f.alice, &EditRequest::delete("obj1", f.ws.version()), &mut f.out)
            .unwrap();
        assert_eq!(f.ws.lock_count(), 0);
        let names: Vec<&str> = f.out.events.iter().map(|(_, e)| e.name()).collect();
        assert_eq!(names, vec!["lockReleased", "selectionChanged", "edit_applied"]);
    }

    #[test]
    fn test_undo_create_requires_delete() {
        let mut f = Fixture::new();
        let request = EditRequest::create("bobs", NewObject::new(ObjectType::Cone), 0);
        f.ws.apply_edit(f.bob, &request, &mut f.out).unwrap();

        let err = f.ws.undo(f.bob, &mut f.out).unwrap_err();
        assert!(matches!(
            err,
            CollabError::PermissionDenied { capability: Capability::Delete, .. }
        ));
        assert_eq!(f.ws.history_depth(), (1, 0));

        // The creator may.
        f.ws.undo(f.alice, &mut f.out).unwrap();
        assert!(f.ws.store().is_empty());
    }

    #[test]
    fn test_undo_redo_empty() {
        let mut f = Fixture::new();
        assert_eq!(f.ws.undo(f.alice, &mut f.out).unwrap_err(), CollabError::NoHistoryToUndo);
        assert_eq!(f.ws.redo(f.alice, &mut f.out).unwrap_err(), CollabError::NoHistoryToRedo);
    }

    #[test]
    fn test_undo_respects_lock() {
        let mut f = Fixture::new();
        f.create("obj1", 0.0);
        let request = EditRequest::transform("obj1", TransformPatch::position(Vec3::ONE), 1);
        f.ws.apply_edit(f.alice, &request, &mut f.out).unwrap();
        f.ws
            .acquire_lock(f.bob, &ObjectId::from("obj1"), Instant::now(), &mut f.out)
            .unwrap();

        assert!(matches!(
            f.ws.undo(f.alice, &mut f.out),
            Err(CollabError::ObjectLocked { .. })
        ));
        assert_eq!(f.position("obj1"), Vec3::ONE);
    }

    #[test]
    fn test_undo_bumps_version() {
        let mut f = Fixture::new();
        f.create("obj1", 0.0);
        f.ws.undo(f.alice, &mut f.out).unwrap();
        assert_eq!(f.ws.version(), 2);
        f.ws.redo(f.alice, &mut f.out).unwrap();
        assert_eq!(f.ws.version(), 3);
        assert!(f.ws.store().contains(&ObjectId::from("obj1")));
    }

    #[test]
    fn test_material_undo_restores_reference() {
        let mut f = Fixture::new();
        f.create("obj1", 0.0);
        let id = ObjectId::from("obj1");
        let original = f.ws.store().object(&id).unwrap().material_id;

        let props = MaterialProps {
            metalness: Some(1.0),
            ..MaterialProps::default()
        };
        f.ws
            .apply_edit(f.bob, &EditRequest::material("obj1", props, 1), &mut f.out)
            .unwrap();
        assert_ne!(f.ws.store().object(&id).unwrap().material_id, original);

        f.ws.undo(f.alice, &mut f.out).unwrap();
        assert_eq!(f.ws.store().object(&id).unwrap().material_id, original);
    }

    #[test]
    fn test_environment_requires_lighting() {
        let mut f = Fixture::new();
        let request = EditRequest::environment(
            crate::scene::EnvironmentPatch {
                background_color: Some([0.0, 0.0, 0.0]),
                ..Default::default()
            },
            0,
        );
        assert!(matches!(
            f.ws.apply_edit(f.bob, &request, &mut f.out),
            Err(CollabError::PermissionDenied { capability: Capability::Lighting, .. })
        ));
        f.ws.apply_edit(f.alice, &request, &mut f.out).unwrap();
        assert_eq!(f.ws.store().environment().background_color, [0.0, 0.0, 0.0]);

        f.ws.undo(f.alice, &mut f.out).unwrap();
        assert_eq!(
            f.ws.store().environment().background_color,
            Environment::default().background_color
        );
    }

    #[test]
    fn test_clone_uses_default_offset() {
        let mut f = Fixture::new();
        f.create("obj1", 2.0);
        let result = f
            .ws
            .apply_edit(
                f.bob,
                &EditRequest::clone_object("obj1", None, Some(ObjectId::from("obj2")), 1),
                &mut f.out,
            )
            .unwrap();
        assert_eq!(result.object_id, ObjectId::from("obj2"));
        assert_eq!(f.position("obj2"), Vec3::new(3.0, 0.0, 0.0));
    }

    #[test]
    fn test_invite_and_remove() {
        let mut f = Fixture::new();
        let carol = Uuid::new_v4();
        assert!(f
            .ws
            .add_participant(f.bob, carol, &PermissionOverrides::default(), &mut f.out)
            .is_err());
        f.ws
            .add_participant(f.alice, carol, &PermissionOverrides::default(), &mut f.out)
            .unwrap();
        assert!(f.ws.info().participants.contains(&carol));

        f.create("obj1", 0.0);
        f.ws
            .acquire_lock(carol, &ObjectId::from("obj1"), Instant::now(), &mut f.out)
            .unwrap();
        f.ws.remove_participant(carol, carol, &mut f.out).unwrap();
        assert_eq!(f.ws.lock_count(), 0);
        assert!(f.ws.snapshot(carol).is_err());
        assert!(f.ws.remove_participant(f.alice, f.alice, &mut f.out).is_err());
    }

    #[test]
    fn test_snapshot_contents() {
        let mut f = Fixture::new();
        for i in 0..12 {
            f.create(&format!("obj{i:02}"), i as f32 * 10.0);
        }
        f.ws
            .update_cursor(f.bob, Vec3::ONE, Vec3::ZERO, Instant::now(), &mut f.out)
            .unwrap();

        let snapshot = f.ws.snapshot(f.bob).unwrap();
        assert_eq!(snapshot.objects.len(), 12);
        assert_eq!(snapshot.materials.len(), 12);
        assert_eq!(snapshot.history.len(), 10);
        assert_eq!(snapshot.history.last().unwrap().version, 12);
        assert_eq!(snapshot.workspace.version, 12);
        assert_eq!(snapshot.workspace.total_edits, 12);
        assert_eq!(snapshot.permissions, Permissions::participant_default());
        assert_eq!(snapshot.cursor.unwrap().position, Vec3::ONE);
        assert_eq!(snapshot.cursors.len(), 1);

        assert!(f.ws.snapshot(Uuid::new_v4()).is_err());
    }

    #[test]
    fn test_snapshot_order_is_stable() {
        let mut f = Fixture::new();
        let carol = Uuid::new_v4();
        f.ws
            .add_participant(f.alice, carol, &PermissionOverrides::default(), &mut f.out)
            .unwrap();
        for i in 0..8 {
            f.create(&format!("obj{i}"), i as f32 * 10.0);
        }
        for id in ["obj5", "obj1", "obj7", "obj3"] {
            f.ws
                .acquire_lock(f.alice, &ObjectId::from(id), Instant::now(), &mut f.out)
                .unwrap();
        }
        for p in [f.alice, f.bob, carol] {
            f.ws
                .update_cursor(p, Vec3::ONE, Vec3::ZERO, Instant::now(), &mut f.out)
                .unwrap();
            f.ws
                .update_selection(p, &[ObjectId::from("obj2")], SelectionMode::Single, &mut f.out)
                .unwrap();
        }

        let first = f.ws.snapshot(f.alice).unwrap();
        let locked: Vec<_> = first.locks.iter().map(|l| l.object_id.as_str()).collect();
        assert_eq!(locked, ["obj1", "obj3", "obj5", "obj7"]);
        assert!(first.cursors.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(first.selections.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(first.cursors.len(), 3);
        assert_eq!(f.ws.snapshot(f.alice).unwrap(), first);
    }

    #[test]
    fn test_end_clears_locks_and_presence() {
        let mut f = Fixture::new();
        f.create("obj1", 0.0);
        f.ws
            .acquire_lock(f.alice, &ObjectId::from("obj1"), Instant::now(), &mut f.out)
            .unwrap();
        f.ws
            .update_cursor(f.bob, Vec3::ONE, Vec3::ZERO, Instant::now(), &mut f.out)
            .unwrap();
        f.drain();

        f.ws.end(&mut f.out);
        assert_eq!(f.ws.lock_count(), 0);
        assert!(f.ws.snapshot(f.alice).unwrap().cursors.is_empty());
        assert_eq!(f.drain()[0].1.name(), "workspaceEnded");
    }
}
