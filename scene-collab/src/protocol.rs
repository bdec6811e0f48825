//! Edit vocabulary, outbound events and the binary wire format.
//!
//! Requests arrive with a string operation tag and a loosely filled
//! parameter bag (the shape clients send). [`EditRequest::resolve`] turns
//! that into a typed [`EditOp`] or rejects it with `InvalidOperation`.
//!
//! Wire frames are bincode-encoded [`ClientMessage`] / [`ServerMessage`]
//! values; the transport decides how frames are carried.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};
use crate::history::{EditRecord, SceneState};
use crate::locks::Lock;
use crate::permissions::{Capability, PermissionOverrides, Permissions};
use crate::presence::{Cursor, Selection, SelectionMode};
use crate::scene::{
    Camera, Environment, EnvironmentPatch, Geometry, Light, Material, MaterialProps, NewObject,
    ObjectId, ObjectMetadata, ObjectType, SceneObject, Transform, TransformPatch, Vec3,
};

/// Target id used by environment edits.
pub const ENVIRONMENT_TARGET: &str = "environment";

// ───────────────────────────────────────────────────────────────────
// Operations
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Transform,
    Material,
    Delete,
    Clone,
    Environment,
    Light,
    /// Undo/redo replays; never sent by clients
    Restore,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Transform => "transform",
            OperationKind::Material => "material",
            OperationKind::Delete => "delete",
            OperationKind::Clone => "clone",
            OperationKind::Environment => "environment",
            OperationKind::Light => "light",
            OperationKind::Restore => "restore",
        }
    }

    /// Capability a participant needs to perform this operation.
    pub fn required_capability(&self) -> Capability {
        match self {
            OperationKind::Create
            | OperationKind::Transform
            | OperationKind::Clone
            | OperationKind::Restore => Capability::Edit,
            OperationKind::Delete => Capability::Delete,
            OperationKind::Material => Capability::Materials,
            OperationKind::Environment | OperationKind::Light => Capability::Lighting,
        }
    }

    /// Whether the operation mutates an existing object and so must
    /// respect that object's lock.
    pub fn touches_existing_object(&self) -> bool {
        matches!(
            self,
            OperationKind::Transform | OperationKind::Material | OperationKind::Delete
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = CollabError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "create" => Ok(OperationKind::Create),
            "transform" => Ok(OperationKind::Transform),
            "material" => Ok(OperationKind::Material),
            "delete" => Ok(OperationKind::Delete),
            "clone" => Ok(OperationKind::Clone),
            "environment" => Ok(OperationKind::Environment),
            "light" => Ok(OperationKind::Light),
            other => Err(CollabError::invalid(format!("unknown operation '{other}'"))),
        }
    }
}

/// Typed, validated edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EditOp {
    Create(NewObject),
    Transform(TransformPatch),
    Material(MaterialProps),
    Delete,
    Clone {
        offset: Option<Vec3>,
        new_id: Option<ObjectId>,
    },
    Environment(EnvironmentPatch),
    Light(Light),
}

impl EditOp {
    /// Tag of the resolved operation.
    pub fn kind(&self) -> OperationKind {
        match self {
            EditOp::Create(_) => OperationKind::Create,
            EditOp::Transform(_) => OperationKind::Transform,
            EditOp::Material(_) => OperationKind::Material,
            EditOp::Delete => OperationKind::Delete,
            EditOp::Clone { .. } => OperationKind::Clone,
            EditOp::Environment(_) => OperationKind::Environment,
            EditOp::Light(_) => OperationKind::Light,
        }
    }
}

/// Free-form parameter bag as sent by clients. Which fields matter
/// depends on the operation tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditParams {
    pub object_type: Option<ObjectType>,
    pub geometry: Option<Geometry>,
    pub transform: Option<TransformPatch>,
    pub material: Option<MaterialProps>,
    pub metadata: Option<ObjectMetadata>,
    pub offset: Option<Vec3>,
    pub new_id: Option<ObjectId>,
    pub environment: Option<EnvironmentPatch>,
    pub light: Option<Light>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditRequest {
    pub operation: String,
    pub object_id: ObjectId,
    pub parameters: EditParams,
    /// Last workspace version the client had seen
    pub client_version: u64,
}

impl EditRequest {
    fn new(kind: OperationKind, object_id: ObjectId, parameters: EditParams, client_version: u64) -> Self {
        Self {
            operation: kind.as_str().to_string(),
            object_id,
            parameters,
            client_version,
        }
    }

    pub fn create(object_id: impl Into<ObjectId>, object: NewObject, client_version: u64) -> Self {
        let parameters = EditParams {
            object_type: Some(object.object_type),
            geometry: Some(object.geometry),
            transform: Some(TransformPatch {
                position: Some(object.transform.position),
                rotation: Some(object.transform.rotation),
                scale: Some(object.transform.scale),
            }),
            material: Some(object.material),
            metadata: Some(object.metadata),
            ..EditParams::default()
        };
        Self::new(OperationKind::Create, object_id.into(), parameters, client_version)
    }

    pub fn transform(object_id: impl Into<ObjectId>, patch: TransformPatch, client_version: u64) -> Self {
        let parameters = EditParams {
            transform: Some(patch),
            ..EditParams::default()
        };
        Self::new(OperationKind::Transform, object_id.into(), parameters, client_version)
    }

    pub fn material(object_id: impl Into<ObjectId>, props: MaterialProps, client_version: u64) -> Self {
        let parameters = EditParams {
            material: Some(props),
            ..EditParams::default()
        };
        Self::new(OperationKind::Material, object_id.into(), parameters, client_version)
    }

    /// Remove an object. Needs the `delete` capability.
    pub fn delete(object_id: impl Into<ObjectId>, client_version: u64) -> Self {
        Self::new(OperationKind::Delete, object_id.into(), EditParams::default(), client_version)
    }

    pub fn clone_object(
        object_id: impl Into<ObjectId>,
        offset: Option<Vec3>,
        new_id: Option<ObjectId>,
        client_version: u64,
    ) -> Self {
        let parameters = EditParams {
            offset,
            new_id,
            ..EditParams::default()
        };
        Self::new(OperationKind::Clone, object_id.into(), parameters, client_version)
    }

    pub fn environment(patch: EnvironmentPatch, client_version: u64) -> Self {
        let parameters = EditParams {
            environment: Some(patch),
            ..EditParams::default()
        };
        Self::new(
            OperationKind::Environment,
            ObjectId::from(ENVIRONMENT_TARGET),
            parameters,
            client_version,
        )
    }

    pub fn light(light: Light, client_version: u64) -> Self {
        let object_id = light.id.clone();
        let parameters = EditParams {
            light: Some(light),
            ..EditParams::default()
        };
        Self::new(OperationKind::Light, object_id, parameters, client_version)
    }

    /// Parse the tag and pull the fields the operation needs.
    pub fn resolve(&self) -> CollabResult<EditOp> {
        let kind: OperationKind = self.operation.parse()?;
        let params = &self.parameters;
        let missing = |field: &str| CollabError::invalid(format!("'{kind}' requires '{field}'"));

        match kind {
            OperationKind::Create => {
                let object_type = params.object_type.clone().ok_or_else(|| missing("object_type"))?;
                let transform = params
                    .transform
                    .map(|t| t.apply_to(&Transform::default()))
                    .unwrap_or_default();
                Ok(EditOp::Create(NewObject {
                    object_type,
                    geometry: params.geometry.unwrap_or_default(),
                    transform,
                    material: params.material.clone().unwrap_or_default(),
                    metadata: params.metadata.clone().unwrap_or_default(),
                }))
            }
            OperationKind::Transform => {
                let patch = params.transform.ok_or_else(|| missing("transform"))?;
                if patch.is_empty() {
                    return Err(CollabError::invalid("empty transform"));
                }
                Ok(EditOp::Transform(patch))
            }
            OperationKind::Material => Ok(EditOp::Material(
                params.material.clone().ok_or_else(|| missing("material"))?,
            )),
            OperationKind::Delete => Ok(EditOp::Delete),
            OperationKind::Clone => Ok(EditOp::Clone {
                offset: params.offset,
                new_id: params.new_id.clone(),
            }),
            OperationKind::Environment => Ok(EditOp::Environment(
                params.environment.clone().ok_or_else(|| missing("environment"))?,
            )),
            OperationKind::Light => {
                let light = params.light.clone().ok_or_else(|| missing("light"))?;
                if light.id != self.object_id {
                    return Err(CollabError::invalid(format!(
                        "light id {} does not match target {}",
                        light.id, self.object_id
                    )));
                }
                Ok(EditOp::Light(light))
            }
            OperationKind::Restore => Err(CollabError::invalid("unknown operation 'restore'")),
        }
    }
}

/// Outcome of an applied edit, as broadcast in `edit_applied`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditResult {
    pub object_id: ObjectId,
    pub operation: OperationKind,
    pub participant: Uuid,
    /// State of the target after the edit
    pub result: SceneState,
    pub server_version: u64,
    pub server_timestamp: u64,
}

// ───────────────────────────────────────────────────────────────────
// Events & snapshots
// ───────────────────────────────────────────────────────────────────

/// Broadcast notifications produced by a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkspaceEvent {
    EditApplied(EditResult),
    SelectionChanged {
        participant: Uuid,
        selection: Selection,
    },
    CursorUpdate {
        participant: Uuid,
        cursor: Cursor,
    },
    LockAcquired(Lock),
    LockConflict {
        object_id: ObjectId,
        requester: Uuid,
        holder: Uuid,
    },
    LockReleased {
        object_id: ObjectId,
        holder: Uuid,
        expired: bool,
    },
    Undo {
        participant: Uuid,
        edit: EditRecord,
        server_version: u64,
    },
    Redo {
        participant: Uuid,
        edit: EditRecord,
        server_version: u64,
    },
    ParticipantJoined {
        participant: Uuid,
        permissions: Permissions,
    },
    ParticipantLeft {
        participant: Uuid,
    },
    PermissionsChanged {
        participant: Uuid,
        permissions: Permissions,
    },
    WorkspaceEnded {
        workspace_id: Uuid,
    },
}

impl WorkspaceEvent {
    /// Event name as used by clients.
    pub fn name(&self) -> &'static str {
        match self {
            WorkspaceEvent::EditApplied(_) => "edit_applied",
            WorkspaceEvent::SelectionChanged { .. } => "selectionChanged",
            WorkspaceEvent::CursorUpdate { .. } => "cursorUpdate",
            WorkspaceEvent::LockAcquired(_) => "lockAcquired",
            WorkspaceEvent::LockConflict { .. } => "lockConflict",
            WorkspaceEvent::LockReleased { .. } => "lockReleased",
            WorkspaceEvent::Undo { .. } => "undo",
            WorkspaceEvent::Redo { .. } => "redo",
            WorkspaceEvent::ParticipantJoined { .. } => "participantJoined",
            WorkspaceEvent::ParticipantLeft { .. } => "participantLeft",
            WorkspaceEvent::PermissionsChanged { .. } => "permissionsChanged",
            WorkspaceEvent::WorkspaceEnded { .. } => "workspaceEnded",
        }
    }
}

/// Workspace header shared by snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub id: Uuid,
    pub name: String,
    pub creator: Uuid,
    pub participants: Vec<Uuid>,
    pub version: u64,
    pub created_at: u64,
    pub last_modified: u64,
    pub total_edits: u64,
}

/// Full state for a joining or resynchronizing participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    pub workspace: WorkspaceInfo,
    pub objects: Vec<SceneObject>,
    pub materials: Vec<Material>,
    pub lights: Vec<Light>,
    pub environment: Environment,
    pub camera: Camera,
    pub locks: Vec<Lock>,
    /// The requester's own capabilities
    pub permissions: Permissions,
    pub selection: Option<Selection>,
    pub cursor: Option<Cursor>,
    pub selections: Vec<(Uuid, Selection)>,
    pub cursors: Vec<(Uuid, Cursor)>,
    /// Most recent history entries, oldest first
    pub history: Vec<EditRecord>,
}

impl WorkspaceSnapshot {
    pub fn object(&self, id: &ObjectId) -> Option<&SceneObject> {
        self.objects.iter().find(|o| o.id == *id)
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// Frames sent by a client connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Open a new workspace owned by the sender
    CreateWorkspace {
        participant_id: Uuid,
        name: String,
        participants: Vec<Uuid>,
        overrides: PermissionOverrides,
    },
    /// Bind this connection to a workspace; must precede everything below
    Join {
        workspace_id: Uuid,
        participant_id: Uuid,
    },
    Edit(EditRequest),
    Undo,
    Redo,
    AcquireLock {
        object_id: ObjectId,
    },
    ReleaseLock {
        object_id: ObjectId,
    },
    Cursor {
        position: Vec3,
        orientation: Vec3,
    },
    Selection {
        object_ids: Vec<ObjectId>,
        mode: SelectionMode,
    },
    Snapshot,
    AddParticipant {
        participant_id: Uuid,
        overrides: PermissionOverrides,
    },
    /// Remove a participant; naming oneself leaves the workspace
    RemoveParticipant {
        participant_id: Uuid,
    },
    UpdatePermissions {
        participant_id: Uuid,
        overrides: PermissionOverrides,
    },
    EndWorkspace,
    /// Detach this connection without giving up membership
    Leave,
}

/// Frames sent to a client connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Created { workspace_id: Uuid },
    Snapshot(Box<WorkspaceSnapshot>),
    Applied(EditResult),
    Event(WorkspaceEvent),
    Rejected { error: CollabError },
    Permissions(Permissions),
    Ack,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Codec-level failures.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::LightKind;

    #[test]
    fn test_operation_tags() {
        for kind in [
            OperationKind::Create,
            OperationKind::Transform,
            OperationKind::Material,
            OperationKind::Delete,
            OperationKind::Clone,
            OperationKind::Environment,
            OperationKind::Light,
        ] {
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
        }
        assert!(matches!(
            "explode".parse::<OperationKind>(),
            Err(CollabError::InvalidOperation(_))
        ));
        assert!("restore".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_capability_mapping() {
        assert_eq!(OperationKind::Create.required_capability(), Capability::Edit);
        assert_eq!(OperationKind::Transform.required_capability(), Capability::Edit);
        assert_eq!(OperationKind::Delete.required_capability(), Capability::Delete);
        assert_eq!(OperationKind::Material.required_capability(), Capability::Materials);
        assert_eq!(OperationKind::Environment.required_capability(), Capability::Lighting);
        assert_eq!(OperationKind::Light.required_capability(), Capability::Lighting);
    }

    #[test]
    fn test_resolve_create_keeps_transform() {
        let object = NewObject::new(ObjectType::Box).at(Vec3::new(1.0, 2.0, 3.0)).named("Crate");
        let request = EditRequest::create("obj1", object.clone(), 0);
        assert_eq!(request.resolve().unwrap(), EditOp::Create(object));
    }

    #[test]
    fn test_resolve_unknown_tag() {
        let mut request = EditRequest::delete("obj1", 0);
        request.operation = "teleport".into();
        assert!(matches!(request.resolve(), Err(CollabError::InvalidOperation(_))));
    }

    #[test]
    fn test_resolve_missing_parameters() {
        let mut request = EditRequest::transform("obj1", TransformPatch::default(), 0);
        assert!(request.resolve().is_err());
        request.parameters.transform = None;
        assert!(request.resolve().is_err());

        let mut create = EditRequest::create("obj1", NewObject::new(ObjectType::Sphere), 0);
        create.parameters.object_type = None;
        assert!(create.resolve().is_err());
    }

    #[test]
    fn test_resolve_light_id_must_match() {
        let light = Light {
            id: ObjectId::from("key"),
            kind: LightKind::Point,
            color: [1.0, 1.0, 1.0],
            intensity: 1.0,
            position: Vec3::ZERO,
        };
        let mut request = EditRequest::light(light, 0);
        assert!(request.resolve().is_ok());
        request.object_id = ObjectId::from("fill");
        assert!(request.resolve().is_err());
    }

    #[test]
    fn test_event_names() {
        let event = WorkspaceEvent::LockReleased {
            object_id: ObjectId::from("a"),
            holder: Uuid::nil(),
            expired: true,
        };
        assert_eq!(event.name(), "lockReleased");
        assert_eq!(
            WorkspaceEvent::ParticipantLeft { participant: Uuid::nil() }.name(),
            "participantLeft"
        );
    }

    #[test]
    fn test_client_message_wire() {
        let msg = ClientMessage::Edit(EditRequest::transform(
            "obj1",
            TransformPatch::position(Vec3::new(1.0, 0.0, 0.0)),
            4,
        ));
        let bytes = msg.encode().unwrap();
        assert_eq!(ClientMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_server_rejection_wire() {
        let msg = ServerMessage::Rejected {
            error: CollabError::NoHistoryToRedo,
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(ServerMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            ClientMessage::decode(&garbage),
            Err(ProtocolError::DeserializationError(_))
        ));
        assert!(matches!(
            ServerMessage::decode(&[]),
            Err(ProtocolError::DeserializationError(_))
        ));
    }
}
