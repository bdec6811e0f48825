//! Error kinds surfaced by the collaboration engine.
//!
//! Every variant is a synchronous, caller-recoverable failure. None of them
//! tear down a workspace actor.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::permissions::Capability;
use crate::scene::ObjectId;

/// Engine-level failure for a single request.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CollabError {
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(Uuid),

    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("Participant {participant} lacks the '{capability}' capability")]
    PermissionDenied {
        participant: Uuid,
        capability: Capability,
    },

    #[error("Object {object_id} is locked by {holder}")]
    ObjectLocked { object_id: ObjectId, holder: Uuid },

    #[error("Nothing to undo")]
    NoHistoryToUndo,

    #[error("Nothing to redo")]
    NoHistoryToRedo,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl CollabError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidOperation(reason.into())
    }

    /// Whether retrying the same request later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ObjectLocked { .. })
    }
}

pub type CollabResult<T> = Result<T, CollabError>;
