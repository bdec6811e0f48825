//! Operational transform over the workspace's versioned edit log.
//!
//! An incoming edit names the version its author last saw. Every logged
//! edit after that version which touched the same object is replayed
//! against it:
//!
//! ```text
//!  logged E   incoming I    result
//!  ─────────  ──────────    ───────────────────────────────────────
//!  transform  transform     position/rotation added, scale multiplied
//!  anything   anything      I unchanged; it lands on the post-E state
//! ```
//!
//! Concurrent transforms therefore accumulate instead of overwriting one
//! another. This is not a geometrically sound merge: two 90° turns become
//! 180° and scales compound.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};
use crate::protocol::{EditOp, OperationKind};
use crate::scene::{ObjectId, TransformPatch};

/// One applied edit as remembered by the transform log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEdit {
    pub version: u64,
    pub object_id: ObjectId,
    pub kind: OperationKind,
    /// Patch as applied, kept for combining with later transforms
    pub transform: Option<TransformPatch>,
    pub participant: Uuid,
}

/// Assigns versions to applied edits and reconciles late-arriving
/// transforms against the edits they missed.
pub struct OperationalTransformEngine {
    log: VecDeque<LoggedEdit>,
    version: u64,
    capacity: usize,
}

impl OperationalTransformEngine {
    /// Keep at most `capacity` applied edits for reconciliation.
    pub fn new(capacity: usize) -> Self {
        Self {
            log: VecDeque::with_capacity(capacity.min(1024)),
            version: 0,
            capacity: capacity.max(1),
        }
    }

    /// Current workspace version (version of the last applied edit).
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Reconcile `op` on `object_id` against everything applied after
    /// `client_version`. Does not touch the log.
    pub fn transform(&self, object_id: &ObjectId, op: EditOp, client_version: u64) -> CollabResult<EditOp> {
        if client_version > self.version {
            return Err(CollabError::invalid(format!(
                "client version {client_version} is ahead of workspace version {}",
                self.version
            )));
        }
        if let Some(oldest) = self.log.front() {
            if client_version + 1 < oldest.version {
                log::warn!(
                    "Client version {client_version} predates the transform log (oldest {}); reconciling against retained edits only",
                    oldest.version
                );
            }
        }

        let mut patch = match op {
            EditOp::Transform(patch) => patch,
            other => return Ok(other),
        };
        for concurrent in self.concurrent_edits(object_id, client_version) {
            if let (OperationKind::Transform, Some(prior)) = (concurrent.kind, &concurrent.transform) {
                patch = combine(&patch, prior);
            }
        }
        Ok(EditOp::Transform(patch))
    }

    /// Append an applied edit and assign it the next version.
    pub fn record(
        &mut self,
        object_id: ObjectId,
        kind: OperationKind,
        transform: Option<TransformPatch>,
        participant: Uuid,
    ) -> u64 {
        self.version += 1;
        if self.log.len() == self.capacity {
            self.log.pop_front();
        }
        self.log.push_back(LoggedEdit {
            version: self.version,
            object_id,
            kind,
            transform,
            participant,
        });
        self.version
    }

    /// Logged edits strictly after `version`, oldest first.
    pub fn edits_since(&self, version: u64) -> impl Iterator<Item = &LoggedEdit> {
        self.log.iter().filter(move |e| e.version > version)
    }

    fn concurrent_edits<'a>(
        &'a self,
        object_id: &'a ObjectId,
        client_version: u64,
    ) -> impl Iterator<Item = &'a LoggedEdit> + 'a {
        self.edits_since(client_version)
            .filter(move |e| e.object_id == *object_id)
    }
}

/// Fold a previously applied transform into an incoming one.
///
/// Only fields present on both sides combine; a field the incoming edit
/// leaves unset stays unset, so the earlier value survives in the store.
pub fn combine(incoming: &TransformPatch, prior: &TransformPatch) -> TransformPatch {
    TransformPatch {
        position: match (incoming.position, prior.position) {
            (Some(a), Some(b)) => Some(a + b),
            (a, _) => a,
        },
        rotation: match (incoming.rotation, prior.rotation) {
            (Some(a), Some(b)) => Some(a + b),
            (a, _) => a,
        },
        scale: match (incoming.scale, prior.scale) {
            (Some(a), Some(b)) => Some(a.scale_by(&b)),
            (a, _) => a,
        },
    }
}
