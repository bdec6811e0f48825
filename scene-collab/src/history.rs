//! Undo/redo stacks.
//!
//! Each record captures the target's state before and after the edit.
//! Undo restores `before`, redo restores `after`, so create and delete are
//! each other's inverse and material/transform changes revert exactly.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::protocol::{EditOp, OperationKind};
use crate::scene::{Environment, Light, ObjectId, SceneObject, SceneObjectStore};

/// Captured state of whatever an edit targeted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SceneState {
    /// `None` means the object was absent
    Object {
        id: ObjectId,
        state: Option<SceneObject>,
    },
    Environment(Environment),
    Light {
        id: ObjectId,
        state: Option<Light>,
    },
}

impl SceneState {
    pub fn capture_object(store: &SceneObjectStore, id: &ObjectId) -> Self {
        SceneState::Object {
            id: id.clone(),
            state: store.object(id).cloned(),
        }
    }

    pub fn capture_light(store: &SceneObjectStore, id: &ObjectId) -> Self {
        SceneState::Light {
            id: id.clone(),
            state: store.light(id).cloned(),
        }
    }

    /// Write this state back into the store.
    pub fn restore_into(&self, store: &mut SceneObjectStore) {
        match self {
            SceneState::Object { id, state } => store.restore_object(id, state.as_ref()),
            SceneState::Environment(environment) => store.set_environment(environment.clone()),
            SceneState::Light { id, state } => store.restore_light(id, state.as_ref()),
        }
    }

    pub fn object(&self) -> Option<&SceneObject> {
        match self {
            SceneState::Object { state, .. } => state.as_ref(),
            _ => None,
        }
    }
}

/// One applied edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditRecord {
    pub operation: OperationKind,
    pub object_id: ObjectId,
    /// Parameters as applied, after transformation
    pub op: EditOp,
    pub before: SceneState,
    pub after: SceneState,
    pub participant: Uuid,
    /// Workspace version assigned when the edit was applied
    pub version: u64,
    pub timestamp: u64,
}

impl EditRecord {
    /// Object whose lock guards undoing or redoing this record.
    pub fn guarded_object(&self) -> Option<&ObjectId> {
        match self.before {
            SceneState::Object { ref id, .. } => Some(id),
            _ => None,
        }
    }

    /// Operation that undoing this record amounts to.
    pub fn inverse_kind(&self) -> OperationKind {
        match self.operation {
            OperationKind::Create | OperationKind::Clone => OperationKind::Delete,
            OperationKind::Delete => OperationKind::Create,
            other => other,
        }
    }
}

/// Bounded undo stack plus the redo stack it feeds.
///
/// The oldest entry is dropped once `capacity` edits are stored.
pub struct HistoryManager {
    history: VecDeque<EditRecord>,
    redo: Vec<EditRecord>,
    capacity: usize,
}

impl HistoryManager {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            redo: Vec::new(),
            capacity,
        }
    }

    /// Record a fresh edit. Invalidates the redo stack.
    pub fn append(&mut self, record: EditRecord) {
        self.push_history(record);
        self.redo.clear();
    }

    /// The edit `undo` would revert next.
    pub fn peek_undo(&self) -> Option<&EditRecord> {
        self.history.back()
    }

    /// The edit `redo` would reapply next.
    pub fn peek_redo(&self) -> Option<&EditRecord> {
        self.redo.last()
    }

    /// Pop the newest edit, restore its prior state, park it for redo.
    pub fn undo(&mut self, store: &mut SceneObjectStore) -> Option<EditRecord> {
        let record = self.history.pop_back()?;
        record.before.restore_into(store);
        self.redo.push(record.clone());
        Some(record)
    }

    /// Re-apply the newest undone edit and put it back on the history.
    pub fn redo(&mut self, store: &mut SceneObjectStore) -> Option<EditRecord> {
        let record = self.redo.pop()?;
        record.after.restore_into(store);
        self.push_history(record.clone());
        Some(record)
    }

    /// Last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<EditRecord> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    fn push_history(&mut self, record: EditRecord) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{NewObject, ObjectType, TransformPatch, Vec3};

    struct Fixture {
        store: SceneObjectStore,
        history: HistoryManager,
        user: Uuid,
        version: u64,
    }

    impl Fixture {
        fn new(capacity: usize) -> Self {
            Self {
                store: SceneObjectStore::default(),
                history: HistoryManager::new(capacity),
                user: Uuid::new_v4(),
                version: 0,
            }
        }

        fn create(&mut self, id: &str) {
            let id = ObjectId::from(id);
            let before = SceneState::capture_object(&self.store, &id);
            let spec = NewObject::new(ObjectType::Box);
            self.store.create_object(id.clone(), &spec, self.user, 1).unwrap();
            self.record(OperationKind::Create, id, EditOp::Create(spec), before);
        }

        fn move_to(&mut self, id: &str, x: f32) {
            let id = ObjectId::from(id);
            let before = SceneState::capture_object(&self.store, &id);
            let patch = TransformPatch::position(Vec3::new(x, 0.0, 0.0));
            self.store.update_transform(&id, &patch, self.user, 2).unwrap();
            self.record(OperationKind::Transform, id, EditOp::Transform(patch), before);
        }

        fn record(&mut self, operation: OperationKind, id: ObjectId, op: EditOp, before: SceneState) {
            self.version += 1;
            let after = SceneState::capture_object(&self.store, &id);
            self.history.append(EditRecord {
                operation,
                object_id: id,
                op,
                before,
                after,
                participant: self.user,
                version: self.version,
                timestamp: 0,
            });
        }

        fn x(&self, id: &str) -> Option<f32> {
            self.store.object(&ObjectId::from(id)).map(|o| o.transform.position.x)
        }
    }

    #[test]
    fn test_undo_empty() {
        let mut f = Fixture::new(10);
        assert!(f.history.undo(&mut f.store).is_none());
        assert!(f.history.redo(&mut f.store).is_none());
    }

    #[test]
    fn test_undo_create_removes_object() {
        let mut f = Fixture::new(10);
        f.create("a");
        let record = f.history.undo(&mut f.store).unwrap();
        assert_eq!(record.operation, OperationKind::Create);
        assert!(f.store.is_empty());
        assert_eq!(f.history.redo_len(), 1);
    }

    #[test]
    fn test_undo_transform_restores_prior() {
        let mut f = Fixture::new(10);
        f.create("a");
        f.move_to("a", 3.0);
        f.move_to("a", 7.0);

        f.history.undo(&mut f.store).unwrap();
        assert_eq!(f.x("a"), Some(3.0));
        f.history.undo(&mut f.store).unwrap();
        assert_eq!(f.x("a"), Some(0.0));
    }

    #[test]
    fn test_undo_then_redo_restores_state() {
        let mut f = Fixture::new(10);
        f.create("a");
        f.move_to("a", 3.0);
        f.create("b");
        f.move_to("b", -2.0);
        let expected: Vec<SceneObject> = {
            let mut v: Vec<_> = f.store.objects().cloned().collect();
            v.sort_by(|l, r| l.id.cmp(&r.id));
            v
        };

        for _ in 0..4 {
            f.history.undo(&mut f.store).unwrap();
        }
        assert!(f.store.is_empty());
        for _ in 0..4 {
            f.history.redo(&mut f.store).unwrap();
        }

        let mut actual: Vec<_> = f.store.objects().cloned().collect();
        actual.sort_by(|l, r| l.id.cmp(&r.id));
        assert_eq!(actual, expected);
        assert_eq!(f.history.len(), 4);
        assert_eq!(f.history.redo_len(), 0);
    }

    #[test]
    fn test_new_edit_clears_redo() {
        let mut f = Fixture::new(10);
        f.create("a");
        f.move_to("a", 1.0);
        f.history.undo(&mut f.store).unwrap();
        assert_eq!(f.history.redo_len(), 1);

        f.move_to("a", 2.0);
        assert_eq!(f.history.redo_len(), 0);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut f = Fixture::new(3);
        f.create("a");
        for x in 1..=4 {
            f.move_to("a", x as f32);
        }
        assert_eq!(f.history.len(), 3);
        let versions: Vec<u64> = f.history.recent(10).iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![3, 4, 5]);
    }

    #[test]
    fn test_recent_is_oldest_first() {
        let mut f = Fixture::new(10);
        f.create("a");
        f.move_to("a", 1.0);
        f.move_to("a", 2.0);
        let recent = f.history.recent(2);
        assert_eq!(recent.len(), 2);
        assert!(recent[0].version < recent[1].version);
    }

    #[test]
    fn test_inverse_kind() {
        let mut f = Fixture::new(10);
        f.create("a");
        let record = f.history.peek_undo().unwrap();
        assert_eq!(record.inverse_kind(), OperationKind::Delete);
        assert_eq!(record.guarded_object(), Some(&ObjectId::from("a")));
    }
}
