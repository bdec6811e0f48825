//! Short-lived exclusive object locks.
//!
//! At most one live lock exists per object. Each grant carries a token;
//! the expiry timer spawned for a grant only releases the lock if the
//! token still matches, so refreshes, explicit releases and late timer
//! firings never step on each other.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};
use crate::scene::ObjectId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    #[default]
    Edit,
}

/// Public view of a held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub object_id: ObjectId,
    pub holder: Uuid,
    pub kind: LockKind,
    /// Wall clock, ms since epoch
    pub acquired_at: u64,
    /// Wall clock, ms since epoch
    pub expires_at: u64,
}

/// Result of a successful acquire.
#[derive(Debug, Clone)]
pub struct LockGrant {
    pub lock: Lock,
    /// Identifies this grant to its expiry timer
    pub token: u64,
    /// When the expiry timer should fire
    pub deadline: Instant,
    /// True when the holder re-acquired its own lock
    pub refreshed: bool,
}

struct LockEntry {
    lock: Lock,
    token: u64,
    timer: Option<AbortHandle>,
}

impl LockEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Lock table for one workspace.
#[derive(Default)]
pub struct LockManager {
    locks: HashMap<ObjectId, LockEntry>,
    next_token: u64,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant or refresh a lock without blocking.
    ///
    /// Fails with `ObjectLocked` when another participant holds it.
    pub fn try_acquire(
        &mut self,
        object_id: &ObjectId,
        participant: Uuid,
        ttl: Duration,
        now: Instant,
        now_ms: u64,
    ) -> CollabResult<LockGrant> {
        let mut refreshed = false;
        if let Some(entry) = self.locks.get_mut(object_id) {
            if entry.lock.holder != participant {
                return Err(CollabError::ObjectLocked {
                    object_id: object_id.clone(),
                    holder: entry.lock.holder,
                });
            }
            entry.cancel_timer();
            refreshed = true;
        }

        self.next_token += 1;
        let token = self.next_token;
        let lock = Lock {
            object_id: object_id.clone(),
            holder: participant,
            kind: LockKind::Edit,
            acquired_at: now_ms,
            expires_at: now_ms + ttl.as_millis() as u64,
        };
        self.locks.insert(
            object_id.clone(),
            LockEntry {
                lock: lock.clone(),
                token,
                timer: None,
            },
        );

        Ok(LockGrant {
            lock,
            token,
            deadline: now + ttl,
            refreshed,
        })
    }

    /// Remember the expiry task of a grant so release can cancel it.
    /// Ignored if the grant has since been replaced.
    pub fn attach_timer(&mut self, object_id: &ObjectId, token: u64, timer: AbortHandle) {
        match self.locks.get_mut(object_id) {
            Some(entry) if entry.token == token => entry.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    /// Explicit release. A no-op unless `participant` is the holder.
    pub fn release(&mut self, object_id: &ObjectId, participant: &Uuid) -> Option<Lock> {
        match self.locks.get(object_id) {
            Some(entry) if entry.lock.holder == *participant => self.take(object_id),
            _ => None,
        }
    }

    /// Timer-driven release. A no-op unless `token` is the current grant.
    pub fn expire(&mut self, object_id: &ObjectId, token: u64) -> Option<Lock> {
        match self.locks.get(object_id) {
            Some(entry) if entry.token == token => self.take(object_id),
            _ => None,
        }
    }

    /// Drop whatever lock exists on an object (e.g. it was deleted).
    pub fn drop_object(&mut self, object_id: &ObjectId) -> Option<Lock> {
        self.take(object_id)
    }

    /// Release every lock held by a participant.
    pub fn release_all_for(&mut self, participant: &Uuid) -> Vec<Lock> {
        let held: Vec<ObjectId> = self
            .locks
            .iter()
            .filter(|(_, e)| e.lock.holder == *participant)
            .map(|(id, _)| id.clone())
            .collect();
        held.iter().filter_map(|id| self.take(id)).collect()
    }

    /// Release everything, cancelling all timers.
    pub fn clear(&mut self) -> usize {
        let count = self.locks.len();
        for (_, mut entry) in self.locks.drain() {
            entry.cancel_timer();
        }
        count
    }

    /// Mutation gate: fails if someone other than `participant` holds the object.
    pub fn check(&self, object_id: &ObjectId, participant: &Uuid) -> CollabResult<()> {
        match self.locks.get(object_id) {
            Some(entry) if entry.lock.holder != *participant => Err(CollabError::ObjectLocked {
                object_id: object_id.clone(),
                holder: entry.lock.holder,
            }),
            _ => Ok(()),
        }
    }

    pub fn holder(&self, object_id: &ObjectId) -> Option<Uuid> {
        self.locks.get(object_id).map(|e| e.lock.holder)
    }

    /// Every held lock, ordered by object id.
    pub fn locks(&self) -> Vec<Lock> {
        let mut locks: Vec<Lock> = self.locks.values().map(|e| e.lock.clone()).collect();
        locks.sort_by(|a, b| a.object_id.cmp(&b.object_id));
        locks
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn take(&mut self, object_id: &ObjectId) -> Option<Lock> {
        self.locks.remove(object_id).map(|mut entry| {
            entry.cancel_timer();
            entry.lock
        })
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    fn acquire(manager: &mut LockManager, object: &str, who: Uuid) -> CollabResult<LockGrant> {
        manager.try_acquire(&ObjectId::from(object), who, TTL, Instant::now(), 1_000)
    }

    #[test]
    fn test_acquire_and_conflict() {
        let mut manager = LockManager::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let grant = acquire(&mut manager, "obj1", alice).unwrap();
        assert!(!grant.refreshed);
        assert_eq!(grant.lock.expires_at, 31_000);

        let err = acquire(&mut manager, "obj1", bob).unwrap_err();
        assert_eq!(
            err,
            CollabError::ObjectLocked {
                object_id: ObjectId::from("obj1"),
                holder: alice
            }
        );
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_reacquire_refreshes_with_new_token() {
        let mut manager = LockManager::new();
        let alice = Uuid::new_v4();
        let first = acquire(&mut manager, "obj1", alice).unwrap();
        let second = acquire(&mut manager, "obj1", alice).unwrap();
        assert!(second.refreshed);
        assert_ne!(first.token, second.token);

        // The stale timer must not release the refreshed lock.
        assert!(manager.expire(&ObjectId::from("obj1"), first.token).is_none());
        assert_eq!(manager.holder(&ObjectId::from("obj1")), Some(alice));
        assert!(manager.expire(&ObjectId::from("obj1"), second.token).is_some());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_release_only_by_holder() {
        let mut manager = LockManager::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        acquire(&mut manager, "obj1", alice).unwrap();

        assert!(manager.release(&ObjectId::from("obj1"), &bob).is_none());
        assert_eq!(manager.len(), 1);
        assert!(manager.release(&ObjectId::from("obj1"), &alice).is_some());
        // Second release is a no-op, not an error.
        assert!(manager.release(&ObjectId::from("obj1"), &alice).is_none());
    }

    #[test]
    fn test_expire_after_release_is_noop() {
        let mut manager = LockManager::new();
        let alice = Uuid::new_v4();
        let grant = acquire(&mut manager, "obj1", alice).unwrap();
        manager.release(&ObjectId::from("obj1"), &alice);
        assert!(manager.expire(&ObjectId::from("obj1"), grant.token).is_none());
    }

    #[test]
    fn test_check_gate() {
        let mut manager = LockManager::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let id = ObjectId::from("obj1");

        assert!(manager.check(&id, &bob).is_ok());
        acquire(&mut manager, "obj1", alice).unwrap();
        assert!(manager.check(&id, &alice).is_ok());
        assert!(manager.check(&id, &bob).is_err());
    }

    #[test]
    fn test_release_all_for_participant() {
        let mut manager = LockManager::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        acquire(&mut manager, "a", alice).unwrap();
        acquire(&mut manager, "b", alice).unwrap();
        acquire(&mut manager, "c", bob).unwrap();

        let released = manager.release_all_for(&alice);
        assert_eq!(released.len(), 2);
        assert_eq!(manager.locks().len(), 1);
        assert_eq!(manager.holder(&ObjectId::from("c")), Some(bob));
    }

    #[test]
    fn test_single_lock_per_object() {
        let mut manager = LockManager::new();
        let peers: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();
        let granted = peers
            .iter()
            .filter(|p| acquire(&mut manager, "shared", **p).is_ok())
            .count();
        assert_eq!(granted, 1);
        assert_eq!(manager.holder(&ObjectId::from("shared")), Some(peers[0]));
    }

    #[tokio::test]
    async fn test_release_cancels_timer() {
        let mut manager = LockManager::new();
        let alice = Uuid::new_v4();
        let grant = acquire(&mut manager, "obj1", alice).unwrap();

        let task = tokio::spawn(std::future::pending::<()>());
        manager.attach_timer(&ObjectId::from("obj1"), grant.token, task.abort_handle());
        manager.release(&ObjectId::from("obj1"), &alice);

        let joined = task.await;
        assert!(joined.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_attach_to_stale_grant_aborts() {
        let mut manager = LockManager::new();
        let alice = Uuid::new_v4();
        let first = acquire(&mut manager, "obj1", alice).unwrap();
        acquire(&mut manager, "obj1", alice).unwrap();

        let task = tokio::spawn(std::future::pending::<()>());
        manager.attach_timer(&ObjectId::from("obj1"), first.token, task.abort_handle());
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
