//! Fire-and-forget fan-out of workspace events.
//!
//! One tokio broadcast channel per workspace; every subscriber gets an
//! independent receiver that buffers up to `capacity` events. A subscriber
//! that falls further behind loses the oldest events and is expected to
//! resynchronize with a snapshot.
//!
//! Addressing (everyone, everyone but the originator, one participant) is
//! resolved on the receiving side so a send is a single channel push.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::WorkspaceEvent;

/// Who should see an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    All,
    AllExcept(Uuid),
    Only(Uuid),
}

impl Audience {
    pub fn includes(&self, participant: &Uuid) -> bool {
        match self {
            Audience::All => true,
            Audience::AllExcept(excluded) => excluded != participant,
            Audience::Only(target) => target == participant,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub audience: Audience,
    pub event: WorkspaceEvent,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events_sent: u64,
    /// Sends that found no subscriber at all
    pub events_unobserved: u64,
    pub subscribers: usize,
}

/// Lock-free counters; read via `stats()`.
#[derive(Default)]
struct AtomicBroadcastStats {
    events_sent: AtomicU64,
    events_unobserved: AtomicU64,
}

/// Broadcast group of a single workspace.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` bounds how many events a slow subscriber can lag behind.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Publish an event. Never blocks and never fails; returns the
    /// number of subscribers the event reached.
    pub fn send(&self, audience: Audience, event: WorkspaceEvent) -> usize {
        log::trace!("Broadcasting {} to {audience:?}", event.name());
        let count = self
            .sender
            .send(Arc::new(Envelope { audience, event }))
            .unwrap_or(0);
        self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
        if count == 0 {
            self.stats.events_unobserved.fetch_add(1, Ordering::Relaxed);
        }
        count
    }

    pub fn subscribe(&self, participant: Uuid) -> EventSubscriber {
        EventSubscriber {
            participant,
            receiver: self.sender.subscribe(),
            lagged: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
            events_unobserved: self.stats.events_unobserved.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

/// One participant's view of a workspace's event stream.
pub struct EventSubscriber {
    participant: Uuid,
    receiver: broadcast::Receiver<Arc<Envelope>>,
    lagged: u64,
}

impl EventSubscriber {
    /// Next event addressed to this participant, or `None` once the
    /// workspace is gone.
    pub async fn recv(&mut self) -> Option<WorkspaceEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if envelope.audience.includes(&self.participant) => {
                    return Some(envelope.event.clone());
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Subscriber {} lagged by {n} events", self.participant);
                    self.lagged += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn participant(&self) -> Uuid {
        self.participant
    }

    /// Events lost to lagging so far.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::ObjectId;
    use tokio::time::{timeout, Duration};

    fn left(participant: Uuid) -> WorkspaceEvent {
        WorkspaceEvent::ParticipantLeft { participant }
    }

    async fn next(sub: &mut EventSubscriber) -> Option<WorkspaceEvent> {
        timeout(Duration::from_millis(50), sub.recv()).await.ok().flatten()
    }

    #[test]
    fn test_audience() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(Audience::All.includes(&a));
        assert!(!Audience::AllExcept(a).includes(&a));
        assert!(Audience::AllExcept(a).includes(&b));
        assert!(Audience::Only(a).includes(&a));
        assert!(!Audience::Only(a).includes(&b));
    }

    #[tokio::test]
    async fn test_fan_out_to_all() {
        let group = BroadcastGroup::new(16);
        let mut subs: Vec<_> = (0..3).map(|_| group.subscribe(Uuid::new_v4())).collect();

        let count = group.send(Audience::All, left(Uuid::nil()));
        assert_eq!(count, 3);
        for sub in subs.iter_mut() {
            assert_eq!(next(sub).await, Some(left(Uuid::nil())));
        }
    }

    #[tokio::test]
    async fn test_originator_excluded() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let mut alice_sub = group.subscribe(alice);
        let mut bob_sub = group.subscribe(Uuid::new_v4());

        group.send(Audience::AllExcept(alice), left(alice));
        assert_eq!(next(&mut bob_sub).await, Some(left(alice)));
        assert_eq!(next(&mut alice_sub).await, None);
    }

    #[tokio::test]
    async fn test_targeted_event() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let mut alice_sub = group.subscribe(alice);
        let mut bob_sub = group.subscribe(Uuid::new_v4());

        let conflict = WorkspaceEvent::LockConflict {
            object_id: ObjectId::from("a"),
            requester: alice,
            holder: Uuid::nil(),
        };
        group.send(Audience::Only(alice), conflict.clone());
        assert_eq!(next(&mut alice_sub).await, Some(conflict));
        assert_eq!(next(&mut bob_sub).await, None);
    }

    #[tokio::test]
    async fn test_closed_after_drop() {
        let group = BroadcastGroup::new(16);
        let mut sub = group.subscribe(Uuid::new_v4());
        group.send(Audience::All, left(Uuid::nil()));
        drop(group);
        // Buffered events are still delivered before the close.
        assert_eq!(sub.recv().await, Some(left(Uuid::nil())));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_ahead() {
        let group = BroadcastGroup::new(2);
        let mut sub = group.subscribe(Uuid::new_v4());
        for _ in 0..5 {
            group.send(Audience::All, left(Uuid::nil()));
        }
        assert!(sub.recv().await.is_some());
        assert_eq!(sub.lagged(), 3);
    }

    #[test]
    fn test_stats() {
        let group = BroadcastGroup::new(16);
        group.send(Audience::All, left(Uuid::nil()));
        let _sub = group.subscribe(Uuid::new_v4());
        group.send(Audience::All, left(Uuid::nil()));

        let stats = group.stats();
        assert_eq!(stats.events_sent, 2);
        assert_eq!(stats.events_unobserved, 1);
        assert_eq!(stats.subscribers, 1);
        assert_eq!(group.capacity(), 16);
    }
}
