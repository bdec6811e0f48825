//! Presence: who is pointing at what.
//!
//! Cursors and selections are ephemeral. They never enter history and
//! losing an update is harmless, so cursor traffic is throttled per
//! participant and bursts are coalesced.
//!
//! ```text
//! update_cursor()
//!       │
//!       ├── window open ─────────────► Broadcast(cursor)
//!       │
//!       └── window closed
//!              ├── no flush pending ─► Deferred { flush_at }  (caller schedules flush)
//!              └── flush pending ────► Coalesced              (latest wins)
//!
//! flush_cursor() at flush_at ────────► latest cursor
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::scene::{ObjectId, SceneObjectStore, Vec3};

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a participant id.
    pub fn from_uuid(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// A participant's 3D pointer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub position: Vec3,
    pub orientation: Vec3,
    pub color: CursorColor,
    /// Wall clock, ms since epoch
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionMode {
    #[default]
    Single,
    /// Also pulls in objects near the selected ones
    Group,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub object_ids: Vec<ObjectId>,
    pub mode: SelectionMode,
    pub updated_at: u64,
}

/// What to do with a cursor update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CursorDecision {
    /// Send this now
    Broadcast(Cursor),
    /// Throttled; call `flush_cursor` at `flush_at`
    Deferred { flush_at: Instant },
    /// Throttled; a flush is already scheduled and will carry this position
    Coalesced,
}

#[derive(Debug, Default)]
struct CursorThrottle {
    last_sent: Option<Instant>,
    flush_pending: bool,
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Presence state of one workspace.
pub struct PresenceTracker {
    cursors: HashMap<Uuid, Cursor>,
    selections: HashMap<Uuid, Selection>,
    throttles: HashMap<Uuid, CursorThrottle>,
    window: Duration,
    connectivity_radius: f32,
}

impl PresenceTracker {
    pub fn new(window: Duration, connectivity_radius: f32) -> Self {
        Self {
            cursors: HashMap::new(),
            selections: HashMap::new(),
            throttles: HashMap::new(),
            window,
            connectivity_radius,
        }
    }

    /// Record a cursor move. The stored cursor is always the latest;
    /// only the broadcast is throttled.
    pub fn update_cursor(
        &mut self,
        participant: Uuid,
        position: Vec3,
        orientation: Vec3,
        now: Instant,
        now_ms: u64,
    ) -> CursorDecision {
        let cursor = Cursor {
            position,
            orientation,
            color: CursorColor::from_uuid(participant),
            updated_at: now_ms,
        };
        self.cursors.insert(participant, cursor);

        let throttle = self.throttles.entry(participant).or_default();
        match throttle.last_sent {
            Some(last) if now.duration_since(last) < self.window => {
                if throttle.flush_pending {
                    CursorDecision::Coalesced
                } else {
                    throttle.flush_pending = true;
                    CursorDecision::Deferred {
                        flush_at: last + self.window,
                    }
                }
            }
            _ => {
                // A flush still queued for the closed window is now stale.
                throttle.flush_pending = false;
                throttle.last_sent = Some(now);
                CursorDecision::Broadcast(cursor)
            }
        }
    }

    /// Emit the coalesced cursor once the window has elapsed.
    pub fn flush_cursor(&mut self, participant: &Uuid, now: Instant) -> Option<Cursor> {
        let throttle = self.throttles.get_mut(participant)?;
        if !throttle.flush_pending {
            return None;
        }
        throttle.flush_pending = false;
        throttle.last_sent = Some(now);
        self.cursors.get(participant).copied()
    }

    /// Replace a participant's selection. Unknown objects are dropped;
    /// `Group` mode adds every object whose center is within the
    /// connectivity radius of an explicitly selected one (one hop only).
    pub fn update_selection(
        &mut self,
        participant: Uuid,
        object_ids: &[ObjectId],
        mode: SelectionMode,
        store: &SceneObjectStore,
        now_ms: u64,
    ) -> Selection {
        let mut seen = HashSet::new();
        let mut selected: Vec<ObjectId> = object_ids
            .iter()
            .filter(|id| store.contains(id) && seen.insert((*id).clone()))
            .cloned()
            .collect();

        if mode == SelectionMode::Group {
            let seeds: Vec<Vec3> = selected
                .iter()
                .filter_map(|id| store.object(id).map(|o| o.center()))
                .collect();
            let mut neighbours: Vec<ObjectId> = store
                .objects()
                .filter(|o| !seen.contains(&o.id))
                .filter(|o| {
                    seeds
                        .iter()
                        .any(|s| s.distance(&o.center()) <= self.connectivity_radius)
                })
                .map(|o| o.id.clone())
                .collect();
            neighbours.sort();
            selected.extend(neighbours);
        }

        let selection = Selection {
            object_ids: selected,
            mode,
            updated_at: now_ms,
        };
        self.selections.insert(participant, selection.clone());
        selection
    }

    /// Strip a removed object from every selection. Returns the
    /// participants whose selection changed.
    pub fn forget_object(&mut self, object_id: &ObjectId) -> Vec<(Uuid, Selection)> {
        let mut changed = Vec::new();
        for (participant, selection) in self.selections.iter_mut() {
            let before = selection.object_ids.len();
            selection.object_ids.retain(|id| id != object_id);
            if selection.object_ids.len() != before {
                changed.push((*participant, selection.clone()));
            }
        }
        changed
    }

    pub fn remove_participant(&mut self, participant: &Uuid) {
        self.cursors.remove(participant);
        self.selections.remove(participant);
        self.throttles.remove(participant);
    }

    pub fn clear(&mut self) {
        self.cursors.clear();
        self.selections.clear();
        self.throttles.clear();
    }

    pub fn cursor(&self, participant: &Uuid) -> Option<&Cursor> {
        self.cursors.get(participant)
    }

    pub fn selection(&self, participant: &Uuid) -> Option<&Selection> {
        self.selections.get(participant)
    }

    /// All cursors, ordered by participant id.
    pub fn cursors(&self) -> Vec<(Uuid, Cursor)> {
        let mut cursors: Vec<_> = self.cursors.iter().map(|(p, c)| (*p, *c)).collect();
        cursors.sort_by_key(|(p, _)| *p);
        cursors
    }

    /// All selections, ordered by participant id.
    pub fn selections(&self) -> Vec<(Uuid, Selection)> {
        let mut selections: Vec<_> = self
            .selections
            .iter()
            .map(|(p, s)| (*p, s.clone()))
            .collect();
        selections.sort_by_key(|(p, _)| *p);
        selections
    }
}
