//! Per-participant capability table.
//!
//! The table is fixed when a participant joins. The only way to change it
//! afterwards is an explicit permission update by a `manage` holder.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Edit,
    Delete,
    Share,
    Manage,
    Invite,
    Voice,
    Materials,
    Lighting,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::Edit,
        Capability::Delete,
        Capability::Share,
        Capability::Manage,
        Capability::Invite,
        Capability::Voice,
        Capability::Materials,
        Capability::Lighting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Edit => "edit",
            Capability::Delete => "delete",
            Capability::Share => "share",
            Capability::Manage => "manage",
            Capability::Invite => "invite",
            Capability::Voice => "voice",
            Capability::Materials => "materials",
            Capability::Lighting => "lighting",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability set of one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub edit: bool,
    pub delete: bool,
    pub share: bool,
    pub manage: bool,
    pub invite: bool,
    pub voice: bool,
    pub materials: bool,
    pub lighting: bool,
}

impl Permissions {
    /// Everything granted; used for workspace creators.
    pub fn full() -> Self {
        Self {
            edit: true,
            delete: true,
            share: true,
            manage: true,
            invite: true,
            voice: true,
            materials: true,
            lighting: true,
        }
    }

    /// What an invited participant gets unless overridden.
    pub fn participant_default() -> Self {
        Self {
            edit: true,
            delete: false,
            share: false,
            manage: false,
            invite: false,
            voice: true,
            materials: true,
            lighting: false,
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Edit => self.edit,
            Capability::Delete => self.delete,
            Capability::Share => self.share,
            Capability::Manage => self.manage,
            Capability::Invite => self.invite,
            Capability::Voice => self.voice,
            Capability::Materials => self.materials,
            Capability::Lighting => self.lighting,
        }
    }

    fn slot(&mut self, capability: Capability) -> &mut bool {
        match capability {
            Capability::Edit => &mut self.edit,
            Capability::Delete => &mut self.delete,
            Capability::Share => &mut self.share,
            Capability::Manage => &mut self.manage,
            Capability::Invite => &mut self.invite,
            Capability::Voice => &mut self.voice,
            Capability::Materials => &mut self.materials,
            Capability::Lighting => &mut self.lighting,
        }
    }

    pub fn with_overrides(mut self, overrides: &PermissionOverrides) -> Self {
        for (capability, value) in overrides.iter() {
            *self.slot(capability) = value;
        }
        self
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::participant_default()
    }
}

/// Sparse capability changes; `None` leaves the current value alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionOverrides {
    pub edit: Option<bool>,
    pub delete: Option<bool>,
    pub share: Option<bool>,
    pub manage: Option<bool>,
    pub invite: Option<bool>,
    pub voice: Option<bool>,
    pub materials: Option<bool>,
    pub lighting: Option<bool>,
}

impl PermissionOverrides {
    pub fn grant(mut self, capability: Capability) -> Self {
        self.set(capability, true);
        self
    }

    pub fn revoke(mut self, capability: Capability) -> Self {
        self.set(capability, false);
        self
    }

    fn set(&mut self, capability: Capability, value: bool) {
        let slot = match capability {
            Capability::Edit => &mut self.edit,
            Capability::Delete => &mut self.delete,
            Capability::Share => &mut self.share,
            Capability::Manage => &mut self.manage,
            Capability::Invite => &mut self.invite,
            Capability::Voice => &mut self.voice,
            Capability::Materials => &mut self.materials,
            Capability::Lighting => &mut self.lighting,
        };
        *slot = Some(value);
    }

    fn get(&self, capability: Capability) -> Option<bool> {
        match capability {
            Capability::Edit => self.edit,
            Capability::Delete => self.delete,
            Capability::Share => self.share,
            Capability::Manage => self.manage,
            Capability::Invite => self.invite,
            Capability::Voice => self.voice,
            Capability::Materials => self.materials,
            Capability::Lighting => self.lighting,
        }
    }

    /// The explicitly set entries.
    pub fn iter(&self) -> impl Iterator<Item = (Capability, bool)> + '_ {
        Capability::ALL
            .into_iter()
            .filter_map(|c| self.get(c).map(|v| (c, v)))
    }

    /// Whether applying these overrides would take anything away.
    pub fn revokes_any(&self) -> bool {
        self.iter().any(|(_, v)| !v)
    }
}

/// Capability table for one workspace.
#[derive(Debug, Clone)]
pub struct PermissionManager {
    creator: Uuid,
    table: HashMap<Uuid, Permissions>,
}

impl PermissionManager {
    /// Creator gets everything; every other participant gets the
    /// defaults with `overrides` applied.
    pub fn new(creator: Uuid, participants: &[Uuid], overrides: &PermissionOverrides) -> Self {
        let mut table = HashMap::with_capacity(participants.len() + 1);
        for participant in participants {
            table.insert(
                *participant,
                Permissions::participant_default().with_overrides(overrides),
            );
        }
        table.insert(creator, Permissions::full());
        Self { creator, table }
    }

    pub fn creator(&self) -> Uuid {
        self.creator
    }

    pub fn is_member(&self, participant: &Uuid) -> bool {
        self.table.contains_key(participant)
    }

    pub fn has_capability(&self, participant: &Uuid, capability: Capability) -> bool {
        self.table
            .get(participant)
            .is_some_and(|p| p.has(capability))
    }

    /// Fail with `PermissionDenied` unless the participant holds `capability`.
    pub fn require(&self, participant: &Uuid, capability: Capability) -> CollabResult<()> {
        if self.has_capability(participant, capability) {
            Ok(())
        } else {
            Err(CollabError::PermissionDenied {
                participant: *participant,
                capability,
            })
        }
    }

    /// Membership gate for read-only calls. Reported as a missing `edit`
    /// capability since non-members hold none.
    pub fn require_member(&self, participant: &Uuid) -> CollabResult<()> {
        if self.is_member(participant) {
            Ok(())
        } else {
            Err(CollabError::PermissionDenied {
                participant: *participant,
                capability: Capability::Edit,
            })
        }
    }

    pub fn permissions(&self, participant: &Uuid) -> Option<&Permissions> {
        self.table.get(participant)
    }

    pub fn participants(&self) -> impl Iterator<Item = &Uuid> {
        self.table.keys()
    }

    pub fn participant_count(&self) -> usize {
        self.table.len()
    }

    /// Admit a participant. Re-adding an existing member keeps their set.
    pub fn add_participant(&mut self, participant: Uuid, overrides: &PermissionOverrides) -> Permissions {
        *self
            .table
            .entry(participant)
            .or_insert_with(|| Permissions::participant_default().with_overrides(overrides))
    }

    pub fn remove_participant(&mut self, participant: &Uuid) -> Option<Permissions> {
        if *participant == self.creator {
            return None;
        }
        self.table.remove(participant)
    }

    /// Change another participant's set. Requires `manage`.
    pub fn update_permissions(
        &mut self,
        by: &Uuid,
        target: &Uuid,
        overrides: &PermissionOverrides,
    ) -> CollabResult<Permissions> {
        self.require(by, Capability::Manage)?;
        if *target == self.creator && overrides.revokes_any() {
            return Err(CollabError::invalid("the creator's capabilities cannot be reduced"));
        }
        let current = self
            .table
            .get_mut(target)
            .ok_or_else(|| CollabError::invalid(format!("{target} is not a participant")))?;
        *current = current.with_overrides(overrides);
        Ok(*current)
    }
}
