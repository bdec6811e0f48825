//! # scene-collab: Real-time collaborative 3D scene editing engine
//!
//! Several participants edit one shared scene (objects, materials,
//! lights, environment) at once. Each workspace is owned by a single
//! actor task that applies edits one at a time, so every participant
//! observes the same total order of versioned edits.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ClientMessage    ┌───────────────────────┐
//! │ CollabGateway│ ─────────────────► │ WorkspaceCoordinator  │
//! │ (WebSocket)  │ ◄───────────────── │ (registry)            │
//! └──────────────┘   ServerMessage    └───────────┬───────────┘
//!                                                 │ mpsc, one per workspace
//!                                     ┌───────────▼───────────┐
//!                                     │ Workspace actor       │
//!                                     │  permissions → OT →   │
//!                                     │  locks → store →      │
//!                                     │  history              │
//!                                     └───────────┬───────────┘
//!                                                 │ after mutation
//!                                         ┌───────▼────────┐
//!                                         │ BroadcastGroup │
//!                                         │ (fan-out)      │
//!                                         └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`scene`]: Scene data model and the live object store
//! - [`permissions`]: Per-participant capability table
//! - [`locks`]: Exclusive, TTL-bounded object locks
//! - [`ot`]: Versioned edit log and concurrent transform reconciliation
//! - [`history`]: Undo/redo stacks
//! - [`presence`]: Cursors and selections, throttled
//! - [`protocol`]: Edit vocabulary, events, binary wire frames
//! - [`broadcast`]: Per-workspace event fan-out
//! - [`workspace`]: Authoritative state machine of one workspace
//! - [`coordinator`]: Registry and per-workspace actors
//! - [`gateway`]: WebSocket adapter

pub mod broadcast;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod history;
pub mod locks;
pub mod ot;
pub mod permissions;
pub mod presence;
pub mod protocol;
pub mod scene;
pub mod workspace;

// Re-exports for convenience
pub use broadcast::{Audience, BroadcastGroup, BroadcastStats, EventSubscriber};
pub use config::{EngineConfig, GatewayConfig};
pub use coordinator::{WorkspaceCoordinator, WorkspaceHandle, WorkspaceStats};
pub use error::{CollabError, CollabResult};
pub use gateway::{CollabGateway, GatewayStats};
pub use history::{EditRecord, HistoryManager, SceneState};
pub use locks::{Lock, LockManager};
pub use ot::OperationalTransformEngine;
pub use permissions::{Capability, PermissionManager, PermissionOverrides, Permissions};
pub use presence::{Cursor, CursorColor, PresenceTracker, Selection, SelectionMode};
pub use protocol::{
    ClientMessage, EditOp, EditRequest, EditResult, OperationKind, ProtocolError, ServerMessage,
    WorkspaceEvent, WorkspaceInfo, WorkspaceSnapshot,
};
pub use scene::{
    Camera, Environment, EnvironmentPatch, Light, LightKind, Material, MaterialProps, NewObject,
    ObjectId, ObjectType, SceneObject, SceneObjectStore, Transform, TransformPatch, Vec3,
};
pub use workspace::{Workspace, WorkspaceSpec};
