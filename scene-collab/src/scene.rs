//! Scene graph data model and the in-memory object store.
//!
//! The store is a plain arena keyed by id. It never talks to the network
//! and is only ever touched from a workspace's serialized context.
//!
//! ```text
//! SceneObjectStore
//!   ├── objects    ObjectId → SceneObject ──┐ material_id
//!   ├── materials  Uuid     → Material  ◄───┘ (orphans kept, never reused)
//!   ├── lights     ObjectId → Light
//!   ├── environment
//!   └── camera
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::Add;
use std::time::SystemTime;
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};

/// Milliseconds since the Unix epoch, used for every wall-clock stamp.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ───────────────────────────────────────────────────────────────────
// Geometry primitives
// ───────────────────────────────────────────────────────────────────

/// 3D vector in scene (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };
    pub const ONE: Vec3 = Vec3 { x: 1.0, y: 1.0, z: 1.0 };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Component-wise product.
    pub fn scale_by(&self, other: &Vec3) -> Vec3 {
        Vec3::new(self.x * other.x, self.y * other.y, self.z * other.z)
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Vec3) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

impl Default for Vec3 {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

/// Position, euler rotation and scale of an object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }
}

/// Partial transform: only the supplied fields are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformPatch {
    pub position: Option<Vec3>,
    pub rotation: Option<Vec3>,
    pub scale: Option<Vec3>,
}

impl TransformPatch {
    pub fn position(position: Vec3) -> Self {
        Self {
            position: Some(position),
            ..Self::default()
        }
    }

    pub fn rotation(rotation: Vec3) -> Self {
        Self {
            rotation: Some(rotation),
            ..Self::default()
        }
    }

    pub fn scale(scale: Vec3) -> Self {
        Self {
            scale: Some(scale),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_none() && self.rotation.is_none() && self.scale.is_none()
    }

    /// Merge the supplied fields over `base`.
    pub fn apply_to(&self, base: &Transform) -> Transform {
        Transform {
            position: self.position.unwrap_or(base.position),
            rotation: self.rotation.unwrap_or(base.rotation),
            scale: self.scale.unwrap_or(base.scale),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Entities
// ───────────────────────────────────────────────────────────────────

/// Object identifier, unique within a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id, used for clones that do not name their copy.
    pub fn generate() -> Self {
        Self(format!("obj-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    Box,
    Sphere,
    Cylinder,
    Cone,
    Plane,
    Custom(String),
}

/// Primitive dimensions; each shape reads the fields it needs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub width: f32,
    pub height: f32,
    pub depth: f32,
    pub radius: f32,
    pub segments: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            width: 1.0,
            height: 1.0,
            depth: 1.0,
            radius: 0.5,
            segments: 32,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub name: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaterialKind {
    #[default]
    Standard,
    Physical,
    Basic,
    Phong,
}

/// Surface description. Each material belongs to at most one live object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Material {
    pub id: Uuid,
    pub kind: MaterialKind,
    /// RGB in [0, 1]
    pub base_color: [f32; 3],
    pub roughness: f32,
    pub metalness: f32,
    pub opacity: f32,
    pub transparent: bool,
    pub owner: ObjectId,
}

/// Requested material properties; unset fields inherit from the
/// current material (or the defaults on creation).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaterialProps {
    pub kind: Option<MaterialKind>,
    pub base_color: Option<[f32; 3]>,
    pub roughness: Option<f32>,
    pub metalness: Option<f32>,
    pub opacity: Option<f32>,
    pub transparent: Option<bool>,
}

impl MaterialProps {
    fn build(&self, base: Option<&Material>, owner: ObjectId) -> Material {
        Material {
            id: Uuid::new_v4(),
            kind: self.kind.or(base.map(|m| m.kind)).unwrap_or_default(),
            base_color: self
                .base_color
                .or(base.map(|m| m.base_color))
                .unwrap_or([0.8, 0.8, 0.8]),
            roughness: self.roughness.or(base.map(|m| m.roughness)).unwrap_or(0.5),
            metalness: self.metalness.or(base.map(|m| m.metalness)).unwrap_or(0.0),
            opacity: self.opacity.or(base.map(|m| m.opacity)).unwrap_or(1.0),
            transparent: self
                .transparent
                .or(base.map(|m| m.transparent))
                .unwrap_or(false),
            owner,
        }
    }
}

/// Everything a `create` edit needs besides the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewObject {
    pub object_type: ObjectType,
    pub geometry: Geometry,
    pub transform: Transform,
    pub material: MaterialProps,
    pub metadata: ObjectMetadata,
}

impl NewObject {
    pub fn new(object_type: ObjectType) -> Self {
        Self {
            object_type,
            geometry: Geometry::default(),
            transform: Transform::default(),
            material: MaterialProps::default(),
            metadata: ObjectMetadata::default(),
        }
    }

    pub fn at(mut self, position: Vec3) -> Self {
        self.transform.position = position;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.metadata.name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneObject {
    pub id: ObjectId,
    pub object_type: ObjectType,
    pub geometry: Geometry,
    pub transform: Transform,
    pub material_id: Uuid,
    pub metadata: ObjectMetadata,
    pub created_by: Uuid,
    pub created_at: u64,
    pub last_modified_by: Uuid,
    pub last_modified_at: u64,
}

impl SceneObject {
    /// Center used for spatial queries.
    pub fn center(&self) -> Vec3 {
        self.transform.position
    }

    fn touch(&mut self, by: Uuid, at: u64) {
        self.last_modified_by = by;
        self.last_modified_at = at;
    }
}

// ───────────────────────────────────────────────────────────────────
// Environment, lights, camera
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LightingMode {
    #[default]
    Studio,
    Outdoor,
    Night,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fog {
    pub color: [f32; 3],
    pub near: f32,
    pub far: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AmbientLight {
    pub color: [f32; 3],
    pub intensity: f32,
}

/// Workspace-wide scene settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub lighting_mode: LightingMode,
    pub fog: Option<Fog>,
    pub ambient: AmbientLight,
    pub background_color: [f32; 3],
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            lighting_mode: LightingMode::Studio,
            fog: None,
            ambient: AmbientLight {
                color: [1.0, 1.0, 1.0],
                intensity: 0.4,
            },
            background_color: [0.1, 0.1, 0.12],
        }
    }
}

/// Partial environment update. `fog: Some(None)` clears the fog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentPatch {
    pub lighting_mode: Option<LightingMode>,
    pub fog: Option<Option<Fog>>,
    pub ambient: Option<AmbientLight>,
    pub background_color: Option<[f32; 3]>,
}

impl EnvironmentPatch {
    pub fn apply_to(&self, base: &Environment) -> Environment {
        Environment {
            lighting_mode: self.lighting_mode.unwrap_or(base.lighting_mode),
            fog: self.fog.unwrap_or(base.fog),
            ambient: self.ambient.unwrap_or(base.ambient),
            background_color: self.background_color.unwrap_or(base.background_color),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LightKind {
    Directional,
    Point,
    Spot,
    Hemisphere,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Light {
    pub id: ObjectId,
    pub kind: LightKind,
    pub color: [f32; 3],
    pub intensity: f32,
    pub position: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub fov: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(5.0, 5.0, 5.0),
            target: Vec3::ZERO,
            fov: 75.0,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

/// Live scene state of one workspace.
#[derive(Debug, Clone, Default)]
pub struct SceneObjectStore {
    objects: HashMap<ObjectId, SceneObject>,
    materials: HashMap<Uuid, Material>,
    lights: HashMap<ObjectId, Light>,
    environment: Environment,
    camera: Camera,
}

impl SceneObjectStore {
    /// Empty scene lit by `environment`.
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            ..Self::default()
        }
    }

    /// Insert a new object together with its own material.
    pub fn create_object(
        &mut self,
        id: ObjectId,
        spec: &NewObject,
        by: Uuid,
        at: u64,
    ) -> CollabResult<&SceneObject> {
        if self.objects.contains_key(&id) {
            return Err(CollabError::invalid(format!("object {id} already exists")));
        }
        let material = spec.material.build(None, id.clone());
        let object = SceneObject {
            id: id.clone(),
            object_type: spec.object_type.clone(),
            geometry: spec.geometry,
            transform: spec.transform,
            material_id: material.id,
            metadata: spec.metadata.clone(),
            created_by: by,
            created_at: at,
            last_modified_by: by,
            last_modified_at: at,
        };
        self.materials.insert(material.id, material);
        Ok(self.objects.entry(id).or_insert(object))
    }

    /// Merge the supplied transform fields into an existing object.
    pub fn update_transform(
        &mut self,
        id: &ObjectId,
        patch: &TransformPatch,
        by: Uuid,
        at: u64,
    ) -> CollabResult<&SceneObject> {
        let object = self
            .objects
            .get_mut(id)
            .ok_or_else(|| CollabError::ObjectNotFound(id.clone()))?;
        object.transform = patch.apply_to(&object.transform);
        object.touch(by, at);
        Ok(object)
    }

    /// Give the object a freshly allocated material; the old one is orphaned.
    pub fn update_material(
        &mut self,
        id: &ObjectId,
        props: &MaterialProps,
        by: Uuid,
        at: u64,
    ) -> CollabResult<&SceneObject> {
        let object = self
            .objects
            .get_mut(id)
            .ok_or_else(|| CollabError::ObjectNotFound(id.clone()))?;
        let material = props.build(self.materials.get(&object.material_id), id.clone());
        object.material_id = material.id;
        object.touch(by, at);
        self.materials.insert(material.id, material);
        Ok(object)
    }

    /// Remove an object from the live map and hand it back for undo capture.
    pub fn delete_object(&mut self, id: &ObjectId) -> CollabResult<SceneObject> {
        self.objects
            .remove(id)
            .ok_or_else(|| CollabError::ObjectNotFound(id.clone()))
    }

    /// Duplicate geometry and material under `new_id`, shifted by `offset`.
    pub fn clone_object(
        &mut self,
        source: &ObjectId,
        new_id: ObjectId,
        offset: Vec3,
        by: Uuid,
        at: u64,
    ) -> CollabResult<&SceneObject> {
        let original = self
            .objects
            .get(source)
            .ok_or_else(|| CollabError::ObjectNotFound(source.clone()))?;
        if self.objects.contains_key(&new_id) {
            return Err(CollabError::invalid(format!("object {new_id} already exists")));
        }

        let mut material = self
            .materials
            .get(&original.material_id)
            .cloned()
            .unwrap_or_else(|| MaterialProps::default().build(None, new_id.clone()));
        material.id = Uuid::new_v4();
        material.owner = new_id.clone();

        let mut copy = original.clone();
        copy.id = new_id.clone();
        copy.transform.position = original.transform.position + offset;
        copy.material_id = material.id;
        copy.metadata.name = original.metadata.name.as_ref().map(|n| format!("{n} (copy)"));
        copy.created_by = by;
        copy.created_at = at;
        copy.touch(by, at);

        self.materials.insert(material.id, material);
        Ok(self.objects.entry(new_id).or_insert(copy))
    }

    /// Put an object back exactly as captured, or remove it when `None`.
    pub fn restore_object(&mut self, id: &ObjectId, state: Option<&SceneObject>) {
        match state {
            Some(object) => {
                self.objects.insert(id.clone(), object.clone());
            }
            None => {
                self.objects.remove(id);
            }
        }
    }

    /// Merge the supplied fields into the environment.
    pub fn update_environment(&mut self, patch: &EnvironmentPatch) -> &Environment {
        self.environment = patch.apply_to(&self.environment);
        &self.environment
    }

    pub fn set_environment(&mut self, environment: Environment) {
        self.environment = environment;
    }

    /// Insert or replace a light, returning the previous one.
    pub fn upsert_light(&mut self, light: Light) -> Option<Light> {
        self.lights.insert(light.id.clone(), light)
    }

    pub fn restore_light(&mut self, id: &ObjectId, state: Option<&Light>) {
        match state {
            Some(light) => {
                self.lights.insert(id.clone(), light.clone());
            }
            None => {
                self.lights.remove(id);
            }
        }
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = camera;
    }

    /// Live object by id. Deleted objects are gone.
    pub fn object(&self, id: &ObjectId) -> Option<&SceneObject> {
        self.objects.get(id)
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    /// Live objects in no particular order.
    pub fn objects(&self) -> impl Iterator<Item = &SceneObject> {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Any material ever allocated, including orphaned ones.
    pub fn material(&self, id: &Uuid) -> Option<&Material> {
        self.materials.get(id)
    }

    /// Materials referenced by live objects, ordered by id.
    pub fn live_materials(&self) -> Vec<Material> {
        let mut live: Vec<Material> = self
            .objects
            .values()
            .filter_map(|o| self.materials.get(&o.material_id).cloned())
            .collect();
        live.sort_by_key(|m| m.id);
        live
    }

    pub fn light(&self, id: &ObjectId) -> Option<&Light> {
        self.lights.get(id)
    }

    /// Lights in no particular order.
    pub fn lights(&self) -> impl Iterator<Item = &Light> {
        self.lights.values()
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }
}
