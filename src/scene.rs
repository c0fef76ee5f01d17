//! Per-frame scene state.
//!
//! The host describes each frame by submitting render entities, dynamic
//! lights, polys and 2D stretch pics, then calls `render_scene` with a
//! [`SceneDefinition`]. Everything here lives for exactly one frame.

use bitflags::bitflags;
use glam::{Mat3, Vec2, Vec3, Vec4};

use crate::vertex::Vertex;

/// Bytes in an area mask: `MAX_MAP_AREAS / 8`.
pub const MAX_MAP_AREA_BYTES: usize = 32;

bitflags! {
    /// Per-entity rendering flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RenderEntityFlags: u32 {
        /// Hack the depth range to avoid poking through walls.
        const DEPTH_HACK = 1 << 0;
        /// Only draw through mirrors and portals.
        const FIRST_PERSON = 1 << 1;
        /// Use `lighting_position` instead of the entity origin for light sampling.
        const LIGHTING_POSITION = 1 << 2;
        /// Don't draw through mirrors and portals.
        const THIRD_PERSON = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderEntityType {
    Beam,
    Lightning,
    #[default]
    Model,
    Poly,
    Portal,
    RailCore,
    RailRings,
    Sprite,
}

/// A render entity submitted by the host for the current frame.
#[derive(Debug, Clone)]
pub struct RenderEntity {
    pub entity_type: RenderEntityType,
    pub flags: RenderEntityFlags,
    /// Model handle for `Model` entities.
    pub handle: i32,
    pub custom_material: i32,
    pub custom_skin: i32,
    pub position: Vec3,
    pub old_position: Vec3,
    /// Axes are not normalized when the entity is scaled.
    pub rotation: Mat3,
    pub non_normalized_axes: bool,
    pub frame: i32,
    pub old_frame: i32,
    pub lerp: f32,
    pub torso_rotation: Mat3,
    pub torso_frame: i32,
    pub old_torso_frame: i32,
    pub torso_lerp: f32,
    pub skin_num: i32,
    pub lighting_position: Vec3,
    /// Color used by the Entity / OneMinusEntity color generators.
    pub material_color: Vec4,
    /// Texture coordinate used by the EntityTranslate tcMod.
    pub material_tex_coord: Vec2,
    pub material_time: f32,
    /// Sprite radius.
    pub radius: f32,
    /// Sprite rotation in degrees.
    pub angle: f32,

    // Derived per frame, not set by the host.
    /// Used for environment mapping and the specular/portal alpha gens.
    pub local_view_position: Vec3,
    /// Normalized world-space direction towards the dominant light.
    pub light_dir: Vec3,
    pub ambient_light: Vec3,
    pub directed_light: Vec3,
}

impl Default for RenderEntity {
    fn default() -> Self {
        RenderEntity {
            entity_type: RenderEntityType::Model,
            flags: RenderEntityFlags::empty(),
            handle: 0,
            custom_material: 0,
            custom_skin: 0,
            position: Vec3::ZERO,
            old_position: Vec3::ZERO,
            rotation: Mat3::IDENTITY,
            non_normalized_axes: false,
            frame: 0,
            old_frame: 0,
            lerp: 0.0,
            torso_rotation: Mat3::IDENTITY,
            torso_frame: 0,
            old_torso_frame: 0,
            torso_lerp: 0.0,
            skin_num: 0,
            lighting_position: Vec3::ZERO,
            material_color: Vec4::ONE,
            material_tex_coord: Vec2::ZERO,
            material_time: 0.0,
            radius: 0.0,
            angle: 0.0,
            local_view_position: Vec3::ZERO,
            light_dir: Vec3::Z,
            ambient_light: Vec3::ZERO,
            directed_light: Vec3::ZERO,
        }
    }
}

bitflags! {
    /// Scene submission flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SceneFlags: u32 {
        const HYPERSPACE = 1 << 0;
        const SKYBOX_PORTAL = 1 << 1;
        const CONTAINS_SKYBOX_PORTAL = 1 << 2;
        const WORLD = 1 << 3;
    }
}

/// Viewport rectangle in window pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    #[must_use]
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Rect {
        Rect { x, y, w, h }
    }
}

/// One `render_scene` submission.
#[derive(Debug, Clone)]
pub struct SceneDefinition {
    pub area_mask: [u8; MAX_MAP_AREA_BYTES],
    pub flags: SceneFlags,
    /// Field of view in degrees, x then y.
    pub fov: Vec2,
    pub position: Vec3,
    pub rotation: Mat3,
    pub rect: Rect,
    /// Scene time in milliseconds.
    pub time: i32,
}

impl Default for SceneDefinition {
    fn default() -> Self {
        SceneDefinition {
            area_mask: [0; MAX_MAP_AREA_BYTES],
            flags: SceneFlags::WORLD,
            fov: Vec2::new(90.0, 90.0),
            position: Vec3::ZERO,
            rotation: Mat3::IDENTITY,
            rect: Rect::default(),
            time: 0,
        }
    }
}

/// The sun parsed from sky materials (`q3map_sun` and friends).
#[derive(Debug, Clone, Copy)]
pub struct SunLight {
    pub shadows: bool,
    pub light: Vec3,
    pub direction: Vec3,
    pub light_scale: f32,
    pub shadow_scale: f32,
}

impl Default for SunLight {
    fn default() -> Self {
        SunLight {
            shadows: false,
            light: Vec3::ZERO,
            direction: Vec3::new(0.45, 0.3, 0.9).normalize(),
            light_scale: 1.0,
            shadow_scale: 0.5,
        }
    }
}

/// A dynamic polygon added with `add_poly_to_scene`. Vertices live in the
/// frame's shared poly vertex pool.
#[derive(Debug, Clone, Copy)]
pub struct Polygon {
    pub material: i32,
    pub first_vertex: u32,
    pub n_vertices: u32,
    pub fog_index: i32,
}

/// A vertex of a host-submitted polygon.
#[derive(Debug, Clone, Copy)]
pub struct PolyVertex {
    pub position: Vec3,
    pub st: Vec2,
    pub color: [u8; 4],
}

impl PolyVertex {
    #[must_use]
    pub fn to_vertex(self) -> Vertex {
        let mut v = Vertex::default();
        v.set_pos(self.position);
        v.set_tex_coord(self.st.x, self.st.y, 0.0, 0.0);
        v.color = self.color;
        v
    }
}

/// A decal fragment produced by `mark_fragments`: a range in the caller's
/// point buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkFragment {
    pub first_point: i32,
    pub num_points: i32,
}

/// A 2D stretched picture queued for the overlay pass.
#[derive(Debug, Clone, Copy)]
pub struct StretchPic {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub s1: f32,
    pub t1: f32,
    pub s2: f32,
    pub t2: f32,
    pub material: i32,
    pub color: Vec4,
    /// Optional bottom gradient color.
    pub gradient: Option<Vec4>,
}
