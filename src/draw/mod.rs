//! Draw-call generation: the value records handed to the GPU backend.
//!
//! Draw calls are accumulated per frame into a [`DrawCallList`], sorted by
//! material sort class → in-call sort byte → material sorted index → fog
//! index, and submitted in order. That ordering is the only contract the
//! backend relies on.

pub mod sky;

use std::cmp::Ordering;

use bitflags::bitflags;
use glam::Mat4;

use crate::gpu::{
    DynamicIndexBufferHandle, IndexBufferHandle, TransientHandle, VertexBufferHandle,
};
use crate::material::MaterialIndex;

bitflags! {
    /// Draw call classification flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DrawCallFlags: u32 {
        /// World sky surface (either `SURF_SKY` or a sky material).
        const SKY = 1 << 0;
        /// One of the six tessellated sky box sides.
        const SKYBOX = 1 << 1;
    }
}

bitflags! {
    /// Fixed-function state toggles for a draw call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u32 {
        const RGB_WRITE = 1 << 0;
        const ALPHA_WRITE = 1 << 1;
        const DEPTH_WRITE = 1 << 2;
        const CULL_CW = 1 << 3;
        const CULL_CCW = 1 << 4;
        /// Increment the stencil buffer where the geometry covers.
        const STENCIL_WRITE = 1 << 5;
        /// Only draw where the stencil buffer is non-zero.
        const STENCIL_TEST = 1 << 6;
        /// Decrement the stencil buffer (restores after a portal pass).
        const STENCIL_CLEAR = 1 << 7;
    }
}

/// Depth test, blend and write state of a draw call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderState {
    pub flags: StateFlags,
    /// `None` disables depth testing.
    pub depth_test: Option<wgpu::CompareFunction>,
    /// Source and destination blend factors. `None` disables blending.
    pub blend: Option<(wgpu::BlendFactor, wgpu::BlendFactor)>,
}

impl Default for RenderState {
    fn default() -> Self {
        RenderState {
            flags: StateFlags::RGB_WRITE | StateFlags::ALPHA_WRITE,
            depth_test: Some(wgpu::CompareFunction::LessEqual),
            blend: None,
        }
    }
}

/// Where a draw call's vertices live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexBufferSource {
    Static(VertexBufferHandle),
    Transient(TransientHandle),
}

/// Where a draw call's indices live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBufferSource {
    Static(IndexBufferHandle),
    Dynamic(DynamicIndexBufferHandle),
    Transient(TransientHandle),
}

/// A vertex range within a buffer.
#[derive(Debug, Clone, Copy)]
pub struct VertexBufferRange {
    pub source: VertexBufferSource,
    pub first_vertex: u32,
    pub n_vertices: u32,
}

impl VertexBufferRange {
    #[must_use]
    pub fn static_buffer(handle: VertexBufferHandle, n_vertices: u32) -> VertexBufferRange {
        VertexBufferRange {
            source: VertexBufferSource::Static(handle),
            first_vertex: 0,
            n_vertices,
        }
    }

    #[must_use]
    pub fn transient(handle: TransientHandle, n_vertices: u32) -> VertexBufferRange {
        VertexBufferRange {
            source: VertexBufferSource::Transient(handle),
            first_vertex: 0,
            n_vertices,
        }
    }
}

/// An index range within a buffer.
#[derive(Debug, Clone, Copy)]
pub struct IndexBufferRange {
    pub source: IndexBufferSource,
    pub first_index: u32,
    pub n_indices: u32,
}

/// One sortable draw call.
///
/// Material sort information is snapshotted at creation so ordering does not
/// need the material cache.
#[derive(Debug, Clone)]
pub struct DrawCall {
    /// Index into the frame's render entity list, if entity geometry.
    pub entity: Option<usize>,
    pub flags: DrawCallFlags,
    pub fog_index: i32,
    pub material: MaterialIndex,
    /// Snapshot of the material's sort class.
    pub material_sort: f32,
    /// Snapshot of the material's dense sorted index.
    pub material_sorted_index: i32,
    pub model_matrix: Mat4,
    pub vb: VertexBufferRange,
    pub ib: IndexBufferRange,
    /// Secondary ordering within a material, e.g. clouds after the sky box.
    pub sort: u8,
    pub state: RenderState,
    pub dynamic_lighting: bool,
    pub soft_sprite_depth: f32,
    pub z_offset: f32,
    pub z_scale: f32,
    /// Which cube side, when `flags` contains `SKYBOX`.
    pub skybox_side: i32,
}

impl DrawCall {
    #[must_use]
    pub fn new(material: MaterialIndex, vb: VertexBufferRange, ib: IndexBufferRange) -> DrawCall {
        DrawCall {
            entity: None,
            flags: DrawCallFlags::empty(),
            fog_index: -1,
            material,
            material_sort: 0.0,
            material_sorted_index: 0,
            model_matrix: Mat4::IDENTITY,
            vb,
            ib,
            sort: 0,
            state: RenderState::default(),
            dynamic_lighting: true,
            soft_sprite_depth: 0.0,
            z_offset: 0.0,
            z_scale: 0.0,
            skybox_side: 0,
        }
    }

    /// The sort contract: material sort class, then the in-call sort byte,
    /// then the material sorted index, then the fog index.
    #[must_use]
    pub fn order(a: &DrawCall, b: &DrawCall) -> Ordering {
        a.material_sort
            .total_cmp(&b.material_sort)
            .then(a.sort.cmp(&b.sort))
            .then(a.material_sorted_index.cmp(&b.material_sorted_index))
            .then(a.fog_index.cmp(&b.fog_index))
    }
}

pub type DrawCallList = Vec<DrawCall>;

/// Sort a draw call list in submission order.
pub fn sort_draw_calls(list: &mut DrawCallList) {
    list.sort_by(DrawCall::order);
}
