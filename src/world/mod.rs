//! The BSP world: loading, spatial queries and visibility.
//!
//! [`load`] builds the world from the versioned binary format; [`visibility`]
//! walks the PVS and batches visible surfaces; [`decals`] clips decal
//! projections against world geometry; [`patch`] subdivides bezier patches
//! at load time.

pub mod decals;
pub mod load;
pub mod patch;
pub mod visibility;

use glam::{Mat3, Mat4, Vec3, Vec4};

use crate::draw::{DrawCall, IndexBufferRange, IndexBufferSource, VertexBufferRange};
use crate::material::calculate::{sin_table, FUNC_TABLE_MASK, FUNC_TABLE_SIZE};
use crate::material::{ContentFlags, MaterialIndex, SurfaceFlags};
use crate::math::{Bounds, Plane};
use crate::model::ModelRenderContext;
use crate::parser::Lexer;
use crate::scene::RenderEntity;
use crate::texture::TextureId;
use crate::vertex::Vertex;
use crate::gpu::{IndexBufferHandle, VertexBufferHandle};

pub use visibility::{Visibility, VisibilityMethod};

/// Vertex buffers the world geometry is partitioned into, sized for 16-bit
/// indices.
pub const MAX_WORLD_GEOMETRY_BUFFERS: usize = 8;

/// Source lightmaps are always 128x128 RGB.
pub const LIGHTMAP_SIZE: usize = 128;

/// Which visibility state a render call uses. Nested scenes use their own id
/// so they don't clobber the main scene's cached PVS walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityId {
    Main = 0,
    Portal = 1,
    /// Reflection probes render the full world batch with frustum culling
    /// applied downstream.
    Probe = 2,
    Reflection = 3,
    SkyboxPortal = 4,
}

pub const VISIBILITY_ID_COUNT: usize = 5;

/// A BSP node or leaf; the two share one arena.
#[derive(Debug, Clone)]
pub struct Node {
    pub leaf: bool,
    pub bounds: Bounds,
    // Node only.
    pub plane: usize,
    /// Indices into the node arena (leaves included).
    pub children: [usize; 2],
    // Leaf only.
    pub cluster: i32,
    pub area: i32,
    pub first_leaf_surface: usize,
    pub n_surfaces: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceType {
    /// Not rendered, e.g. the material has SURF_NODRAW.
    Ignore,
    Face,
    Mesh,
    Patch,
    Flare,
}

/// One world draw surface.
#[derive(Debug)]
pub struct Surface {
    pub surface_type: SurfaceType,
    pub material: MaterialIndex,
    /// -1 means no fog.
    pub fog_index: i32,
    pub flags: SurfaceFlags,
    pub content_flags: ContentFlags,
    /// Absolute indices into the surface's geometry buffer.
    pub indices: Vec<u16>,
    /// Which geometry buffer the vertices live in.
    pub buffer_index: usize,
    pub cull_bounds: Bounds,
    /// Faces only.
    pub cull_plane: Option<Plane>,
    pub patch: Option<Box<patch::Patch>>,
    /// Used at runtime to avoid adding duplicate visible surfaces.
    pub duplicate_id: i32,
    /// Like `duplicate_id`, for decal projection.
    pub decal_duplicate_id: i32,
    /// CPU deforms only.
    pub first_vertex: u32,
    pub n_vertices: u32,
}

/// A fog volume from the fogs lump.
#[derive(Debug)]
pub struct Fog {
    pub original_brush_number: i32,
    pub bounds: Bounds,
    /// Packed color, scaled by identity light.
    pub color: [u8; 4],
    /// Texture coordinate scale: `1 / (max(1, depthForOpaque) * 8)`.
    pub tc_scale: f32,
    pub parms: crate::material::FogParms,
    /// The one visible side of the fog brush, if any.
    pub surface: Option<Vec4>,
}

/// A named material definition from the shaders lump.
#[derive(Debug)]
pub struct MaterialDef {
    pub name: String,
    pub surface_flags: SurfaceFlags,
    pub content_flags: ContentFlags,
}

/// An inline model: a contiguous surface range plus bounds.
#[derive(Debug, Clone, Copy)]
pub struct ModelDef {
    pub first_surface: usize,
    pub n_surfaces: usize,
    pub bounds: Bounds,
}

/// A map entity parsed from the entities lump.
#[derive(Debug, Clone, Default)]
pub struct MapEntity {
    pub kvps: Vec<(String, String)>,
}

impl MapEntity {
    #[must_use]
    pub fn find_value(&self, key: &str) -> Option<&str> {
        self.kvps
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Visible sky geometry accumulated per material.
#[derive(Debug, Clone)]
pub struct SkySurface {
    pub material: MaterialIndex,
    pub vertices: Vec<Vertex>,
}

/// Visible surfaces merged by material/fog/buffer state.
#[derive(Debug, Clone)]
pub struct BatchedSurface {
    /// Frustum culling only.
    pub bounds: Bounds,
    pub material: MaterialIndex,
    pub fog_index: i32,
    pub surface_flags: SurfaceFlags,
    pub content_flags: ContentFlags,
    /// Undefined if the material has CPU deforms.
    pub buffer_index: usize,
    pub first_index: u32,
    pub n_indices: u32,
    /// CPU deforms only.
    pub first_vertex: u32,
    pub n_vertices: u32,
}

/// Batches and index buffers for one inline brush model.
#[derive(Debug)]
pub struct BrushModelGeometry {
    pub batches: Vec<BatchedSurface>,
    pub index_buffers: [IndexBufferHandle; MAX_WORLD_GEOMETRY_BUFFERS],
}

/// Per-draw fog parameters produced by [`World::calculate_fog`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FogUniforms {
    pub color: Vec4,
    pub distance: Vec4,
    pub depth: Vec4,
    pub eye_t: f32,
}

/// A loaded BSP world.
#[derive(Debug)]
pub struct World {
    /// ie: maps/tim_dm2.bsp
    pub name: String,
    /// ie: tim_dm2
    pub base_name: String,

    pub(crate) entity_string: String,
    pub(crate) entity_parse_offset: usize,
    pub entities: Vec<MapEntity>,
    pub fogs: Vec<Fog>,
    /// Atlas dimensions in cells, e.g. 2x2 cells is 256x256 texels.
    pub lightmap_atlas_size: (usize, usize),
    pub lightmap_atlases: Vec<TextureId>,
    pub n_lightmaps_per_atlas: usize,
    pub light_grid_size: Vec3,
    pub(crate) light_grid_inverse_size: Vec3,
    pub(crate) light_grid_data: Vec<u8>,
    pub(crate) light_grid_origin: Vec3,
    pub(crate) light_grid_bounds: [i32; 3],
    pub material_defs: Vec<MaterialDef>,
    pub model_defs: Vec<ModelDef>,
    pub planes: Vec<Plane>,
    pub surfaces: Vec<Surface>,
    pub(crate) vertex_buffers: Vec<VertexBufferHandle>,
    /// Vertex data populated at load time; referenced by draw calls, so it
    /// outlives every frame.
    pub vertices: Vec<Vec<Vertex>>,
    pub(crate) current_geometry_buffer: usize,
    pub nodes: Vec<Node>,
    pub leaf_surfaces: Vec<i32>,
    /// Index into the node arena of the first leaf.
    pub first_leaf: usize,
    pub n_clusters: i32,
    pub cluster_bytes: i32,
    pub(crate) vis_data: Vec<u8>,
    pub(crate) visibility: Vec<Visibility>,
    /// Incremented once per visibility update for surface dedup.
    pub(crate) duplicate_surface_id: i32,
    pub(crate) decal_duplicate_surface_id: i32,

    // Full-world batches for camera-frustum visibility (probes).
    pub(crate) batched_surfaces: Vec<BatchedSurface>,
    pub(crate) cpu_deform_vertices: Vec<Vertex>,
    pub(crate) cpu_deform_indices: Vec<u16>,
    pub(crate) index_buffers: [IndexBufferHandle; MAX_WORLD_GEOMETRY_BUFFERS],
    pub(crate) sky_surfaces: Vec<SkySurface>,

    pub(crate) brush_models: Vec<BrushModelGeometry>,
}

impl World {
    // ========================================================================
    // Lightmaps
    // ========================================================================

    /// Atlas texel dimensions.
    #[must_use]
    pub fn lightmap_size(&self) -> (usize, usize) {
        (
            self.lightmap_atlas_size.0 * LIGHTMAP_SIZE,
            self.lightmap_atlas_size.1 * LIGHTMAP_SIZE,
        )
    }

    #[must_use]
    pub fn n_lightmaps(&self) -> usize {
        self.lightmap_atlases.len()
    }

    #[must_use]
    pub fn lightmap(&self, index: i32) -> Option<TextureId> {
        if index < 0 {
            return None;
        }

        self.lightmap_atlases.get(index as usize).copied()
    }

    // ========================================================================
    // Light grid
    // ========================================================================

    #[must_use]
    pub fn has_light_grid(&self) -> bool {
        !self.light_grid_data.is_empty()
    }

    /// Trilinearly sample the baked light grid.
    ///
    /// Returns (ambient, directed, direction). Samples inside walls are
    /// ignored; partial coverage renormalizes the contribution.
    #[must_use]
    pub fn sample_light_grid(&self, position: Vec3) -> (Vec3, Vec3, Vec3) {
        debug_assert!(self.has_light_grid()); // false with -nolight maps

        let light_position = position - self.light_grid_origin;
        let mut pos = [0i32; 3];
        let mut frac = [0.0f32; 3];

        for i in 0..3 {
            let v = light_position[i] * self.light_grid_inverse_size[i];
            pos[i] = (v.floor() as i32).clamp(0, self.light_grid_bounds[i] - 1);
            frac[i] = v - v.floor();
        }

        let grid_step = [
            8usize,
            8 * self.light_grid_bounds[0] as usize,
            8 * (self.light_grid_bounds[0] * self.light_grid_bounds[1]) as usize,
        ];
        let base = pos[0] as usize * grid_step[0]
            + pos[1] as usize * grid_step[1]
            + pos[2] as usize * grid_step[2];

        let mut ambient = Vec3::ZERO;
        let mut directed = Vec3::ZERO;
        let mut direction = Vec3::ZERO;
        let mut total_factor = 0.0f32;

        // Trilerp the light value.
        'corner: for i in 0..8 {
            let mut factor = 1.0f32;
            let mut offset = base;

            for j in 0..3 {
                if i & (1 << j) != 0 {
                    // Ignore values outside the grid.
                    if pos[j] + 1 > self.light_grid_bounds[j] - 1 {
                        continue 'corner;
                    }

                    factor *= frac[j];
                    offset += grid_step[j];
                } else {
                    factor *= 1.0 - frac[j];
                }
            }

            let Some(data) = self.light_grid_data.get(offset..offset + 8) else {
                continue;
            };

            // Ignore samples in walls.
            if data[..6].iter().all(|&b| b == 0) {
                continue;
            }

            total_factor += factor;
            ambient += factor * Vec3::new(f32::from(data[0]), f32::from(data[1]), f32::from(data[2]));
            directed +=
                factor * Vec3::new(f32::from(data[3]), f32::from(data[4]), f32::from(data[5]));

            let lat = data[7] as usize * (FUNC_TABLE_SIZE / 256);
            let lng = data[6] as usize * (FUNC_TABLE_SIZE / 256);

            // Decode X as cos(lat) * sin(long), Y as sin(lat) * sin(long),
            // Z as cos(long).
            let normal = Vec3::new(
                sin_table(lat + FUNC_TABLE_SIZE / 4) * sin_table(lng),
                sin_table(lat) * sin_table(lng),
                sin_table((lng + FUNC_TABLE_SIZE / 4) & FUNC_TABLE_MASK),
            );
            direction += normal * factor;
        }

        if total_factor > 0.0 && total_factor < 0.99 {
            let scale = 1.0 / total_factor;
            ambient *= scale;
            directed *= scale;
        }

        (ambient, directed, direction.normalize_or(Vec3::Z))
    }

    // ========================================================================
    // BSP queries
    // ========================================================================

    /// Index of the leaf containing `position`: point descent taking the
    /// front child on the front side.
    #[must_use]
    pub fn leaf_from_position(&self, position: Vec3) -> usize {
        let mut index = 0usize;

        loop {
            let node = &self.nodes[index];

            if node.leaf {
                return index;
            }

            let plane = &self.planes[node.plane];
            let d = position.dot(plane.normal) - plane.distance;
            index = if d > 0.0 { node.children[0] } else { node.children[1] };
        }
    }

    /// Whether `position` is inside the PVS at all (cluster != -1).
    #[must_use]
    pub fn in_pvs(&self, position: Vec3) -> bool {
        self.nodes[self.leaf_from_position(position)].cluster != -1
    }

    /// Whether `p2`'s cluster is visible from `p1`'s, using the collision
    /// module's PVS.
    #[must_use]
    pub fn in_pvs_between(&self, host: &dyn crate::interface::Host, p1: Vec3, p2: Vec3) -> bool {
        let cluster1 = self.nodes[self.leaf_from_position(p1)].cluster;
        let vis = host.cluster_pvs(cluster1);
        let cluster2 = self.nodes[self.leaf_from_position(p2)].cluster;

        if cluster2 < 0 {
            return false;
        }

        vis.get(cluster2 as usize >> 3)
            .is_some_and(|byte| byte & (1 << (cluster2 & 7)) != 0)
    }

    #[must_use]
    pub fn bounds(&self) -> Bounds {
        self.model_defs[0].bounds
    }

    #[must_use]
    pub fn model_bounds(&self, model_index: usize) -> Bounds {
        self.model_defs
            .get(model_index)
            .map_or_else(Bounds::default, |m| m.bounds)
    }

    #[must_use]
    pub fn n_models(&self) -> usize {
        self.model_defs.len()
    }

    // ========================================================================
    // Fog
    // ========================================================================

    /// The first fog volume whose bounds contain the sphere. -1 if none.
    #[must_use]
    pub fn find_fog_index_sphere(&self, position: Vec3, radius: f32) -> i32 {
        for (i, fog) in self.fogs.iter().enumerate() {
            let mut inside = true;

            for j in 0..3 {
                if position[j] - radius >= fog.bounds.max[j]
                    || position[j] + radius <= fog.bounds.min[j]
                {
                    inside = false;
                    break;
                }
            }

            if inside {
                return i as i32;
            }
        }

        -1
    }

    /// The first fog volume intersecting the bounds. -1 if none.
    #[must_use]
    pub fn find_fog_index_bounds(&self, bounds: &Bounds) -> i32 {
        for (i, fog) in self.fogs.iter().enumerate() {
            if Bounds::intersects(*bounds, fog.bounds) {
                return i as i32;
            }
        }

        -1
    }

    /// Per-draw fog vectors for the given fog volume.
    #[must_use]
    pub fn calculate_fog(
        &self,
        fog_index: i32,
        model_matrix: &Mat4,
        model_view_matrix: &Mat4,
        camera_position: Vec3,
        local_view_position: Vec3,
        camera_rotation: &Mat3,
    ) -> FogUniforms {
        debug_assert!(fog_index >= 0);
        let fog = &self.fogs[fog_index as usize];

        let color = Vec4::new(
            f32::from(fog.color[0]) / 255.0,
            f32::from(fog.color[1]) / 255.0,
            f32::from(fog.color[2]) / 255.0,
            f32::from(fog.color[3]) / 255.0,
        );

        // The entity position and rotation come from the model matrix.
        let position = model_matrix.w_axis.truncate();
        let rotation = Mat3::from_mat4(*model_matrix);
        let local = position - camera_position;

        let mut distance = Vec4::new(
            -model_view_matrix.x_axis.z,
            -model_view_matrix.y_axis.z,
            -model_view_matrix.z_axis.z,
            local.dot(camera_rotation.x_axis),
        );

        // Scale the fog vectors by the fog's thickness.
        distance *= fog.tc_scale;

        // Rotate the gradient vector for this orientation.
        let (depth, eye_t) = if let Some(surface) = fog.surface {
            let surface_normal = surface.truncate();
            let depth = Vec4::new(
                surface_normal.dot(rotation.x_axis),
                surface_normal.dot(rotation.y_axis),
                surface_normal.dot(rotation.z_axis),
                -surface.w + position.dot(surface_normal),
            );
            let eye_t = local_view_position.dot(depth.truncate()) + depth.w;
            (depth, eye_t)
        } else {
            // Non-surface fog always has the eye inside.
            (Vec4::ZERO, 1.0)
        };

        FogUniforms {
            color,
            distance,
            depth,
            eye_t,
        }
    }

    // ========================================================================
    // Entity tokens
    // ========================================================================

    /// Walk the entities-lump text one token at a time for the host. At the
    /// end the walk rewinds and `None` is returned once.
    pub fn next_entity_token(&mut self) -> Option<String> {
        let mut lexer = Lexer::at_offset(&self.entity_string, self.entity_parse_offset);
        let token = lexer.next();

        if token.is_empty() {
            self.entity_parse_offset = 0;
            return None;
        }

        let token = token.to_string();
        self.entity_parse_offset = lexer.offset();
        Some(token)
    }

    // ========================================================================
    // Sky and brush models
    // ========================================================================

    /// Visible sky surfaces for a visibility id.
    #[must_use]
    pub fn sky_surfaces(&self, vis_id: VisibilityId) -> &[SkySurface] {
        let vis = &self.visibility[vis_id as usize];

        if vis.method == VisibilityMethod::Pvs {
            &vis.sky_surfaces
        } else {
            &self.sky_surfaces
        }
    }

    /// Merged bounds of the leaves visible to a visibility id.
    #[must_use]
    pub fn visible_bounds(&self, vis_id: VisibilityId) -> Bounds {
        self.visibility[vis_id as usize].bounds
    }

    /// The visibility record for an id.
    #[must_use]
    pub fn visibility_state(&self, vis_id: VisibilityId) -> &Visibility {
        &self.visibility[vis_id as usize]
    }

    /// Emit draw calls for an inline brush model.
    pub fn render_brush_model(
        &self,
        model_index: usize,
        ctx: &mut ModelRenderContext,
        draw_list: &mut crate::draw::DrawCallList,
        entity: &RenderEntity,
    ) {
        let Some(geometry) = self.brush_models.get(model_index.wrapping_sub(1)) else {
            return;
        };

        let model_matrix = crate::math::model_matrix(entity.rotation, entity.position);

        for batch in &geometry.batches {
            let material = ctx.materials.resolve(batch.material);
            let material_data = ctx.materials.material(material);

            let mut dc = DrawCall::new(
                material,
                VertexBufferRange::static_buffer(
                    self.vertex_buffers[batch.buffer_index],
                    self.vertices[batch.buffer_index].len() as u32,
                ),
                IndexBufferRange {
                    source: IndexBufferSource::Static(geometry.index_buffers[batch.buffer_index]),
                    first_index: batch.first_index,
                    n_indices: batch.n_indices,
                },
            );
            dc.entity = Some(ctx.entity_index);
            dc.fog_index = batch.fog_index;
            dc.material_sort = material_data.sort;
            dc.material_sorted_index = material_data.sorted_index;
            dc.model_matrix = model_matrix;
            draw_list.push(dc);
        }
    }
}
