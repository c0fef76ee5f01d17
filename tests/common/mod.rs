//! Shared test support: a synthetic BSP builder, an inspectable recording
//! device, and image helpers.
#![allow(dead_code)]

use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;

use glam::Vec3;

use strafe::gpu::{
    DynamicIndexBufferHandle, GraphicsDevice, IndexBufferHandle, NullDevice, TextureDescriptor,
    TextureHandle, TransientHandle, VertexBufferHandle, ViewId,
};
use strafe::{DrawCall, Vertex};

// ============================================================================
// Recording device shared between the engine and the test
// ============================================================================

#[derive(Clone, Default)]
pub struct SharedDevice(pub Rc<RefCell<NullDevice>>);

impl SharedDevice {
    pub fn new() -> SharedDevice {
        SharedDevice::default()
    }
}

impl GraphicsDevice for SharedDevice {
    fn create_texture(&mut self, desc: &TextureDescriptor, data: Option<Vec<u8>>) -> TextureHandle {
        self.0.borrow_mut().create_texture(desc, data)
    }

    fn update_texture(
        &mut self,
        handle: TextureHandle,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: &[u8],
    ) {
        self.0.borrow_mut().update_texture(handle, x, y, width, height, data);
    }

    fn create_vertex_buffer(&mut self, vertices: &[Vertex]) -> VertexBufferHandle {
        self.0.borrow_mut().create_vertex_buffer(vertices)
    }

    fn create_index_buffer(&mut self, indices: &[u16]) -> IndexBufferHandle {
        self.0.borrow_mut().create_index_buffer(indices)
    }

    fn create_dynamic_index_buffer(&mut self, indices: &[u16]) -> DynamicIndexBufferHandle {
        self.0.borrow_mut().create_dynamic_index_buffer(indices)
    }

    fn update_dynamic_index_buffer(&mut self, handle: DynamicIndexBufferHandle, indices: &[u16]) {
        self.0.borrow_mut().update_dynamic_index_buffer(handle, indices);
    }

    fn alloc_transient(&mut self, vertices: &[Vertex], indices: &[u16]) -> Option<TransientHandle> {
        self.0.borrow_mut().alloc_transient(vertices, indices)
    }

    fn submit(&mut self, view: ViewId, draw_call: &DrawCall) {
        self.0.borrow_mut().submit(view, draw_call);
    }

    fn frame(&mut self) {
        self.0.borrow_mut().frame();
    }
}

/// A tiny valid PNG for image-backed materials.
pub fn png_bytes(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let mut image = image::RgbaImage::new(width, height);

    for pixel in image.pixels_mut() {
        *pixel = image::Rgba(rgba);
    }

    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("png encode");
    bytes
}

// ============================================================================
// Synthetic BSP builder
// ============================================================================

pub const LUMP_COUNT: usize = 17;

#[derive(Clone)]
pub struct BspNode {
    pub plane: i32,
    /// Negative children address leaves: -(leaf + 1).
    pub children: [i32; 2],
    pub mins: [i32; 3],
    pub maxs: [i32; 3],
}

#[derive(Clone)]
pub struct BspLeaf {
    pub cluster: i32,
    pub area: i32,
    pub mins: [i32; 3],
    pub maxs: [i32; 3],
    pub first_leaf_surface: i32,
    pub n_leaf_surfaces: i32,
}

#[derive(Clone)]
pub struct BspModel {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub first_surface: i32,
    pub n_surfaces: i32,
}

#[derive(Clone)]
pub struct BspVertex {
    pub xyz: Vec3,
    pub st: [f32; 2],
    pub lightmap: [f32; 2],
    pub normal: Vec3,
    pub color: [u8; 4],
}

impl BspVertex {
    pub fn new(xyz: Vec3, st: [f32; 2], lightmap: [f32; 2], normal: Vec3) -> BspVertex {
        BspVertex {
            xyz,
            st,
            lightmap,
            normal,
            color: [255, 255, 255, 255],
        }
    }
}

#[derive(Clone)]
pub struct BspSurface {
    pub shader_num: i32,
    pub fog_num: i32,
    pub surface_type: i32,
    pub first_vert: i32,
    pub n_verts: i32,
    pub first_index: i32,
    pub n_indexes: i32,
    pub lightmap_num: i32,
    /// lightmapVecs[2]: the face plane normal.
    pub plane_normal: Vec3,
    pub patch_width: i32,
    pub patch_height: i32,
}

impl Default for BspSurface {
    fn default() -> Self {
        BspSurface {
            shader_num: 0,
            fog_num: -1,
            surface_type: 1, // planar
            first_vert: 0,
            n_verts: 0,
            first_index: 0,
            n_indexes: 0,
            lightmap_num: 0,
            plane_normal: Vec3::Z,
            patch_width: 0,
            patch_height: 0,
        }
    }
}

pub struct BspBuilder {
    pub version: i32,
    pub entities: String,
    /// (name, surface flags, content flags)
    pub shaders: Vec<(String, u32, u32)>,
    pub planes: Vec<(Vec3, f32)>,
    pub nodes: Vec<BspNode>,
    pub leaves: Vec<BspLeaf>,
    pub leaf_surfaces: Vec<i32>,
    pub models: Vec<BspModel>,
    /// (first side, n sides, shader)
    pub brushes: Vec<(i32, i32, i32)>,
    /// (plane, shader)
    pub brush_sides: Vec<(i32, i32)>,
    pub vertices: Vec<BspVertex>,
    pub indices: Vec<i32>,
    /// (shader name, brush number, visible side)
    pub fogs: Vec<(String, i32, i32)>,
    pub surfaces: Vec<BspSurface>,
    pub n_lightmaps: usize,
    pub light_grid: Vec<u8>,
    /// (n clusters, cluster bytes, data)
    pub visibility: Option<(i32, i32, Vec<u8>)>,
    /// Overrides for lump lengths, to fabricate malformed files: (lump, len).
    pub length_overrides: Vec<(usize, usize)>,
}

fn push_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_vec3(out: &mut Vec<u8>, v: Vec3) {
    push_f32(out, v.x);
    push_f32(out, v.y);
    push_f32(out, v.z);
}

fn push_name(out: &mut Vec<u8>, name: &str) {
    let mut bytes = [0u8; 64];
    let n = name.len().min(63);
    bytes[..n].copy_from_slice(&name.as_bytes()[..n]);
    out.extend_from_slice(&bytes);
}

impl Default for BspBuilder {
    fn default() -> Self {
        BspBuilder::new()
    }
}

impl BspBuilder {
    pub fn new() -> BspBuilder {
        BspBuilder {
            version: 46,
            entities: "{ \"classname\" \"worldspawn\" }".to_string(),
            shaders: vec![("textures/test/wall".to_string(), 0, 1)],
            planes: Vec::new(),
            nodes: Vec::new(),
            leaves: Vec::new(),
            leaf_surfaces: Vec::new(),
            models: Vec::new(),
            brushes: Vec::new(),
            brush_sides: Vec::new(),
            vertices: Vec::new(),
            indices: Vec::new(),
            fogs: Vec::new(),
            surfaces: Vec::new(),
            n_lightmaps: 1,
            light_grid: Vec::new(),
            visibility: None,
            length_overrides: Vec::new(),
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut lumps: Vec<Vec<u8>> = vec![Vec::new(); LUMP_COUNT];

        // 0: entities, null terminated.
        lumps[0].extend_from_slice(self.entities.as_bytes());
        lumps[0].push(0);

        // 1: shaders.
        for (name, surface_flags, content_flags) in &self.shaders {
            push_name(&mut lumps[1], name);
            push_i32(&mut lumps[1], *surface_flags as i32);
            push_i32(&mut lumps[1], *content_flags as i32);
        }

        // 2: planes.
        for (normal, dist) in &self.planes {
            push_vec3(&mut lumps[2], *normal);
            push_f32(&mut lumps[2], *dist);
        }

        // 3: nodes.
        for node in &self.nodes {
            push_i32(&mut lumps[3], node.plane);
            push_i32(&mut lumps[3], node.children[0]);
            push_i32(&mut lumps[3], node.children[1]);

            for v in node.mins {
                push_i32(&mut lumps[3], v);
            }

            for v in node.maxs {
                push_i32(&mut lumps[3], v);
            }
        }

        // 4: leaves.
        for leaf in &self.leaves {
            push_i32(&mut lumps[4], leaf.cluster);
            push_i32(&mut lumps[4], leaf.area);

            for v in leaf.mins {
                push_i32(&mut lumps[4], v);
            }

            for v in leaf.maxs {
                push_i32(&mut lumps[4], v);
            }

            push_i32(&mut lumps[4], leaf.first_leaf_surface);
            push_i32(&mut lumps[4], leaf.n_leaf_surfaces);
            push_i32(&mut lumps[4], 0);
            push_i32(&mut lumps[4], 0);
        }

        // 5: leaf surfaces.
        for v in &self.leaf_surfaces {
            push_i32(&mut lumps[5], *v);
        }

        // 7: models.
        for model in &self.models {
            push_vec3(&mut lumps[7], model.mins);
            push_vec3(&mut lumps[7], model.maxs);
            push_i32(&mut lumps[7], model.first_surface);
            push_i32(&mut lumps[7], model.n_surfaces);
            push_i32(&mut lumps[7], 0);
            push_i32(&mut lumps[7], 0);
        }

        // 8: brushes.
        for (first_side, n_sides, shader) in &self.brushes {
            push_i32(&mut lumps[8], *first_side);
            push_i32(&mut lumps[8], *n_sides);
            push_i32(&mut lumps[8], *shader);
        }

        // 9: brush sides.
        for (plane, shader) in &self.brush_sides {
            push_i32(&mut lumps[9], *plane);
            push_i32(&mut lumps[9], *shader);
        }

        // 10: draw vertices.
        for v in &self.vertices {
            push_vec3(&mut lumps[10], v.xyz);
            push_f32(&mut lumps[10], v.st[0]);
            push_f32(&mut lumps[10], v.st[1]);
            push_f32(&mut lumps[10], v.lightmap[0]);
            push_f32(&mut lumps[10], v.lightmap[1]);
            push_vec3(&mut lumps[10], v.normal);
            lumps[10].extend_from_slice(&v.color);
        }

        // 11: draw indices.
        for v in &self.indices {
            push_i32(&mut lumps[11], *v);
        }

        // 12: fogs.
        for (shader, brush, visible_side) in &self.fogs {
            push_name(&mut lumps[12], shader);
            push_i32(&mut lumps[12], *brush);
            push_i32(&mut lumps[12], *visible_side);
        }

        // 13: surfaces.
        for s in &self.surfaces {
            push_i32(&mut lumps[13], s.shader_num);
            push_i32(&mut lumps[13], s.fog_num);
            push_i32(&mut lumps[13], s.surface_type);
            push_i32(&mut lumps[13], s.first_vert);
            push_i32(&mut lumps[13], s.n_verts);
            push_i32(&mut lumps[13], s.first_index);
            push_i32(&mut lumps[13], s.n_indexes);
            push_i32(&mut lumps[13], s.lightmap_num);
            push_i32(&mut lumps[13], 0); // lightmapX
            push_i32(&mut lumps[13], 0); // lightmapY
            push_i32(&mut lumps[13], 128); // lightmapWidth
            push_i32(&mut lumps[13], 128); // lightmapHeight
            push_vec3(&mut lumps[13], Vec3::ZERO); // lightmapOrigin
            push_vec3(&mut lumps[13], Vec3::X); // lightmapVecs[0]
            push_vec3(&mut lumps[13], Vec3::Y); // lightmapVecs[1]
            push_vec3(&mut lumps[13], s.plane_normal);
            push_i32(&mut lumps[13], s.patch_width);
            push_i32(&mut lumps[13], s.patch_height);
        }

        // 14: lightmaps, a flat grey.
        lumps[14].resize(self.n_lightmaps * 128 * 128 * 3, 100);

        // 15: light grid.
        lumps[15].extend_from_slice(&self.light_grid);

        // 16: visibility.
        if let Some((n_clusters, cluster_bytes, data)) = &self.visibility {
            push_i32(&mut lumps[16], *n_clusters);
            push_i32(&mut lumps[16], *cluster_bytes);
            lumps[16].extend_from_slice(data);
        }

        // Header: ident, version, 17 lump directory entries.
        let mut out = Vec::new();
        out.extend_from_slice(b"IBSP");
        push_i32(&mut out, self.version);

        let mut offset = 8 + LUMP_COUNT * 8;

        for (i, lump) in lumps.iter().enumerate() {
            let mut length = lump.len();

            for (lump_index, override_length) in &self.length_overrides {
                if *lump_index == i {
                    length = *override_length;
                }
            }

            push_i32(&mut out, offset as i32);
            push_i32(&mut out, length as i32);
            offset += lump.len();
        }

        for lump in &lumps {
            out.extend_from_slice(lump);
        }

        out
    }
}

/// A box world: one splitting node, two leaves (clusters 0 and 1), a floor
/// quad in leaf 0.
pub fn floor_world(n_lightmaps: usize, floor_lightmap: i32) -> BspBuilder {
    let mut builder = BspBuilder::new();
    builder.n_lightmaps = n_lightmaps;

    // Split at x = 0: front (x > 0) is leaf 0, back is leaf 1.
    builder.planes.push((Vec3::X, 0.0));

    builder.nodes.push(BspNode {
        plane: 0,
        children: [-1, -2],
        mins: [-1024, -1024, -1024],
        maxs: [1024, 1024, 1024],
    });

    builder.leaves.push(BspLeaf {
        cluster: 0,
        area: 0,
        mins: [0, -1024, -1024],
        maxs: [1024, 1024, 1024],
        first_leaf_surface: 0,
        n_leaf_surfaces: 1,
    });
    builder.leaves.push(BspLeaf {
        cluster: 1,
        area: 0,
        mins: [-1024, -1024, -1024],
        maxs: [0, 1024, 1024],
        first_leaf_surface: 0,
        n_leaf_surfaces: 0,
    });

    builder.leaf_surfaces.push(0);

    // A floor quad in leaf 0.
    builder.vertices = vec![
        BspVertex::new(Vec3::new(64.0, -64.0, 0.0), [0.0, 0.0], [0.0, 0.0], Vec3::Z),
        BspVertex::new(Vec3::new(192.0, -64.0, 0.0), [1.0, 0.0], [1.0, 0.0], Vec3::Z),
        BspVertex::new(Vec3::new(192.0, 64.0, 0.0), [1.0, 1.0], [1.0, 1.0], Vec3::Z),
        BspVertex::new(Vec3::new(64.0, 64.0, 0.0), [0.0, 1.0], [0.0, 1.0], Vec3::Z),
    ];
    builder.indices = vec![0, 1, 2, 0, 2, 3];

    builder.surfaces.push(BspSurface {
        n_verts: 4,
        n_indexes: 6,
        lightmap_num: floor_lightmap,
        ..BspSurface::default()
    });

    builder.models.push(BspModel {
        mins: Vec3::new(-1024.0, -1024.0, -1024.0),
        maxs: Vec3::new(1024.0, 1024.0, 1024.0),
        first_surface: 0,
        n_surfaces: 1,
    });

    // Cluster 0 sees only itself; cluster 1 sees both.
    builder.visibility = Some((2, 1, vec![0b01, 0b11]));

    builder
}

// ============================================================================
// Synthetic MD3 builder
// ============================================================================

/// Build a minimal two-frame MD3 with one tag and one single-quad surface.
/// The tag moves from `tag_start` to `tag_end` across the frames.
pub fn md3_bytes(tag_name: &str, tag_start: Vec3, tag_end: Vec3) -> Vec<u8> {
    let n_frames = 2;
    let n_tags = 1;
    let n_verts = 4;
    let n_triangles = 2;

    let header_size = 108;
    let frames_offset = header_size;
    let frame_size = 56;
    let tags_offset = frames_offset + n_frames * frame_size;
    let tag_size = 112;
    let surfaces_offset = tags_offset + n_frames * n_tags * tag_size;

    let mut out = Vec::new();
    out.extend_from_slice(b"IDP3");
    push_i32(&mut out, 15); // version
    push_name(&mut out, "test_model");
    push_i32(&mut out, 0); // flags
    push_i32(&mut out, n_frames as i32);
    push_i32(&mut out, n_tags as i32);
    push_i32(&mut out, 1); // surfaces
    push_i32(&mut out, 0); // skins
    push_i32(&mut out, frames_offset as i32);
    push_i32(&mut out, tags_offset as i32);
    push_i32(&mut out, surfaces_offset as i32);
    push_i32(&mut out, 0); // end, unused by the loader

    // Frames.
    for _ in 0..n_frames {
        push_vec3(&mut out, Vec3::splat(-16.0));
        push_vec3(&mut out, Vec3::splat(16.0));
        push_vec3(&mut out, Vec3::ZERO); // local origin
        push_f32(&mut out, 28.0); // radius
        out.extend_from_slice(&[0u8; 16]); // frame name
    }

    // Tags: frame-major.
    for frame in 0..n_frames {
        let position = if frame == 0 { tag_start } else { tag_end };
        let mut name = [0u8; 64];
        let n = tag_name.len().min(63);
        name[..n].copy_from_slice(&tag_name.as_bytes()[..n]);
        out.extend_from_slice(&name);
        push_vec3(&mut out, position);
        push_vec3(&mut out, Vec3::X);
        push_vec3(&mut out, Vec3::Y);
        push_vec3(&mut out, Vec3::Z);
    }

    // Surface header.
    let surface_header = 108;
    let shaders_offset = surface_header;
    let triangles_offset = shaders_offset + 68;
    let st_offset = triangles_offset + n_triangles * 12;
    let xyz_offset = st_offset + n_verts * 8;
    let surface_end = xyz_offset + n_frames * n_verts * 8;

    assert_eq!(out.len(), surfaces_offset);
    out.extend_from_slice(b"IDP3");
    push_name(&mut out, "quad_1");
    push_i32(&mut out, 0); // flags
    push_i32(&mut out, n_frames as i32);
    push_i32(&mut out, 1); // shaders
    push_i32(&mut out, n_verts as i32);
    push_i32(&mut out, n_triangles as i32);
    push_i32(&mut out, triangles_offset as i32);
    push_i32(&mut out, shaders_offset as i32);
    push_i32(&mut out, st_offset as i32);
    push_i32(&mut out, xyz_offset as i32);
    push_i32(&mut out, surface_end as i32);

    // Shader.
    push_name(&mut out, "textures/test/image");
    push_i32(&mut out, 0);

    // Triangles.
    for triangle in [[0i32, 1, 2], [0, 2, 3]] {
        for index in triangle {
            push_i32(&mut out, index);
        }
    }

    // Texture coordinates.
    for (s, t) in [(0.0f32, 0.0f32), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
        push_f32(&mut out, s);
        push_f32(&mut out, t);
    }

    // Positions and normals per frame: a unit quad, 1/64 scale shorts.
    for _ in 0..n_frames {
        for (x, y) in [(-16i16, -16i16), (16, -16), (16, 16), (-16, 16)] {
            out.extend_from_slice(&(x * 64).to_le_bytes());
            out.extend_from_slice(&(y * 64).to_le_bytes());
            out.extend_from_slice(&0i16.to_le_bytes());
            // Lat/long packed +z normal: lat 0, long 0.
            out.extend_from_slice(&0i16.to_le_bytes());
        }
    }

    out
}
