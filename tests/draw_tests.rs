//! Draw-call ordering, bounds and sky tessellation tests.

mod common;

use common::SharedDevice;
use glam::{Mat3, Vec3};

use strafe::draw::sky::SkyRenderer;
use strafe::draw::{sort_draw_calls, IndexBufferRange, IndexBufferSource, VertexBufferRange};
use strafe::gpu::TransientHandle;
use strafe::interface::MemoryHost;
use strafe::material::calculate::extract_quad_corners;
use strafe::material::parse::ParseContext;
use strafe::material::{MaterialCache, MaterialIndex};
use strafe::math::Bounds;
use strafe::scene::SunLight;
use strafe::texture::TextureCache;
use strafe::world::SkySurface;
use strafe::{DrawCall, DrawCallFlags, Vertex};

fn dummy_draw_call(material_sort: f32, sort: u8, sorted_index: i32, fog_index: i32) -> DrawCall {
    let mut dc = DrawCall::new(
        MaterialIndex(0),
        VertexBufferRange::transient(TransientHandle(0), 4),
        IndexBufferRange {
            source: IndexBufferSource::Transient(TransientHandle(0)),
            first_index: 0,
            n_indices: 6,
        },
    );
    dc.material_sort = material_sort;
    dc.sort = sort;
    dc.material_sorted_index = sorted_index;
    dc.fog_index = fog_index;
    dc
}

// ============================================================================
// Sort order
// ============================================================================

#[test]
fn draw_calls_sort_by_class_then_index_then_fog() {
    let mut list = vec![
        dummy_draw_call(9.0, 0, 4, -1), // blend
        dummy_draw_call(3.0, 0, 7, 2),  // opaque, fog 2
        dummy_draw_call(3.0, 0, 7, 0),  // opaque, fog 0
        dummy_draw_call(1.0, 0, 2, -1), // portal
        dummy_draw_call(2.0, 1, 1, -1), // sky clouds
        dummy_draw_call(2.0, 0, 1, -1), // sky box
        dummy_draw_call(3.0, 0, 3, -1), // opaque, earlier material
    ];

    sort_draw_calls(&mut list);

    // The sort key is monotone along the sorted list.
    for pair in list.windows(2) {
        let key = |dc: &DrawCall| (dc.material_sort, dc.sort, dc.material_sorted_index, dc.fog_index);
        let (a, b) = (key(&pair[0]), key(&pair[1]));
        assert!(a <= b, "draw calls out of order: {a:?} then {b:?}");
    }

    assert_eq!(list[0].material_sort, 1.0);
    assert_eq!(list[1].material_sort, 2.0);
    assert_eq!(list[1].sort, 0); // sky box before clouds
    assert_eq!(list[2].sort, 1);
    assert_eq!(list[3].material_sorted_index, 3);
    assert_eq!(list[4].fog_index, 0); // fog minor key
    assert_eq!(list[5].fog_index, 2);
}

// ============================================================================
// Bounds
// ============================================================================

#[test]
fn bounds_accumulation_is_permutation_invariant() {
    let points = [
        Vec3::new(1.0, -2.0, 3.0),
        Vec3::new(-5.0, 0.5, 2.0),
        Vec3::new(4.0, 9.0, -7.0),
        Vec3::new(0.0, 0.0, 0.0),
    ];

    let mut forward = Bounds::EMPTY;
    let mut backward = Bounds::EMPTY;

    for p in points {
        forward.add_point(p);
    }

    for p in points.iter().rev() {
        backward.add_point(*p);
    }

    assert_eq!(forward, backward);
    assert_eq!(forward.min, Vec3::new(-5.0, -2.0, -7.0));
    assert_eq!(forward.max, Vec3::new(4.0, 9.0, 3.0));
}

// ============================================================================
// Quad corner extraction
// ============================================================================

#[test]
fn quad_corners_require_four_unique_vertices() {
    assert_eq!(extract_quad_corners(&[4, 5, 7, 7, 5, 6]), Some([4, 5, 6, 7]));
    assert_eq!(extract_quad_corners(&[0, 1, 2, 2, 1, 3]), Some([0, 1, 2, 3]));
    assert_eq!(extract_quad_corners(&[0, 1, 2, 3, 4, 5]), None);
    assert_eq!(extract_quad_corners(&[0, 0, 0, 0, 0, 0]), None);
}

// ============================================================================
// Sky rendering
// ============================================================================

/// A sky material with an outer box and clouds, plus a sky surface
/// surrounding the camera, produces six sky box sides and one cloud layer.
#[test]
fn sky_box_emits_six_sides_and_clouds() {
    let host = MemoryHost::new();
    let mut device = SharedDevice::new();
    let mut textures = TextureCache::new(&mut device, 0, 0.5).unwrap();
    let mut sun = SunLight::default();

    let mut cache = {
        let mut ctx = ParseContext {
            device: &mut device,
            host: &host,
            textures: &mut textures,
            lightmaps: &[],
            sun: &mut sun,
            overbright_factor: 2.0,
        };
        MaterialCache::new(&mut ctx)
    };

    // Build the sky material by hand: outer box bound to the white texture
    // (anything but the default checker counts as present), clouds at 512.
    let mut material = strafe::Material::new("textures/test/sky");
    material.is_sky = true;
    material.sky.cloud_height = 512.0;
    material.sky.outer_box = [Some(textures.white()); 6];
    material.stages[0].bundles[0].textures[0] = Some(textures.white());
    material.stages[0].active = true;

    let index = {
        let mut ctx = ParseContext {
            device: &mut device,
            host: &host,
            textures: &mut textures,
            lightmaps: &[],
            sun: &mut sun,
            overbright_factor: 2.0,
        };
        cache.create_material(material, &mut ctx)
    };

    // Sky geometry on all six sides of the camera so every cube face has
    // coverage.
    let mut vertices = Vec::new();
    let mut quad = |corners: [Vec3; 4]| {
        for triangle in [[0, 1, 2], [0, 2, 3]] {
            for i in triangle {
                let mut v = Vertex::default();
                v.set_pos(corners[i] * 1000.0);
                vertices.push(v);
            }
        }
    };

    for axis in 0..3 {
        for sign in [-1.0f32, 1.0] {
            let mut corners = [Vec3::ZERO; 4];
            let offsets = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

            for (i, (a, b)) in offsets.iter().enumerate() {
                let mut corner = Vec3::ZERO;
                corner[axis] = sign;
                corner[(axis + 1) % 3] = *a;
                corner[(axis + 2) % 3] = *b;
                corners[i] = corner;
            }

            quad(corners);
        }
    }

    let surface = SkySurface {
        material: index,
        vertices,
    };

    let mut sky = SkyRenderer::new();
    let mut draw_list = Vec::new();
    sky.render(
        &mut draw_list,
        &mut device,
        &cache,
        textures.default_texture(),
        Vec3::ZERO,
        4096.0,
        &surface,
    );

    let sides: Vec<_> = draw_list
        .iter()
        .filter(|dc| dc.flags.contains(DrawCallFlags::SKYBOX))
        .collect();
    let clouds: Vec<_> = draw_list
        .iter()
        .filter(|dc| dc.flags.contains(DrawCallFlags::SKY) && !dc.flags.contains(DrawCallFlags::SKYBOX))
        .collect();

    assert_eq!(sides.len(), 6, "expected all six sky box sides");
    assert_eq!(clouds.len(), 1, "expected one cloud layer");
    assert_eq!(draw_list.len(), 7);

    // Sky box depth is forced to one; clouds draw after the box.
    for dc in &sides {
        assert_eq!(dc.z_offset, 1.0);
        assert_eq!(dc.sort, 0);
    }

    assert_eq!(clouds[0].sort, 1);

    // Every side index is distinct.
    let mut side_ids: Vec<i32> = sides.iter().map(|dc| dc.skybox_side).collect();
    side_ids.sort_unstable();
    assert_eq!(side_ids, vec![0, 1, 2, 3, 4, 5]);
}

// ============================================================================
// Autosprite deformation
// ============================================================================

#[test]
fn autosprite_rebuilds_quads_facing_the_camera() {
    let mut material = strafe::Material::new("sprite");
    material.deforms[0].deform = strafe::material::Deform::Autosprite;
    material.n_deforms = 1;

    // A quad lying flat in the xy plane.
    let mut vertices = Vec::new();

    for (x, y) in [(-2.0f32, -2.0), (2.0, -2.0), (2.0, 2.0), (-2.0, 2.0)] {
        let mut v = Vertex::default();
        v.set_pos(Vec3::new(x, y, 0.0));
        v.set_normal(Vec3::Z);
        vertices.push(v);
    }

    let mut indices = vec![0u16, 1, 2, 0, 2, 3];

    // The scene faces along +x.
    let rotation = Mat3::IDENTITY;
    let depth = material.do_autosprite_deform(&rotation, &mut vertices, &mut indices, None, false);
    assert!(depth > 0.0);

    // The rebuilt quad faces the camera: all normals point back along -x.
    for v in &vertices {
        assert!((v.normal() - Vec3::new(-1.0, 0.0, 0.0)).length() < 1e-2);
    }

    // The midpoint is preserved.
    let midpoint: Vec3 = vertices.iter().map(Vertex::pos).sum::<Vec3>() / 4.0;
    assert!(midpoint.length() < 1e-3);
}
