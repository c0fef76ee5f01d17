//! World loading, visibility and decal tests against synthetic BSP data.

mod common;

use common::{floor_world, BspBuilder, BspLeaf, BspModel, BspNode, BspSurface, BspVertex, SharedDevice};
use glam::Vec3;

use strafe::interface::MemoryHost;
use strafe::material::MaterialCache;
use strafe::material::parse::ParseContext;
use strafe::scene::{SunLight, MAX_MAP_AREA_BYTES};
use strafe::texture::TextureCache;
use strafe::world::load::WorldLoadContext;
use strafe::world::{VisibilityId, World};
use strafe::StrafeError;

struct Fixture {
    device: SharedDevice,
    host: MemoryHost,
    textures: TextureCache,
    materials: MaterialCache,
    sun: SunLight,
}

impl Fixture {
    fn new(map: &BspBuilder) -> Fixture {
        Fixture::with_files(map, &[])
    }

    fn with_files(map: &BspBuilder, files: &[(&str, Vec<u8>)]) -> Fixture {
        let mut host = MemoryHost::new();
        host.add_file("maps/test.bsp", map.build());

        for (name, data) in files {
            host.add_file(name, data.clone());
        }

        let mut device = SharedDevice::new();
        let mut textures = TextureCache::new(&mut device, 0, 0.5).unwrap();
        let mut sun = SunLight::default();

        let materials = {
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

        Fixture {
            device,
            host,
            textures,
            materials,
            sun,
        }
    }

    fn load(&mut self) -> strafe::Result<World> {
        let mut ctx = WorldLoadContext {
            device: &mut self.device,
            host: &self.host,
            textures: &mut self.textures,
            materials: &mut self.materials,
            sun: &mut self.sun,
            overbright_factor: 2.0,
            identity_light: 0.5,
            external_vis_data: None,
        };
        World::load("maps/test.bsp", &mut ctx)
    }
}

// ============================================================================
// Loading
// ============================================================================

#[test]
fn loads_a_simple_world() {
    let mut fixture = Fixture::new(&floor_world(1, 0));
    let world = fixture.load().unwrap();

    assert_eq!(world.base_name, "test");
    assert_eq!(world.surfaces.len(), 1);
    assert_eq!(world.nodes.len(), 3); // 1 node + 2 leaves
    assert_eq!(world.first_leaf, 1);
    assert_eq!(world.n_models(), 1);
    assert_eq!(world.n_clusters, 2);
    assert_eq!(world.planes.len(), 1);
    assert!(!world.surfaces[0].indices.is_empty());
}

#[test]
fn wrong_version_is_rejected() {
    let mut map = floor_world(1, 0);
    map.version = 38;
    let mut fixture = Fixture::new(&map);

    match fixture.load() {
        Err(StrafeError::BadBspVersion { version, .. }) => assert_eq!(version, 38),
        other => panic!("expected version error, got {other:?}"),
    }
}

#[test]
fn bad_lump_size_is_rejected() {
    let mut map = floor_world(1, 0);
    map.length_overrides.push((2, 15)); // planes record size is 16
    let mut fixture = Fixture::new(&map);

    match fixture.load() {
        Err(StrafeError::BadLumpSize { lump, .. }) => assert_eq!(lump, 2),
        other => panic!("expected lump size error, got {other:?}"),
    }
}

#[test]
fn not_a_bsp_is_rejected() {
    let mut fixture = Fixture::new(&floor_world(1, 0));
    fixture.host.add_file("maps/test.bsp", b"JUNKJUNKJUNKJUNK".to_vec());

    assert!(matches!(
        fixture.load(),
        Err(StrafeError::BadBspIdent { .. })
    ));
}

#[test]
fn missing_world_is_reported() {
    let mut fixture = Fixture::new(&floor_world(1, 0));
    fixture.host.files.remove("maps/test.bsp");
    assert!(matches!(fixture.load(), Err(StrafeError::WorldNotFound(_))));
}

// ============================================================================
// Lightmap atlases
// ============================================================================

#[test]
fn five_lightmaps_pack_into_two_atlases() {
    let mut map = floor_world(5, 4); // the floor uses the 5th lightmap
    map.surfaces[0].lightmap_num = 4;
    let mut fixture = Fixture::new(&map);
    let world = fixture.load().unwrap();

    assert_eq!(world.n_lightmaps(), 2);
    assert_eq!(world.lightmap_size(), (256, 256));

    // The 5th lightmap lands in the second atlas, cell (0, 0): the remapped
    // uvs stay inside that cell's quarter of the atlas.
    let surface = &world.surfaces[0];

    for &index in &surface.indices {
        let tc = world.vertices[surface.buffer_index][index as usize].tex_coord();
        assert!(tc.z >= -1e-3 && tc.z <= 0.5 + 1e-3, "u out of cell: {}", tc.z);
        assert!(tc.w >= -1e-3 && tc.w <= 0.5 + 1e-3, "v out of cell: {}", tc.w);
    }
}

#[test]
fn single_lightmap_keeps_uvs() {
    let mut fixture = Fixture::new(&floor_world(1, 0));
    let world = fixture.load().unwrap();
    assert_eq!(world.n_lightmaps(), 1);
    assert_eq!(world.lightmap_size(), (128, 128));
}

// ============================================================================
// BSP queries
// ============================================================================

#[test]
fn leaf_descent_and_pvs() {
    let mut fixture = Fixture::new(&floor_world(1, 0));
    let world = fixture.load().unwrap();

    // x > 0 is leaf 0 (cluster 0), x < 0 is leaf 1 (cluster 1).
    let front = world.leaf_from_position(Vec3::new(100.0, 0.0, 0.0));
    let back = world.leaf_from_position(Vec3::new(-100.0, 0.0, 0.0));
    assert_eq!(world.nodes[front].cluster, 0);
    assert_eq!(world.nodes[back].cluster, 1);
    assert!(world.in_pvs(Vec3::new(100.0, 0.0, 0.0)));
}

#[test]
fn entity_token_walk_rewinds() {
    let mut fixture = Fixture::new(&floor_world(1, 0));
    let mut world = fixture.load().unwrap();

    assert_eq!(world.next_entity_token().as_deref(), Some("{"));
    assert_eq!(world.next_entity_token().as_deref(), Some("classname"));
    assert_eq!(world.next_entity_token().as_deref(), Some("worldspawn"));
    assert_eq!(world.next_entity_token().as_deref(), Some("}"));
    assert_eq!(world.next_entity_token(), None);

    // The walk rewinds after the end.
    assert_eq!(world.next_entity_token().as_deref(), Some("{"));
}

#[test]
fn worldspawn_overrides_grid_size() {
    let mut map = floor_world(1, 0);
    map.entities = "{ \"classname\" \"worldspawn\" \"gridsize\" \"128 128 256\" }".to_string();
    let mut fixture = Fixture::new(&map);
    let world = fixture.load().unwrap();
    assert_eq!(world.light_grid_size, Vec3::new(128.0, 128.0, 256.0));
}

// ============================================================================
// Visibility
// ============================================================================

#[test]
fn pvs_walk_collects_visible_surfaces() {
    let mut fixture = Fixture::new(&floor_world(1, 0));
    let mut world = fixture.load().unwrap();
    let area_mask = [0u8; MAX_MAP_AREA_BYTES];

    // Cluster 0 sees only itself; the floor is in leaf 0.
    world.update_visibility(
        VisibilityId::Main,
        Vec3::new(100.0, 0.0, 10.0),
        &area_mask,
        &mut fixture.device,
        &fixture.materials,
    );

    let vis = world.visibility_state(VisibilityId::Main);
    assert_eq!(vis.surfaces, vec![0]);
    assert_eq!(vis.batched_surfaces.len(), 1);
    assert_eq!(vis.batched_surfaces[0].n_indices, 6);
}

#[test]
fn unchanged_cluster_skips_rebuild() {
    let mut fixture = Fixture::new(&floor_world(1, 0));
    let mut world = fixture.load().unwrap();
    let area_mask = [0u8; MAX_MAP_AREA_BYTES];

    world.update_visibility(
        VisibilityId::Main,
        Vec3::new(100.0, 0.0, 10.0),
        &area_mask,
        &mut fixture.device,
        &fixture.materials,
    );
    let surfaces_ptr = world.visibility_state(VisibilityId::Main).surfaces.as_ptr();

    // Same cluster, different position: no rebuild, the surface list is
    // untouched.
    world.update_visibility(
        VisibilityId::Main,
        Vec3::new(200.0, 50.0, 10.0),
        &area_mask,
        &mut fixture.device,
        &fixture.materials,
    );
    assert_eq!(
        world.visibility_state(VisibilityId::Main).surfaces.as_ptr(),
        surfaces_ptr
    );

    // A changed area mask forces a rebuild.
    let mut masked = area_mask;
    masked[0] = 0b1;
    world.update_visibility(
        VisibilityId::Main,
        Vec3::new(200.0, 50.0, 10.0),
        &masked,
        &mut fixture.device,
        &fixture.materials,
    );

    // Area 0 is now masked off: nothing is visible.
    assert!(world.visibility_state(VisibilityId::Main).surfaces.is_empty());
}

#[test]
fn area_mask_blocks_leaves() {
    let mut fixture = Fixture::new(&floor_world(1, 0));
    let mut world = fixture.load().unwrap();
    let mut area_mask = [0u8; MAX_MAP_AREA_BYTES];
    area_mask[0] = 0b1; // area 0 is behind a door

    world.update_visibility(
        VisibilityId::Main,
        Vec3::new(100.0, 0.0, 10.0),
        &area_mask,
        &mut fixture.device,
        &fixture.materials,
    );
    assert!(world.visibility_state(VisibilityId::Main).surfaces.is_empty());
}

#[test]
fn outside_pvs_sees_everything() {
    let mut map = floor_world(1, 0);
    map.leaves[1].cluster = -1; // make leaf 1 "outside"
    let mut fixture = Fixture::new(&map);
    let mut world = fixture.load().unwrap();
    let area_mask = [0u8; MAX_MAP_AREA_BYTES];

    // The camera is in the outside leaf: everything draws.
    world.update_visibility(
        VisibilityId::Main,
        Vec3::new(-100.0, 0.0, 10.0),
        &area_mask,
        &mut fixture.device,
        &fixture.materials,
    );
    assert_eq!(world.visibility_state(VisibilityId::Main).surfaces, vec![0]);
}

#[test]
fn probe_visibility_uses_full_world_batch() {
    let mut fixture = Fixture::new(&floor_world(1, 0));
    let mut world = fixture.load().unwrap();
    let area_mask = [0u8; MAX_MAP_AREA_BYTES];

    world.update_visibility(
        VisibilityId::Probe,
        Vec3::ZERO,
        &area_mask,
        &mut fixture.device,
        &fixture.materials,
    );

    let vis = world.visibility_state(VisibilityId::Probe);
    assert_eq!(vis.method, strafe::world::VisibilityMethod::CameraFrustum);
    assert!(vis.surfaces.is_empty()); // no PVS walk happened
}

// ============================================================================
// Fog volumes
// ============================================================================

fn fog_map() -> BspBuilder {
    let mut map = floor_world(1, 0);

    // Six axial planes bounding a fog brush from (-64,-64,-64) to (64,64,64).
    // Brushes store the axial sides as (-x, +x, -y, +y, -z, +z) whose plane
    // distances encode the bounds.
    let first_plane = map.planes.len() as i32;

    map.planes.push((-Vec3::X, 64.0)); // min x = -(-(-64)) => -dist
    map.planes.push((Vec3::X, 64.0));
    map.planes.push((-Vec3::Y, 64.0));
    map.planes.push((Vec3::Y, 64.0));
    map.planes.push((-Vec3::Z, 64.0));
    map.planes.push((Vec3::Z, 64.0));

    let first_side = map.brush_sides.len() as i32;

    for i in 0..6 {
        map.brush_sides.push((first_plane + i, 0));
    }

    map.brushes.push((first_side, 6, 0));
    map.fogs.push(("textures/test/fogmat".to_string(), 0, 5));
    map
}

#[test]
fn fog_volume_bounds_and_lookup() {
    let mut fixture = Fixture::new(&fog_map());
    let world = fixture.load().unwrap();

    assert_eq!(world.fogs.len(), 1);
    let fog = &world.fogs[0];
    assert_eq!(fog.bounds.min, Vec3::splat(-64.0));
    assert_eq!(fog.bounds.max, Vec3::splat(64.0));

    // depthForOpaque of 0 is tolerated as 1.
    assert!((fog.tc_scale - 1.0 / 8.0).abs() < 1e-6);
    assert!(fog.surface.is_some());

    assert_eq!(world.find_fog_index_sphere(Vec3::ZERO, 10.0), 0);
    assert_eq!(world.find_fog_index_sphere(Vec3::new(500.0, 0.0, 0.0), 10.0), -1);

    let inside = strafe::math::Bounds::new(Vec3::splat(-10.0), Vec3::splat(10.0));
    assert_eq!(world.find_fog_index_bounds(&inside), 0);
}

// ============================================================================
// Light grid
// ============================================================================

#[test]
fn light_grid_sampling() {
    let mut map = floor_world(1, 0);

    // Grid sized for the default (64, 64, 128) cell size over the world
    // bounds: origin rounds up, max rounds down.
    let counts = [33usize, 33, 17];
    let n_points = counts[0] * counts[1] * counts[2];
    let mut grid = Vec::with_capacity(n_points * 8);

    for _ in 0..n_points {
        grid.extend_from_slice(&[100, 100, 100, 50, 50, 50, 0, 0]);
    }

    map.light_grid = grid;
    let mut fixture = Fixture::new(&map);
    let world = fixture.load().unwrap();

    assert!(world.has_light_grid());
    let (ambient, directed, direction) = world.sample_light_grid(Vec3::new(10.0, 10.0, 10.0));
    assert!(ambient.x > 0.0);
    assert!(directed.x > 0.0);
    assert!((direction.length() - 1.0).abs() < 1e-3);
}

// ============================================================================
// Decals
// ============================================================================

#[test]
fn mark_fragments_on_floor() {
    let mut fixture = Fixture::new(&floor_world(1, 0));
    let mut world = fixture.load().unwrap();

    // Project a 16x16 square at the impact position straight down through
    // the floor quad. Winding is clockwise seen from above so the edge
    // planes face inward.
    let points = [
        Vec3::new(120.0, -8.0, 0.0),
        Vec3::new(120.0, 8.0, 0.0),
        Vec3::new(136.0, 8.0, 0.0),
        Vec3::new(136.0, -8.0, 0.0),
    ];
    let projection = Vec3::new(0.0, 0.0, -100.0);
    let (point_buffer, fragments) = world.mark_fragments(&points, projection, 128, 16);

    assert!(!fragments.is_empty());

    for fragment in &fragments {
        assert!(fragment.num_points >= 3);
        assert!(fragment.num_points <= 8);

        for i in 0..fragment.num_points {
            let p = point_buffer[(fragment.first_point + i) as usize];
            assert!(p.x >= 119.0 && p.x <= 137.0, "x outside prism: {}", p.x);
            assert!(p.y >= -9.0 && p.y <= 9.0, "y outside prism: {}", p.y);
            assert!(p.z.abs() < 1.0, "fragment should lie on the floor: {}", p.z);
        }
    }
}

#[test]
fn mark_fragments_boundary_cases() {
    let mut fixture = Fixture::new(&floor_world(1, 0));
    let mut world = fixture.load().unwrap();

    let (points, fragments) = world.mark_fragments(&[], Vec3::NEG_Z, 128, 16);
    assert!(points.is_empty());
    assert!(fragments.is_empty());

    // More than the polygon limit is rejected outright.
    let too_many: Vec<Vec3> = (0..65).map(|i| Vec3::new(i as f32, 0.0, 50.0)).collect();
    let (points, fragments) = world.mark_fragments(&too_many, Vec3::NEG_Z, 128, 16);
    assert!(points.is_empty());
    assert!(fragments.is_empty());
}

// ============================================================================
// Patches
// ============================================================================

#[test]
fn patch_surfaces_are_subdivided() {
    let mut map = floor_world(1, 0);

    // A 3x3 curved control grid as a second surface, in leaf 0.
    let first_vert = map.vertices.len() as i32;

    for j in 0..3 {
        for i in 0..3 {
            let bulge = if i == 1 || j == 1 { 20.0 } else { 0.0 };
            map.vertices.push(BspVertex::new(
                Vec3::new(100.0 + i as f32 * 50.0, -50.0 + j as f32 * 50.0, bulge),
                [i as f32 / 2.0, j as f32 / 2.0],
                [i as f32 / 2.0, j as f32 / 2.0],
                Vec3::Z,
            ));
        }
    }

    map.surfaces.push(BspSurface {
        surface_type: 2, // patch
        first_vert,
        n_verts: 9,
        lightmap_num: 0,
        patch_width: 3,
        patch_height: 3,
        ..BspSurface::default()
    });
    map.models[0].n_surfaces = 2;
    map.leaf_surfaces.push(1);
    map.leaves[0].n_leaf_surfaces = 2;

    let mut fixture = Fixture::new(&map);
    let world = fixture.load().unwrap();

    let patch_surface = &world.surfaces[1];
    assert_eq!(patch_surface.surface_type, strafe::world::SurfaceType::Patch);
    let patch = patch_surface.patch.as_ref().unwrap();
    assert!(patch.width >= 3);
    assert!(!patch_surface.indices.is_empty());
}

// ============================================================================
// Brush models
// ============================================================================

#[test]
fn brush_models_build_batches() {
    let mut map = floor_world(1, 0);

    // A second quad forming brush model *1.
    let first_vert = map.vertices.len() as i32;
    map.vertices.extend(vec![
        BspVertex::new(Vec3::new(0.0, 0.0, 100.0), [0.0, 0.0], [0.0, 0.0], Vec3::Z),
        BspVertex::new(Vec3::new(32.0, 0.0, 100.0), [1.0, 0.0], [1.0, 0.0], Vec3::Z),
        BspVertex::new(Vec3::new(32.0, 32.0, 100.0), [1.0, 1.0], [1.0, 1.0], Vec3::Z),
        BspVertex::new(Vec3::new(0.0, 32.0, 100.0), [0.0, 1.0], [0.0, 1.0], Vec3::Z),
    ]);
    let first_index = map.indices.len() as i32;
    map.indices.extend_from_slice(&[0, 1, 2, 0, 2, 3]);

    map.surfaces.push(BspSurface {
        first_vert,
        n_verts: 4,
        first_index,
        n_indexes: 6,
        lightmap_num: -3, // vertex lit
        ..BspSurface::default()
    });

    map.models.push(BspModel {
        mins: Vec3::new(0.0, 0.0, 99.0),
        maxs: Vec3::new(32.0, 32.0, 101.0),
        first_surface: 1,
        n_surfaces: 1,
    });

    let mut fixture = Fixture::new(&map);
    let world = fixture.load().unwrap();
    assert_eq!(world.n_models(), 2);
    assert_eq!(world.model_bounds(1).min, Vec3::new(0.0, 0.0, 99.0));
}

// ============================================================================
// Portal camera derivation
// ============================================================================

/// Spec scenario: a mirror portal surface on the x = 0 plane with a
/// coincident-origin portal entity reflects the main camera about x = 0.
#[test]
fn mirror_portal_camera_is_reflected() {
    use glam::{Mat3, Mat4};
    use strafe::scene::{RenderEntity, RenderEntityType};

    let mut map = floor_world(1, 0);
    map.shaders.push(("textures/test/teleporter".to_string(), 0, 0));
    let first_vert = map.vertices.len() as i32;
    map.vertices.extend(vec![
        BspVertex::new(Vec3::new(0.0, -0.5, -0.5), [0.0, 0.0], [0.0, 0.0], Vec3::X),
        BspVertex::new(Vec3::new(0.0, -0.5, 0.5), [1.0, 0.0], [0.0, 0.0], Vec3::X),
        BspVertex::new(Vec3::new(0.0, 0.5, 0.5), [1.0, 1.0], [0.0, 0.0], Vec3::X),
        BspVertex::new(Vec3::new(0.0, 0.5, -0.5), [0.0, 1.0], [0.0, 0.0], Vec3::X),
    ]);
    let first_index = map.indices.len() as i32;
    map.indices.extend_from_slice(&[0, 1, 2, 0, 2, 3]);

    map.surfaces.push(BspSurface {
        shader_num: 1,
        first_vert,
        n_verts: 4,
        first_index,
        n_indexes: 6,
        lightmap_num: -1,
        plane_normal: Vec3::X,
        ..BspSurface::default()
    });
    map.models[0].n_surfaces = 2;
    map.leaf_surfaces.push(1);
    map.leaves[0].n_leaf_surfaces = 2;

    let shader_text = br"
textures/test/teleporter
{
    portal
    {
        map $whiteimage
    }
}
";

    let mut fixture =
        Fixture::with_files(&map, &[("scripts/portal.shader", shader_text.to_vec())]);
    let mut world = fixture.load().unwrap();

    let camera_position = Vec3::new(10.0, 0.0, 0.0);
    let camera_rotation = Mat3::from_cols(
        Vec3::new(-1.0, 0.0, 0.0),
        Vec3::new(0.0, -1.0, 0.0),
        Vec3::Z,
    );
    let area_mask = [0u8; MAX_MAP_AREA_BYTES];

    world.update_visibility(
        VisibilityId::Main,
        camera_position,
        &area_mask,
        &mut fixture.device,
        &fixture.materials,
    );
    assert_eq!(
        world.visibility_state(VisibilityId::Main).portal_surfaces.len(),
        1
    );

    let entities = vec![RenderEntity {
        entity_type: RenderEntityType::Portal,
        position: Vec3::ZERO,
        old_position: Vec3::ZERO,
        ..RenderEntity::default()
    }];

    let portal = world
        .calculate_portal_camera(
            VisibilityId::Main,
            camera_position,
            &camera_rotation,
            &Mat4::IDENTITY,
            &entities,
            &fixture.materials,
            0.0,
        )
        .expect("portal should be visible");

    assert!(portal.is_mirror);
    assert_eq!(portal.pvs_position, Vec3::ZERO);
    assert!((portal.camera.position - Vec3::new(-10.0, 0.0, 0.0)).length() < 1e-3);
    assert!((portal.camera.axis(0) - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-3);

    // The near clip plane rejects geometry behind the portal surface.
    assert!((portal.plane.normal - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-3);
    assert!(portal.plane.distance.abs() < 1e-3);

    // Without a matching portal entity nothing is rendered: the server may
    // not have communicated the entity yet.
    let portal = world.calculate_portal_camera(
        VisibilityId::Main,
        camera_position,
        &camera_rotation,
        &Mat4::IDENTITY,
        &[],
        &fixture.materials,
        0.0,
    );
    assert!(portal.is_none());
}
