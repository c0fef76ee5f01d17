//! Engine-level scene tests: registration, 2D overlay, world scenes,
//! portal cameras and model queries.

mod common;

use common::{floor_world, md3_bytes, png_bytes, BspSurface, BspVertex, SharedDevice};
use glam::{Mat3, Vec3};

use strafe::interface::MemoryHost;
use strafe::scene::{
    RenderEntity, RenderEntityType, SceneDefinition, SceneFlags, MAX_MAP_AREA_BYTES,
};
use strafe::{DynamicLight, Engine, LightType};

fn engine_with(files: Vec<(&str, Vec<u8>)>) -> (Engine, SharedDevice) {
    let mut host = MemoryHost::new();

    for (name, data) in files {
        host.add_file(name, data);
    }

    let device = SharedDevice::new();
    let engine = Engine::new(Box::new(host), Box::new(device.clone())).unwrap();
    (engine, device)
}

// ============================================================================
// Registration
// ============================================================================

#[test]
fn register_shader_returns_zero_for_missing() {
    let (mut engine, _device) = engine_with(vec![]);
    assert_eq!(engine.register_shader("textures/not/there"), 0);
}

#[test]
fn register_shader_finds_image_backed_materials() {
    let (mut engine, _device) = engine_with(vec![(
        "gfx/2d/crosshair.png",
        png_bytes(8, 8, [255, 255, 255, 255]),
    )]);

    let handle = engine.register_shader("gfx/2d/crosshair");
    assert!(handle > 0);

    // Registration is stable.
    assert_eq!(engine.register_shader("gfx/2d/crosshair"), handle);
}

#[test]
fn register_model_and_lerp_tag() {
    let (mut engine, _device) = engine_with(vec![
        (
            "models/test/gun.md3",
            md3_bytes("tag_flash", Vec3::ZERO, Vec3::new(10.0, 0.0, 0.0)),
        ),
        ("textures/test/image.png", png_bytes(4, 4, [255, 0, 0, 255])),
    ]);

    let handle = engine.register_model("models/test/gun.md3");
    assert!(handle > 0);

    // A missing model is handle zero, and the failure is cached.
    assert_eq!(engine.register_model("models/test/none.md3"), 0);
    assert_eq!(engine.register_model("models/test/none.md3"), 0);

    let bounds = engine.model_bounds(handle).unwrap();
    assert_eq!(bounds.min, Vec3::splat(-16.0));

    // The tag lerps halfway between its two frames.
    let entity = RenderEntity {
        frame: 1,
        old_frame: 0,
        lerp: 0.5,
        ..RenderEntity::default()
    };
    let (tag_index, transform) = engine
        .lerp_tag(handle, &entity, "tag_flash", 0)
        .expect("tag should exist");
    assert_eq!(tag_index, 0);
    assert!((transform.position - Vec3::new(5.0, 0.0, 0.0)).length() < 1e-3);

    assert!(engine.lerp_tag(handle, &entity, "tag_nope", 0).is_none());
}

// ============================================================================
// 2D overlay
// ============================================================================

#[test]
fn stretch_pics_flush_on_non_world_scenes() {
    let (mut engine, device) = engine_with(vec![(
        "gfx/2d/pic.png",
        png_bytes(8, 8, [255, 255, 255, 255]),
    )]);

    let handle = engine.register_shader("gfx/2d/pic");
    engine.begin_frame();
    engine.draw_stretch_pic(0.0, 0.0, 64.0, 64.0, 0.0, 0.0, 1.0, 1.0, handle);
    engine.draw_stretch_pic(64.0, 0.0, 64.0, 64.0, 0.0, 0.0, 1.0, 1.0, handle);

    let scene = SceneDefinition {
        flags: SceneFlags::empty(),
        ..SceneDefinition::default()
    };
    engine.render_scene(&scene);

    let submissions = device.0.borrow().submissions.clone();
    assert_eq!(submissions.len(), 2);

    // 2D submissions land on the reserved overlay view.
    for (view, dc) in &submissions {
        assert_eq!(view.0, 0);
        assert_eq!(dc.ib.n_indices, 6);
    }
}

// ============================================================================
// World scenes
// ============================================================================

fn world_scene() -> SceneDefinition {
    SceneDefinition {
        area_mask: [0u8; MAX_MAP_AREA_BYTES],
        flags: SceneFlags::WORLD,
        fov: glam::Vec2::new(90.0, 90.0),
        position: Vec3::new(100.0, 0.0, 10.0),
        rotation: Mat3::IDENTITY,
        rect: strafe::scene::Rect::new(0, 0, 640, 480),
        time: 500,
    }
}

#[test]
fn world_scene_submits_sorted_draw_calls() {
    let map = floor_world(1, 0);
    let (mut engine, device) = engine_with(vec![("maps/test.bsp", map.build())]);
    engine.load_world("maps/test.bsp").unwrap();

    engine.begin_frame();
    engine.clear_scene();
    engine.render_scene(&world_scene());

    let submissions = device.0.borrow().submissions.clone();
    assert!(!submissions.is_empty(), "world scene should submit draw calls");

    // Submission order within a view is the sort order.
    for pair in submissions.windows(2) {
        if pair[0].0 != pair[1].0 {
            continue;
        }

        let key = |dc: &strafe::DrawCall| {
            (dc.material_sort, dc.sort, dc.material_sorted_index, dc.fog_index)
        };
        assert!(key(&pair[0].1) <= key(&pair[1].1));
    }

    let (front_ms, back_ms) = engine.end_frame();
    assert!(front_ms >= 0);
    assert_eq!(back_ms, 0);
}

#[test]
fn dynamic_lights_are_cleared_each_scene() {
    let map = floor_world(1, 0);
    let (mut engine, _device) = engine_with(vec![("maps/test.bsp", map.build())]);
    engine.load_world("maps/test.bsp").unwrap();

    engine.begin_frame();
    engine.clear_scene();

    engine.add_light_to_scene(DynamicLight {
        color: Vec3::ONE,
        radius: 100.0,
        position: Vec3::new(100.0, 0.0, 10.0),
        light_type: LightType::Point,
        capsule_end: Vec3::ZERO,
    });
    assert_eq!(engine.dynamic_lights().n_lights(engine.frame_no()), 1);

    engine.clear_scene();
    assert_eq!(engine.dynamic_lights().n_lights(engine.frame_no()), 0);
}

#[test]
fn sprite_entities_emit_quads() {
    let map = floor_world(1, 0);
    let (mut engine, device) = engine_with(vec![
        ("maps/test.bsp", map.build()),
        ("gfx/smoke.png", png_bytes(8, 8, [128, 128, 128, 255])),
    ]);
    engine.load_world("maps/test.bsp").unwrap();
    let material = engine.register_shader("gfx/smoke");

    engine.begin_frame();
    engine.clear_scene();
    engine.add_entity_to_scene(&RenderEntity {
        entity_type: RenderEntityType::Sprite,
        position: Vec3::new(150.0, 0.0, 20.0),
        radius: 8.0,
        custom_material: material,
        ..RenderEntity::default()
    });
    engine.render_scene(&world_scene());

    let submissions = device.0.borrow().submissions.clone();
    let sprite_calls: Vec<_> = submissions
        .iter()
        .filter(|(_, dc)| dc.entity.is_some())
        .collect();
    assert_eq!(sprite_calls.len(), 1);
    assert_eq!(sprite_calls[0].1.ib.n_indices, 6);
}

// ============================================================================
// Portals
// ============================================================================

/// A visible mirror portal triggers the stencil passes and a nested scene
/// render on separate views.
#[test]
fn mirror_portal_renders_nested_scene() {
    let mut map = floor_world(1, 0);

    // The portal quad at x = 0, wound so the plane normal faces +x.
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

    let (mut engine, device) = engine_with(vec![
        ("maps/test.bsp", map.build()),
        ("scripts/portal.shader", shader_text.to_vec()),
    ]);
    engine.load_world("maps/test.bsp").unwrap();

    engine.begin_frame();
    engine.clear_scene();

    // The portal entity sits at the origin with coincident origins, making
    // it a mirror.
    engine.add_entity_to_scene(&RenderEntity {
        entity_type: RenderEntityType::Portal,
        position: Vec3::ZERO,
        old_position: Vec3::ZERO,
        ..RenderEntity::default()
    });

    // Look down -x at the portal.
    let scene = SceneDefinition {
        position: Vec3::new(10.0, 0.0, 0.0),
        rotation: Mat3::from_cols(
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(0.0, -1.0, 0.0),
            Vec3::Z,
        ),
        ..world_scene()
    };
    engine.render_scene(&scene);

    let submissions = device.0.borrow().submissions.clone();
    let views: std::collections::BTreeSet<u16> =
        submissions.iter().map(|(view, _)| view.0).collect();

    // Stencil increment, nested scene, stencil restore and the parent scene
    // each use their own view.
    assert!(views.len() >= 3, "expected nested portal views, got {views:?}");

    // The stencil passes mark the portal polygon.
    let stencil_writes = submissions
        .iter()
        .filter(|(_, dc)| dc.state.flags.contains(strafe::draw::StateFlags::STENCIL_WRITE))
        .count();
    let stencil_clears = submissions
        .iter()
        .filter(|(_, dc)| dc.state.flags.contains(strafe::draw::StateFlags::STENCIL_CLEAR))
        .count();
    assert_eq!(stencil_writes, 1);
    assert_eq!(stencil_clears, 1);
}

/// A portal surface with no portal entity in the frame is dropped entirely.
#[test]
fn portal_without_entity_is_dropped() {
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

    let (mut engine, device) = engine_with(vec![
        ("maps/test.bsp", map.build()),
        ("scripts/portal.shader", shader_text.to_vec()),
    ]);
    engine.load_world("maps/test.bsp").unwrap();

    engine.begin_frame();
    engine.clear_scene();

    let scene = SceneDefinition {
        position: Vec3::new(10.0, 0.0, 0.0),
        rotation: Mat3::from_cols(
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(0.0, -1.0, 0.0),
            Vec3::Z,
        ),
        ..world_scene()
    };
    engine.render_scene(&scene);

    let submissions = device.0.borrow().submissions.clone();
    let stencil_writes = submissions
        .iter()
        .filter(|(_, dc)| dc.state.flags.contains(strafe::draw::StateFlags::STENCIL_WRITE))
        .count();
    assert_eq!(stencil_writes, 0);
}

// ============================================================================
// Stage evaluation
// ============================================================================

/// Backends evaluate material stages per draw call at submission time.
#[test]
fn stage_evaluation_produces_uniforms() {
    let map = floor_world(1, 0);
    let (mut engine, device) = engine_with(vec![("maps/test.bsp", map.build())]);
    engine.load_world("maps/test.bsp").unwrap();

    engine.begin_frame();
    engine.clear_scene();
    engine.render_scene(&world_scene());

    let submissions = device.0.borrow().submissions.clone();
    let (_, dc) = submissions.first().expect("world draw call").clone();

    let stage = engine.evaluate_stage(&dc, 0).expect("stage 0 exists");

    // The default material draws an identity-lit opaque pass.
    assert!(stage.state.flags.contains(strafe::draw::StateFlags::DEPTH_WRITE));
    assert!(stage.colors.base_color.w > 0.99);
    assert!(stage.colors.base_color.x > 0.5);
    assert!(stage.animation.is_none());
    assert_eq!(stage.deforms.n_deforms, 0);

    // The identity texture matrix: no tcMods on the default material.
    assert_eq!(stage.tex_gen.matrix, glam::Vec4::new(1.0, 0.0, 0.0, 1.0));

    // Past the last pass there is nothing to bind.
    let n_passes = engine
        .materials()
        .material(dc.material)
        .num_unfogged_passes;
    assert!(engine.evaluate_stage(&dc, n_passes).is_none());
}
