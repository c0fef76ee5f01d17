//! Dynamic light grid tests: cell assignment, texture layout invariants
//! and the CPU contribution path.

mod common;

use common::SharedDevice;
use glam::Vec3;

use strafe::math::Bounds;
use strafe::{DynamicLight, DynamicLightManager, LightType};

fn canonical_grid() -> (SharedDevice, DynamicLightManager) {
    let mut device = SharedDevice::new();
    let mut manager = DynamicLightManager::new(&mut device);

    // An 8192-unit cube world: 32 cells of 256 units per axis.
    let bounds = Bounds::new(Vec3::splat(-4096.0), Vec3::splat(4096.0));
    manager.initialize_grid(&mut device, bounds);
    (device, manager)
}

fn point_light(position: Vec3, radius: f32) -> DynamicLight {
    DynamicLight {
        color: Vec3::ONE,
        radius,
        position,
        light_type: LightType::Point,
        capsule_end: Vec3::ZERO,
    }
}

#[test]
fn grid_dimensions_follow_world_bounds() {
    let (_, manager) = canonical_grid();
    let uniforms = manager.uniforms(0, 1.0);
    assert_eq!(uniforms.grid_size, [32, 32, 32]);
    assert_eq!(uniforms.cell_size, Vec3::splat(256.0));
    assert_eq!(uniforms.grid_offset, Vec3::splat(4096.0));

    // 32^3 cells need a 256x256 R16 texture; indices are fixed at 512.
    assert_eq!(uniforms.texture_sizes[0], 256);
    assert_eq!(uniforms.texture_sizes[1], 512);
}

#[test]
fn small_world_clamps_cell_size() {
    let mut device = SharedDevice::new();
    let mut manager = DynamicLightManager::new(&mut device);
    manager.initialize_grid(
        &mut device,
        Bounds::new(Vec3::splat(-100.0), Vec3::splat(100.0)),
    );

    // Cells never shrink under 200 units.
    let uniforms = manager.uniforms(0, 1.0);
    assert_eq!(uniforms.grid_size, [1, 1, 1]);
}

#[test]
fn point_light_is_assigned_to_nearby_cells() {
    let (mut device, mut manager) = canonical_grid();

    // A light at the world origin, radius 100. Origin sits on the corner of
    // 8 cells; at most those 8 receive the light.
    manager.add(0, point_light(Vec3::ZERO, 100.0), 1.0);
    manager.update_textures(0, &mut device);

    let mut assigned_cells = 0;
    let mut total_assignments = 0;

    for x in 0..32 {
        for y in 0..32 {
            for z in 0..32 {
                let lights = manager.cell_lights(0, [x, y, z]);

                if !lights.is_empty() {
                    assigned_cells += 1;
                    total_assignments += lights.len();

                    // Every index refers to the only light.
                    assert!(lights.iter().all(|&i| i == 0));

                    // The cell must be adjacent to the origin.
                    assert!((14..=17).contains(&x));
                    assert!((14..=17).contains(&y));
                    assert!((14..=17).contains(&z));
                }
            }
        }
    }

    assert!(assigned_cells > 0);
    assert!(assigned_cells <= 8);
    assert_eq!(assigned_cells, total_assignments);
}

#[test]
fn far_cells_have_no_lights() {
    let (mut device, mut manager) = canonical_grid();
    manager.add(0, point_light(Vec3::ZERO, 100.0), 1.0);
    manager.update_textures(0, &mut device);

    assert!(manager.cell_lights(0, [0, 0, 0]).is_empty());
    assert!(manager.cell_lights(0, [31, 31, 31]).is_empty());
}

#[test]
fn clear_then_update_produces_empty_assignment() {
    let (mut device, mut manager) = canonical_grid();
    manager.add(0, point_light(Vec3::ZERO, 100.0), 1.0);
    manager.update_textures(0, &mut device);

    manager.clear(0);
    manager.update_textures(0, &mut device);

    for x in 0..32 {
        for y in 0..32 {
            for z in 0..32 {
                assert!(manager.cell_lights(0, [x, y, z]).is_empty());
            }
        }
    }

    assert_eq!(manager.n_lights(0), 0);
}

#[test]
fn capsule_light_covers_the_segment() {
    let (mut device, mut manager) = canonical_grid();

    // A capsule spanning four cells along x.
    manager.add(
        0,
        DynamicLight {
            color: Vec3::ONE,
            radius: 50.0,
            position: Vec3::new(-500.0, 0.0, 0.0),
            light_type: LightType::Capsule,
            capsule_end: Vec3::new(500.0, 0.0, 0.0),
        },
        1.0,
    );
    manager.update_textures(0, &mut device);

    // Cells along the segment must see the light.
    let mut covered = 0;

    for x in 13..=18 {
        if !manager.cell_lights(0, [x, 15, 15]).is_empty()
            || !manager.cell_lights(0, [x, 16, 16]).is_empty()
        {
            covered += 1;
        }
    }

    assert!(covered >= 3, "capsule covered {covered} cells along x");
}

#[test]
fn radius_scale_is_applied() {
    let (mut device, mut manager) = canonical_grid();
    manager.add(0, point_light(Vec3::ZERO, 100.0), 2.0);
    manager.update_textures(0, &mut device);

    // Doubling the radius widens the coarse AABB to reach further cells.
    let mut assigned_cells = 0;

    for x in 0..32 {
        for y in 0..32 {
            for z in 0..32 {
                if !manager.cell_lights(0, [x, y, z]).is_empty() {
                    assigned_cells += 1;
                }
            }
        }
    }

    assert!(assigned_cells >= 8);
}

#[test]
fn triple_buffered_frames_are_independent() {
    let (mut device, mut manager) = canonical_grid();

    manager.add(0, point_light(Vec3::ZERO, 100.0), 1.0);
    manager.update_textures(0, &mut device);

    // Frame 1 has no lights; its cells must stay clear while frame 0 keeps
    // its assignment.
    manager.clear(1);
    manager.update_textures(1, &mut device);

    assert_eq!(manager.n_lights(0), 1);
    assert_eq!(manager.n_lights(1), 0);
    assert!(!manager.cell_lights(0, [15, 15, 15]).is_empty());
    assert!(manager.cell_lights(1, [15, 15, 15]).is_empty());
}

#[test]
fn contribute_falls_off_with_distance() {
    let (_, mut manager) = canonical_grid();
    manager.add(0, point_light(Vec3::ZERO, 10.0), 1.0);

    let (near, near_dir) = manager.contribute(0, Vec3::new(10.0, 0.0, 0.0));
    let (far, _) = manager.contribute(0, Vec3::new(100.0, 0.0, 0.0));

    assert!(near.x > far.x);
    assert!(far.x > 0.0);

    // The direction points from the sample towards the light.
    assert!(near_dir.x < 0.0);
}

#[test]
fn lights_beyond_the_maximum_are_dropped() {
    let (_, mut manager) = canonical_grid();

    for i in 0..300 {
        manager.add(0, point_light(Vec3::new(i as f32, 0.0, 0.0), 10.0), 1.0);
    }

    assert_eq!(manager.n_lights(0), strafe::dynamic_light::MAX_LIGHTS - 1);
}
