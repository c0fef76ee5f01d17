//! Dynamic light grid.
//!
//! A per-frame 3D spatial index of dynamic lights, exposed to shaders as
//! three textures:
//!
//! - cells: `u16` offset into the indices texture per grid cell,
//! - indices: `u8` light count followed by that many light indices,
//! - lights: the packed light records as RGBA32F texels.
//!
//! CPU-side copies are triple buffered by frame number so the GPU never
//! reads a buffer the CPU is writing.

use glam::Vec3;
use log::{info, warn};

use crate::gpu::{GraphicsDevice, TextureDescriptor, TextureHandle};
use crate::math::{closest_point_on_line_segment, Bounds};

/// Frames of CPU-side buffering.
pub const NUM_BUFFER_FRAMES: usize = 3;

/// Maximum dynamic lights per frame.
pub const MAX_LIGHTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LightType {
    #[default]
    Point,
    Capsule,
}

/// One dynamic light submitted by the host.
#[derive(Debug, Clone, Copy)]
pub struct DynamicLight {
    /// Linear-space color.
    pub color: Vec3,
    /// Radius / intensity.
    pub radius: f32,
    pub position: Vec3,
    pub light_type: LightType,
    /// Capsule lights only.
    pub capsule_end: Vec3,
}

impl Default for DynamicLight {
    fn default() -> Self {
        DynamicLight {
            color: Vec3::ONE,
            radius: 0.0,
            position: Vec3::ZERO,
            light_type: LightType::Point,
            capsule_end: Vec3::ZERO,
        }
    }
}

/// Shader uniform block describing the grid and its textures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicLightUniforms {
    /// Cell size in world units.
    pub cell_size: Vec3,
    pub grid_offset: Vec3,
    pub grid_size: [u32; 3],
    pub n_lights: u32,
    pub intensity: f32,
    /// cells, indices, lights texture sizes.
    pub texture_sizes: [u32; 3],
}

/// Floats per light record in the lights texture (three RGBA32F texels).
const LIGHT_RECORD_FLOATS: usize = 12;

fn smallest_pot_texture_size(n_pixels: usize) -> u16 {
    let side = (n_pixels as f32).sqrt().ceil() as usize;
    let mut size = 1u16;

    while (size as usize) < side {
        size *= 2;
    }

    size
}

/// Owns the grid and its GPU textures for the lifetime of the engine; the
/// grid itself is sized on first world load.
pub struct DynamicLightManager {
    lights: [Vec<DynamicLight>; NUM_BUFFER_FRAMES],
    assigned_lights: Vec<u32>,

    cells_texture: TextureHandle,
    cells_texture_size: u16,
    cells_data: [Vec<u16>; NUM_BUFFER_FRAMES],

    indices_texture: TextureHandle,
    indices_texture_size: u16,
    indices_data: [Vec<u8>; NUM_BUFFER_FRAMES],

    lights_texture: TextureHandle,
    lights_texture_size: u16,

    cell_size: [i32; 3],
    grid_offset: Vec3,
    grid_size: [u32; 3],

    warned_max_lights: bool,
}

impl DynamicLightManager {
    pub fn new(device: &mut dyn GraphicsDevice) -> DynamicLightManager {
        // The smallest square power-of-two texture that fits the light data,
        // never smaller than 64x64 to sidestep partial-update quirks on some
        // backends.
        let lights_texture_size =
            smallest_pot_texture_size(MAX_LIGHTS * LIGHT_RECORD_FLOATS / 4).max(64);
        info!("dlight texture size is {lights_texture_size}x{lights_texture_size}");

        let lights_texture = device.create_texture(
            &TextureDescriptor {
                label: "*dlightLights".to_string(),
                width: u32::from(lights_texture_size),
                height: u32::from(lights_texture_size),
                mip_count: 1,
                format: wgpu::TextureFormat::Rgba32Float,
                clamp_to_edge: true,
                mutable: true,
            },
            None,
        );

        DynamicLightManager {
            lights: Default::default(),
            assigned_lights: Vec::new(),
            cells_texture: TextureHandle::INVALID,
            cells_texture_size: 0,
            cells_data: Default::default(),
            indices_texture: TextureHandle::INVALID,
            indices_texture_size: 0,
            indices_data: Default::default(),
            lights_texture,
            lights_texture_size,
            cell_size: [0; 3],
            grid_offset: Vec3::ZERO,
            grid_size: [0; 3],
            warned_max_lights: false,
        }
    }

    /// Size the grid against the world bounds: at least 200 units per cell,
    /// at most 32 cells per axis, re-derived so the cells exactly tile the
    /// world.
    pub fn initialize_grid(&mut self, device: &mut dyn GraphicsDevice, world_bounds: Bounds) {
        const MIN_CELL_SIZE: i32 = 200;
        const MAX_GRID_SIZE: u32 = 32;

        let world_size = world_bounds.size();

        for i in 0..3 {
            self.cell_size[i] =
                MIN_CELL_SIZE.max((world_size[i] / MAX_GRID_SIZE as f32).ceil() as i32);
            self.grid_size[i] =
                MAX_GRID_SIZE.min((world_size[i] / self.cell_size[i] as f32).ceil() as u32).max(1);
            self.cell_size[i] = (world_size[i] / self.grid_size[i] as f32) as i32;
        }

        info!(
            "dlight grid size is {}x{}x{}",
            self.grid_size[0], self.grid_size[1], self.grid_size[2]
        );
        self.grid_offset = -world_bounds.min;

        // Cells texture.
        let n_cells = (self.grid_size[0] * self.grid_size[1] * self.grid_size[2]) as usize;
        self.cells_texture_size = smallest_pot_texture_size(n_cells).max(64);
        info!(
            "dlight cells texture size is {0}x{0}",
            self.cells_texture_size
        );
        self.cells_texture = device.create_texture(
            &TextureDescriptor {
                label: "*dlightCells".to_string(),
                width: u32::from(self.cells_texture_size),
                height: u32::from(self.cells_texture_size),
                mip_count: 1,
                format: wgpu::TextureFormat::R16Uint,
                clamp_to_edge: true,
                mutable: true,
            },
            None,
        );

        for buffer in &mut self.cells_data {
            buffer.resize(
                self.cells_texture_size as usize * self.cells_texture_size as usize,
                0,
            );
        }

        // Indices texture.
        self.indices_texture_size = 512;
        self.indices_texture = device.create_texture(
            &TextureDescriptor {
                label: "*dlightIndices".to_string(),
                width: u32::from(self.indices_texture_size),
                height: u32::from(self.indices_texture_size),
                mip_count: 1,
                format: wgpu::TextureFormat::R8Uint,
                clamp_to_edge: true,
                mutable: true,
            },
            None,
        );

        for buffer in &mut self.indices_data {
            buffer.resize(
                self.indices_texture_size as usize * self.indices_texture_size as usize,
                0,
            );
        }

        self.assigned_lights.reserve(512);
    }

    #[must_use]
    pub fn cells_texture(&self) -> TextureHandle {
        self.cells_texture
    }

    #[must_use]
    pub fn indices_texture(&self) -> TextureHandle {
        self.indices_texture
    }

    #[must_use]
    pub fn lights_texture(&self) -> TextureHandle {
        self.lights_texture
    }

    #[must_use]
    pub fn n_lights(&self, frame_no: u32) -> usize {
        self.lights[frame_no as usize % NUM_BUFFER_FRAMES].len()
    }

    /// Add a light for this frame. Lights beyond the maximum are dropped
    /// with a warning (logged once).
    pub fn add(&mut self, frame_no: u32, mut light: DynamicLight, radius_scale: f32) {
        let lights = &mut self.lights[frame_no as usize % NUM_BUFFER_FRAMES];

        if lights.len() == MAX_LIGHTS - 1 {
            if !self.warned_max_lights {
                warn!("Hit maximum dlights");
                self.warned_max_lights = true;
            }

            return;
        }

        light.radius *= radius_scale;
        lights.push(light);
    }

    /// Clear this frame's lights.
    pub fn clear(&mut self, frame_no: u32) {
        self.lights[frame_no as usize % NUM_BUFFER_FRAMES].clear();
    }

    /// Classical forward contribution for a sampled point: `power / d²`
    /// falloff summed over all active lights.
    #[must_use]
    pub fn contribute(&self, frame_no: u32, position: Vec3) -> (Vec3, Vec3) {
        // At the edge of a light's influence this much light is added; the
        // range is clamped to prevent huge light values up close.
        const DLIGHT_AT_RADIUS: f32 = 16.0;
        const DLIGHT_MINIMUM_RADIUS: f32 = 16.0;

        let mut color = Vec3::ZERO;
        let mut direction = Vec3::ZERO;

        for light in &self.lights[frame_no as usize % NUM_BUFFER_FRAMES] {
            let mut dir = light.position - position;
            let d = dir.length();
            dir = dir.normalize_or_zero();
            let power = (DLIGHT_AT_RADIUS * light.radius * light.radius).min(DLIGHT_MINIMUM_RADIUS);
            let scale = power / (d * d).max(1e-6);
            let gamma = |v: f32| v.powf(1.0 / 2.2);
            color += Vec3::new(gamma(light.color.x), gamma(light.color.y), gamma(light.color.z))
                * scale;
            direction += dir * scale;
        }

        (color, direction)
    }

    fn encode_assigned_light(cell: [u32; 3], light_index: u8) -> u32 {
        (cell[0] << 24) | (cell[1] << 16) | (cell[2] << 8) | u32::from(light_index)
    }

    fn decode_assigned_light(value: u32) -> ([u32; 3], u8) {
        (
            [(value >> 24) & 0xff, (value >> 16) & 0xff, (value >> 8) & 0xff],
            (value & 0xff) as u8,
        )
    }

    fn cell_index(&self, cell: [u32; 3]) -> usize {
        (cell[0] + cell[1] * self.grid_size[0] + cell[2] * self.grid_size[0] * self.grid_size[1])
            as usize
    }

    /// Clamped cell coordinates for a world position.
    fn cell_from_position(&self, position: Vec3) -> [u32; 3] {
        let local = self.grid_offset + position;
        let mut cell = [0u32; 3];

        for i in 0..3 {
            cell[i] = ((local[i] / self.cell_size[i] as f32).max(0.0) as u32)
                .min(self.grid_size[i] - 1);
        }

        cell
    }

    /// Assign this frame's lights to cells and update the three textures.
    pub fn update_textures(&mut self, frame_no: u32, device: &mut dyn GraphicsDevice) {
        if self.grid_size[0] == 0 {
            return;
        }

        let buffer = frame_no as usize % NUM_BUFFER_FRAMES;

        // Assign lights to cells.
        self.assigned_lights.clear();
        let cell_radius = Vec3::new(
            self.cell_size[0] as f32,
            self.cell_size[1] as f32,
            self.cell_size[2] as f32,
        )
        .length()
            / 2.0;

        for light_index in 0..self.lights[buffer].len() {
            let light = self.lights[buffer][light_index];
            let mut min = self.grid_size;
            let mut max = [0u32; 3];

            // Coarse cull: the cells touched by the corners of the sphere
            // AABB(s) bound the candidate range. Capsules contribute both
            // endpoint spheres.
            let endpoints = match light.light_type {
                LightType::Point => vec![light.position],
                LightType::Capsule => vec![light.position, light.capsule_end],
            };

            for endpoint in endpoints {
                let aabb = Bounds::from_origin_radius(endpoint, light.radius);

                for corner in aabb.corners() {
                    let cell = self.cell_from_position(corner);

                    for k in 0..3 {
                        min[k] = min[k].min(cell[k]);
                        max[k] = max[k].max(cell[k]);
                    }
                }
            }

            for x in min[0]..=max[0] {
                for y in min[1]..=max[1] {
                    for z in min[2]..=max[2] {
                        // Finer-grained cull against the light radius; for
                        // capsules, from the closest point on the segment.
                        let cell_center = Vec3::new(
                            -self.grid_offset.x
                                + (x as f32 + 0.5) * self.cell_size[0] as f32,
                            -self.grid_offset.y
                                + (y as f32 + 0.5) * self.cell_size[1] as f32,
                            -self.grid_offset.z
                                + (z as f32 + 0.5) * self.cell_size[2] as f32,
                        );

                        let compare_position = match light.light_type {
                            LightType::Point => light.position,
                            LightType::Capsule => closest_point_on_line_segment(
                                light.position,
                                light.capsule_end,
                                cell_center,
                            ),
                        };

                        if cell_center.distance(compare_position) > cell_radius + light.radius {
                            continue;
                        }

                        self.assigned_lights
                            .push(Self::encode_assigned_light([x, y, z], light_index as u8));
                    }
                }
            }
        }

        // Group the assignments by cell in deterministic scan order.
        self.assigned_lights.sort_unstable();

        // Fill the cells and indices texture data. The first index byte is
        // reserved so all empty cells can point at it.
        self.cells_data[buffer].fill(0);
        let mut indices_offset = 1usize;
        self.indices_data[buffer][0] = 0;
        let mut current_cell_index = usize::MAX;
        let mut count_offset = 0usize;

        for i in 0..self.assigned_lights.len() {
            let (cell, light_index) = Self::decode_assigned_light(self.assigned_lights[i]);
            let cell_index = self.cell_index(cell);

            if i == 0 || cell_index != current_cell_index {
                current_cell_index = cell_index;

                // Point the cell at the indices.
                self.cells_data[buffer][cell_index] = indices_offset as u16;

                // Reserve the per-cell light count byte.
                count_offset = indices_offset;
                self.indices_data[buffer][count_offset] = 0;
                indices_offset += 1;
            }

            self.indices_data[buffer][count_offset] += 1;
            self.indices_data[buffer][indices_offset] = light_index;
            indices_offset += 1;

            if indices_offset > usize::from(u16::MAX - 2) {
                warn!("Too many assigned lights.");
                break;
            }
        }

        // Update the cells texture.
        let cells_bytes: Vec<u8> = bytemuck::cast_slice(&self.cells_data[buffer]).to_vec();
        device.update_texture(
            self.cells_texture,
            0,
            0,
            u32::from(self.cells_texture_size),
            u32::from(self.cells_texture_size),
            &cells_bytes,
        );

        let n_lights = self.lights[buffer].len();

        // Update the used rows of the indices texture.
        if n_lights > 0 && indices_offset > 0 {
            let width = (indices_offset as u32).min(u32::from(self.indices_texture_size));
            let height =
                (indices_offset as f32 / f32::from(self.indices_texture_size)).ceil() as u32;
            device.update_texture(
                self.indices_texture,
                0,
                0,
                width,
                height,
                &self.indices_data[buffer][..indices_offset],
            );
        }

        // Update the used rows of the lights texture.
        if n_lights > 0 {
            let mut floats = Vec::with_capacity(n_lights * LIGHT_RECORD_FLOATS);

            for light in &self.lights[buffer] {
                floats.extend_from_slice(&[
                    light.capsule_end.x,
                    light.capsule_end.y,
                    light.capsule_end.z,
                    0.0,
                    light.color.x,
                    light.color.y,
                    light.color.z,
                    light.radius,
                    light.position.x,
                    light.position.y,
                    light.position.z,
                    match light.light_type {
                        LightType::Point => 0.0,
                        LightType::Capsule => 1.0,
                    },
                ]);
            }

            let n_texels = (floats.len() / 4) as u32;
            let width = n_texels.min(u32::from(self.lights_texture_size));
            let height = (n_texels as f32 / f32::from(self.lights_texture_size)).ceil() as u32;
            device.update_texture(
                self.lights_texture,
                0,
                0,
                width,
                height,
                bytemuck::cast_slice(&floats),
            );
        }
    }

    /// The uniform block shaders use to decode the grid.
    #[must_use]
    pub fn uniforms(&self, frame_no: u32, intensity: f32) -> DynamicLightUniforms {
        DynamicLightUniforms {
            cell_size: Vec3::new(
                self.cell_size[0] as f32,
                self.cell_size[1] as f32,
                self.cell_size[2] as f32,
            ),
            grid_offset: self.grid_offset,
            grid_size: self.grid_size,
            n_lights: self.n_lights(frame_no) as u32,
            intensity,
            texture_sizes: [
                u32::from(self.cells_texture_size),
                u32::from(self.indices_texture_size),
                u32::from(self.lights_texture_size),
            ],
        }
    }

    /// Inspect a cell's light list from the CPU copy: (count, indices).
    /// Test and debug helper mirroring what a shader reads.
    #[must_use]
    pub fn cell_lights(&self, frame_no: u32, cell: [u32; 3]) -> Vec<u8> {
        let buffer = frame_no as usize % NUM_BUFFER_FRAMES;
        let offset = self.cells_data[buffer][self.cell_index(cell)] as usize;

        if offset == 0 {
            // A cell pointing at offset zero has no lights.
            return Vec::new();
        }

        let count = self.indices_data[buffer][offset] as usize;
        self.indices_data[buffer][offset + 1..offset + 1 + count].to_vec()
    }
}
