//! BSP world loading.
//!
//! Parses the 17-lump binary format, validating the version and every
//! lump's record size. Lightmaps are packed into atlases with overbright
//! applied, surfaces are decoded by type (patches subdivided), the light
//! grid is sized from worldspawn, and brush models get their own batched
//! geometry.

use glam::{Vec3, Vec4};
use log::{info, warn};

use crate::bytes::ByteReader;
use crate::errors::{Result, StrafeError};
use crate::gpu::{GraphicsDevice, IndexBufferHandle};
use crate::interface::Host;
use crate::material::parse::ParseContext;
use crate::material::{
    ContentFlags, MaterialCache, MaterialIndex, MaterialLightmapId, SurfaceFlags,
};
use crate::math::{Bounds, Plane};
use crate::parser::{self, Lexer};
use crate::scene::SunLight;
use crate::texture::image::Image;
use crate::texture::{TextureCache, TextureFlags, TextureId};
use crate::vertex::Vertex;
use crate::world::visibility::{create_batched_surfaces, Visibility};
use crate::world::{
    patch, BrushModelGeometry, Fog, MapEntity, MaterialDef, ModelDef, Node, SkySurface, Surface,
    SurfaceType, World, LIGHTMAP_SIZE, MAX_WORLD_GEOMETRY_BUFFERS, VISIBILITY_ID_COUNT,
};

const BSP_MAGIC: u32 = u32::from_le_bytes(*b"IBSP");

/// Supported BSP versions: 46 (Quake III) and 47 (RTCW).
const BSP_VERSIONS: [i32; 2] = [46, 47];

const LUMP_ENTITIES: usize = 0;
const LUMP_SHADERS: usize = 1;
const LUMP_PLANES: usize = 2;
const LUMP_NODES: usize = 3;
const LUMP_LEAFS: usize = 4;
const LUMP_LEAFSURFACES: usize = 5;
const LUMP_MODELS: usize = 7;
const LUMP_BRUSHES: usize = 8;
const LUMP_BRUSHSIDES: usize = 9;
const LUMP_DRAWVERTS: usize = 10;
const LUMP_DRAWINDEXES: usize = 11;
const LUMP_FOGS: usize = 12;
const LUMP_SURFACES: usize = 13;
const LUMP_LIGHTMAPS: usize = 14;
const LUMP_LIGHTGRID: usize = 15;
const LUMP_VISIBILITY: usize = 16;
const HEADER_LUMPS: usize = 17;

/// Per-lump record sizes; zero means unvalidated.
const LUMP_SIZES: [usize; HEADER_LUMPS] = [0, 72, 16, 36, 48, 4, 0, 40, 12, 8, 44, 4, 72, 104, 0, 0, 0];

const MST_PLANAR: i32 = 1;
const MST_PATCH: i32 = 2;
const MST_TRIANGLE_SOUP: i32 = 3;
const MST_FLARE: i32 = 4;

/// Atlases hold at most 2x2 lightmap cells (256x256 texels).
const MAX_ATLAS_CELLS_PER_AXIS: usize = 2;

const MAX_ENTITY_KVPS: usize = 32;

/// Everything world loading needs from the rest of the engine.
pub struct WorldLoadContext<'a> {
    pub device: &'a mut dyn GraphicsDevice,
    pub host: &'a dyn Host,
    pub textures: &'a mut TextureCache,
    pub materials: &'a mut MaterialCache,
    pub sun: &'a mut SunLight,
    /// `2^overBrightBits`
    pub overbright_factor: f32,
    /// `1 / 2^overBrightBits`
    pub identity_light: f32,
    /// PVS data shared by the collision module, if it was loaded first.
    pub external_vis_data: Option<&'a [u8]>,
}

impl WorldLoadContext<'_> {
    fn find_material(&mut self, lightmaps: &[TextureId], name: &str, lightmap_index: i32) -> MaterialIndex {
        let mut parse_ctx = ParseContext {
            device: &mut *self.device,
            host: self.host,
            textures: &mut *self.textures,
            lightmaps,
            sun: &mut *self.sun,
            overbright_factor: self.overbright_factor,
        };

        self.materials
            .find_material(name, lightmap_index, true, &mut parse_ctx)
            .unwrap_or_else(|| self.materials.default_material())
    }
}

/// Multiply stored light by the overbright factor, normalizing by the
/// largest channel instead of saturating to white.
pub(crate) fn overbrighten_color(src: [u8; 3], factor: f32) -> [u8; 3] {
    let mut r = (f32::from(src[0]) * factor) as i32;
    let mut g = (f32::from(src[1]) * factor) as i32;
    let mut b = (f32::from(src[2]) * factor) as i32;

    if (r | g | b) > 255 {
        let max = r.max(g).max(b);
        r = r * 255 / max;
        g = g * 255 / max;
        b = b * 255 / max;
    }

    [r as u8, g as u8, b as u8]
}

fn to_linear_byte(byte: u8) -> u8 {
    (((f32::from(byte) / 255.0).powf(2.2)) * 255.0) as u8
}

struct Lump {
    offset: usize,
    length: usize,
}

/// Remap a source lightmap uv into its atlas cell. Cells are laid out
/// x-major.
fn atlas_tex_coord(uv: (f32, f32), cell: usize, atlas_size: (usize, usize)) -> (f32, f32) {
    let tile_x = cell % atlas_size.0;
    let tile_y = cell / atlas_size.0;
    (
        (tile_x as f32 + uv.0) / atlas_size.0 as f32,
        (tile_y as f32 + uv.1) / atlas_size.1 as f32,
    )
}

impl World {
    /// Load a world from the virtual filesystem.
    pub fn load(name: &str, ctx: &mut WorldLoadContext) -> Result<World> {
        let base_name = parser::strip_extension(parser::basename(name)).to_string();

        let Some(file_data) = ctx.host.read_file(name) else {
            return Err(StrafeError::WorldNotFound(name.to_string()));
        };

        let mut reader = ByteReader::new(&file_data);
        let ident = reader.u32();
        let version = reader.i32();

        if ident != BSP_MAGIC {
            return Err(StrafeError::BadBspIdent {
                name: name.to_string(),
                ident,
            });
        }

        if !BSP_VERSIONS.contains(&version) {
            return Err(StrafeError::BadBspVersion {
                name: name.to_string(),
                version,
                expected: BSP_VERSIONS[0],
            });
        }

        // Read and validate every lump's size.
        let mut lumps = Vec::with_capacity(HEADER_LUMPS);

        for i in 0..HEADER_LUMPS {
            let offset = reader.i32().max(0) as usize;
            let length = reader.i32().max(0) as usize;

            if LUMP_SIZES[i] != 0 && length % LUMP_SIZES[i] != 0 {
                return Err(StrafeError::BadLumpSize {
                    name: name.to_string(),
                    lump: i,
                });
            }

            if offset + length > file_data.len() {
                return Err(StrafeError::LumpOutOfBounds {
                    name: name.to_string(),
                    lump: i,
                });
            }

            lumps.push(Lump { offset, length });
        }

        let mut world = World {
            name: name.to_string(),
            base_name,
            entity_string: String::new(),
            entity_parse_offset: 0,
            entities: Vec::new(),
            fogs: Vec::new(),
            lightmap_atlas_size: (0, 0),
            lightmap_atlases: Vec::new(),
            n_lightmaps_per_atlas: 0,
            light_grid_size: Vec3::new(64.0, 64.0, 128.0),
            light_grid_inverse_size: Vec3::ONE,
            light_grid_data: Vec::new(),
            light_grid_origin: Vec3::ZERO,
            light_grid_bounds: [0; 3],
            material_defs: Vec::new(),
            model_defs: Vec::new(),
            planes: Vec::new(),
            surfaces: Vec::new(),
            vertex_buffers: Vec::new(),
            vertices: vec![Vec::new(); MAX_WORLD_GEOMETRY_BUFFERS],
            current_geometry_buffer: 0,
            nodes: Vec::new(),
            leaf_surfaces: Vec::new(),
            first_leaf: 0,
            n_clusters: 0,
            cluster_bytes: 0,
            vis_data: Vec::new(),
            visibility: (0..VISIBILITY_ID_COUNT).map(|_| Visibility::default()).collect(),
            duplicate_surface_id: 0,
            decal_duplicate_surface_id: 0,
            batched_surfaces: Vec::new(),
            cpu_deform_vertices: Vec::new(),
            cpu_deform_indices: Vec::new(),
            index_buffers: [IndexBufferHandle::INVALID; MAX_WORLD_GEOMETRY_BUFFERS],
            sky_surfaces: Vec::new(),
            brush_models: Vec::new(),
        };

        world.load_entities(&file_data, &lumps[LUMP_ENTITIES]);
        world.load_planes(&reader, &lumps[LUMP_PLANES]);
        world.load_fogs(
            &reader,
            &lumps[LUMP_FOGS],
            &lumps[LUMP_BRUSHES],
            &lumps[LUMP_BRUSHSIDES],
            ctx,
        )?;
        world.load_lightmaps(&file_data, &lumps[LUMP_LIGHTMAPS], ctx)?;
        world.load_models(&reader, &lumps[LUMP_MODELS]);
        world.load_light_grid(&file_data, &lumps[LUMP_LIGHTGRID], ctx);
        world.load_material_defs(&reader, &lumps[LUMP_SHADERS]);

        // Draw vertices and indices feed surface decoding.
        let vertices = world.read_draw_vertices(&reader, &lumps[LUMP_DRAWVERTS], ctx);
        let indices = read_draw_indices(&reader, &lumps[LUMP_DRAWINDEXES]);
        world.load_surfaces(&reader, &lumps[LUMP_SURFACES], &vertices, &indices, ctx)?;
        world.build_brush_models(ctx);

        // Leaf surfaces.
        {
            let mut r = reader.at(lumps[LUMP_LEAFSURFACES].offset);

            for _ in 0..lumps[LUMP_LEAFSURFACES].length / 4 {
                world.leaf_surfaces.push(r.i32());
            }
        }

        world.load_nodes_and_leaves(&reader, &lumps[LUMP_NODES], &lumps[LUMP_LEAFS]);
        world.load_visibility(&file_data, &lumps[LUMP_VISIBILITY], ctx.external_vis_data);

        // Static vertex buffers for the geometry partitions in use.
        for i in 0..=world.current_geometry_buffer {
            world
                .vertex_buffers
                .push(ctx.device.create_vertex_buffer(&world.vertices[i]));
        }

        world.build_world_batches(ctx);

        info!(
            "loaded {}: {} surfaces, {} nodes, {} fogs, {} lightmap atlas(es)",
            world.name,
            world.surfaces.len(),
            world.nodes.len(),
            world.fogs.len(),
            world.lightmap_atlases.len()
        );

        Ok(world)
    }

    fn load_entities(&mut self, file_data: &[u8], lump: &Lump) {
        let raw = &file_data[lump.offset..lump.offset + lump.length];
        let end = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
        self.entity_string = String::from_utf8_lossy(&raw[..end]).into_owned();

        let mut lexer = Lexer::new(&self.entity_string);
        let mut parsing_entity = false;
        let mut entity = MapEntity::default();

        loop {
            let token = lexer.next();

            if token.is_empty() {
                break; // End of entity string.
            }

            if token == "{" {
                if parsing_entity {
                    warn!("stray '{{' when parsing entity string");
                    break;
                }

                parsing_entity = true;
                entity.kvps.clear();
            } else if token == "}" {
                if !parsing_entity {
                    warn!("stray '}}' when parsing entity string");
                    break;
                }

                parsing_entity = false;

                // Worldspawn may override the light grid cell size.
                if entity
                    .find_value("classname")
                    .is_some_and(|c| c.eq_ignore_ascii_case("worldspawn"))
                {
                    if let Some(gridsize) = entity.find_value("gridsize") {
                        let mut values = gridsize.split_whitespace();

                        for i in 0..3 {
                            if let Some(v) = values.next().and_then(|v| v.parse::<f32>().ok()) {
                                self.light_grid_size[i] = v;
                            }
                        }
                    }
                }

                self.entities.push(std::mem::take(&mut entity));
            } else {
                if entity.kvps.len() == MAX_ENTITY_KVPS {
                    warn!("exceeded max entity key-value pairs");
                    break;
                }

                let key = token.to_string();
                let value = lexer.next();

                if value.is_empty() {
                    warn!("empty key-value pair in entity string. Key is \"{key}\"");
                    break;
                }

                entity.kvps.push((key, value.to_string()));
            }
        }
    }

    fn load_planes(&mut self, reader: &ByteReader, lump: &Lump) {
        let mut r = reader.at(lump.offset);

        for _ in 0..lump.length / 16 {
            let normal = r.vec3();
            let distance = r.f32();
            self.planes.push(Plane::new(normal, distance));
        }
    }

    fn load_fogs(
        &mut self,
        reader: &ByteReader,
        lump: &Lump,
        brushes: &Lump,
        brush_sides: &Lump,
        ctx: &mut WorldLoadContext,
    ) -> Result<()> {
        let n_fogs = lump.length / 72;
        let n_brushes = brushes.length / 12;
        let n_brush_sides = brush_sides.length / 8;

        for i in 0..n_fogs {
            let mut r = reader.at(lump.offset + i * 72);
            let shader = r.fixed_str(64);
            let brush_number = r.i32();
            let visible_side = r.i32();

            if brush_number < 0 || brush_number as usize >= n_brushes {
                return Err(StrafeError::BadFogReference(self.name.clone()));
            }

            let mut brush_reader = reader.at(brushes.offset + brush_number as usize * 12);
            let first_side = brush_reader.i32();

            if first_side < 0 || first_side as usize > n_brush_sides.saturating_sub(6) {
                return Err(StrafeError::BadFogReference(self.name.clone()));
            }

            // Brushes are always sorted with the axial sides first.
            let side_plane = |side: usize| -> f32 {
                let mut side_reader =
                    reader.at(brush_sides.offset + (first_side as usize + side) * 8);
                let plane_num = side_reader.i32().max(0) as usize;
                self.planes.get(plane_num).map_or(0.0, |p| p.distance)
            };

            let bounds = Bounds::new(
                Vec3::new(-side_plane(0), -side_plane(2), -side_plane(4)),
                Vec3::new(side_plane(1), side_plane(3), side_plane(5)),
            );

            // Fog parameters come from the material.
            let material_index = ctx.find_material(&[], &shader, MaterialLightmapId::NONE);
            let parms = ctx.materials.material(material_index).fog_parms;

            let color = [
                (parms.color.x * ctx.identity_light * 255.0) as u8,
                (parms.color.y * ctx.identity_light * 255.0) as u8,
                (parms.color.z * ctx.identity_light * 255.0) as u8,
                255,
            ];

            // A depth of zero is technically invalid, but tolerated as 1.
            let d = if parms.depth_for_opaque < 1.0 {
                1.0
            } else {
                parms.depth_for_opaque
            };
            let tc_scale = 1.0 / (d * 8.0);

            // The gradient surface, when the brush has a visible side.
            let surface = (visible_side != -1).then(|| {
                let mut side_reader = reader
                    .at(brush_sides.offset + (first_side as usize + visible_side as usize) * 8);
                let plane_num = side_reader.i32().max(0) as usize;
                let plane = self.planes.get(plane_num).copied().unwrap_or_default();
                Vec4::new(-plane.normal.x, -plane.normal.y, -plane.normal.z, -plane.distance)
            });

            self.fogs.push(Fog {
                original_brush_number: brush_number,
                bounds,
                color,
                tc_scale,
                parms,
                surface,
            });
        }

        Ok(())
    }

    fn load_lightmaps(
        &mut self,
        file_data: &[u8],
        lump: &Lump,
        ctx: &mut WorldLoadContext,
    ) -> Result<()> {
        if lump.length == 0 {
            return Ok(());
        }

        let src_data_size = LIGHTMAP_SIZE * LIGHTMAP_SIZE * 3;
        let n_lightmaps = lump.length / src_data_size;

        if n_lightmaps == 0 {
            return Ok(());
        }

        // Pick atlas dimensions in cells.
        let max_cells = MAX_ATLAS_CELLS_PER_AXIS;

        let (mut cells_x, mut cells_y) = if n_lightmaps <= max_cells {
            (n_lightmaps, 1)
        } else if n_lightmaps.is_power_of_two() {
            let side = (n_lightmaps as f32).sqrt().ceil() as usize;
            (side, side)
        } else {
            let x = max_cells.min(n_lightmaps);
            (x, (n_lightmaps as f32 / x as f32).ceil() as usize)
        };

        cells_x = cells_x.min(max_cells);
        cells_y = cells_y.min(max_cells);
        self.lightmap_atlas_size = (cells_x, cells_y);
        self.n_lightmaps_per_atlas = cells_x * cells_y;
        let n_atlases =
            (n_lightmaps as f32 / self.n_lightmaps_per_atlas as f32).ceil() as usize;

        info!(
            "Packing {n_lightmaps} lightmaps into {n_atlases} atlas(es) sized {}x{}.",
            cells_x * LIGHTMAP_SIZE,
            cells_y * LIGHTMAP_SIZE
        );

        let atlas_width = cells_x * LIGHTMAP_SIZE;
        let atlas_height = cells_y * LIGHTMAP_SIZE;
        let mut lightmap_index = 0usize;

        for atlas_index in 0..n_atlases {
            let mut data = vec![0u8; atlas_width * atlas_height * 4];
            let mut n_atlased = 0usize;

            while n_atlased < self.n_lightmaps_per_atlas && lightmap_index < n_lightmaps {
                let src_offset = lump.offset + lightmap_index * src_data_size;
                let src = &file_data[src_offset..src_offset + src_data_size];
                let cell_x = n_atlased % cells_x;
                let cell_y = n_atlased / cells_x;

                // Expand from 24bpp to 32bpp with overbright.
                for y in 0..LIGHTMAP_SIZE {
                    for x in 0..LIGHTMAP_SIZE {
                        let s = (x + y * LIGHTMAP_SIZE) * 3;
                        let rgb = overbrighten_color(
                            [src[s], src[s + 1], src[s + 2]],
                            ctx.overbright_factor,
                        );
                        let dx = cell_x * LIGHTMAP_SIZE + x;
                        let dy = cell_y * LIGHTMAP_SIZE + y;
                        let d = (dx + dy * atlas_width) * 4;
                        data[d] = rgb[0];
                        data[d + 1] = rgb[1];
                        data[d + 2] = rgb[2];
                        data[d + 3] = 255;
                    }
                }

                n_atlased += 1;
                lightmap_index += 1;
            }

            let image = Image::from_rgba8(atlas_width as u32, atlas_height as u32, data);
            let id = ctx.textures.create(
                ctx.device,
                &format!("*lightmap{atlas_index}"),
                &image,
                TextureFlags::CLAMP_TO_EDGE | TextureFlags::MUTABLE,
                wgpu::TextureFormat::Rgba8Unorm,
            )?;
            self.lightmap_atlases.push(id);
        }

        Ok(())
    }

    fn load_models(&mut self, reader: &ByteReader, lump: &Lump) {
        let mut r = reader.at(lump.offset);

        for _ in 0..lump.length / 40 {
            let mins = r.vec3();
            let maxs = r.vec3();
            let first_surface = r.i32().max(0) as usize;
            let n_surfaces = r.i32().max(0) as usize;
            let _first_brush = r.i32();
            let _n_brushes = r.i32();

            self.model_defs.push(ModelDef {
                first_surface,
                n_surfaces,
                bounds: Bounds::new(mins, maxs),
            });
        }
    }

    fn load_light_grid(&mut self, file_data: &[u8], lump: &Lump, ctx: &WorldLoadContext) {
        debug_assert!(!self.model_defs.is_empty());

        self.light_grid_inverse_size = Vec3::new(
            1.0 / self.light_grid_size.x,
            1.0 / self.light_grid_size.y,
            1.0 / self.light_grid_size.z,
        );

        let world_bounds = self.model_defs[0].bounds;

        for i in 0..3 {
            self.light_grid_origin[i] =
                self.light_grid_size[i] * (world_bounds.min[i] / self.light_grid_size[i]).ceil();
            let max =
                self.light_grid_size[i] * (world_bounds.max[i] / self.light_grid_size[i]).floor();
            self.light_grid_bounds[i] =
                ((max - self.light_grid_origin[i]) / self.light_grid_size[i]) as i32 + 1;
        }

        let n_grid_points = (self.light_grid_bounds[0]
            * self.light_grid_bounds[1]
            * self.light_grid_bounds[2]) as usize;

        if lump.length != n_grid_points * 8 {
            warn!("light grid mismatch");
            return;
        }

        self.light_grid_data = file_data[lump.offset..lump.offset + lump.length].to_vec();

        // Deal with overbright bits: ambient rgb then directed rgb.
        for i in 0..n_grid_points {
            for channel in [0, 3] {
                let o = i * 8 + channel;
                let rgb = overbrighten_color(
                    [
                        self.light_grid_data[o],
                        self.light_grid_data[o + 1],
                        self.light_grid_data[o + 2],
                    ],
                    ctx.overbright_factor,
                );
                self.light_grid_data[o..o + 3].copy_from_slice(&rgb);
            }
        }
    }

    fn load_material_defs(&mut self, reader: &ByteReader, lump: &Lump) {
        let mut r = reader.at(lump.offset);

        for _ in 0..lump.length / 72 {
            let name = r.fixed_str(64);
            let surface_flags = SurfaceFlags::from_bits_retain(r.i32() as u32);
            let content_flags = ContentFlags::from_bits_retain(r.i32() as u32);
            self.material_defs.push(MaterialDef {
                name,
                surface_flags,
                content_flags,
            });
        }
    }

    fn read_draw_vertices(
        &self,
        reader: &ByteReader,
        lump: &Lump,
        ctx: &WorldLoadContext,
    ) -> Vec<Vertex> {
        let mut vertices = Vec::with_capacity(lump.length / 44);
        let mut r = reader.at(lump.offset);

        for _ in 0..lump.length / 44 {
            let position = r.vec3();
            let s = r.f32();
            let t = r.f32();
            let lm_s = r.f32();
            let lm_t = r.f32();
            let normal = r.vec3();
            let color = [r.u8(), r.u8(), r.u8(), r.u8()];

            let mut v = Vertex::default();
            v.set_pos(position);
            v.set_normal(normal);
            v.set_tex_coord(s, t, lm_s, lm_t);

            // Overbrighten and linearize the baked vertex light.
            let rgb = overbrighten_color([color[0], color[1], color[2]], ctx.overbright_factor);
            v.color = [
                to_linear_byte(rgb[0]),
                to_linear_byte(rgb[1]),
                to_linear_byte(rgb[2]),
                color[3],
            ];

            vertices.push(v);
        }

        vertices
    }

    fn load_surfaces(
        &mut self,
        reader: &ByteReader,
        lump: &Lump,
        vertices: &[Vertex],
        indices: &[u16],
        ctx: &mut WorldLoadContext,
    ) -> Result<()> {
        let n_surfaces = lump.length / 104;
        let lightmaps = self.lightmap_atlases.clone();

        for i in 0..n_surfaces {
            let mut r = reader.at(lump.offset + i * 104);
            let shader_num = r.i32();
            let fog_num = r.i32();
            let surface_type = r.i32();
            let first_vertex = r.i32().max(0) as usize;
            let n_vertices = r.i32().max(0) as usize;
            let first_index = r.i32().max(0) as usize;
            let n_indices = r.i32().max(0) as usize;
            let mut lightmap_index = r.i32();
            let _lightmap_x = r.i32();
            let _lightmap_y = r.i32();
            let _lightmap_width = r.i32();
            let _lightmap_height = r.i32();
            let _lightmap_origin = r.vec3();
            let _lightmap_vec0 = r.vec3();
            let _lightmap_vec1 = r.vec3();
            let lightmap_vec2 = r.vec3();
            let patch_width = r.i32().max(0) as usize;
            let patch_height = r.i32().max(0) as usize;

            if shader_num < 0 || shader_num as usize >= self.material_defs.len() {
                return Err(StrafeError::BadMaterialIndex {
                    name: self.name.clone(),
                    index: shader_num,
                });
            }

            // Trisoup is always vertex lit.
            if surface_type == MST_TRIANGLE_SOUP {
                lightmap_index = MaterialLightmapId::VERTEX;
            }

            // Material lookup uses the atlas index, not the source index.
            let material_lightmap = if lightmap_index > 0 {
                lightmap_index / self.n_lightmaps_per_atlas.max(1) as i32
            } else {
                lightmap_index
            };

            let def = &self.material_defs[shader_num as usize];
            let def_surface_flags = def.surface_flags;
            let def_content_flags = def.content_flags;
            let def_name = def.name.clone();
            let material = ctx.find_material(&lightmaps, &def_name, material_lightmap);
            let material_surface_flags = ctx.materials.material(material).surface_flags;

            let mut surface = Surface {
                surface_type: SurfaceType::Ignore,
                material,
                fog_index: fog_num,
                flags: def_surface_flags,
                content_flags: def_content_flags,
                indices: Vec::new(),
                buffer_index: 0,
                cull_bounds: Bounds::EMPTY,
                cull_plane: None,
                patch: None,
                duplicate_id: -1,
                decal_duplicate_id: -1,
                first_vertex: 0,
                n_vertices: 0,
            };

            // Nodraw surfaces stay around for movement clipping only.
            let nodraw = material_surface_flags.contains(SurfaceFlags::NODRAW)
                || def_surface_flags.contains(SurfaceFlags::NODRAW);

            let vertex_range_ok = first_vertex + n_vertices <= vertices.len()
                && first_index + n_indices <= indices.len();
            let patch_range_ok = first_vertex + patch_width * patch_height <= vertices.len();

            if !nodraw
                && ((surface_type == MST_PLANAR || surface_type == MST_TRIANGLE_SOUP)
                    && !vertex_range_ok
                    || surface_type == MST_PATCH && !patch_range_ok)
            {
                warn!("{}: surface {i} references out-of-range geometry", self.name);
                self.surfaces.push(surface);
                continue;
            }

            if nodraw {
                surface.surface_type = SurfaceType::Ignore;
            } else if surface_type == MST_PLANAR {
                surface.surface_type = SurfaceType::Face;
                self.set_surface_geometry(
                    &mut surface,
                    &vertices[first_vertex..first_vertex + n_vertices],
                    &indices[first_index..first_index + n_indices],
                    lightmap_index,
                )?;

                for v in &vertices[first_vertex..first_vertex + n_vertices] {
                    surface.cull_bounds.add_point(v.pos());
                }

                // The plane comes from the lightmap vectors.
                let normal = lightmap_vec2;
                let distance = vertices[first_vertex].pos().dot(normal);
                surface.cull_plane = Some(Plane::new(normal, distance));
            } else if surface_type == MST_TRIANGLE_SOUP {
                surface.surface_type = SurfaceType::Mesh;
                self.set_surface_geometry(
                    &mut surface,
                    &vertices[first_vertex..first_vertex + n_vertices],
                    &indices[first_index..first_index + n_indices],
                    lightmap_index,
                )?;

                for v in &vertices[first_vertex..first_vertex + n_vertices] {
                    surface.cull_bounds.add_point(v.pos());
                }
            } else if surface_type == MST_PATCH {
                surface.surface_type = SurfaceType::Patch;
                let patch = patch::subdivide(
                    patch_width,
                    patch_height,
                    &vertices[first_vertex..first_vertex + patch_width * patch_height],
                );
                self.set_surface_geometry(
                    &mut surface,
                    &patch.vertices,
                    &patch.indices,
                    lightmap_index,
                )?;
                surface.cull_bounds = patch.cull_bounds;
                surface.patch = Some(Box::new(patch));
            } else if surface_type == MST_FLARE {
                surface.surface_type = SurfaceType::Flare;
            }

            self.surfaces.push(surface);
        }

        Ok(())
    }

    /// Append surface vertices into the current geometry buffer, remapping
    /// lightmap UVs into atlas space, and make the indices absolute.
    fn set_surface_geometry(
        &mut self,
        surface: &mut Surface,
        vertices: &[Vertex],
        indices: &[u16],
        lightmap_index: i32,
    ) -> Result<()> {
        // Move to the next buffer if the vertices won't fit in 16 bits.
        if self.vertices[self.current_geometry_buffer].len() + vertices.len() >= usize::from(u16::MAX)
        {
            self.current_geometry_buffer += 1;

            if self.current_geometry_buffer == MAX_WORLD_GEOMETRY_BUFFERS {
                return Err(StrafeError::OutOfGeometryBuffers);
            }
        }

        let buffer = &mut self.vertices[self.current_geometry_buffer];
        let start_vertex = buffer.len() as u32;

        for v in vertices {
            let mut v = *v;

            if lightmap_index >= 0 && !self.lightmap_atlases.is_empty() {
                let tc = v.tex_coord();
                let cell = lightmap_index as usize % self.n_lightmaps_per_atlas;
                let (u, w) = atlas_tex_coord((tc.z, tc.w), cell, self.lightmap_atlas_size);
                v.set_tex_coord(tc.x, tc.y, u, w);
            }

            buffer.push(v);
        }

        surface.buffer_index = self.current_geometry_buffer;
        surface.first_vertex = start_vertex;
        surface.n_vertices = vertices.len() as u32;
        surface.indices = indices
            .iter()
            .map(|&index| index + start_vertex as u16)
            .collect();
        Ok(())
    }

    fn load_nodes_and_leaves(&mut self, reader: &ByteReader, nodes: &Lump, leaves: &Lump) {
        let n_nodes = nodes.length / 36;
        let n_leaves = leaves.length / 48;
        self.first_leaf = n_nodes;
        let mut r = reader.at(nodes.offset);

        for _ in 0..n_nodes {
            let plane = r.i32().max(0) as usize;
            let child0 = r.i32();
            let child1 = r.i32();
            let mins = Vec3::new(r.i32() as f32, r.i32() as f32, r.i32() as f32);
            let maxs = Vec3::new(r.i32() as f32, r.i32() as f32, r.i32() as f32);

            // Negative children address leaves.
            let resolve = |c: i32| -> usize {
                if c >= 0 {
                    c as usize
                } else {
                    n_nodes + (-1 - c) as usize
                }
            };

            self.nodes.push(Node {
                leaf: false,
                bounds: Bounds::new(mins, maxs),
                plane,
                children: [resolve(child0), resolve(child1)],
                cluster: 0,
                area: 0,
                first_leaf_surface: 0,
                n_surfaces: 0,
            });
        }

        let mut r = reader.at(leaves.offset);

        for _ in 0..n_leaves {
            let cluster = r.i32();
            let area = r.i32();
            let mins = Vec3::new(r.i32() as f32, r.i32() as f32, r.i32() as f32);
            let maxs = Vec3::new(r.i32() as f32, r.i32() as f32, r.i32() as f32);
            let first_leaf_surface = r.i32().max(0) as usize;
            let n_surfaces = r.i32().max(0) as usize;
            let _first_leaf_brush = r.i32();
            let _n_leaf_brushes = r.i32();

            if cluster >= self.n_clusters {
                self.n_clusters = cluster + 1;
            }

            self.nodes.push(Node {
                leaf: true,
                bounds: Bounds::new(mins, maxs),
                plane: 0,
                children: [0, 0],
                cluster,
                area,
                first_leaf_surface,
                n_surfaces,
            });
        }
    }

    fn load_visibility(&mut self, file_data: &[u8], lump: &Lump, external: Option<&[u8]>) {
        if lump.length == 0 {
            return;
        }

        let mut r = ByteReader::new(file_data).at(lump.offset);
        self.n_clusters = r.i32();
        self.cluster_bytes = r.i32();

        // The collision module may have already loaded the vis data; share it
        // rather than keeping another copy.
        if let Some(external) = external {
            self.vis_data = external.to_vec();
        } else {
            self.vis_data = file_data[lump.offset + 8..lump.offset + lump.length].to_vec();
        }
    }

    /// Batches and static index buffers for the inline brush models.
    fn build_brush_models(&mut self, ctx: &mut WorldLoadContext) {
        for model_index in 1..self.model_defs.len() {
            let def = self.model_defs[model_index];

            // Grab the surfaces we aren't ignoring and sort them.
            let mut sorted: Vec<usize> = (def.first_surface..def.first_surface + def.n_surfaces)
                .filter(|&i| {
                    !matches!(
                        self.surfaces[i].surface_type,
                        SurfaceType::Ignore | SurfaceType::Flare
                    )
                })
                .collect();

            sort_surfaces(&self.surfaces, &mut sorted);

            let batch =
                create_batched_surfaces(&self.surfaces, &sorted, self.current_geometry_buffer, |m| {
                    ctx.materials.material(m).has_cpu_deforms()
                }, &self.vertices);

            let mut index_buffers = [IndexBufferHandle::INVALID; MAX_WORLD_GEOMETRY_BUFFERS];

            for (i, indices) in batch.indices.iter().enumerate() {
                if !indices.is_empty() {
                    index_buffers[i] = ctx.device.create_index_buffer(indices);
                }
            }

            self.brush_models.push(BrushModelGeometry {
                batches: batch.batches,
                index_buffers,
            });
        }
    }

    /// Full-world batches used by camera-frustum visibility, plus the static
    /// sky surface list.
    fn build_world_batches(&mut self, ctx: &mut WorldLoadContext) {
        let mut sorted = Vec::with_capacity(self.model_defs[0].n_surfaces);

        for (i, surface) in self.surfaces.iter().enumerate() {
            if matches!(surface.surface_type, SurfaceType::Ignore | SurfaceType::Flare) {
                continue;
            }

            let material = ctx.materials.material(surface.material);

            // Ignore portals too.
            if material.is_portal {
                continue;
            }

            if material.is_sky {
                append_sky_surface(&mut self.sky_surfaces, surface, &self.vertices);
            } else {
                sorted.push(i);
            }
        }

        sort_surfaces(&self.surfaces, &mut sorted);

        let batch = create_batched_surfaces(
            &self.surfaces,
            &sorted,
            self.current_geometry_buffer,
            |m| ctx.materials.material(m).has_cpu_deforms(),
            &self.vertices,
        );

        self.batched_surfaces = batch.batches;
        self.cpu_deform_vertices = batch.cpu_deform_vertices;
        self.cpu_deform_indices = batch.cpu_deform_indices;

        for (i, indices) in batch.indices.iter().enumerate() {
            if !indices.is_empty() {
                self.index_buffers[i] = ctx.device.create_index_buffer(indices);
            }
        }
    }
}

fn read_draw_indices(reader: &ByteReader, lump: &Lump) -> Vec<u16> {
    let mut indices = Vec::with_capacity(lump.length / 4);
    let mut r = reader.at(lump.offset);

    for _ in 0..lump.length / 4 {
        indices.push(r.i32() as u16);
    }

    indices
}

/// Stable sort by material index, then fog, then geometry buffer.
pub(crate) fn sort_surfaces(surfaces: &[Surface], sorted: &mut [usize]) {
    sorted.sort_by(|&a, &b| {
        let sa = &surfaces[a];
        let sb = &surfaces[b];
        sa.material
            .cmp(&sb.material)
            .then(sa.fog_index.cmp(&sb.fog_index))
            .then(sa.buffer_index.cmp(&sb.buffer_index))
    });
}

/// Accumulate a surface's triangles into the per-material sky vertex stream.
pub(crate) fn append_sky_surface(
    sky_surfaces: &mut Vec<SkySurface>,
    surface: &Surface,
    vertices: &[Vec<Vertex>],
) {
    let entry = match sky_surfaces
        .iter_mut()
        .find(|ss| ss.material == surface.material)
    {
        Some(entry) => entry,
        None => {
            sky_surfaces.push(SkySurface {
                material: surface.material,
                vertices: Vec::new(),
            });
            sky_surfaces.last_mut().unwrap()
        }
    };

    let buffer = &vertices[surface.buffer_index];

    for &index in &surface.indices {
        entry.vertices.push(buffer[index as usize]);
    }
}
