//! Texture cache.
//!
//! Textures are created once and live until engine shutdown. Lookup is by
//! the lowercased, extension-stripped name. The cache owns the built-in
//! textures every renderer needs: the default checker box, white, the
//! identity-light grey, a noise texture and a pool of mutable scratch
//! textures for cinematic uploads.

pub mod image;

use log::debug;
use rustc_hash::FxHashMap;

use crate::errors::{Result, StrafeError};
use crate::gpu::{GraphicsDevice, TextureDescriptor, TextureHandle};
use crate::interface::Host;
use crate::parser;
use crate::texture::image::{Image, ImageOptions};

use bitflags::bitflags;

/// Maximum length of a texture name, including extension.
pub const MAX_NAME_LENGTH: usize = 64;

const MAX_TEXTURES: usize = 2048;
const DEFAULT_IMAGE_SIZE: u32 = 16;
const NOISE_IMAGE_SIZE: u32 = 256;
const N_SCRATCH_TEXTURES: usize = 32;

bitflags! {
    /// Texture creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TextureFlags: u32 {
        const MIPMAP = 1 << 0;
        const MUTABLE = 1 << 1;
        const PICMIP = 1 << 2;
        const CLAMP_TO_EDGE = 1 << 3;
    }
}

/// Index of a texture within the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u16);

/// A named GPU texture.
#[derive(Debug, Clone)]
pub struct Texture {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub n_mips: u32,
    pub format: wgpu::TextureFormat,
    pub flags: TextureFlags,
    pub handle: TextureHandle,
}

/// Cache of named textures plus the built-in set.
pub struct TextureCache {
    textures: Vec<Texture>,
    by_name: FxHashMap<String, TextureId>,
    default_texture: TextureId,
    white_texture: TextureId,
    identity_light_texture: TextureId,
    noise_texture: TextureId,
    scratch_textures: [TextureId; N_SCRATCH_TEXTURES],
    picmip: u32,
}

impl TextureCache {
    /// Create the cache and its built-in textures.
    ///
    /// `identity_light` is `1 / 2^overBrightBits`, used for the grey
    /// identity-light texture.
    pub fn new(device: &mut dyn GraphicsDevice, picmip: u32, identity_light: f32) -> Result<TextureCache> {
        let mut cache = TextureCache {
            textures: Vec::new(),
            by_name: FxHashMap::default(),
            default_texture: TextureId(0),
            white_texture: TextureId(0),
            identity_light_texture: TextureId(0),
            noise_texture: TextureId(0),
            scratch_textures: [TextureId(0); N_SCRATCH_TEXTURES],
            picmip,
        };

        // Default texture: dark grey box with a white border.
        let size = DEFAULT_IMAGE_SIZE;
        let mut default_data = vec![32u8; (size * size * 4) as usize];

        for x in 0..size {
            for border in [
                x,                     // top row
                x * size,              // left column
                size - 1 + x * size,   // right column
                x + (size - 1) * size, // bottom row
            ] {
                default_data[(border * 4) as usize..(border * 4 + 4) as usize]
                    .copy_from_slice(&[255, 255, 255, 255]);
            }
        }

        cache.default_texture = cache.create(
            device,
            "*default",
            &Image::from_rgba8(size, size, default_data),
            TextureFlags::MIPMAP,
            wgpu::TextureFormat::Rgba8Unorm,
        )?;

        // White.
        cache.white_texture = cache.create(
            device,
            "*white",
            &Image::solid(size, size, [255, 255, 255, 255]),
            TextureFlags::empty(),
            wgpu::TextureFormat::Rgba8Unorm,
        )?;

        // With overbright bits active, default lightmaps need a fractional
        // grey rather than white.
        let grey = (255.0 * identity_light) as u8;
        cache.identity_light_texture = cache.create(
            device,
            "*identityLight",
            &Image::solid(size, size, [grey, grey, grey, 255]),
            TextureFlags::empty(),
            wgpu::TextureFormat::Rgba8Unorm,
        )?;

        // Noise. Deterministic xorshift so loads reproduce exactly.
        let mut noise_data = Vec::with_capacity((NOISE_IMAGE_SIZE * NOISE_IMAGE_SIZE * 4) as usize);
        let mut state = 0x2545_f491u32;

        for _ in 0..NOISE_IMAGE_SIZE * NOISE_IMAGE_SIZE {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            noise_data.extend_from_slice(&[state as u8, (state >> 8) as u8, (state >> 16) as u8, 255]);
        }

        cache.noise_texture = cache.create(
            device,
            "*noise",
            &Image::from_rgba8(NOISE_IMAGE_SIZE, NOISE_IMAGE_SIZE, noise_data),
            TextureFlags::empty(),
            wgpu::TextureFormat::Rgba8Unorm,
        )?;

        // Scratch textures for cinematic uploads.
        for i in 0..N_SCRATCH_TEXTURES {
            cache.scratch_textures[i] = cache.create(
                device,
                &format!("*scratch{i}"),
                &Image::solid(size, size, [0, 0, 0, 255]),
                TextureFlags::PICMIP | TextureFlags::CLAMP_TO_EDGE | TextureFlags::MUTABLE,
                wgpu::TextureFormat::Rgba8Unorm,
            )?;
        }

        Ok(cache)
    }

    /// Create a texture from decoded pixels.
    pub fn create(
        &mut self,
        device: &mut dyn GraphicsDevice,
        name: &str,
        image: &Image,
        flags: TextureFlags,
        format: wgpu::TextureFormat,
    ) -> Result<TextureId> {
        if name.len() >= MAX_NAME_LENGTH {
            return Err(StrafeError::TextureNameTooLong(name.to_string()));
        }

        if self.textures.len() == MAX_TEXTURES {
            return Err(StrafeError::TextureCacheFull);
        }

        let desc = TextureDescriptor {
            label: name.to_string(),
            width: image.width,
            height: image.height,
            mip_count: image.n_mips,
            format,
            clamp_to_edge: flags.contains(TextureFlags::CLAMP_TO_EDGE),
            mutable: flags.contains(TextureFlags::MUTABLE),
        };

        // Create with data: immutable. Create without: mutable, update later.
        let handle = if flags.contains(TextureFlags::MUTABLE) {
            let handle = device.create_texture(&desc, None);
            device.update_texture(handle, 0, 0, image.width, image.height, &image.data);
            handle
        } else {
            device.create_texture(&desc, Some(image.data.clone()))
        };

        let id = TextureId(self.textures.len() as u16);
        self.textures.push(Texture {
            name: name.to_string(),
            width: image.width,
            height: image.height,
            n_mips: image.n_mips,
            format,
            flags,
            handle,
        });
        self.by_name.insert(parser::canonical_name(name), id);
        Ok(id)
    }

    /// Find a loaded texture or load it from a file.
    ///
    /// Returns `None` when no image file exists, not the default texture.
    pub fn find(
        &mut self,
        device: &mut dyn GraphicsDevice,
        host: &dyn Host,
        name: &str,
        flags: TextureFlags,
    ) -> Option<TextureId> {
        if name.is_empty() {
            return None;
        }

        let key = parser::canonical_name(name);

        if let Some(&id) = self.by_name.get(&key) {
            let existing = &self.textures[id.0 as usize];

            if existing.name != "*white" && existing.flags != flags {
                debug!(
                    "reused texture {name} with mixed flags ({:?} vs {:?})",
                    existing.flags, flags
                );
            }

            return Some(id);
        }

        let options = ImageOptions {
            generate_mipmaps: flags.intersects(TextureFlags::MIPMAP | TextureFlags::PICMIP),
            picmip: if flags.contains(TextureFlags::PICMIP) {
                self.picmip
            } else {
                0
            },
        };

        let image = image::load_image(host, name, options)?;
        self.create(device, name, &image, flags, wgpu::TextureFormat::Rgba8Unorm)
            .ok()
    }

    /// A loaded texture by name, without attempting a file load.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<TextureId> {
        self.by_name.get(&parser::canonical_name(name)).copied()
    }

    #[must_use]
    pub fn texture(&self, id: TextureId) -> &Texture {
        &self.textures[id.0 as usize]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.textures.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    #[must_use]
    pub fn default_texture(&self) -> TextureId {
        self.default_texture
    }

    #[must_use]
    pub fn white(&self) -> TextureId {
        self.white_texture
    }

    #[must_use]
    pub fn identity_light(&self) -> TextureId {
        self.identity_light_texture
    }

    #[must_use]
    pub fn noise(&self) -> TextureId {
        self.noise_texture
    }

    #[must_use]
    pub fn scratch(&self, index: usize) -> TextureId {
        self.scratch_textures[index % N_SCRATCH_TEXTURES]
    }

    /// Upload cinematic pixels into a scratch texture, resizing if needed.
    pub fn upload_scratch(
        &mut self,
        device: &mut dyn GraphicsDevice,
        index: usize,
        width: u32,
        height: u32,
        data: &[u8],
    ) {
        let id = self.scratch(index);
        let texture = &mut self.textures[id.0 as usize];

        if texture.width != width || texture.height != height {
            texture.width = width;
            texture.height = height;
        }

        device.update_texture(texture.handle, 0, 0, width, height, data);
    }
}
