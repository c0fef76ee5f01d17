//! Raster decode and mipmap generation.
//!
//! Images are decoded to tightly packed RGBA8 with an optional box-filtered
//! mip chain appended. The picmip policy drops the top `r_picmip` mip levels
//! at load time by resizing before the chain is generated.

use image::imageops::FilterType;
use image::RgbaImage;
use log::warn;

use crate::interface::Host;
use crate::parser;

/// Extensions tried when resolving an image name, in priority order.
pub const IMAGE_EXTENSIONS: [&str; 5] = ["bmp", "jpg", "jpeg", "tga", "png"];

/// A decoded image: RGBA8 mip chain, largest level first.
#[derive(Debug, Clone)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub n_mips: u32,
    pub data: Vec<u8>,
}

impl Image {
    /// Wrap raw RGBA8 pixels as a single-mip image.
    #[must_use]
    pub fn from_rgba8(width: u32, height: u32, data: Vec<u8>) -> Image {
        debug_assert_eq!(data.len(), (width * height * 4) as usize);
        Image {
            width,
            height,
            n_mips: 1,
            data,
        }
    }

    /// A solid-color image.
    #[must_use]
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Image {
        let mut data = Vec::with_capacity((width * height * 4) as usize);

        for _ in 0..width * height {
            data.extend_from_slice(&rgba);
        }

        Image::from_rgba8(width, height, data)
    }
}

/// Mipmap and picmip policy for [`load_image`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageOptions {
    pub generate_mipmaps: bool,
    /// Mip levels to drop at load time. Only applies with `generate_mipmaps`.
    pub picmip: u32,
}

fn mip_count(width: u32, height: u32) -> u32 {
    1 + (width.max(height) as f32).log2().floor() as u32
}

/// Append a box-resized mip chain to a base level.
fn finalize(mut base: RgbaImage, options: ImageOptions) -> Image {
    if options.generate_mipmaps && options.picmip > 0 {
        let width = (base.width() >> options.picmip).max(1);
        let height = (base.height() >> options.picmip).max(1);
        base = image::imageops::resize(&base, width, height, FilterType::Triangle);
    }

    let (width, height) = (base.width(), base.height());
    let n_mips = if options.generate_mipmaps {
        mip_count(width, height)
    } else {
        1
    };

    let mut data = base.clone().into_raw();
    let mut level = base;

    for _ in 1..n_mips {
        let w = (level.width() >> 1).max(1);
        let h = (level.height() >> 1).max(1);
        level = image::imageops::resize(&level, w, h, FilterType::Triangle);
        data.extend_from_slice(level.as_raw());
    }

    Image {
        width,
        height,
        n_mips,
        data,
    }
}

fn decode(name: &str, file_data: &[u8], options: ImageOptions) -> Option<Image> {
    match image::load_from_memory(file_data) {
        Ok(decoded) => Some(finalize(decoded.to_rgba8(), options)),
        Err(err) => {
            warn!("error loading image \"{name}\": {err}");
            None
        }
    }
}

/// Load an image from the virtual filesystem.
///
/// If the supplied extension exists it is tried first; otherwise every
/// supported extension is tried in order. A file that exists but fails to
/// decode does not fall through to other extensions.
pub fn load_image(host: &dyn Host, name: &str, options: ImageOptions) -> Option<Image> {
    let supplied_extension = parser::extension(name);

    if IMAGE_EXTENSIONS
        .iter()
        .any(|e| e.eq_ignore_ascii_case(supplied_extension))
    {
        if let Some(file_data) = host.read_file(name) {
            return decode(name, &file_data, options);
        }
    }

    let stripped = parser::strip_extension(name);

    for ext in IMAGE_EXTENSIONS {
        if ext.eq_ignore_ascii_case(supplied_extension) {
            continue;
        }

        let filename = format!("{stripped}.{ext}");

        if let Some(file_data) = host.read_file(&filename) {
            return decode(&filename, &file_data, options);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_counts() {
        assert_eq!(mip_count(1, 1), 1);
        assert_eq!(mip_count(16, 16), 5);
        assert_eq!(mip_count(256, 128), 9);
    }

    #[test]
    fn solid_image_sizes() {
        let image = Image::solid(4, 4, [1, 2, 3, 4]);
        assert_eq!(image.data.len(), 64);
        assert_eq!(image.n_mips, 1);
    }
}
