//! The fixed vertex layout shared by every draw call.
//!
//! Position is full float; normals and texture coordinates are packed to
//! half floats, colors to linear-space bytes. 32 bytes per vertex.

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use half::f16;

/// Vertex layout: position f32x3, normal f16x4, texcoord f16x4 (diffuse uv +
/// lightmap uv), color u8x4 in linear space.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f16; 4],
    pub tex_coord: [f16; 4],
    pub color: [u8; 4],
}

impl Vertex {
    pub const STRIDE: usize = std::mem::size_of::<Vertex>();

    #[must_use]
    pub fn pos(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    pub fn set_pos(&mut self, p: Vec3) {
        self.position = p.to_array();
    }

    #[must_use]
    pub fn normal(&self) -> Vec3 {
        Vec3::new(
            self.normal[0].to_f32(),
            self.normal[1].to_f32(),
            self.normal[2].to_f32(),
        )
    }

    pub fn set_normal(&mut self, n: Vec3) {
        self.normal = [
            f16::from_f32(n.x),
            f16::from_f32(n.y),
            f16::from_f32(n.z),
            f16::ZERO,
        ];
    }

    /// xy is the diffuse uv, zw the lightmap uv.
    #[must_use]
    pub fn tex_coord(&self) -> Vec4 {
        Vec4::new(
            self.tex_coord[0].to_f32(),
            self.tex_coord[1].to_f32(),
            self.tex_coord[2].to_f32(),
            self.tex_coord[3].to_f32(),
        )
    }

    pub fn set_tex_coord(&mut self, s: f32, t: f32, u: f32, v: f32) {
        self.tex_coord = [
            f16::from_f32(s),
            f16::from_f32(t),
            f16::from_f32(u),
            f16::from_f32(v),
        ];
    }

    pub fn set_tex_coord4(&mut self, st_uv: Vec4) {
        self.set_tex_coord(st_uv.x, st_uv.y, st_uv.z, st_uv.w);
    }

    pub fn set_color(&mut self, c: Vec4) {
        self.color = [
            (c.x.min(1.0).max(0.0) * 255.0) as u8,
            (c.y.min(1.0).max(0.0) * 255.0) as u8,
            (c.z.min(1.0).max(0.0) * 255.0) as u8,
            (c.w.min(1.0).max(0.0) * 255.0) as u8,
        ];
    }

    /// Midpoint of two vertices, lerping every attribute.
    #[must_use]
    pub fn midpoint(a: &Vertex, b: &Vertex) -> Vertex {
        let mut out = Vertex::default();
        out.set_pos(a.pos().lerp(b.pos(), 0.5));
        out.set_tex_coord4(a.tex_coord().lerp(b.tex_coord(), 0.5));

        for i in 0..4 {
            out.color[i] = ((u16::from(a.color[i]) + u16::from(b.color[i])) / 2) as u8;
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_is_32_bytes() {
        assert_eq!(Vertex::STRIDE, 32);
    }

    #[test]
    fn texcoord_roundtrip() {
        let mut v = Vertex::default();
        v.set_tex_coord(0.5, 0.25, 0.75, 1.0);
        let tc = v.tex_coord();
        assert!((tc - Vec4::new(0.5, 0.25, 0.75, 1.0)).length() < 1e-3);
    }
}
