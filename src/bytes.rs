//! Little-endian byte cursor for the binary model and world formats.

use glam::Vec3;

/// A bounds-checked reader over a byte slice. Reads past the end yield
/// zeros and clear [`ByteReader::ok`], so loaders can validate once at the
/// end of a section instead of at every field.
#[derive(Clone)]
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    ok: bool,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> ByteReader<'a> {
        ByteReader {
            data,
            pos: 0,
            ok: true,
        }
    }

    pub fn at(&self, offset: usize) -> ByteReader<'a> {
        ByteReader {
            data: self.data,
            pos: offset,
            ok: offset <= self.data.len(),
        }
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn skip(&mut self, n: usize) {
        self.pos += n;

        if self.pos > self.data.len() {
            self.ok = false;
        }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.pos + n > self.data.len() {
            self.ok = false;
            self.pos = self.data.len();
            return None;
        }

        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    pub fn u8(&mut self) -> u8 {
        self.take(1).map_or(0, |s| s[0])
    }

    pub fn i16(&mut self) -> i16 {
        self.take(2)
            .map_or(0, |s| i16::from_le_bytes([s[0], s[1]]))
    }

    pub fn u16(&mut self) -> u16 {
        self.take(2)
            .map_or(0, |s| u16::from_le_bytes([s[0], s[1]]))
    }

    pub fn i32(&mut self) -> i32 {
        self.take(4)
            .map_or(0, |s| i32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    pub fn u32(&mut self) -> u32 {
        self.take(4)
            .map_or(0, |s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    pub fn f32(&mut self) -> f32 {
        f32::from_bits(self.u32())
    }

    pub fn vec3(&mut self) -> Vec3 {
        Vec3::new(self.f32(), self.f32(), self.f32())
    }

    pub fn bytes(&mut self, n: usize) -> &'a [u8] {
        self.take(n).unwrap_or(&[])
    }

    /// A fixed-size, NUL-padded string field.
    pub fn fixed_str(&mut self, n: usize) -> String {
        let raw = self.bytes(n);
        let end = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }
}
