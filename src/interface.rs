//! Host capability surface.
//!
//! The renderer core never touches the OS directly: file access, game time,
//! console variables and the collision module's PVS all come through the
//! [`Host`] trait supplied by the embedding engine. Logging goes through the
//! `log` facade instead of a callback.

use bitflags::bitflags;
use rustc_hash::FxHashMap;

bitflags! {
    /// Console variable registration flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CvarFlags: u32 {
        /// Persisted by the host.
        const ARCHIVE = 1 << 0;
        /// Takes effect on the next restart.
        const LATCH = 1 << 1;
        /// Only changeable when cheats are enabled.
        const CHEAT = 1 << 2;
    }
}

/// A console variable snapshot at registration time.
#[derive(Debug, Clone, Default)]
pub struct CvarValue {
    pub string: String,
    pub value: f32,
    pub integer: i32,
}

impl CvarValue {
    #[must_use]
    pub fn parse(s: &str) -> CvarValue {
        CvarValue {
            string: s.to_string(),
            value: s.parse().unwrap_or(0.0),
            integer: s.parse::<f32>().map_or(0, |v| v as i32),
        }
    }
}

/// Display capability information returned by `begin_registration`.
#[derive(Debug, Clone, Default)]
pub struct GlConfig {
    pub vid_width: i32,
    pub vid_height: i32,
    pub window_aspect: f32,
    pub max_texture_size: i32,
    pub is_fullscreen: bool,
}

/// Everything the core requires of its embedder.
///
/// File paths use `/` separators; pak archives are transparent to the core.
pub trait Host {
    /// Monotonic game time in milliseconds.
    fn milliseconds(&self) -> i32;

    /// Read an entire file. `None` when the file does not exist.
    fn read_file(&self, name: &str) -> Option<Vec<u8>>;

    /// List file names (not paths) in `dir` with the given extension.
    fn list_files(&self, dir: &str, extension: &str) -> Vec<String>;

    fn write_file(&self, _name: &str, _data: &[u8]) -> bool {
        false
    }

    fn file_exists(&self, name: &str) -> bool {
        self.read_file(name).is_some()
    }

    /// Register a console variable, returning its current value.
    fn cvar_get(&self, name: &str, default: &str, flags: CvarFlags) -> CvarValue;

    fn cvar_set(&self, _name: &str, _value: &str) {}

    fn cvar_integer(&self, name: &str) -> i32 {
        self.cvar_get(name, "0", CvarFlags::empty()).integer
    }

    /// The collision module's PVS row for a cluster. Used by `in_pvs`.
    fn cluster_pvs(&self, _cluster: i32) -> Vec<u8> {
        Vec::new()
    }

    /// Start a cinematic for a videomap stage. Returns a handle, -1 on failure.
    fn play_cinematic(&self, _name: &str, _width: i32, _height: i32) -> i32 {
        -1
    }

    fn run_cinematic(&self, _handle: i32) {}

    fn upload_cinematic(&self, _handle: i32) {}
}

/// Read a file as UTF-8 text, replacing invalid sequences.
pub fn read_text_file(host: &dyn Host, name: &str) -> Option<String> {
    host.read_file(name)
        .map(|data| String::from_utf8_lossy(&data).into_owned())
}

/// In-memory host used by tests and tools: a virtual filesystem plus a cvar
/// table seeded with defaults on first access.
#[derive(Default)]
pub struct MemoryHost {
    pub files: FxHashMap<String, Vec<u8>>,
    pub cvars: std::cell::RefCell<FxHashMap<String, String>>,
    pub time: std::cell::Cell<i32>,
}

impl MemoryHost {
    #[must_use]
    pub fn new() -> MemoryHost {
        MemoryHost::default()
    }

    pub fn add_file(&mut self, name: &str, data: impl Into<Vec<u8>>) {
        self.files.insert(name.to_string(), data.into());
    }

    pub fn set_cvar(&self, name: &str, value: &str) {
        self.cvars
            .borrow_mut()
            .insert(name.to_string(), value.to_string());
    }
}

impl Host for MemoryHost {
    fn milliseconds(&self) -> i32 {
        self.time.get()
    }

    fn read_file(&self, name: &str) -> Option<Vec<u8>> {
        self.files.get(name).cloned()
    }

    fn list_files(&self, dir: &str, extension: &str) -> Vec<String> {
        let prefix = format!("{dir}/");
        let mut names: Vec<String> = self
            .files
            .keys()
            .filter(|k| k.starts_with(&prefix) && k.ends_with(extension))
            .map(|k| k[prefix.len()..].to_string())
            .filter(|k| !k.contains('/'))
            .collect();
        names.sort();
        names
    }

    fn cvar_get(&self, name: &str, default: &str, _flags: CvarFlags) -> CvarValue {
        let mut cvars = self.cvars.borrow_mut();
        let value = cvars
            .entry(name.to_string())
            .or_insert_with(|| default.to_string());
        CvarValue::parse(value)
    }

    fn cvar_set(&self, name: &str, value: &str) {
        self.set_cvar(name, value);
    }

    fn cvar_integer(&self, name: &str) -> i32 {
        self.cvars
            .borrow()
            .get(name)
            .and_then(|v| v.parse::<f32>().ok())
            .map_or(0, |v| v as i32)
    }
}
