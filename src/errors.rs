//! Error Types
//!
//! The main error type [`StrafeError`] covers every failure mode of the
//! renderer core. Each variant carries a severity: `Drop` errors abort the
//! current level load or frame, `Fatal` errors indicate a misconfiguration
//! the embedding host cannot recover from. The core itself never terminates
//! the process; the host inspects [`StrafeError::severity`] and decides.

use thiserror::Error;

/// How the host should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Abort the current level load or frame; the engine stays usable.
    Drop,
    /// Unrecoverable misconfiguration.
    Fatal,
}

/// The main error type for the strafe renderer core.
#[derive(Error, Debug)]
pub enum StrafeError {
    // ========================================================================
    // World loading
    // ========================================================================
    /// The world file was not found in the virtual filesystem.
    #[error("world not found: {0}")]
    WorldNotFound(String),

    /// The BSP header ident was not 'IBSP'.
    #[error("{name} is not a BSP file (ident {ident:#x})")]
    BadBspIdent {
        /// Map path.
        name: String,
        /// The ident that was read.
        ident: u32,
    },

    /// The BSP version did not match the expected engine flavor.
    #[error("{name} has wrong version number ({version} should be {expected})")]
    BadBspVersion {
        /// Map path.
        name: String,
        /// The version that was read.
        version: i32,
        /// The version the loader expected.
        expected: i32,
    },

    /// A lump's length was not a multiple of its record size.
    #[error("{name}: lump {lump} has bad size")]
    BadLumpSize {
        /// Map path.
        name: String,
        /// Lump index.
        lump: usize,
    },

    /// A lump referenced data outside the file.
    #[error("{name}: lump {lump} is out of bounds")]
    LumpOutOfBounds {
        /// Map path.
        name: String,
        /// Lump index.
        lump: usize,
    },

    /// A fog brush or brush side index was out of range.
    #[error("{0}: fog references are out of range")]
    BadFogReference(String),

    /// A surface referenced a material index outside the shaders lump.
    #[error("{name}: bad material index {index}")]
    BadMaterialIndex {
        /// Map path.
        name: String,
        /// The offending index.
        index: i32,
    },

    /// The world geometry exceeded the fixed vertex buffer budget.
    #[error("not enough world vertex buffers")]
    OutOfGeometryBuffers,

    // ========================================================================
    // Texture cache
    // ========================================================================
    /// A texture name exceeded the maximum path length.
    #[error("texture name \"{0}\" is too long")]
    TextureNameTooLong(String),

    /// The fixed-capacity texture cache is full.
    #[error("exceeded max textures")]
    TextureCacheFull,

    // ========================================================================
    // Assets
    // ========================================================================
    /// Image decoding failed.
    #[error("image decode error: {0}")]
    ImageDecode(String),

    /// A model file had the wrong ident or version for its extension.
    #[error("model {name}: {reason}")]
    BadModel {
        /// Model path.
        name: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl StrafeError {
    /// Severity of this error, mirroring the `ERR_DROP` / `ERR_FATAL` split.
    #[must_use]
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            StrafeError::TextureNameTooLong(_) | StrafeError::TextureCacheFull => {
                ErrorSeverity::Fatal
            }
            _ => ErrorSeverity::Drop,
        }
    }
}

impl From<image::ImageError> for StrafeError {
    fn from(err: image::ImageError) -> Self {
        StrafeError::ImageDecode(err.to_string())
    }
}

/// Alias for `Result<T, StrafeError>`.
pub type Result<T> = std::result::Result<T, StrafeError>;
