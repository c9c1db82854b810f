//! OpenPL: room-acoustic impulse responses for interactive audio
//!
//! This crate provides:
//! - Ingestion of world-space triangle meshes under rigid-plus-scale transforms
//! - Voxelisation of an axis-aligned simulation volume into a rigidity/absorptivity lattice
//! - A staggered-grid acoustic FDTD solver that captures the pressure field
//!   after a Gaussian impulse is injected at a source cell
//! - A scene facade with a single-worker asynchronous voxeliser and a
//!   C-style opaque-handle surface for host engines
//!
//! Units are metres, seconds and pascals (arbitrary scale) throughout;
//! no conversion happens inside the engine.

pub mod capi;
pub mod fdtd;
pub mod geometry;
pub mod scene;
pub mod voxel;

pub use fdtd::{AcousticSimulation, SimulationConfig, SimulationGrid};
pub use geometry::{Aabb, Mesh, Quat, Vec3, DEFAULT_ABSORPTION};
pub use scene::{Scene, SceneSnapshot, System, VoxeliserStatus};
pub use voxel::{fill_voxels, points_in_mesh, Voxel, VoxelLattice};

use thiserror::Error;

/// Result alias used by every fallible engine operation.
pub type PlResult<T> = Result<T, PlError>;

/// Engine error surfaced through the public API.
///
/// `InvalidParam` marks caller mistakes that can be fixed and retried;
/// `Generic` marks internal invariant violations or "no work possible"
/// states that require a state change before retrying. Diagnostic detail
/// goes to the logger and the message; the machine-readable distinction
/// is the variant alone.
#[derive(Debug, Error)]
pub enum PlError {
    /// Caller-supplied input failed validation.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    /// Internal invariant violation or no work possible.
    #[error("{0}")]
    Generic(String),
}

impl PlError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParam(message.into())
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic(message.into())
    }
}
