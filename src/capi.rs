//! C embedding surface
//!
//! Opaque-handle API for host engines: create a system, create scenes from
//! it, feed meshes and probe locations, voxelise, simulate, then read back
//! per-voxel state. Every entry point returns a [`PlResultCode`]; diagnostic
//! detail goes to the logger, never the return value.
//!
//! # Safety
//!
//! Handles are raw pointers produced by `pl_system_create` and
//! `pl_scene_create`. Callers must pass them back unmodified, must not use a
//! handle after releasing it, and must keep array pointers valid for the
//! duration of the call. Null pointers are rejected with
//! [`PlResultCode::InvalidParam`].

use std::os::raw::{c_double, c_int, c_uint};
use std::slice;

use nalgebra::Quaternion;

use crate::geometry::{Quat, Vec3, DEFAULT_ABSORPTION};
use crate::scene::{Scene, System};
use crate::PlError;

/// Result code returned by every C entry point.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlResultCode {
    Ok = 0,
    Err = 1,
    InvalidParam = 2,
}

fn code_of(err: &PlError) -> PlResultCode {
    match err {
        PlError::InvalidParam(_) => PlResultCode::InvalidParam,
        PlError::Generic(_) => PlResultCode::Err,
    }
}

/// World-space vector crossing the C boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PlVector {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<PlVector> for Vec3 {
    fn from(v: PlVector) -> Self {
        Vec3::new(v.x, v.y, v.z)
    }
}

impl From<Vec3> for PlVector {
    fn from(v: Vec3) -> Self {
        Self {
            x: v.x,
            y: v.y,
            z: v.z,
        }
    }
}

/// World-space rotation crossing the C boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PlQuaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<PlQuaternion> for Quat {
    fn from(q: PlQuaternion) -> Self {
        Quat::from_quaternion(Quaternion::new(q.w, q.x, q.y, q.z))
    }
}

/// Create a system handle.
///
/// # Safety
/// `out_system` must point to writable storage for one pointer.
#[no_mangle]
pub unsafe extern "C" fn pl_system_create(out_system: *mut *mut System) -> PlResultCode {
    if out_system.is_null() {
        return PlResultCode::InvalidParam;
    }
    *out_system = Box::into_raw(Box::new(System::new()));
    PlResultCode::Ok
}

/// Destroy a system and every scene it owns, joining in-flight workers.
///
/// # Safety
/// `system` must be a live handle from `pl_system_create`.
#[no_mangle]
pub unsafe extern "C" fn pl_system_release(system: *mut System) -> PlResultCode {
    if system.is_null() {
        return PlResultCode::InvalidParam;
    }
    drop(Box::from_raw(system));
    PlResultCode::Ok
}

/// Create a scene owned by `system`.
///
/// # Safety
/// `system` must be a live system handle and `out_scene` writable.
#[no_mangle]
pub unsafe extern "C" fn pl_scene_create(
    system: *mut System,
    out_scene: *mut *mut Scene,
) -> PlResultCode {
    if system.is_null() || out_scene.is_null() {
        return PlResultCode::InvalidParam;
    }
    let system = &mut *system;
    *out_scene = system.create_scene() as *mut Scene;
    PlResultCode::Ok
}

/// Release one scene of `system`.
///
/// # Safety
/// Both handles must be live; `scene` is invalid after a successful call.
#[no_mangle]
pub unsafe extern "C" fn pl_scene_release(
    system: *mut System,
    scene: *mut Scene,
) -> PlResultCode {
    if system.is_null() || scene.is_null() {
        return PlResultCode::InvalidParam;
    }
    if (*system).release_scene(scene) {
        PlResultCode::Ok
    } else {
        PlResultCode::InvalidParam
    }
}

/// Ingest host geometry: `vertex_count` xyz triples and `index_count` raw
/// indices, transformed by position/rotation/scale. Writes the stable mesh
/// index to `out_index`.
///
/// # Safety
/// All pointers must be valid; `vertices` must hold `3 * vertex_count`
/// doubles and `indices` must hold `index_count` entries.
#[no_mangle]
pub unsafe extern "C" fn pl_scene_add_and_convert_game_mesh(
    scene: *mut Scene,
    position: *const PlVector,
    rotation: *const PlQuaternion,
    scale: *const PlVector,
    vertices: *const c_double,
    vertex_count: c_int,
    indices: *const c_uint,
    index_count: c_int,
    out_index: *mut c_int,
) -> PlResultCode {
    if scene.is_null()
        || position.is_null()
        || rotation.is_null()
        || scale.is_null()
        || vertices.is_null()
        || indices.is_null()
        || out_index.is_null()
    {
        return PlResultCode::InvalidParam;
    }
    if vertex_count < 0 || index_count < 0 {
        return PlResultCode::InvalidParam;
    }

    let scene = &mut *scene;
    let verts = slice::from_raw_parts(vertices, vertex_count as usize * 3);
    let idx = slice::from_raw_parts(indices, index_count as usize);
    match scene.add_mesh(
        (*position).into(),
        (*rotation).into(),
        (*scale).into(),
        verts,
        idx,
        DEFAULT_ABSORPTION,
    ) {
        Ok(index) => {
            *out_index = index as c_int;
            PlResultCode::Ok
        }
        Err(err) => code_of(&err),
    }
}

/// # Safety
/// `scene` must be a live scene handle.
#[no_mangle]
pub unsafe extern "C" fn pl_scene_remove_mesh(scene: *mut Scene, index: c_int) -> PlResultCode {
    if scene.is_null() || index < 0 {
        return PlResultCode::InvalidParam;
    }
    match (*scene).remove_mesh(index as usize) {
        Ok(()) => PlResultCode::Ok,
        Err(err) => code_of(&err),
    }
}

/// # Safety
/// `scene` and `location` must be valid; `out_index` writable.
#[no_mangle]
pub unsafe extern "C" fn pl_scene_add_listener_location(
    scene: *mut Scene,
    location: *const PlVector,
    out_index: *mut c_int,
) -> PlResultCode {
    if scene.is_null() || location.is_null() || out_index.is_null() {
        return PlResultCode::InvalidParam;
    }
    match (*scene).add_listener_location((*location).into()) {
        Ok(index) => {
            *out_index = index as c_int;
            PlResultCode::Ok
        }
        Err(err) => code_of(&err),
    }
}

/// # Safety
/// `scene` must be a live scene handle.
#[no_mangle]
pub unsafe extern "C" fn pl_scene_remove_listener_location(
    scene: *mut Scene,
    index: c_int,
) -> PlResultCode {
    if scene.is_null() || index < 0 {
        return PlResultCode::InvalidParam;
    }
    match (*scene).remove_listener_location(index as usize) {
        Ok(()) => PlResultCode::Ok,
        Err(err) => code_of(&err),
    }
}

/// # Safety
/// `scene` and `location` must be valid; `out_index` writable.
#[no_mangle]
pub unsafe extern "C" fn pl_scene_add_source_location(
    scene: *mut Scene,
    location: *const PlVector,
    out_index: *mut c_int,
) -> PlResultCode {
    if scene.is_null() || location.is_null() || out_index.is_null() {
        return PlResultCode::InvalidParam;
    }
    match (*scene).add_source_location((*location).into()) {
        Ok(index) => {
            *out_index = index as c_int;
            PlResultCode::Ok
        }
        Err(err) => code_of(&err),
    }
}

/// # Safety
/// `scene` must be a live scene handle.
#[no_mangle]
pub unsafe extern "C" fn pl_scene_remove_source_location(
    scene: *mut Scene,
    index: c_int,
) -> PlResultCode {
    if scene.is_null() || index < 0 {
        return PlResultCode::InvalidParam;
    }
    match (*scene).remove_source_location(index as usize) {
        Ok(()) => PlResultCode::Ok,
        Err(err) => code_of(&err),
    }
}

/// Kick off asynchronous voxelisation of the box around `centre`.
///
/// # Safety
/// `scene`, `centre` and `size` must be valid.
#[no_mangle]
pub unsafe extern "C" fn pl_scene_voxelise(
    scene: *mut Scene,
    centre: *const PlVector,
    size: *const PlVector,
    cell_size: c_double,
) -> PlResultCode {
    if scene.is_null() || centre.is_null() || size.is_null() {
        return PlResultCode::InvalidParam;
    }
    match (*scene).voxelise((*centre).into(), (*size).into(), cell_size) {
        Ok(()) => PlResultCode::Ok,
        Err(err) => code_of(&err),
    }
}

/// Run the FDTD kernel, blocking on the voxeliser first.
///
/// # Safety
/// `scene` must be a live scene handle.
#[no_mangle]
pub unsafe extern "C" fn pl_scene_simulate(scene: *mut Scene) -> PlResultCode {
    if scene.is_null() {
        return PlResultCode::InvalidParam;
    }
    match (*scene).simulate() {
        Ok(()) => PlResultCode::Ok,
        Err(err) => code_of(&err),
    }
}

/// Number of lattice cells; zero while the voxeliser is still running.
///
/// # Safety
/// `scene` must be live and `out_count` writable.
#[no_mangle]
pub unsafe extern "C" fn pl_scene_get_voxels_count(
    scene: *mut Scene,
    out_count: *mut c_int,
) -> PlResultCode {
    if scene.is_null() || out_count.is_null() {
        return PlResultCode::InvalidParam;
    }
    match (*scene).voxel_count() {
        Ok(count) => {
            *out_count = count as c_int;
            PlResultCode::Ok
        }
        Err(err) => code_of(&err),
    }
}

/// World-space centre of one cell; zeros while the voxeliser is running.
///
/// # Safety
/// `scene` must be live and `out_location` writable.
#[no_mangle]
pub unsafe extern "C" fn pl_scene_get_voxel_location(
    scene: *mut Scene,
    index: c_int,
    out_location: *mut PlVector,
) -> PlResultCode {
    if scene.is_null() || out_location.is_null() || index < 0 {
        return PlResultCode::InvalidParam;
    }
    match (*scene).voxel_location(index as usize) {
        Ok(location) => {
            *out_location = location.into();
            PlResultCode::Ok
        }
        Err(err) => code_of(&err),
    }
}

/// Absorptivity of one cell; zero while the voxeliser is running.
///
/// # Safety
/// `scene` must be live and `out_absorptivity` writable.
#[no_mangle]
pub unsafe extern "C" fn pl_scene_get_voxel_absorptivity(
    scene: *mut Scene,
    index: c_int,
    out_absorptivity: *mut c_double,
) -> PlResultCode {
    if scene.is_null() || out_absorptivity.is_null() || index < 0 {
        return PlResultCode::InvalidParam;
    }
    match (*scene).voxel_absorptivity(index as usize) {
        Ok(absorptivity) => {
            *out_absorptivity = absorptivity;
            PlResultCode::Ok
        }
        Err(err) => code_of(&err),
    }
}
