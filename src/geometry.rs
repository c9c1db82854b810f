//! World-space geometry: bounding boxes and triangle meshes
//!
//! Meshes arrive from the host as raw interleaved vertex/index arrays with a
//! position/rotation/scale transform and are stored as dense column matrices
//! (column i holds vertex i, column j holds triangle j's indices).

use nalgebra::{Matrix3xX, Matrix4, UnitQuaternion, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::{PlError, PlResult};

/// World-space position or direction in metres.
pub type Vec3 = Vector3<f64>;

/// Normalised rotation quaternion.
pub type Quat = UnitQuaternion<f64>;

/// Wall absorption coefficient assigned when the host supplies none.
pub const DEFAULT_ABSORPTION: f64 = 0.75;

/// Axis-aligned bounding box. Containment is inclusive and boxes whose
/// faces merely touch still count as intersecting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_center_size(center: Vec3, size: Vec3) -> Self {
        let half = size / 2.0;
        Self {
            min: center - half,
            max: center + half,
        }
    }

    /// Smallest box enclosing all given points.
    pub fn from_points(points: &[Vec3]) -> Self {
        let mut min = Vec3::repeat(f64::MAX);
        let mut max = Vec3::repeat(f64::MIN);
        for p in points {
            min = min.inf(p);
            max = max.sup(p);
        }
        Self { min, max }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) / 2.0
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn contains_point(&self, p: &Vec3) -> bool {
        (0..3).all(|a| p[a] >= self.min[a] && p[a] <= self.max[a])
    }

    /// Whether `other` lies entirely inside this box (shared faces allowed).
    pub fn contains(&self, other: &Aabb) -> bool {
        (0..3).all(|a| other.min[a] >= self.min[a] && other.max[a] <= self.max[a])
    }

    /// Whether the two boxes overlap or touch.
    pub fn intersects(&self, other: &Aabb) -> bool {
        (0..3).all(|a| self.min[a] <= other.max[a] && self.max[a] >= other.min[a])
    }
}

/// Build the world-from-local transform `translate(P) * rotate(Q) * scale(S)`.
/// The product order is part of the ingestion contract.
pub fn world_from_local(position: Vec3, rotation: Quat, scale: Vec3) -> Matrix4<f64> {
    Matrix4::new_translation(&position)
        * rotation.to_homogeneous()
        * Matrix4::new_nonuniform_scaling(&scale)
}

/// Triangle mesh in world space.
///
/// `vertices` has shape (3, Nv), `indices` has shape (3, Nt) with each
/// column holding one counter-clockwise triangle (viewed from outside).
/// `absorption` is the wall absorption coefficient applied to every
/// lattice cell this mesh claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    pub vertices: Matrix3xX<f64>,
    pub indices: Matrix3xX<u32>,
    pub absorption: f64,
}

impl Mesh {
    /// Ingest raw host geometry: apply the world transform to every vertex
    /// and pack the result into dense column matrices.
    ///
    /// `vertices` is xyz-interleaved local-space positions, `indices` a flat
    /// triangle list. Rejects anything that cannot describe a closed solid:
    /// fewer than 4 vertices, fewer than 4 indices, an index count that is
    /// not a multiple of three, an out-of-range index, or an absorption
    /// coefficient outside (0, 1].
    pub fn from_game_geometry(
        position: Vec3,
        rotation: Quat,
        scale: Vec3,
        vertices: &[f64],
        indices: &[u32],
        absorption: f64,
    ) -> PlResult<Self> {
        if vertices.len() % 3 != 0 {
            return Err(PlError::invalid(format!(
                "vertex array length {} is not a multiple of 3",
                vertices.len()
            )));
        }
        let vertex_count = vertices.len() / 3;
        if vertex_count < 4 {
            return Err(PlError::invalid(format!(
                "a closed mesh needs at least 4 vertices, got {vertex_count}"
            )));
        }
        if indices.len() < 4 {
            return Err(PlError::invalid(format!(
                "a closed mesh needs at least 4 indices, got {}",
                indices.len()
            )));
        }
        if indices.len() % 3 != 0 {
            return Err(PlError::invalid(format!(
                "index count {} is not a multiple of 3",
                indices.len()
            )));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(PlError::invalid(format!(
                "index {bad} out of range for {vertex_count} vertices"
            )));
        }
        if !(absorption > 0.0 && absorption <= 1.0) {
            return Err(PlError::invalid(format!(
                "absorption {absorption} outside (0, 1]"
            )));
        }

        let transform = world_from_local(position, rotation, scale);

        let mut world = Matrix3xX::zeros(vertex_count);
        for i in 0..vertex_count {
            let local = Vector4::new(
                vertices[i * 3],
                vertices[i * 3 + 1],
                vertices[i * 3 + 2],
                1.0,
            );
            let v = transform * local;
            world.set_column(i, &Vec3::new(v.x, v.y, v.z));
        }

        let triangle_count = indices.len() / 3;
        let mut triangles = Matrix3xX::<u32>::zeros(triangle_count);
        for j in 0..triangle_count {
            triangles.set_column(
                j,
                &Vector3::new(indices[j * 3], indices[j * 3 + 1], indices[j * 3 + 2]),
            );
        }

        Ok(Self {
            vertices: world,
            indices: triangles,
            absorption,
        })
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.ncols()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.ncols()
    }

    pub fn vertex(&self, i: usize) -> Vec3 {
        self.vertices.column(i).into_owned()
    }

    /// Vertex indices of triangle `j`.
    pub fn triangle(&self, j: usize) -> [usize; 3] {
        let col = self.indices.column(j);
        [col[0] as usize, col[1] as usize, col[2] as usize]
    }

    /// World-space bounds from the per-row extremes of the vertex matrix.
    pub fn aabb(&self) -> Aabb {
        let mut min = Vec3::repeat(f64::MAX);
        let mut max = Vec3::repeat(f64::MIN);
        for i in 0..self.vertex_count() {
            let v = self.vertices.column(i);
            for a in 0..3 {
                min[a] = min[a].min(v[a]);
                max[a] = max[a].max(v[a]);
            }
        }
        Aabb::new(min, max)
    }
}

/// Unit cube corner positions used by tests across the crate.
#[cfg(test)]
pub(crate) const CUBE_VERTICES: [f64; 24] = [
    -0.5, -0.5, -0.5, // 0
    0.5, -0.5, -0.5, // 1
    0.5, 0.5, -0.5, // 2
    -0.5, 0.5, -0.5, // 3
    -0.5, -0.5, 0.5, // 4
    0.5, -0.5, 0.5, // 5
    0.5, 0.5, 0.5, // 6
    -0.5, 0.5, 0.5, // 7
];

/// Unit cube triangle list, counter-clockwise viewed from outside.
#[cfg(test)]
pub(crate) const CUBE_INDICES: [u32; 36] = [
    0, 2, 1, 0, 3, 2, // z = -1/2 face
    4, 5, 6, 4, 6, 7, // z = +1/2 face
    0, 1, 5, 0, 5, 4, // y = -1/2 face
    3, 7, 6, 3, 6, 2, // y = +1/2 face
    0, 4, 7, 0, 7, 3, // x = -1/2 face
    1, 2, 6, 1, 6, 5, // x = +1/2 face
];

/// Axis-aligned cube mesh used by tests across the crate.
#[cfg(test)]
pub(crate) fn cube_mesh(center: Vec3, side: f64, absorption: f64) -> Mesh {
    match Mesh::from_game_geometry(
        center,
        Quat::identity(),
        Vec3::repeat(side),
        &CUBE_VERTICES,
        &CUBE_INDICES,
        absorption,
    ) {
        Ok(mesh) => mesh,
        Err(err) => panic!("cube mesh construction failed: {err}"),
    }
}
