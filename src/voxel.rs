//! Voxeliser for the acoustic FDTD lattice
//!
//! Discretises the simulation volume into a dense lattice of cubic cells and
//! classifies each cell as open air or solid wall by sampling world-space
//! triangle meshes. Inside/outside classification uses generalized winding
//! numbers, so meshes with small defects still voxelise as closed solids.

use std::f64::consts::PI;

use tracing::{debug, warn};

use crate::geometry::{Aabb, Mesh, Vec3};
use crate::{PlError, PlResult};

/// A cell solidifies when at least this many of its 9 sample points fall
/// inside a mesh. Cells straddling the surface with fewer hits stay air.
const SOLID_SAMPLE_THRESHOLD: usize = 3;

/// Tolerance on the winding number threshold: a point on a face sees a
/// winding number of exactly 1/2 up to rounding.
const WINDING_EPS: f64 = 1e-6;

/// One cubic cell of the lattice.
///
/// `beta` is the rigidity scalar (1 = open air, 0 = solid wall) and
/// `absorptivity` the wall absorption coefficient, zero for air cells.
/// `pressure` and the three staggered particle-velocity components hold the
/// acoustic state; the velocity on a cell's face sits between the cell and
/// its negative-axis neighbour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Voxel {
    pub world_pos: Vec3,
    pub beta: f64,
    pub absorptivity: f64,
    pub pressure: f64,
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
}

impl Voxel {
    /// Open-air cell at rest.
    pub fn air(world_pos: Vec3) -> Self {
        Self {
            world_pos,
            beta: 1.0,
            absorptivity: 0.0,
            pressure: 0.0,
            vx: 0.0,
            vy: 0.0,
            vz: 0.0,
        }
    }
}

impl Default for Voxel {
    fn default() -> Self {
        Self::air(Vec3::zeros())
    }
}

/// Dense cubic-cell lattice over an axis-aligned volume.
///
/// Cells are stored flat under the lexicographic mapping
/// `i = x + y * X + z * X * Y` (x fastest).
#[derive(Debug, Clone)]
pub struct VoxelLattice {
    bounds: Aabb,
    counts: [usize; 3],
    cell_size: f64,
    pub(crate) voxels: Vec<Voxel>,
}

impl VoxelLattice {
    /// Build an all-air lattice for the box `[centre - size/2, centre + size/2]`
    /// with cubic cells of edge `cell_size`.
    ///
    /// Per-axis counts come from the isotropic grid rule: the floored ratio
    /// `side / cell_size`, rounded up by one when the floored count leaves
    /// part of the box uncovered. Cell centres sit at
    /// `min + cell_size/2 + i * cell_size` along each axis.
    pub fn build(centre: Vec3, size: Vec3, cell_size: f64) -> PlResult<Self> {
        if !(cell_size > 0.0) {
            return Err(PlError::invalid(format!(
                "cell size must be positive, got {cell_size}"
            )));
        }
        if size.x < cell_size || size.y < cell_size || size.z < cell_size {
            return Err(PlError::invalid(format!(
                "cell size {cell_size} exceeds a domain side ({}, {}, {})",
                size.x, size.y, size.z
            )));
        }

        let bounds = Aabb::from_center_size(centre, size);
        let counts = axis_counts(size, cell_size);
        if counts.iter().any(|&c| c == 0) {
            return Err(PlError::generic(format!(
                "degenerate lattice extents {counts:?}"
            )));
        }

        let [nx, ny, nz] = counts;
        let mut voxels = Vec::with_capacity(nx * ny * nz);
        let half = cell_size / 2.0;
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    let pos = Vec3::new(
                        bounds.min.x + half + x as f64 * cell_size,
                        bounds.min.y + half + y as f64 * cell_size,
                        bounds.min.z + half + z as f64 * cell_size,
                    );
                    voxels.push(Voxel::air(pos));
                }
            }
        }

        Ok(Self {
            bounds,
            counts,
            cell_size,
            voxels,
        })
    }

    /// Flat index of cell `(x, y, z)`.
    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        x + y * self.counts[0] + z * self.counts[0] * self.counts[1]
    }

    /// Inverse of [`index`](Self::index).
    #[inline]
    pub fn coords(&self, i: usize) -> [usize; 3] {
        let [nx, ny, _] = self.counts;
        [i % nx, (i / nx) % ny, i / (nx * ny)]
    }

    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    pub fn counts(&self) -> [usize; 3] {
        self.counts
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    pub fn voxel(&self, i: usize) -> Option<&Voxel> {
        self.voxels.get(i)
    }

    pub fn voxels(&self) -> &[Voxel] {
        &self.voxels
    }

    /// Cube covered by cell `i` (centre plus/minus half the edge length).
    pub fn cell_aabb(&self, i: usize) -> Aabb {
        let centre = self.voxels[i].world_pos;
        Aabb::from_center_size(centre, Vec3::repeat(self.cell_size))
    }

    /// Index of the cell whose cube contains the world-space point, if any.
    pub fn cell_containing(&self, p: &Vec3) -> Option<usize> {
        if !self.bounds.contains_point(p) {
            return None;
        }
        let mut coords = [0usize; 3];
        for a in 0..3 {
            let offset = ((p[a] - self.bounds.min[a]) / self.cell_size).floor();
            coords[a] = (offset.max(0.0) as usize).min(self.counts[a] - 1);
        }
        Some(self.index(coords[0], coords[1], coords[2]))
    }
}

/// Per-axis cell counts for the isotropic grid rule.
fn axis_counts(size: Vec3, cell_size: f64) -> [usize; 3] {
    let mut counts = [0usize; 3];
    for a in 0..3 {
        let floored = (size[a] / cell_size).floor() as usize;
        // Round up by one when the floored count does not fill the box.
        counts[a] = if (floored as f64) * cell_size < size[a] - cell_size * 1e-9 {
            floored + 1
        } else {
            floored
        };
    }
    counts
}

// ===========================
// Winding-number point classification
// ===========================

/// Which of the query points lie inside the closed mesh.
///
/// Computes the generalized winding number of each query point: the sum of
/// signed solid angles subtended by every triangle, normalised by the full
/// sphere. A point counts as inside when the winding number reaches 1/2, so
/// a point on a face classifies as inside while a point on an edge or near
/// the surface does not. Holes and slivers shift the number gradually
/// instead of flipping it, which keeps slightly defective meshes usable.
pub fn points_in_mesh(mesh: &Mesh, queries: &[Vec3]) -> Vec<bool> {
    queries
        .iter()
        .map(|q| winding_number(mesh, q) >= 0.5 - WINDING_EPS)
        .collect()
}

/// Generalized winding number of `query` with respect to the mesh surface.
/// Close to 1 inside, close to 0 outside, 1/2 on a face.
pub fn winding_number(mesh: &Mesh, query: &Vec3) -> f64 {
    let mut total = 0.0;
    for j in 0..mesh.triangle_count() {
        let [i0, i1, i2] = mesh.triangle(j);
        total += solid_angle(
            mesh.vertex(i0) - query,
            mesh.vertex(i1) - query,
            mesh.vertex(i2) - query,
        );
    }
    total / (4.0 * PI)
}

/// Signed solid angle of the triangle spanned by `a`, `b`, `c` as seen from
/// the origin (Van Oosterom & Strackee). Positive when the origin is on the
/// inner side of an outward-wound triangle.
fn solid_angle(a: Vec3, b: Vec3, c: Vec3) -> f64 {
    let la = a.norm();
    let lb = b.norm();
    let lc = c.norm();
    let numer = a.dot(&b.cross(&c));
    let denom = la * lb * lc + a.dot(&b) * lc + a.dot(&c) * lb + b.dot(&c) * la;
    2.0 * numer.atan2(denom)
}

// ===========================
// Cell classification
// ===========================

/// Classify every lattice cell against the scene's meshes.
///
/// Resets the whole lattice to air, then for each mesh culls candidate cells
/// by bounding box and samples 9 points per candidate (the centre plus the 8
/// cube corners). A cell with at least [`SOLID_SAMPLE_THRESHOLD`] inside
/// points becomes a wall carrying the mesh's absorption. Later meshes
/// overwrite earlier ones on co-claimed cells.
pub fn fill_voxels(lattice: &mut VoxelLattice, meshes: &[Mesh]) {
    for voxel in lattice.voxels.iter_mut() {
        voxel.beta = 1.0;
        voxel.absorptivity = 0.0;
    }

    for (mesh_index, mesh) in meshes.iter().enumerate() {
        let mesh_bounds = mesh.aabb();
        if !mesh_bounds.intersects(lattice.bounds()) {
            debug!(mesh = mesh_index, "mesh outside lattice bounds, skipping");
            continue;
        }

        let candidates = candidate_cells(lattice, &mesh_bounds);
        if candidates.is_empty() {
            warn!(
                mesh = mesh_index,
                "mesh intersects the lattice but claimed no candidate cells"
            );
            continue;
        }

        let mut solid = 0usize;
        for cell in candidates {
            let samples = sample_points(lattice, cell);
            let inside = points_in_mesh(mesh, &samples);
            let hits = inside.iter().filter(|&&flag| flag).count();
            if hits >= SOLID_SAMPLE_THRESHOLD {
                let voxel = &mut lattice.voxels[cell];
                voxel.beta = 0.0;
                voxel.absorptivity = mesh.absorption;
                solid += 1;
            }
        }
        debug!(mesh = mesh_index, solid, "mesh voxelised");
    }
}

/// Indices of every cell whose cube intersects the mesh bounds.
fn candidate_cells(lattice: &VoxelLattice, mesh_bounds: &Aabb) -> Vec<usize> {
    let [nx, ny, nz] = lattice.counts();
    let h = lattice.cell_size();
    let min = lattice.bounds().min;

    let mut lo = [0usize; 3];
    let mut hi = [0usize; 3];
    let limits = [nx, ny, nz];
    for a in 0..3 {
        let start = ((mesh_bounds.min[a] - min[a]) / h).floor() - 1.0;
        let end = ((mesh_bounds.max[a] - min[a]) / h).ceil() + 1.0;
        lo[a] = start.max(0.0) as usize;
        hi[a] = (end.max(0.0) as usize).min(limits[a]);
    }

    let mut cells = Vec::new();
    for z in lo[2]..hi[2] {
        for y in lo[1]..hi[1] {
            for x in lo[0]..hi[0] {
                let i = lattice.index(x, y, z);
                if lattice.cell_aabb(i).intersects(mesh_bounds) {
                    cells.push(i);
                }
            }
        }
    }
    cells
}

/// The 9-point sample set for a cell: its centre plus the 8 corners.
fn sample_points(lattice: &VoxelLattice, cell: usize) -> Vec<Vec3> {
    let centre = lattice.voxels[cell].world_pos;
    let half = lattice.cell_size() / 2.0;
    let mut points = Vec::with_capacity(9);
    points.push(centre);
    for &sx in &[-half, half] {
        for &sy in &[-half, half] {
            for &sz in &[-half, half] {
                points.push(centre + Vec3::new(sx, sy, sz));
            }
        }
    }
    points
}
