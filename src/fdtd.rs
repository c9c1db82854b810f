//! Acoustic FDTD solver for room impulse responses
//!
//! Time-steps the linearised acoustic wave equation on the voxel lattice:
//! pressure at cell centres, particle velocity on cell faces (Yee-style
//! staggering), leapfrog time-stepping, locally reactive wall boundaries
//! driven by each cell's rigidity and absorptivity, and a first-order
//! absorbing layer on two opposing domain faces.
//!
//! References:
//! - Yee, "Numerical solution of initial boundary value problems" (1966)
//! - Botteldooren, "Finite-difference time-domain simulation of
//!   low-frequency room acoustic problems" (1995)

use std::f64::consts::PI;

use tracing::{debug, warn};

use crate::voxel::{Voxel, VoxelLattice};
use crate::{PlError, PlResult};

/// Speed of sound in air (m/s)
pub const SPEED_OF_SOUND: f64 = 343.21;
/// Lowest frequency the lattice resolves (Hz)
pub const MIN_FREQUENCY: f64 = 275.0;
/// Default recording length in time steps, long enough for the pulse to
/// decay well before the window ends.
pub const DEFAULT_STEPS: usize = 100;

/// Spatial step required to resolve [`MIN_FREQUENCY`] (m). The voxeliser's
/// cell size must match it for the update coefficients to hold.
pub fn spatial_step() -> f64 {
    (SPEED_OF_SOUND / MIN_FREQUENCY) / 3.5
}

/// Time step paired with [`spatial_step`] (s).
pub fn time_step() -> f64 {
    spatial_step() / (SPEED_OF_SOUND * 1.5)
}

/// Sampling rate of the captured impulse response (Hz).
pub fn sampling_rate() -> f64 {
    1.0 / time_step()
}

/// Dimensionless coefficient `c * dt / dx` appearing in every pressure and
/// velocity update.
pub fn update_coefficient() -> f64 {
    SPEED_OF_SOUND * time_step() / spatial_step()
}

/// Knobs for one simulation run.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Number of recorded time steps.
    pub steps: usize,
    /// Peak amplitude of the excitation pulse.
    pub amplitude: f64,
    /// Whether the absorbing face layer is applied.
    pub absorbing_faces: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            steps: DEFAULT_STEPS,
            amplitude: 1.0,
            absorbing_faces: true,
        }
    }
}

/// Gaussian excitation pulse: sample i is
/// `A * exp(-((i*dt - 2*sigma)^2 / sigma^2))` with
/// `sigma = 1 / (0.5 * pi * f_min)`.
pub fn gaussian_pulse(steps: usize, amplitude: f64) -> Vec<f64> {
    let dt = time_step();
    let sigma = 1.0 / (0.5 * PI * MIN_FREQUENCY);
    (0..steps)
        .map(|i| {
            let t = i as f64 * dt;
            amplitude * (-((t - 2.0 * sigma).powi(2) / (sigma * sigma))).exp()
        })
        .collect()
}

/// Retained (cell, time) history: column t holds the full per-cell state
/// recorded at step t.
#[derive(Debug, Clone)]
pub struct SimulationGrid {
    cells: usize,
    steps: usize,
    data: Vec<Voxel>,
}

impl SimulationGrid {
    fn new(cells: usize, steps: usize) -> Self {
        Self {
            cells,
            steps,
            data: vec![Voxel::default(); cells * steps],
        }
    }

    /// Reuse a previous allocation when the shape is unchanged.
    pub(crate) fn reuse_or_new(previous: Option<Self>, cells: usize, steps: usize) -> Self {
        match previous {
            Some(grid) if grid.cells == cells && grid.steps == steps => grid,
            _ => Self::new(cells, steps),
        }
    }

    pub fn cells(&self) -> usize {
        self.cells
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Recorded state of `cell` at `step`.
    pub fn at(&self, cell: usize, step: usize) -> &Voxel {
        &self.data[step * self.cells + cell]
    }

    /// Pressure time series of one cell, in step order.
    pub fn pressure_series(&self, cell: usize) -> Vec<f64> {
        (0..self.steps)
            .map(|t| self.data[t * self.cells + cell].pressure)
            .collect()
    }

    fn column_mut(&mut self, step: usize) -> &mut [Voxel] {
        &mut self.data[step * self.cells..(step + 1) * self.cells]
    }
}

/// One full FDTD run over a voxelised lattice.
///
/// Each step runs, in order: the pressure update from the particle-velocity
/// divergence, the three velocity-component updates from the pressure
/// gradients, the absorbing face layer, the additive source injection, and
/// the snapshot into the simulation grid. The snapshot follows the
/// injection, so column t of the grid includes the excitation of step t.
pub struct AcousticSimulation {
    lattice: VoxelLattice,
    config: SimulationConfig,
    pulse: Vec<f64>,
    source_cell: usize,
    coefficient: f64,
    grid: SimulationGrid,
}

impl AcousticSimulation {
    pub fn new(
        lattice: VoxelLattice,
        source_cell: usize,
        config: SimulationConfig,
        previous_grid: Option<SimulationGrid>,
    ) -> PlResult<Self> {
        if config.steps == 0 {
            return Err(PlError::invalid("simulation needs at least one time step"));
        }
        if source_cell >= lattice.len() {
            return Err(PlError::invalid(format!(
                "source cell {source_cell} out of range for {} cells",
                lattice.len()
            )));
        }
        if (lattice.cell_size() - spatial_step()).abs() > 1e-9 {
            warn!(
                cell_size = lattice.cell_size(),
                required = spatial_step(),
                "lattice cell size differs from the step the update coefficients assume"
            );
        }

        let pulse = gaussian_pulse(config.steps, config.amplitude);
        let grid = SimulationGrid::reuse_or_new(previous_grid, lattice.len(), config.steps);
        Ok(Self {
            lattice,
            source_cell,
            coefficient: update_coefficient(),
            pulse,
            config,
            grid,
        })
    }

    /// Run all configured time steps.
    pub fn run(&mut self) {
        debug!(
            steps = self.config.steps,
            cells = self.lattice.len(),
            "starting FDTD run"
        );
        for t in 0..self.config.steps {
            self.step(t);
        }
    }

    fn step(&mut self, t: usize) {
        let counts = self.lattice.counts();
        let k = self.coefficient;

        update_pressure(&mut self.lattice.voxels, counts, k);
        update_velocity_x(&mut self.lattice.voxels, counts, k);
        update_velocity_y(&mut self.lattice.voxels, counts, k);
        update_velocity_z(&mut self.lattice.voxels, counts, k);
        if self.config.absorbing_faces {
            absorb_x_faces(&mut self.lattice.voxels, counts);
        }
        self.lattice.voxels[self.source_cell].pressure += self.pulse[t];
        self.grid.column_mut(t).copy_from_slice(&self.lattice.voxels);
    }

    pub fn lattice(&self) -> &VoxelLattice {
        &self.lattice
    }

    pub fn grid(&self) -> &SimulationGrid {
        &self.grid
    }

    pub fn pulse(&self) -> &[f64] {
        &self.pulse
    }

    /// Hand the lattice and the recorded history back to the owner.
    pub fn into_parts(self) -> (VoxelLattice, SimulationGrid) {
        (self.lattice, self.grid)
    }
}

/// Pressure update: `P <- beta * (P - K * div(V))` with the divergence taken
/// from the forward neighbours. Reads past the lattice edge see a
/// zero-initialised ghost neighbour.
fn update_pressure(voxels: &mut [Voxel], counts: [usize; 3], k: f64) {
    let [nx, ny, nz] = counts;
    let idx = |x: usize, y: usize, z: usize| x + y * nx + z * nx * ny;

    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let i = idx(x, y, z);
                let vx1 = if x + 1 < nx { voxels[idx(x + 1, y, z)].vx } else { 0.0 };
                let vy1 = if y + 1 < ny { voxels[idx(x, y + 1, z)].vy } else { 0.0 };
                let vz1 = if z + 1 < nz { voxels[idx(x, y, z + 1)].vz } else { 0.0 };

                let cell = voxels[i];
                let div = (vx1 - cell.vx) + (vy1 - cell.vy) + (vz1 - cell.vz);
                voxels[i].pressure = cell.beta * (cell.pressure - k * div);
            }
        }
    }
}

/// Velocity update along one axis for the face between `prev` and `this`.
///
/// In free air the update reduces to `V - K * grad(P)`. Across an air/wall
/// interface the admittance `Y = (1 - alpha) / (1 + alpha)` of each side
/// relates pressure to normal velocity, and the `beta(prev) - beta(this)`
/// factor flips the sign of the wall term depending on which side of the
/// interface the cell sits.
#[inline]
fn face_velocity(prev: &Voxel, this: &Voxel, velocity: f64, k: f64) -> f64 {
    let y_prev = (1.0 - prev.absorptivity) / (1.0 + prev.absorptivity);
    let y_this = (1.0 - this.absorptivity) / (1.0 + this.absorptivity);
    let grad = this.pressure - prev.pressure;
    let air_update = velocity - k * grad;
    let wall_update = (this.beta * y_prev + prev.beta * y_this)
        * (prev.pressure * prev.beta + this.pressure * this.beta);
    this.beta * prev.beta * air_update + (prev.beta - this.beta) * wall_update
}

fn update_velocity_x(voxels: &mut [Voxel], counts: [usize; 3], k: f64) {
    let [nx, ny, nz] = counts;
    let idx = |x: usize, y: usize, z: usize| x + y * nx + z * nx * ny;
    for z in 0..nz {
        for y in 0..ny {
            for x in 1..nx {
                let prev = voxels[idx(x - 1, y, z)];
                let this = voxels[idx(x, y, z)];
                voxels[idx(x, y, z)].vx = face_velocity(&prev, &this, this.vx, k);
            }
        }
    }
}

fn update_velocity_y(voxels: &mut [Voxel], counts: [usize; 3], k: f64) {
    let [nx, ny, nz] = counts;
    let idx = |x: usize, y: usize, z: usize| x + y * nx + z * nx * ny;
    for z in 0..nz {
        for y in 1..ny {
            for x in 0..nx {
                let prev = voxels[idx(x, y - 1, z)];
                let this = voxels[idx(x, y, z)];
                voxels[idx(x, y, z)].vy = face_velocity(&prev, &this, this.vy, k);
            }
        }
    }
}

fn update_velocity_z(voxels: &mut [Voxel], counts: [usize; 3], k: f64) {
    let [nx, ny, nz] = counts;
    let idx = |x: usize, y: usize, z: usize| x + y * nx + z * nx * ny;
    for z in 1..nz {
        for y in 0..ny {
            for x in 0..nx {
                let prev = voxels[idx(x, y, z - 1)];
                let this = voxels[idx(x, y, z)];
                voxels[idx(x, y, z)].vz = face_velocity(&prev, &this, this.vz, k);
            }
        }
    }
}

/// First-order Mur-style absorber on the two opposing x-faces, the fastest
/// axis of the cell index mapping. The face-normal velocity is pinned to the
/// local pressure (`v = -p` at x = 0, `v = +p` at x = X-1), which lets
/// outgoing waves leave instead of reflecting.
fn absorb_x_faces(voxels: &mut [Voxel], counts: [usize; 3]) {
    let [nx, ny, nz] = counts;
    let idx = |x: usize, y: usize, z: usize| x + y * nx + z * nx * ny;
    for z in 0..nz {
        for y in 0..ny {
            let lo = idx(0, y, z);
            voxels[lo].vx = -voxels[lo].pressure;
            let hi = idx(nx - 1, y, z);
            voxels[hi].vx = voxels[hi].pressure;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Vec3;

    /// All-air cubic lattice of n cells per axis at the solver's native step.
    fn air_lattice(n: usize) -> VoxelLattice {
        let h = spatial_step();
        VoxelLattice::build(Vec3::zeros(), Vec3::repeat(n as f64 * h), h).unwrap()
    }

    fn total_energy(voxels: &[Voxel]) -> f64 {
        voxels
            .iter()
            .map(|v| v.pressure * v.pressure + v.vx * v.vx + v.vy * v.vy + v.vz * v.vz)
            .sum()
    }

    #[test]
    fn test_physics_constants() {
        let dx = spatial_step();
        assert!((dx - (343.21 / 275.0) / 3.5).abs() < 1e-12);
        assert!((update_coefficient() - 1.0 / 1.5).abs() < 1e-12);
        // dt follows from dx and the CFL margin; the sampling rate is its
        // inverse, around 1.44 kHz.
        assert!(sampling_rate() > 1443.0 && sampling_rate() < 1445.0);
    }

    #[test]
    fn test_gaussian_pulse_shape() {
        let pulse = gaussian_pulse(30, 1.0);
        assert_eq!(pulse.len(), 30);
        // At t = 0 the pulse sits two sigmas before its peak.
        assert!((pulse[0] - (-4.0f64).exp()).abs() < 1e-12);
        // The peak lands where i*dt is closest to 2*sigma.
        let sigma = 1.0 / (0.5 * PI * MIN_FREQUENCY);
        let peak_step = (2.0 * sigma / time_step()).round() as usize;
        for (i, &sample) in pulse.iter().enumerate() {
            assert!(sample <= pulse[peak_step] + 1e-12, "sample {i} above peak");
        }
        assert!(pulse[peak_step] > 0.95);

        // Amplitude scales every sample.
        let doubled = gaussian_pulse(30, 2.0);
        for (a, b) in pulse.iter().zip(doubled.iter()) {
            assert!((b - 2.0 * a).abs() < 1e-12);
        }
    }

    #[test]
    fn test_first_steps_around_source() {
        let lattice = air_lattice(5);
        let source = lattice.index(2, 2, 2);
        let config = SimulationConfig {
            steps: 2,
            ..SimulationConfig::default()
        };
        let mut sim = AcousticSimulation::new(lattice, source, config, None).unwrap();
        let pulse0 = sim.pulse()[0];
        let k = update_coefficient();
        sim.run();

        let grid = sim.grid();
        let lattice = sim.lattice();

        // Step 0: only the injected pulse exists, velocities untouched.
        let at_source = grid.at(source, 0);
        assert!((at_source.pressure - pulse0).abs() < 1e-12);
        assert_eq!(at_source.vx, 0.0);
        assert_eq!(at_source.vy, 0.0);
        assert_eq!(at_source.vz, 0.0);

        // Step 1: the six faces around the source carry equal outgoing
        // velocity. The positive-side faces live on the neighbouring cells,
        // the negative-side faces on the source cell itself.
        let expected = k * pulse0;
        let xp = grid.at(lattice.index(3, 2, 2), 1).vx;
        let yp = grid.at(lattice.index(2, 3, 2), 1).vy;
        let zp = grid.at(lattice.index(2, 2, 3), 1).vz;
        let at_source = grid.at(source, 1);
        assert!((xp - expected).abs() < 1e-12);
        assert!((yp - expected).abs() < 1e-12);
        assert!((zp - expected).abs() < 1e-12);
        assert!((at_source.vx + expected).abs() < 1e-12);
        assert!((at_source.vy + expected).abs() < 1e-12);
        assert!((at_source.vz + expected).abs() < 1e-12);

        // A cell two steps away has seen nothing yet.
        assert_eq!(grid.at(lattice.index(0, 2, 2), 1).pressure, 0.0);
    }

    #[test]
    fn test_pressure_linearity() {
        let run = |amplitude: f64| {
            let lattice = air_lattice(5);
            let source = lattice.index(2, 2, 2);
            let config = SimulationConfig {
                steps: 6,
                amplitude,
                absorbing_faces: true,
            };
            let mut sim = AcousticSimulation::new(lattice, source, config, None).unwrap();
            sim.run();
            sim.into_parts().1
        };

        let base = run(1.0);
        let doubled = run(2.0);
        for t in 0..base.steps() {
            for cell in 0..base.cells() {
                let a = base.at(cell, t).pressure;
                let b = doubled.at(cell, t).pressure;
                assert!(
                    (b - 2.0 * a).abs() < 1e-9,
                    "cell {cell} at step {t}: {b} vs 2*{a}"
                );
            }
        }
    }

    #[test]
    fn test_reflex_symmetry() {
        // Source at the exact centre of an all-air cube: the pressure field
        // stays mirror-symmetric about every axis while the wavefront is
        // still inside the domain.
        let lattice = air_lattice(7);
        let source = lattice.index(3, 3, 3);
        let config = SimulationConfig {
            steps: 4,
            ..SimulationConfig::default()
        };
        let mut sim = AcousticSimulation::new(lattice, source, config, None).unwrap();
        sim.run();
        let (lattice, grid) = sim.into_parts();
        let [nx, ny, nz] = lattice.counts();

        for t in 0..grid.steps() {
            for z in 0..nz {
                for y in 0..ny {
                    for x in 0..nx {
                        let p = grid.at(lattice.index(x, y, z), t).pressure;
                        let px = grid.at(lattice.index(nx - 1 - x, y, z), t).pressure;
                        let py = grid.at(lattice.index(x, ny - 1 - y, z), t).pressure;
                        let pz = grid.at(lattice.index(x, y, nz - 1 - z), t).pressure;
                        assert!((p - px).abs() < 1e-9, "x mirror broken at t={t}");
                        assert!((p - py).abs() < 1e-9, "y mirror broken at t={t}");
                        assert!((p - pz).abs() < 1e-9, "z mirror broken at t={t}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_lossless_medium_keeps_energy_bounded() {
        // A smooth pressure blob in an all-air lattice with the absorber off:
        // the quadratic energy stays in a tight band. The same blob with the
        // absorbing faces on ends up strictly lower once the field has
        // reached the boundary.
        let blob_lattice = |absorbing: bool| {
            let mut lattice = air_lattice(9);
            let h = lattice.cell_size();
            let sigma = 2.0 * h;
            for voxel in lattice.voxels.iter_mut() {
                let r2 = voxel.world_pos.norm_squared();
                voxel.pressure = (-r2 / (2.0 * sigma * sigma)).exp();
            }
            let source = lattice.index(4, 4, 4);
            let config = SimulationConfig {
                steps: 8,
                amplitude: 0.0,
                absorbing_faces: absorbing,
            };
            AcousticSimulation::new(lattice, source, config, None).unwrap()
        };

        let mut lossless = blob_lattice(false);
        let initial = total_energy(lossless.lattice().voxels());
        lossless.run();
        let conserved = total_energy(lossless.lattice().voxels());
        assert!(conserved > 0.5 * initial, "energy vanished: {conserved}");
        assert!(conserved < 2.0 * initial, "energy grew: {conserved}");

        let mut absorbed = blob_lattice(true);
        absorbed.run();
        let drained = total_energy(absorbed.lattice().voxels());
        assert!(
            drained < conserved,
            "absorber retained energy: {drained} vs {conserved}"
        );
    }

    #[test]
    fn test_wall_cells_stay_silent() {
        let mut lattice = air_lattice(5);
        let wall = lattice.index(1, 2, 2);
        lattice.voxels[wall].beta = 0.0;
        lattice.voxels[wall].absorptivity = 0.75;

        let source = lattice.index(3, 2, 2);
        let config = SimulationConfig {
            steps: 6,
            ..SimulationConfig::default()
        };
        let mut sim = AcousticSimulation::new(lattice, source, config, None).unwrap();
        sim.run();
        let grid = sim.grid();
        for t in 0..grid.steps() {
            assert_eq!(grid.at(wall, t).pressure, 0.0, "wall gained pressure at t={t}");
        }
    }

    #[test]
    fn test_grid_reuse_and_series() {
        let grid = SimulationGrid::new(10, 4);
        let reused = SimulationGrid::reuse_or_new(Some(grid), 10, 4);
        assert_eq!(reused.cells(), 10);
        assert_eq!(reused.steps(), 4);

        let reshaped = SimulationGrid::reuse_or_new(Some(reused), 20, 4);
        assert_eq!(reshaped.cells(), 20);
        assert_eq!(reshaped.pressure_series(3).len(), 4);

        let err = AcousticSimulation::new(
            air_lattice(3),
            999,
            SimulationConfig::default(),
            None,
        );
        assert!(matches!(err, Err(PlError::InvalidParam(_))));
    }
}
