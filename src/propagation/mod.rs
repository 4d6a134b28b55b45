/*
    Tycho, a mission analysis executive
    Copyright (C) 2026-onwards Tycho contributors

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use crate::cosmic::SpaceObject;
use crate::linalg::DVector;
use crate::time::{Epoch, Unit};
use snafu::prelude::*;

mod rk;
pub use rk::RungeKutta4;

/// Errors raised while evaluating equations of motion.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DynamicsError {
    #[snafu(display("radius magnitude is {rmag} km, too close to the singularity"))]
    RadiusSingularity { rmag: f64 },
    #[snafu(display("state vector length {len} is not a multiple of 6"))]
    MalformedState { len: usize },
}

/// Errors raised while taking an integration step.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SteppingError {
    #[snafu(display("dynamics error during step: {source}"))]
    StepDynamics { source: DynamicsError },
    #[snafu(display(
        "requested step of {dt} s is below the minimum step of {min_step} s (not in final step mode)"
    ))]
    BelowMinStep { dt: f64, min_step: f64 },
}

/// Equations of motion for a stacked state vector (one 6-vector per vehicle).
/// The black box behind every propagator.
pub trait Dynamics: Send + Sync {
    fn eom(&self, elapsed: f64, state: &DVector<f64>) -> Result<DVector<f64>, DynamicsError>;
    fn clone_boxed(&self) -> Box<dyn Dynamics>;
}

/// Two body point mass dynamics about a single central body.
#[derive(Clone, Debug)]
pub struct TwoBody {
    pub gm: f64,
}

impl TwoBody {
    pub fn earth() -> Self {
        Self {
            gm: crate::cosmic::EARTH_GM,
        }
    }
}

impl Dynamics for TwoBody {
    fn eom(&self, _elapsed: f64, state: &DVector<f64>) -> Result<DVector<f64>, DynamicsError> {
        ensure!(
            state.len() % 6 == 0,
            MalformedStateSnafu { len: state.len() }
        );
        let mut dstate = DVector::zeros(state.len());
        for blk in 0..state.len() / 6 {
            let o = blk * 6;
            let rmag =
                (state[o].powi(2) + state[o + 1].powi(2) + state[o + 2].powi(2)).sqrt();
            ensure!(rmag > 1.0, RadiusSingularitySnafu { rmag });
            let k = -self.gm / rmag.powi(3);
            for i in 0..3 {
                dstate[o + i] = state[o + i + 3];
                dstate[o + i + 3] = k * state[o + i];
            }
        }
        Ok(dstate)
    }

    fn clone_boxed(&self) -> Box<dyn Dynamics> {
        Box::new(self.clone())
    }
}

/// Force free motion: positions advance linearly with the velocities. Mostly
/// useful to exercise the stop condition machinery against analytic crossings.
#[derive(Clone, Debug)]
pub struct ConstantVelocity;

impl Dynamics for ConstantVelocity {
    fn eom(&self, _elapsed: f64, state: &DVector<f64>) -> Result<DVector<f64>, DynamicsError> {
        ensure!(
            state.len() % 6 == 0,
            MalformedStateSnafu { len: state.len() }
        );
        let mut dstate = DVector::zeros(state.len());
        for blk in 0..state.len() / 6 {
            let o = blk * 6;
            for i in 0..3 {
                dstate[o + i] = state[o + i + 3];
            }
        }
        Ok(dstate)
    }

    fn clone_boxed(&self) -> Box<dyn Dynamics> {
        Box::new(self.clone())
    }
}

/// Owns the raw integration state for one group of space objects, plus the
/// single-step revert buffer that lets the executive undo a speculative step.
#[derive(Debug)]
pub struct StateContainer {
    dynamics: Box<dyn Dynamics>,
    objects: Vec<SpaceObject>,
    vector: DVector<f64>,
    elapsed: f64,
    base_epoch: Epoch,
    prev_vector: DVector<f64>,
    prev_elapsed: f64,
    dim: usize,
}

impl std::fmt::Debug for dyn Dynamics {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Dynamics")
    }
}

impl StateContainer {
    pub fn new(dynamics: Box<dyn Dynamics>, objects: Vec<SpaceObject>) -> Self {
        let dim = objects.iter().map(|o| o.dimension()).sum();
        let base_epoch = objects
            .first()
            .map(|o| o.epoch())
            .unwrap_or(Epoch::from_mjd_tai(0.0));
        let mut me = Self {
            dynamics,
            objects,
            vector: DVector::zeros(dim),
            elapsed: 0.0,
            base_epoch,
            prev_vector: DVector::zeros(dim),
            prev_elapsed: 0.0,
            dim,
        };
        me.update_initial_data();
        me
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Elapsed seconds since the base epoch.
    pub fn time(&self) -> f64 {
        self.elapsed
    }

    pub fn set_time(&mut self, elapsed: f64) {
        self.elapsed = elapsed;
    }

    pub fn base_epoch(&self) -> Epoch {
        self.base_epoch
    }

    pub fn objects(&self) -> &[SpaceObject] {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut [SpaceObject] {
        &mut self.objects
    }

    pub fn dynamics(&self) -> &dyn Dynamics {
        self.dynamics.as_ref()
    }

    pub fn vector(&self) -> &DVector<f64> {
        &self.vector
    }

    /// Reloads the integration vector and base epoch from the space objects.
    pub fn update_initial_data(&mut self) {
        let mut idx = 0;
        for obj in &self.objects {
            for sc in obj.spacecraft() {
                for i in 0..6 {
                    self.vector[idx + i] = sc.state[i];
                }
                idx += 6;
            }
        }
        if let Some(first) = self.objects.first() {
            self.base_epoch = first.epoch();
        }
        self.elapsed = 0.0;
        self.prev_vector.copy_from(&self.vector);
        self.prev_elapsed = self.elapsed;
    }

    /// Records the pre-step state so that exactly one step can be reverted.
    pub fn mark_previous(&mut self) {
        self.prev_vector.copy_from(&self.vector);
        self.prev_elapsed = self.elapsed;
    }

    /// Applies an integrated step: new vector, elapsed advanced by `dt` seconds.
    /// The pre-step state is recorded so [Self::revert_space_object] can undo it.
    pub fn apply_step(&mut self, dt: f64, new_vector: DVector<f64>) {
        self.mark_previous();
        self.vector = new_vector;
        self.elapsed += dt;
    }

    /// Overwrites the integration vector without touching the revert buffer.
    /// Integrators use this for the substeps inside one propagator level step.
    pub fn set_vector(&mut self, vector: DVector<f64>) {
        self.vector = vector;
    }

    /// Writes the integration vector back to the space objects at the given epoch.
    pub fn update_space_object(&mut self, epoch: Epoch) {
        let mut idx = 0;
        for obj in &mut self.objects {
            for sc in obj.spacecraft_mut() {
                for i in 0..6 {
                    sc.state[i] = self.vector[idx + i];
                }
                sc.epoch = epoch;
                idx += 6;
            }
        }
    }

    /// Undoes exactly one step: restores the pre-step vector and elapsed time,
    /// and writes the restored state back to the space objects.
    pub fn revert_space_object(&mut self) {
        self.vector.copy_from(&self.prev_vector);
        self.elapsed = self.prev_elapsed;
        let epoch = self.base_epoch + self.elapsed * Unit::Second;
        self.update_space_object(epoch);
    }

    /// Reloads the integration vector from the space objects after an external
    /// restore (clone buffer), realigning elapsed time with their epoch.
    pub fn update_from_space_object(&mut self) {
        let mut idx = 0;
        for obj in &self.objects {
            for sc in obj.spacecraft() {
                for i in 0..6 {
                    self.vector[idx + i] = sc.state[i];
                }
                idx += 6;
            }
        }
        if let Some(first) = self.objects.first() {
            self.elapsed = (first.epoch() - self.base_epoch).to_seconds();
        }
        self.prev_vector.copy_from(&self.vector);
        self.prev_elapsed = self.elapsed;
    }
}

/// The black box integrator capability the executive drives.
pub trait Propagator: Send {
    /// Take one natural step, forward or backward per the configured direction.
    fn step(&mut self, fm: &mut StateContainer) -> Result<(), SteppingError>;
    /// Take a step of exactly `dt` seconds (negative steps backward).
    fn step_by(&mut self, dt: f64, fm: &mut StateContainer) -> Result<(), SteppingError>;
    /// Signed size, in seconds, of the step actually taken.
    fn step_taken(&self) -> f64;
    /// In final step mode the minimum step floor is relaxed so that the
    /// landing step may be arbitrarily small.
    fn set_final_step(&mut self, enabled: bool);
    fn set_direction(&mut self, direction: f64);
    fn min_step(&self) -> f64;
    fn clone_boxed(&self) -> Box<dyn Propagator>;
}

/// A configured (propagator, dynamics) template, cloned into a live unit when
/// the executive initializes. The template itself is never stepped.
pub struct PropSetup {
    pub name: String,
    propagator: Box<dyn Propagator>,
    dynamics: Box<dyn Dynamics>,
}

impl PropSetup {
    pub fn new(name: &str, propagator: Box<dyn Propagator>, dynamics: Box<dyn Dynamics>) -> Self {
        Self {
            name: name.to_string(),
            propagator,
            dynamics,
        }
    }

    /// Instantiate a live (propagator, container) pair for the given bodies.
    pub fn instantiate(
        &self,
        objects: Vec<SpaceObject>,
    ) -> (Box<dyn Propagator>, StateContainer) {
        (
            self.propagator.clone_boxed(),
            StateContainer::new(self.dynamics.clone_boxed(), objects),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cosmic::Spacecraft;
    use crate::time::Epoch;
    use approx::assert_abs_diff_eq;

    fn container() -> StateContainer {
        let sc = Spacecraft::new(
            "Sat1",
            Epoch::from_gregorian_utc_at_midnight(2026, 1, 1),
            [7000.0, 0.0, 0.0, 0.0, 7.5, 0.0],
        );
        StateContainer::new(Box::new(ConstantVelocity), vec![SpaceObject::Spacecraft(sc)])
    }

    #[test]
    fn revert_undoes_exactly_one_step() {
        let mut fm = container();
        let before = fm.vector().clone();
        let mut stepped = before.clone();
        stepped[0] += 75.0;
        fm.apply_step(10.0, stepped);
        assert_abs_diff_eq!(fm.time(), 10.0);
        fm.revert_space_object();
        assert_abs_diff_eq!(fm.time(), 0.0);
        assert_abs_diff_eq!(fm.vector()[0], before[0]);
    }

    #[test]
    fn update_from_space_object_realigns_elapsed() {
        let mut fm = container();
        let base = fm.base_epoch();
        for obj in fm.objects_mut() {
            for sc in obj.spacecraft_mut() {
                sc.epoch = base + 42.0 * Unit::Second;
                sc.state[0] = 7100.0;
            }
        }
        fm.update_from_space_object();
        assert_abs_diff_eq!(fm.time(), 42.0, epsilon = 1e-9);
        assert_abs_diff_eq!(fm.vector()[0], 7100.0);
    }

    #[test]
    fn two_body_eom_points_inward() {
        let dyn_ = TwoBody::earth();
        let state = DVector::from_vec(vec![7000.0, 0.0, 0.0, 0.0, 7.5, 0.0]);
        let dstate = dyn_.eom(0.0, &state).unwrap();
        assert!(dstate[3] < 0.0, "acceleration must point toward the body");
        assert_abs_diff_eq!(dstate[1], 7.5);
    }
}
