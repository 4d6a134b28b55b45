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

use super::{BelowMinStepSnafu, Propagator, StateContainer, StepDynamicsSnafu, SteppingError};
use crate::linalg::DVector;
use snafu::prelude::*;

/// Classic fixed step fourth order Runge-Kutta integrator.
///
/// Explicit steps larger than the configured step size are split into
/// substeps of at most that size so that landing steps do not lose accuracy.
#[derive(Clone, Debug)]
pub struct RungeKutta4 {
    /// Natural step size, in seconds, always positive.
    step_size: f64,
    /// Smallest explicit step accepted outside of final step mode.
    min_step: f64,
    direction: f64,
    final_step: bool,
    last_step: f64,
}

impl RungeKutta4 {
    pub fn new(step_size: f64) -> Self {
        assert!(step_size > 0.0, "step size must be strictly positive");
        Self {
            step_size,
            min_step: 0.0,
            direction: 1.0,
            final_step: false,
            last_step: 0.0,
        }
    }

    pub fn with_min_step(mut self, min_step: f64) -> Self {
        self.min_step = min_step;
        self
    }

    /// One RK4 stage evaluation over `h` seconds from `(t, y)`.
    fn rk4_step(
        &self,
        fm: &StateContainer,
        t: f64,
        y: &DVector<f64>,
        h: f64,
    ) -> Result<DVector<f64>, SteppingError> {
        let dynamics = fm.dynamics();
        let k1 = dynamics.eom(t, y).context(StepDynamicsSnafu)?;
        let k2 = dynamics
            .eom(t + h / 2.0, &(y + (h / 2.0) * &k1))
            .context(StepDynamicsSnafu)?;
        let k3 = dynamics
            .eom(t + h / 2.0, &(y + (h / 2.0) * &k2))
            .context(StepDynamicsSnafu)?;
        let k4 = dynamics
            .eom(t + h, &(y + h * &k3))
            .context(StepDynamicsSnafu)?;
        Ok(y + (h / 6.0) * (k1 + 2.0 * k2 + 2.0 * k3 + k4))
    }

    fn integrate(&mut self, dt: f64, fm: &mut StateContainer) -> Result<(), SteppingError> {
        if dt == 0.0 {
            self.last_step = 0.0;
            return Ok(());
        }
        fm.mark_previous();
        let substeps = (dt.abs() / self.step_size).ceil().max(1.0) as usize;
        let h = dt / substeps as f64;
        let mut t = fm.time();
        let mut y = fm.vector().clone();
        for _ in 0..substeps {
            y = self.rk4_step(fm, t, &y, h)?;
            t += h;
        }
        fm.set_vector(y);
        fm.set_time(fm.time() + dt);
        self.last_step = dt;
        Ok(())
    }
}

impl Propagator for RungeKutta4 {
    fn step(&mut self, fm: &mut StateContainer) -> Result<(), SteppingError> {
        self.integrate(self.direction * self.step_size, fm)
    }

    fn step_by(&mut self, dt: f64, fm: &mut StateContainer) -> Result<(), SteppingError> {
        if !self.final_step && dt != 0.0 {
            ensure!(
                dt.abs() >= self.min_step,
                BelowMinStepSnafu {
                    dt,
                    min_step: self.min_step
                }
            );
        }
        self.integrate(dt, fm)
    }

    fn step_taken(&self) -> f64 {
        self.last_step
    }

    fn set_final_step(&mut self, enabled: bool) {
        self.final_step = enabled;
    }

    fn set_direction(&mut self, direction: f64) {
        self.direction = if direction < 0.0 { -1.0 } else { 1.0 };
    }

    fn min_step(&self) -> f64 {
        self.min_step
    }

    fn clone_boxed(&self) -> Box<dyn Propagator> {
        Box::new(self.clone())
    }
}
