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

use super::StopVariable;
use crate::cosmic::Spacecraft;
use crate::utils::{lagrange_inverse, put_in_range};
use snafu::prelude::*;
use std::fmt;

/// Samples kept for the cubic time-to-crossing estimate.
const BUFFER_SIZE: usize = 4;

/// Eccentricity floor below which apsis crossings are ignored: osculation
/// noise on a near circular orbit can mask the true apsis.
const APSIS_ECC_FLOOR: f64 = 1.0e-6;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StopConditionError {
    #[snafu(display("stopping condition '{name}' has no tracked vehicle bound"))]
    UnboundCondition { name: String },
    #[snafu(display("unable to interpolate a stop epoch for '{name}'"))]
    InterpolationFailed { name: String },
}

/// Tracks one scalar quantity against a goal value during propagation.
///
/// `evaluate` is idempotent for an unchanged state but mutates the previous
/// value cache and, through `add_to_buffer`, the interpolation ring buffer: it
/// is not a pure function across calls.
#[derive(Clone, Debug)]
pub struct StopCondition {
    /// Conditions with an empty name are transient: the executive prunes them
    /// once they have stopped a run.
    pub name: String,
    sat_name: String,
    variable: StopVariable,
    goal: f64,
    /// When set, this variable is evaluated in place of the fixed goal, both
    /// for triggering and for convergence measurement.
    goal_variable: Option<StopVariable>,
    backwards: bool,

    current_value: f64,
    previous_value: f64,
    previous_epoch: f64,
    stop_epoch: f64,
    stop_interval: f64,
    num_valid_points: usize,
    skip_next: bool,
    epoch_buffer: [f64; BUFFER_SIZE],
    value_buffer: [f64; BUFFER_SIZE],
}

impl StopCondition {
    pub fn new(name: &str, sat_name: &str, variable: StopVariable, goal: f64) -> Self {
        Self {
            name: name.to_string(),
            sat_name: sat_name.to_string(),
            variable,
            goal,
            goal_variable: None,
            backwards: false,
            current_value: 0.0,
            previous_value: 0.0,
            previous_epoch: 0.0,
            stop_epoch: 0.0,
            stop_interval: 0.0,
            num_valid_points: 0,
            skip_next: false,
            epoch_buffer: [0.0; BUFFER_SIZE],
            value_buffer: [0.0; BUFFER_SIZE],
        }
    }

    /// Stop after `secs` seconds of propagation.
    pub fn elapsed_secs(sat_name: &str, secs: f64) -> Self {
        Self::new(
            &format!("StopOn{sat_name}.ElapsedSecs"),
            sat_name,
            StopVariable::ElapsedSecs,
            secs,
        )
    }

    /// Stop at the next apoapsis passage. Transient (empty name): pruned after use.
    pub fn apoapsis(sat_name: &str) -> Self {
        Self::new("", sat_name, StopVariable::Apoapsis, 0.0)
    }

    /// Stop at the next periapsis passage. Transient (empty name): pruned after use.
    pub fn periapsis(sat_name: &str) -> Self {
        Self::new("", sat_name, StopVariable::Periapsis, 0.0)
    }

    /// Track the goal from another variable instead of a fixed value.
    pub fn with_goal_variable(mut self, goal_variable: StopVariable) -> Self {
        self.goal_variable = Some(goal_variable);
        self
    }

    pub fn sat_name(&self) -> &str {
        &self.sat_name
    }

    pub fn variable(&self) -> StopVariable {
        self.variable
    }

    pub fn set_prop_direction(&mut self, direction: f64) {
        self.backwards = direction < 0.0;
    }

    /// Binds and validates the condition ahead of a propagation cycle.
    pub fn initialize(&mut self) -> Result<(), StopConditionError> {
        ensure!(
            !self.sat_name.is_empty(),
            UnboundConditionSnafu {
                name: self.name.clone()
            }
        );
        self.reset();
        Ok(())
    }

    /// Clears per-cycle state. The goal and the binding survive.
    pub fn reset(&mut self) {
        self.num_valid_points = 0;
        self.skip_next = false;
        self.stop_interval = 0.0;
        self.stop_epoch = 0.0;
        self.epoch_buffer = [0.0; BUFFER_SIZE];
        self.value_buffer = [0.0; BUFFER_SIZE];
    }

    /// Forces the next `evaluate` to report "not triggered". Used to suppress
    /// an immediate re-trigger on the very first step after a stop, when the
    /// tracked value still sits exactly at the goal. Self clearing after one
    /// evaluation.
    pub fn skip_evaluation(&mut self, skip: bool) {
        self.skip_next = skip;
    }

    /// The goal, substituting the evaluated goal variable when one is bound.
    pub fn get_stop_goal(&self, sc: &Spacecraft, epoch: f64) -> f64 {
        match self.goal_variable {
            Some(var) => var.evaluate(sc, epoch),
            None => self.goal,
        }
    }

    pub fn is_time_condition(&self) -> bool {
        self.variable.is_time_based()
    }

    pub fn is_cyclic_parameter(&self) -> bool {
        self.variable.is_cyclic()
    }

    /// Whether an apsis trigger is physically meaningful right now: the orbit
    /// must be eccentric enough and R dot V must approach the crossing from
    /// the correct side for the propagation direction.
    fn check_on_apsis(&self, sc: &Spacecraft, goal: f64) -> bool {
        if sc.ecc() < APSIS_ECC_FLOOR {
            return false;
        }
        if self.variable.is_apoapsis() {
            (self.backwards && self.previous_value <= goal)
                || (!self.backwards && self.previous_value >= goal)
        } else {
            (self.backwards && self.previous_value >= goal)
                || (!self.backwards && self.previous_value <= goal)
        }
    }

    /// Remaps the goal into its cycle and the current/previous values into the
    /// half cycle branch nearest the goal. Returns whether the value is close
    /// enough to the goal for a crossing test to be meaningful.
    fn check_cyclic(&mut self, value: &mut f64, goal: &mut f64) -> bool {
        if let Some((min, max)) = self.variable.cyclic_range() {
            let range2 = (max - min) / 2.0;
            *goal = put_in_range(*goal, min, max);
            *value = put_in_range(*value, *goal - range2, *goal + range2);
            self.previous_value = put_in_range(self.previous_value, *goal - range2, *goal + range2);
            (*goal - *value).abs() < range2 / 2.0
        } else {
            false
        }
    }

    /// Recomputes the tracked value and reports whether it crossed the goal
    /// since the previous evaluation. `epoch` is the elapsed time, in seconds,
    /// of the propagation cycle.
    pub fn evaluate(&mut self, sc: &Spacecraft, epoch: f64) -> bool {
        let mut goal = self.get_stop_goal(sc, epoch);
        let mut value = self.variable.evaluate(sc, epoch);
        self.current_value = value;

        if self.skip_next {
            self.skip_next = false;
            self.goal = goal;
            self.previous_value = value;
            self.previous_epoch = epoch;
            self.num_valid_points += 1;
            return false;
        }

        let mut ready = true;
        if self.is_cyclic_parameter() {
            ready = self.check_cyclic(&mut value, &mut goal);
            if !ready {
                self.previous_value = value;
                self.previous_epoch = epoch;
            }
        }
        if self.variable.is_apoapsis() || self.variable.is_periapsis() {
            ready = self.check_on_apsis(sc, goal);
            if !ready {
                self.previous_value = value;
                self.previous_epoch = epoch;
            }
        }

        // The first valid point only seeds the previous value cache
        if self.num_valid_points == 0 {
            self.goal = goal;
            self.previous_value = value;
            self.previous_epoch = epoch;
            self.num_valid_points += 1;
            return false;
        }

        let mut goal_met = false;
        if !self.is_time_condition() {
            let min = self.previous_value.min(value);
            let max = self.previous_value.max(value);
            if min != max && ready {
                if goal >= min && goal <= max {
                    goal_met = true;
                    self.stop_interval = epoch - self.previous_epoch;
                } else {
                    self.previous_value = value;
                    self.previous_epoch = epoch;
                }
            }
        } else {
            let prev_diff = self.previous_value - goal;
            let curr_diff = value - goal;
            let direction = if curr_diff - prev_diff > 0.0 { 1.0 } else { -1.0 };

            if self.num_valid_points == 1
                && ((2.0 * goal - value - self.previous_value) * direction) < 0.0
            {
                warn!(
                    "time based stopping condition '{}' = {} will never be satisfied",
                    self.name, goal
                );
            }

            if curr_diff * direction >= 0.0 && prev_diff * direction <= 0.0 {
                goal_met = true;
                self.stop_interval = epoch - self.previous_epoch;
            } else {
                self.previous_value = value;
                self.previous_epoch = epoch;
            }
        }

        // The working goal (evaluated goal variable, cyclic remap) is kept so
        // that the stop epoch estimate measures against the same quantity
        self.goal = goal;
        self.num_valid_points += 1;
        goal_met
    }

    /// Appends a (time, value) sample to the interpolation ring buffer.
    /// Returns true once the buffer is full and brackets the goal, meaning a
    /// stop epoch estimate is available through [Self::get_stop_epoch].
    ///
    /// Time conditions need no interpolation; they always report true.
    pub fn add_to_buffer(&mut self, sc: &Spacecraft, epoch: f64, is_initial_point: bool) -> bool {
        if self.is_time_condition() {
            return true;
        }

        let mut goal = self.get_stop_goal(sc, epoch);
        let mut value = self.variable.evaluate(sc, epoch);
        if self.is_cyclic_parameter() && !self.check_cyclic(&mut value, &mut goal) {
            return false;
        }

        if is_initial_point {
            // Seed with the cached pre-trigger point at the internal time origin
            self.num_valid_points = 1;
            self.epoch_buffer = [0.0; BUFFER_SIZE];
            self.value_buffer = [0.0; BUFFER_SIZE];
            self.value_buffer[BUFFER_SIZE - 1] = self.previous_value;
            self.epoch_buffer[BUFFER_SIZE - 1] = 0.0;
        }

        // Roll the ring buffer to make room for the newest sample
        for i in 0..BUFFER_SIZE - 1 {
            self.epoch_buffer[i] = self.epoch_buffer[i + 1];
            self.value_buffer[i] = self.value_buffer[i + 1];
        }
        self.epoch_buffer[BUFFER_SIZE - 1] = epoch;
        self.value_buffer[BUFFER_SIZE - 1] = value;
        self.num_valid_points += 1;

        if self.num_valid_points < BUFFER_SIZE {
            return false;
        }

        let min = self.value_buffer.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = self
            .value_buffer
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        if goal >= min && goal <= max {
            if let Some(stop_epoch) = lagrange_inverse(&self.value_buffer, &self.epoch_buffer, goal)
            {
                self.stop_epoch = stop_epoch;
                return true;
            }
        }
        false
    }

    /// Time to step, in seconds, to reach the crossing.
    ///
    /// Exact for time conditions; interpolated from the ring buffer otherwise
    /// (an error if the buffer never bracketed the goal).
    pub fn get_stop_epoch(&mut self) -> Result<f64, StopConditionError> {
        if self.is_time_condition() {
            let dt = (self.goal - self.previous_value) * self.variable.time_multiplier();
            return Ok(dt);
        }

        let goal = self.goal;
        if let Some(stop_epoch) = lagrange_inverse(&self.value_buffer, &self.epoch_buffer, goal) {
            self.stop_epoch = stop_epoch;
            Ok(stop_epoch)
        } else {
            InterpolationFailedSnafu {
                name: self.name.clone(),
            }
            .fail()
        }
    }

    /// Width, in seconds, of the step that bracketed the crossing. Zero if the
    /// crossing landed exactly on the just evaluated epoch.
    pub fn get_stop_interval(&self) -> f64 {
        self.stop_interval
    }

    /// Goal minus achieved, with cyclic values remapped into the branch
    /// nearest the goal.
    pub fn get_stop_difference(&self, sc: &Spacecraft, epoch: f64) -> f64 {
        let goal = self.get_stop_goal(sc, epoch);
        let mut achieved = self.variable.evaluate(sc, epoch);
        if let Some((min, max)) = self.variable.cyclic_range() {
            let delta = (max - min) * 0.5;
            achieved = put_in_range(achieved, goal - delta, goal + delta);
        }
        goal - achieved
    }

    /// The tracked value at the previous evaluation.
    pub fn get_stop_value(&self) -> f64 {
        self.previous_value
    }
}

impl fmt::Display for StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = if self.name.is_empty() {
            "(transient)"
        } else {
            &self.name
        };
        write!(
            f,
            "{name}: {}.{} = {} {}",
            self.sat_name,
            self.variable,
            self.goal,
            self.variable.unit()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Epoch;
    use approx::assert_abs_diff_eq;

    fn sat_at(x: f64, vx: f64) -> Spacecraft {
        Spacecraft::new(
            "Sat1",
            Epoch::from_gregorian_utc_at_midnight(2026, 1, 1),
            [x, 0.0, 0.0, vx, 0.0, 0.0],
        )
    }

    #[test]
    fn first_point_never_triggers() {
        let mut cond = StopCondition::elapsed_secs("Sat1", 0.0);
        let sc = sat_at(7000.0, 0.0);
        // Value already exactly at the goal, but the first point only seeds
        assert!(!cond.evaluate(&sc, 0.0));
    }

    #[test]
    fn elapsed_secs_triggers_on_crossing() {
        let mut cond = StopCondition::elapsed_secs("Sat1", 120.0);
        let sc = sat_at(7000.0, 0.0);
        assert!(!cond.evaluate(&sc, 0.0));
        assert!(!cond.evaluate(&sc, 60.0));
        assert!(cond.evaluate(&sc, 150.0));
        assert_abs_diff_eq!(cond.get_stop_interval(), 90.0);
        // Time conditions know the remaining time exactly
        assert_abs_diff_eq!(cond.get_stop_epoch().unwrap(), 60.0);
    }

    #[test]
    fn value_condition_triggers_on_bracket() {
        let mut cond = StopCondition::new("xcross", "Sat1", StopVariable::X, 7100.0);
        assert!(!cond.evaluate(&sat_at(7000.0, 1.0), 0.0));
        assert!(!cond.evaluate(&sat_at(7050.0, 1.0), 50.0));
        assert!(cond.evaluate(&sat_at(7150.0, 1.0), 150.0));
        assert_abs_diff_eq!(cond.get_stop_interval(), 100.0);
    }

    #[test]
    fn skip_suppresses_exactly_one_evaluation() {
        let mut cond = StopCondition::new("xcross", "Sat1", StopVariable::X, 7100.0);
        assert!(!cond.evaluate(&sat_at(7000.0, 1.0), 0.0));
        cond.skip_evaluation(true);
        // This would have triggered without the skip
        assert!(!cond.evaluate(&sat_at(7150.0, 1.0), 150.0));
        // The next crossing is detected again
        assert!(cond.evaluate(&sat_at(7050.0, -1.0), 250.0));
    }

    #[test]
    fn ring_buffer_brackets_then_interpolates() {
        // x(t) = 7000 + t, goal x = 7102.5 crossed at t = 102.5
        let mut cond = StopCondition::new("xcross", "Sat1", StopVariable::X, 7102.5);
        assert!(!cond.evaluate(&sat_at(7000.0, 1.0), 0.0));
        assert!(cond.evaluate(&sat_at(7200.0, 1.0), 200.0));

        assert!(!cond.add_to_buffer(&sat_at(7050.0, 1.0), 50.0, true));
        assert!(!cond.add_to_buffer(&sat_at(7100.0, 1.0), 100.0, false));
        assert!(cond.add_to_buffer(&sat_at(7150.0, 1.0), 150.0, false));
        assert_abs_diff_eq!(cond.get_stop_epoch().unwrap(), 102.5, epsilon = 1e-9);
    }

    #[test]
    fn reset_clears_cycle_state_but_keeps_goal() {
        let mut cond = StopCondition::elapsed_secs("Sat1", 120.0);
        let sc = sat_at(7000.0, 0.0);
        cond.evaluate(&sc, 0.0);
        cond.evaluate(&sc, 150.0);
        cond.reset();
        // First point after reset seeds again rather than triggering
        assert!(!cond.evaluate(&sc, 130.0));
    }

    #[test]
    fn unbound_condition_fails_initialize() {
        let mut cond = StopCondition::new("orphan", "", StopVariable::X, 0.0);
        assert!(cond.initialize().is_err());
    }

    #[test]
    fn cyclic_difference_wraps_to_nearest_branch() {
        let cond = StopCondition::new("ta", "Sat1", StopVariable::TrueAnomaly, 0.0);
        // A spacecraft just shy of the 360 -> 0 wrap
        let sc = Spacecraft::new(
            "Sat1",
            Epoch::from_gregorian_utc_at_midnight(2026, 1, 1),
            [-2436.45, -2436.45, 6891.037, 5.088_611, -5.088_611, 0.0],
        );
        let diff = cond.get_stop_difference(&sc, 0.0);
        // Remapped into [-180, 180) around the goal, never near 360
        assert!(diff.abs() <= 180.0);
    }
}
