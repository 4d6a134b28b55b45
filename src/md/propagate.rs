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

use super::stopcond::{StopCondition, StopConditionError};
use crate::cosmic::Spacecraft;
use crate::propagation::{PropSetup, Propagator, StateContainer, SteppingError};
use crate::publish::{Publisher, StreamId};
use crate::time::{Epoch, Unit};
use crate::utils::{put_in_range, round_to_quantum};
use crate::SpaceObject;
use snafu::prelude::*;
use std::fmt;
use typed_builder::TypedBuilder;

/// Secant refinement budget before escalating to bisection.
const SECANT_MAX_ITER: usize = 50;
/// Bisection budget: one halving per bit of a double's mantissa.
const BISECTION_MAX_ITER: usize = 52;
/// Exploratory sub-steps available to bracket a crossing for interpolation.
const INTERP_MAX_SUBSTEPS: usize = 8;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExecError {
    #[snafu(display("the command must be initialized before execution"))]
    NotInitialized,
    #[snafu(display("no propagation units are configured"))]
    NoPropUnits,
    #[snafu(display("stopping condition '{condition}' tracks unknown vehicle '{sat}'"))]
    UnknownStopSat { condition: String, sat: String },
    #[snafu(display(
        "synchronized propagation requires matching epochs, but '{unit_a}' and '{unit_b}' differ by {delta_days} days"
    ))]
    EpochMismatch {
        unit_a: String,
        unit_b: String,
        delta_days: f64,
    },
    #[snafu(display("stop tolerance must be strictly positive, got {value}"))]
    InvalidStopTolerance { value: f64 },
    #[snafu(display("unknown propagation mode '{mode}'"))]
    InvalidMode { mode: String },
    #[snafu(display("stepping failed on unit '{unit}': {source}"))]
    Stepping { unit: String, source: SteppingError },
    #[snafu(display("{source}"))]
    StopEpoch { source: StopConditionError },
    #[snafu(display(
        "could not establish a stopping step for condition '{condition}': the tracked parameter may be flat or the condition malformed"
    ))]
    RootFindingFailed { condition: String },
}

/// How the units of a Propagate command advance relative to each other.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PropagationMode {
    /// Every unit takes its own natural step.
    Independent,
    /// All units are forced to match the first unit's step, keeping their
    /// elapsed times identical.
    Synchronized,
    /// Independent stepping, backward in time.
    BackProp,
}

impl PropagationMode {
    /// Parses the scriptable mode string: empty means independent.
    pub fn from_mode_str(mode: &str) -> Option<Self> {
        match mode {
            "" => Some(Self::Independent),
            "Synchronized" => Some(Self::Synchronized),
            "BackProp" => Some(Self::BackProp),
            _ => None,
        }
    }

    pub fn mode_str(&self) -> &'static str {
        match self {
            Self::Independent => "",
            Self::Synchronized => "Synchronized",
            Self::BackProp => "BackProp",
        }
    }
}

/// Tunable knobs of the executive.
#[derive(Clone, Copy, Debug, TypedBuilder)]
#[builder(doc)]
pub struct ExecOpts {
    #[builder(default = PropagationMode::Independent)]
    pub mode: PropagationMode,
    /// Steps between cooperative yields to the caller. Zero disables yielding.
    #[builder(default = 30)]
    pub interrupt_check_frequency: u32,
    /// Tolerance on value based stopping conditions, in tracked value units.
    #[builder(default = 1e-7)]
    pub stop_accuracy: f64,
    /// Tolerance on time based stopping conditions, in seconds.
    #[builder(default = 1e-6)]
    pub time_accuracy: f64,
    /// Window within which a just-stopped condition is suppressed on the
    /// first evaluation of the next run.
    #[builder(default = 1e-4)]
    pub first_step_tolerance: f64,
}

impl Default for ExecOpts {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// What `execute` handed back: either the command yielded mid-cycle for the
/// caller's event loop and must be re-entered, or the cycle finished.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExecControl {
    /// Still in progress: call `execute` again to resume.
    Yielded,
    /// The propagation cycle is complete; the successor command may run.
    Completed,
}

/// One live (propagator, state container) pair bound to a named body group.
pub struct PropUnit {
    pub name: String,
    propagator: Box<dyn Propagator>,
    container: StateContainer,
    base_epoch: Epoch,
    elapsed: f64,
    curr_epoch: Epoch,
    dim: usize,
    stream_id: StreamId,
}

impl PropUnit {
    /// Seconds since the base epoch for the current cycle.
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    pub fn base_epoch(&self) -> Epoch {
        self.base_epoch
    }

    pub fn curr_epoch(&self) -> Epoch {
        self.curr_epoch
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn container(&self) -> &StateContainer {
        &self.container
    }

    /// Realigns elapsed time and the current epoch with the container, and
    /// writes the integrated state back to the space objects.
    fn sync_from_container(&mut self) {
        self.elapsed = self.container.time();
        self.curr_epoch = self.base_epoch + self.elapsed * Unit::Second;
        self.container.update_space_object(self.curr_epoch);
    }

    /// Same realignment without the write back, for paths where the container
    /// has already restored the space objects itself.
    fn sync_elapsed(&mut self) {
        self.elapsed = self.container.time();
        self.curr_epoch = self.base_epoch + self.elapsed * Unit::Second;
    }
}

/// The Propagate command: advances every configured unit through time until a
/// stopping condition triggers, then lands exactly on the crossing.
///
/// Execution is re-entrant: with a non zero interrupt check frequency,
/// [Propagate::execute] periodically returns [ExecControl::Yielded] with all
/// in-flight state persisted, and the caller resumes by calling `execute`
/// again. [Propagate::run_complete] force-resets that state, for both normal
/// completion and abort.
pub struct Propagate {
    pub name: String,
    opts: ExecOpts,
    templates: Vec<(PropSetup, Vec<SpaceObject>)>,
    units: Vec<PropUnit>,
    stop_conds: Vec<StopCondition>,
    direction: f64,

    initialized: bool,
    in_progress: bool,
    has_fired: bool,
    stop_cond_met: bool,
    single_step_mode: bool,
    interrupt_count: u32,
    step_count: u64,
    stop_interval: f64,
    step_brackets: [f64; 2],
    triggers: Vec<usize>,
    stopper_name: Option<String>,
    sat_buffer: Vec<SpaceObject>,
    summary: String,
}

impl Propagate {
    pub fn new(name: &str, opts: ExecOpts) -> Self {
        Self {
            name: name.to_string(),
            opts,
            templates: Vec::new(),
            units: Vec::new(),
            stop_conds: Vec::new(),
            direction: 1.0,
            initialized: false,
            in_progress: false,
            has_fired: false,
            stop_cond_met: false,
            single_step_mode: false,
            interrupt_count: 0,
            step_count: 0,
            stop_interval: 0.0,
            step_brackets: [0.0, 0.0],
            triggers: Vec::new(),
            stopper_name: None,
            sat_buffer: Vec::new(),
            summary: String::new(),
        }
    }

    /// Configures a propagation unit template: the setup is cloned into a
    /// live unit at `initialize`.
    pub fn add_prop_setup(&mut self, setup: PropSetup, objects: Vec<SpaceObject>) {
        self.templates.push((setup, objects));
        self.initialized = false;
    }

    pub fn add_stop_condition(&mut self, cond: StopCondition) {
        self.stop_conds.push(cond);
    }

    /// Value based stop tolerance; rejected at set time if not positive.
    pub fn set_stop_accuracy(&mut self, accuracy: f64) -> Result<(), ExecError> {
        ensure!(
            accuracy > 0.0,
            InvalidStopToleranceSnafu { value: accuracy }
        );
        self.opts.stop_accuracy = accuracy;
        Ok(())
    }

    /// Sets the propagation mode from its scriptable string form.
    pub fn set_mode_str(&mut self, mode: &str) -> Result<(), ExecError> {
        self.opts.mode = PropagationMode::from_mode_str(mode).context(InvalidModeSnafu { mode })?;
        Ok(())
    }

    pub fn set_interrupt_check_frequency(&mut self, freq: u32) {
        self.opts.interrupt_check_frequency = freq;
    }

    pub fn set_backward(&mut self, backward: bool) {
        self.direction = if backward { -1.0 } else { 1.0 };
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn has_fired(&self) -> bool {
        self.has_fired
    }

    pub fn units(&self) -> &[PropUnit] {
        &self.units
    }

    /// Finds a tracked vehicle by name, across all units.
    pub fn spacecraft(&self, name: &str) -> Option<&Spacecraft> {
        for unit in &self.units {
            for obj in unit.container.objects() {
                for sc in obj.spacecraft() {
                    if sc.name == name {
                        return Some(sc);
                    }
                }
            }
        }
        None
    }

    /// Instantiates units from their templates, binds the stopping conditions
    /// and registers one publisher stream per unit.
    pub fn initialize(&mut self, publisher: &mut dyn Publisher) -> Result<(), ExecError> {
        ensure!(!self.templates.is_empty(), NoPropUnitsSnafu);
        self.units.clear();
        for (setup, objects) in &self.templates {
            let (propagator, container) = setup.instantiate(objects.clone());
            let base_epoch = container.base_epoch();
            let dim = container.dimension();
            let owners: Vec<String> = objects.iter().map(|o| o.name().to_string()).collect();
            let mut elements = Vec::new();
            for obj in objects {
                for sc in obj.spacecraft() {
                    for el in ["x", "y", "z", "vx", "vy", "vz"] {
                        elements.push(format!("{}.{el}", sc.name));
                    }
                }
            }
            let stream_id = publisher.register(&owners, &elements);
            self.units.push(PropUnit {
                name: setup.name.clone(),
                propagator,
                container,
                base_epoch,
                elapsed: 0.0,
                curr_epoch: base_epoch,
                dim,
                stream_id,
            });
        }

        for cond in &mut self.stop_conds {
            cond.initialize().context(StopEpochSnafu)?;
        }
        // Every condition must track a vehicle some unit propagates
        for idx in 0..self.stop_conds.len() {
            self.tracked_state(idx)?;
        }

        info!(
            "'{}' initialized with {} unit(s) and {} stopping condition(s)",
            self.name,
            self.units.len(),
            self.stop_conds.len()
        );
        self.initialized = true;
        self.has_fired = false;
        self.in_progress = false;
        Ok(())
    }

    /// Runs (or resumes) the propagation cycle. See [ExecControl].
    pub fn execute(&mut self, publisher: &mut dyn Publisher) -> Result<ExecControl, ExecError> {
        match self.execute_inner(publisher) {
            Ok(ctrl) => Ok(ctrl),
            Err(e) => {
                // A failed cycle cannot be resumed
                self.in_progress = false;
                Err(e)
            }
        }
    }

    fn execute_inner(&mut self, publisher: &mut dyn Publisher) -> Result<ExecControl, ExecError> {
        ensure!(self.initialized, NotInitializedSnafu);

        if !self.in_progress {
            self.prepare_to_propagate()?;

            // Seed the conditions with the as-prepared state so that "already
            // past the goal" is detected, and suppress for one evaluation any
            // condition that stopped the previous cycle and still sits on its
            // goal, lest it re-trigger at elapsed time zero.
            for idx in 0..self.stop_conds.len() {
                let (sc, elapsed) = self.tracked_state(idx)?;
                let _ = self.stop_conds[idx].evaluate(&sc, elapsed);
                let cond = &mut self.stop_conds[idx];
                let on_goal = cond.get_stop_difference(&sc, elapsed).abs()
                    <= self.opts.first_step_tolerance;
                // An apsis reached at elapsed zero is the starting point, not
                // a passage: the run must propagate to the next one
                let at_apsis = cond.variable().is_apoapsis() || cond.variable().is_periapsis();
                if on_goal && (at_apsis || sc.was_last_stop_triggered(&cond.name)) {
                    debug!("suppressing first-step trigger of '{cond}'");
                    cond.skip_evaluation(true);
                }
            }
            for unit in &mut self.units {
                for obj in unit.container.objects_mut() {
                    for sc in obj.spacecraft_mut() {
                        sc.clear_last_stop_triggered();
                    }
                }
            }

            self.in_progress = true;
            self.stop_cond_met = false;
            self.interrupt_count = 0;
            self.step_count = 0;
            self.stopper_name = None;
        }

        loop {
            self.take_a_step(None)?;
            self.has_fired = true;
            self.step_count += 1;

            if self.single_step_mode {
                self.publish_state(publisher);
                break;
            }

            if self.check_stop_conditions()? {
                self.stop_cond_met = true;
                // The crossing lies within the just-taken step: undo it so the
                // landing can be computed from the bracket's near edge
                for unit in &mut self.units {
                    unit.container.revert_space_object();
                    unit.sync_elapsed();
                }
                self.step_brackets = [0.0, self.stop_interval * 1.1];
                break;
            }

            self.publish_state(publisher);
            self.interrupt_count += 1;
            if self.opts.interrupt_check_frequency > 0
                && self.interrupt_count >= self.opts.interrupt_check_frequency
            {
                // Cooperative yield: all state stays put, caller re-enters
                self.interrupt_count = 0;
                return Ok(ExecControl::Yielded);
            }
        }

        if self.stop_cond_met {
            self.take_final_step(publisher)?;
        }

        for cond in &mut self.stop_conds {
            cond.reset();
        }
        self.build_summary();
        self.in_progress = false;
        Ok(ExecControl::Completed)
    }

    /// Resets the per-cycle run state and flushes the publisher. Used for
    /// both normal completion and abort.
    pub fn run_complete(&mut self, publisher: &mut dyn Publisher) {
        self.in_progress = false;
        self.has_fired = false;
        publisher.flush();
    }

    fn prepare_to_propagate(&mut self) -> Result<(), ExecError> {
        ensure!(!self.units.is_empty(), NoPropUnitsSnafu);

        let direction = if self.opts.mode == PropagationMode::BackProp {
            -1.0
        } else {
            self.direction
        };

        for unit in &mut self.units {
            unit.container.update_initial_data();
            unit.base_epoch = unit.container.base_epoch();
            unit.elapsed = 0.0;
            unit.curr_epoch = unit.base_epoch;
            unit.propagator.set_direction(direction);
            unit.propagator.set_final_step(false);
        }

        if !self.has_fired {
            // Cold start: full validation; a warm re-entry within the same
            // run skips it
            for cond in &mut self.stop_conds {
                cond.initialize().context(StopEpochSnafu)?;
            }
        }
        for cond in &mut self.stop_conds {
            cond.set_prop_direction(direction);
            cond.reset();
        }

        self.single_step_mode = self.stop_conds.is_empty();

        if self.opts.mode == PropagationMode::Synchronized && self.units.len() > 1 {
            let first_epoch = self.units[0].base_epoch;
            let first_name = self.units[0].name.clone();
            for unit in &self.units[1..] {
                let delta = unit.base_epoch - first_epoch;
                if delta.abs() > 1 * Unit::Nanosecond {
                    return EpochMismatchSnafu {
                        unit_a: first_name.clone(),
                        unit_b: unit.name.clone(),
                        delta_days: delta.to_unit(Unit::Day),
                    }
                    .fail();
                }
            }
        }

        Ok(())
    }

    /// Advances all units by one step. With `prop_step` unset, each unit
    /// steps per the propagation mode; otherwise all units take exactly
    /// `prop_step` seconds. A refused step is fatal for the command.
    fn take_a_step(&mut self, prop_step: Option<f64>) -> Result<(), ExecError> {
        match prop_step {
            Some(dt) => {
                for unit in &mut self.units {
                    unit.propagator
                        .step_by(dt, &mut unit.container)
                        .context(SteppingSnafu {
                            unit: unit.name.clone(),
                        })?;
                }
            }
            None => match self.opts.mode {
                PropagationMode::Synchronized => {
                    let (first, rest) = self.units.split_at_mut(1);
                    first[0]
                        .propagator
                        .step(&mut first[0].container)
                        .context(SteppingSnafu {
                            unit: first[0].name.clone(),
                        })?;
                    let dt = first[0].propagator.step_taken();
                    for unit in rest {
                        unit.propagator
                            .step_by(dt, &mut unit.container)
                            .context(SteppingSnafu {
                                unit: unit.name.clone(),
                            })?;
                    }
                }
                _ => {
                    for unit in &mut self.units {
                        unit.propagator
                            .step(&mut unit.container)
                            .context(SteppingSnafu {
                                unit: unit.name.clone(),
                            })?;
                    }
                }
            },
        }
        for unit in &mut self.units {
            unit.sync_from_container();
        }
        Ok(())
    }

    /// Evaluates all conditions in registration order; collects every trigger
    /// and records the largest magnitude bracketing interval.
    fn check_stop_conditions(&mut self) -> Result<bool, ExecError> {
        self.triggers.clear();
        self.stop_interval = 0.0;
        for idx in 0..self.stop_conds.len() {
            let (sc, elapsed) = self.tracked_state(idx)?;
            if self.stop_conds[idx].evaluate(&sc, elapsed) {
                self.triggers.push(idx);
                let interval = self.stop_conds[idx].get_stop_interval();
                if interval.abs() > self.stop_interval.abs() {
                    self.stop_interval = interval;
                }
                debug!(
                    "'{}' triggered with interval {interval} s",
                    self.stop_conds[idx]
                );
            }
        }
        Ok(!self.triggers.is_empty())
    }

    /// The landing sequence: pick the nearest triggered crossing, estimate its
    /// epoch, take the corrective step, and refine if the estimate missed.
    fn take_final_step(&mut self, publisher: &mut dyn Publisher) -> Result<(), ExecError> {
        self.buffer_satellite_states(true);

        let triggers = self.triggers.clone();
        let mut stopper = triggers[0];
        let mut secs_to_step = f64::INFINITY;
        for &idx in &triggers {
            let dt = if self.stop_conds[idx].is_time_condition() {
                // Time is known exactly, no search needed
                self.stop_conds[idx]
                    .get_stop_epoch()
                    .context(StopEpochSnafu)?
            } else {
                self.interpolate_to_stop(idx)?
            };
            if dt.abs() < secs_to_step.abs() {
                secs_to_step = dt;
                stopper = idx;
            }
        }

        let mut secs_to_step = round_to_quantum(secs_to_step);
        debug!(
            "landing on '{}' with a step of {secs_to_step} s",
            self.stop_conds[stopper]
        );

        self.set_final_step_mode(true);
        self.take_a_step(Some(secs_to_step))?;

        let (sc, elapsed) = self.tracked_state(stopper)?;
        self.stop_conds[stopper].evaluate(&sc, elapsed);
        let accuracy = if self.stop_conds[stopper].is_time_condition() {
            self.opts.time_accuracy
        } else {
            self.opts.stop_accuracy
        };
        let diff = self.stop_conds[stopper].get_stop_difference(&sc, elapsed);
        if diff.abs() > accuracy {
            debug!("interpolated landing missed by {diff:.3e}, refining");
            self.buffer_satellite_states(false);
            let refined = self.refine_final_step(secs_to_step, stopper)?;
            secs_to_step = round_to_quantum(refined);
            self.take_a_step(Some(secs_to_step))?;
        }

        self.publish_state(publisher);
        publisher.flush();

        self.stopper_name = Some(format!("{}", self.stop_conds[stopper]));
        info!(
            "'{}' stopped on '{}' at {}",
            self.name, self.stop_conds[stopper], self.units[0].curr_epoch
        );

        // Remember which conditions fired on their vehicles so the next run
        // can suppress an immediate re-trigger at elapsed time zero
        for &idx in &triggers {
            let sat = self.stop_conds[idx].sat_name().to_string();
            let cond_name = self.stop_conds[idx].name.clone();
            for unit in &mut self.units {
                for obj in unit.container.objects_mut() {
                    for sc in obj.spacecraft_mut() {
                        if sc.name == sat {
                            sc.last_stop_triggered.push(cond_name.clone());
                        }
                    }
                }
            }
        }

        // Transient conditions (implicit apsis clauses) are single use
        self.stop_conds.retain(|c| !c.name.is_empty());
        self.set_final_step_mode(false);
        self.empty_buffer();
        Ok(())
    }

    /// First tier: estimate the time to the crossing by feeding exploratory
    /// sub-steps into the condition's ring buffer until the goal is bracketed.
    /// The sub-steps are undone before returning.
    fn interpolate_to_stop(&mut self, idx: usize) -> Result<f64, ExecError> {
        let sub_step = self.stop_interval / 4.0;
        let mut internal_elapsed = 0.0;
        for i in 0..INTERP_MAX_SUBSTEPS {
            self.take_a_step(Some(sub_step))?;
            internal_elapsed += sub_step;
            let (sc, _) = self.tracked_state(idx)?;
            // The ring buffer works in an internal frame: zero at the pre-step point
            if self.stop_conds[idx].add_to_buffer(&sc, internal_elapsed, i == 0) {
                break;
            }
        }
        self.buffer_satellite_states(false);
        self.stop_conds[idx]
            .get_stop_epoch()
            .context(StopEpochSnafu)
    }

    /// Second tier: secant iteration on (step size, tracked value) samples.
    /// Falls through to bisection on a degenerate slope or iteration
    /// exhaustion; a bisection failure is fatal, citing the condition.
    ///
    /// Leaves the state restored to the pre-landing point; the caller re-takes
    /// the returned step after rounding.
    fn refine_final_step(&mut self, first_guess: f64, idx: usize) -> Result<f64, ExecError> {
        let accuracy = if self.stop_conds[idx].is_time_condition() {
            self.opts.time_accuracy
        } else {
            self.opts.stop_accuracy
        };
        let cyclic_range = self.stop_conds[idx].variable().cyclic_range();

        self.buffer_satellite_states(false);
        let (sc0, e0) = self.tracked_state(idx)?;
        let goal = self.stop_conds[idx].get_stop_goal(&sc0, e0);
        let mut x0 = 0.0;
        let mut y0 = remap_to_goal_branch(
            self.stop_conds[idx].variable().evaluate(&sc0, e0),
            goal,
            cyclic_range,
        );
        let mut x1 = first_guess;

        for attempt in 0..SECANT_MAX_ITER {
            let y1 = remap_to_goal_branch(self.trial_step(x1, idx)?, goal, cyclic_range);
            if (goal - y1).abs() <= accuracy {
                debug!("secant converged to {x1} s in {attempt} iteration(s)");
                self.buffer_satellite_states(false);
                return Ok(x1);
            }
            if (x1 - x0).abs() < f64::EPSILON {
                // Identical samples, secant cannot proceed
                break;
            }
            let slope = (y1 - y0) / (x1 - x0);
            if slope == 0.0 {
                break;
            }
            let next = x1 + (goal - y1) / slope;
            x0 = x1;
            y0 = y1;
            x1 = next;
        }

        warn!(
            "secant refinement failed for '{}', falling back to bisection",
            self.stop_conds[idx]
        );
        let dt = self.bisect_to_stop(idx)?;
        if dt == 0.0 {
            // 0.0 is the bisection failure sentinel, never a usable step
            return RootFindingFailedSnafu {
                condition: format!("{}", self.stop_conds[idx]),
            }
            .fail();
        }
        Ok(dt)
    }

    /// Third tier: classic bracket halving over the recorded step brackets.
    /// Returns 0.0 when the budget is exhausted without convergence.
    fn bisect_to_stop(&mut self, idx: usize) -> Result<f64, ExecError> {
        let accuracy = if self.stop_conds[idx].is_time_condition() {
            self.opts.time_accuracy
        } else {
            self.opts.stop_accuracy
        };
        let cyclic_range = self.stop_conds[idx].variable().cyclic_range();
        let [mut lo, mut hi] = self.step_brackets;

        self.buffer_satellite_states(false);
        let (sc0, e0) = self.tracked_state(idx)?;
        let goal = self.stop_conds[idx].get_stop_goal(&sc0, e0);
        let y_lo = if lo == 0.0 {
            remap_to_goal_branch(
                self.stop_conds[idx].variable().evaluate(&sc0, e0),
                goal,
                cyclic_range,
            )
        } else {
            remap_to_goal_branch(self.trial_step(lo, idx)?, goal, cyclic_range)
        };
        let y_hi = remap_to_goal_branch(self.trial_step(hi, idx)?, goal, cyclic_range);
        let increasing = y_hi > y_lo;

        for _ in 0..BISECTION_MAX_ITER {
            let mid = 0.5 * (lo + hi);
            let y = remap_to_goal_branch(self.trial_step(mid, idx)?, goal, cyclic_range);
            if (goal - y).abs() <= accuracy {
                self.buffer_satellite_states(false);
                return Ok(mid);
            }
            if (y < goal) == increasing {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        self.buffer_satellite_states(false);
        error!(
            "bisection did not converge within {BISECTION_MAX_ITER} iterations for '{}'",
            self.stop_conds[idx]
        );
        Ok(0.0)
    }

    /// Restores the pre-landing state, takes a speculative step of `dt`
    /// seconds and evaluates the tracked variable there.
    fn trial_step(&mut self, dt: f64, idx: usize) -> Result<f64, ExecError> {
        self.buffer_satellite_states(false);
        if dt != 0.0 {
            self.take_a_step(Some(dt))?;
        }
        let (sc, elapsed) = self.tracked_state(idx)?;
        Ok(self.stop_conds[idx].variable().evaluate(&sc, elapsed))
    }

    /// Clone-snapshots every tracked object (`filling == true`), or restores
    /// them all from the snapshot and realigns the containers.
    fn buffer_satellite_states(&mut self, filling: bool) {
        if filling {
            self.sat_buffer.clear();
            for unit in &self.units {
                for obj in unit.container.objects() {
                    self.sat_buffer.push(obj.clone());
                }
            }
        } else {
            let buffer = &self.sat_buffer;
            for unit in &mut self.units {
                for obj in unit.container.objects_mut() {
                    if let Some(saved) = buffer.iter().find(|b| b.name() == obj.name()) {
                        *obj = saved.clone();
                    }
                }
                unit.container.update_from_space_object();
                unit.sync_elapsed();
            }
        }
    }

    fn empty_buffer(&mut self) {
        self.sat_buffer.clear();
    }

    fn set_final_step_mode(&mut self, enabled: bool) {
        for unit in &mut self.units {
            unit.propagator.set_final_step(enabled);
        }
    }

    fn publish_state(&self, publisher: &mut dyn Publisher) {
        for unit in &self.units {
            let mut data = Vec::with_capacity(unit.dim);
            for obj in unit.container.objects() {
                for sc in obj.spacecraft() {
                    data.extend_from_slice(&sc.state);
                }
            }
            publisher.publish(unit.stream_id, unit.curr_epoch, &data);
        }
    }

    /// Cloned tracked vehicle and the elapsed seconds of its unit.
    fn tracked_state(&self, idx: usize) -> Result<(Spacecraft, f64), ExecError> {
        let cond = &self.stop_conds[idx];
        for unit in &self.units {
            for obj in unit.container.objects() {
                for sc in obj.spacecraft() {
                    if sc.name == cond.sat_name() {
                        return Ok((sc.clone(), unit.elapsed));
                    }
                }
            }
        }
        UnknownStopSatSnafu {
            condition: cond.name.clone(),
            sat: cond.sat_name().to_string(),
        }
        .fail()
    }

    fn build_summary(&mut self) {
        let stop = match (&self.stopper_name, self.single_step_mode) {
            (_, true) => "single step mode".to_string(),
            (Some(name), _) => format!("stopped on '{name}' at {}", self.units[0].curr_epoch),
            (None, _) => "no stopping condition met".to_string(),
        };
        self.summary = format!(
            "Propagate '{}': {} step(s) across {} unit(s), {stop}",
            self.name,
            self.step_count,
            self.units.len()
        );
    }
}

impl fmt::Display for Propagate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.summary.is_empty() {
            write!(f, "Propagate '{}' (not yet executed)", self.name)
        } else {
            write!(f, "{}", self.summary)
        }
    }
}

/// Remaps a cyclic sample into the half cycle branch nearest the goal, so a
/// secant slope across a wrap boundary sees no false discontinuity.
fn remap_to_goal_branch(value: f64, goal: f64, cyclic_range: Option<(f64, f64)>) -> f64 {
    match cyclic_range {
        Some((min, max)) => {
            let range2 = (max - min) / 2.0;
            put_in_range(value, goal - range2, goal + range2)
        }
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cosmic::Spacecraft;
    use crate::md::param::StopVariable;
    use crate::propagation::{ConstantVelocity, PropSetup, RungeKutta4};
    use crate::publish::MemoryPublisher;
    use crate::time::Epoch;
    use crate::SpaceObject;
    use approx::assert_abs_diff_eq;

    /// One linear vehicle behind an RK4, with an X goal condition, primed for
    /// a landing search over the given brackets.
    fn primed_cmd(vx: f64, goal: f64, brackets: [f64; 2]) -> (Propagate, MemoryPublisher) {
        let mut cmd = Propagate::new("prop", ExecOpts::default());
        let sat = SpaceObject::Spacecraft(Spacecraft::new(
            "Sat1",
            Epoch::from_gregorian_utc_at_midnight(2026, 1, 1),
            [0.0, 0.0, 0.0, vx, 0.0, 0.0],
        ));
        cmd.add_prop_setup(
            PropSetup::new(
                "unit1",
                Box::new(RungeKutta4::new(27.0)),
                Box::new(ConstantVelocity),
            ),
            vec![sat],
        );
        cmd.add_stop_condition(StopCondition::new("xcross", "Sat1", StopVariable::X, goal));
        let mut publisher = MemoryPublisher::new();
        cmd.initialize(&mut publisher).unwrap();
        cmd.buffer_satellite_states(true);
        cmd.step_brackets = brackets;
        (cmd, publisher)
    }

    #[test]
    fn bisection_converges_on_a_linear_crossing() {
        // x(t) = 1.5 t crosses 25 km at dt = 16.666... s inside the bracket
        let (mut cmd, _publisher) = primed_cmd(1.5, 25.0, [0.0, 30.0]);
        let dt = cmd.bisect_to_stop(0).unwrap();
        assert_abs_diff_eq!(dt, 25.0 / 1.5, epsilon = 1e-6);
        // The search leaves the state restored to the bracket's near edge
        assert_abs_diff_eq!(cmd.units[0].elapsed, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn bisection_exhaustion_returns_the_failure_sentinel() {
        // The tracked value is flat across the whole bracket: the halving
        // budget runs out and 0.0 must come back as "no usable step"
        let (mut cmd, _publisher) = primed_cmd(0.0, 100.0, [0.0, 30.0]);
        assert_eq!(cmd.bisect_to_stop(0).unwrap(), 0.0);
        assert_abs_diff_eq!(cmd.units[0].elapsed, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn flat_slope_refinement_is_fatal_and_names_the_condition() {
        // Zero secant slope escalates to bisection, which cannot converge on
        // a flat value either; the sentinel becomes an error citing 'xcross'
        let (mut cmd, _publisher) = primed_cmd(0.0, 100.0, [0.0, 30.0]);
        match cmd.refine_final_step(10.0, 0) {
            Err(ExecError::RootFindingFailed { condition }) => {
                assert!(condition.contains("xcross"));
            }
            other => panic!("expected a root finding failure, got {other:?}"),
        }
    }

    #[test]
    fn mode_strings_round_trip() {
        for mode in [
            PropagationMode::Independent,
            PropagationMode::Synchronized,
            PropagationMode::BackProp,
        ] {
            assert_eq!(
                PropagationMode::from_mode_str(mode.mode_str()),
                Some(mode)
            );
        }
        assert_eq!(PropagationMode::from_mode_str("Turbo"), None);
    }

    #[test]
    fn stop_accuracy_validated_at_set_time() {
        let mut cmd = Propagate::new("prop", ExecOpts::default());
        assert!(cmd.set_stop_accuracy(0.0).is_err());
        assert!(cmd.set_stop_accuracy(-1e-9).is_err());
        assert!(cmd.set_stop_accuracy(1e-9).is_ok());
    }

    #[test]
    fn cyclic_branch_remapping() {
        // A 359 degree sample near a goal of 0 must remap to -1
        approx::assert_abs_diff_eq!(
            remap_to_goal_branch(359.0, 0.0, Some((0.0, 360.0))),
            -1.0,
            epsilon = 1e-12
        );
        // Non cyclic values pass through untouched
        approx::assert_abs_diff_eq!(remap_to_goal_branch(359.0, 0.0, None), 359.0);
    }

    #[test]
    fn execute_requires_initialization() {
        let mut cmd = Propagate::new("prop", ExecOpts::default());
        let mut publisher = crate::publish::MemoryPublisher::new();
        assert!(matches!(
            cmd.execute(&mut publisher),
            Err(ExecError::NotInitialized)
        ));
    }
}
