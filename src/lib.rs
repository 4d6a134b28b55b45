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

/*! # tycho

Tycho drives trajectory simulations the way a mission script does: it advances
one or more coupled numerical propagators through time, watches a set of
stopping conditions (apoapsis, periapsis, elapsed time, parameter thresholds),
and lands exactly on the first condition to trigger using a three tier
root-finding pipeline (cubic interpolation, secant refinement, bisection
fallback). Propagated samples are pushed to a pluggable publisher as they are
produced.
*/

/// Spacecraft, formations and the orbital state accessors used by stop variables.
pub mod cosmic;

/// The integration seam: dynamics, state containers, propagators and setups.
pub mod propagation;

/// Mission design layer: stop variables, stopping conditions and the Propagate executive.
pub mod md;

/// Data publishing: the `Publisher` seam plus CSV and in-memory implementations.
pub mod publish;

/// Configuration loading for the executive.
pub mod io;

/// Shared numerical helpers.
pub mod utils;

#[macro_use]
extern crate log;
extern crate hifitime;
extern crate nalgebra as na;

/// Re-export of hifitime
pub mod time {
    pub use hifitime::*;
}

/// Re-export nalgebra
pub mod linalg {
    pub use na::base::*;
}

pub use self::cosmic::{Formation, SpaceObject, Spacecraft};

/// Number of seconds in a day, used for epoch/elapsed-time conversions.
pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// A useful prelude for driving a simulation.
pub mod prelude {
    pub use crate::cosmic::{Formation, SpaceObject, Spacecraft};
    pub use crate::md::propagate::{ExecControl, ExecOpts, Propagate, PropagationMode};
    pub use crate::md::stopcond::StopCondition;
    pub use crate::md::StopVariable;
    pub use crate::propagation::{
        ConstantVelocity, Dynamics, PropSetup, Propagator, RungeKutta4, StateContainer, TwoBody,
    };
    pub use crate::publish::{CsvPublisher, MemoryPublisher, Publisher};
    pub use crate::time::{Duration, Epoch, Unit};
}
