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

use crate::cosmic::Spacecraft;
use crate::SECONDS_PER_DAY;
use enum_iterator::Sequence;
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Scalar quantities a stopping condition can track.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Sequence, Serialize, Deserialize)]
pub enum StopVariable {
    /// Seconds since the start of the propagation cycle
    ElapsedSecs,
    /// Days since the start of the propagation cycle
    ElapsedDays,
    /// X component of the position (km)
    X,
    /// Y component of the position (km)
    Y,
    /// Z component of the position (km)
    Z,
    /// X component of the velocity (km/s)
    VX,
    /// Y component of the velocity (km/s)
    VY,
    /// Z component of the velocity (km/s)
    VZ,
    /// Radius magnitude (km)
    Rmag,
    /// Velocity magnitude (km/s)
    Vmag,
    /// Eccentricity (no unit)
    Eccentricity,
    /// True anomaly (deg), cyclic over [0, 360)
    TrueAnomaly,
    /// Apoapsis passage: R dot V, falling through zero
    Apoapsis,
    /// Periapsis passage: R dot V, rising through zero
    Periapsis,
}

impl StopVariable {
    /// Evaluate this quantity for the given vehicle, `elapsed` seconds into the cycle.
    pub fn evaluate(&self, sc: &Spacecraft, elapsed: f64) -> f64 {
        match self {
            Self::ElapsedSecs => elapsed,
            Self::ElapsedDays => elapsed / SECONDS_PER_DAY,
            Self::X => sc.state[0],
            Self::Y => sc.state[1],
            Self::Z => sc.state[2],
            Self::VX => sc.state[3],
            Self::VY => sc.state[4],
            Self::VZ => sc.state[5],
            Self::Rmag => sc.rmag(),
            Self::Vmag => sc.vmag(),
            Self::Eccentricity => sc.ecc(),
            Self::TrueAnomaly => sc.ta_deg(),
            // Apsides are detected on the R dot V zero crossing
            Self::Apoapsis | Self::Periapsis => sc.rdotv(),
        }
    }

    pub fn is_time_based(&self) -> bool {
        matches!(self, Self::ElapsedSecs | Self::ElapsedDays)
    }

    /// Conversion factor from this quantity's unit to seconds, for time based
    /// variables. Unity for everything else.
    pub fn time_multiplier(&self) -> f64 {
        match self {
            Self::ElapsedDays => SECONDS_PER_DAY,
            _ => 1.0,
        }
    }

    /// Cyclic variables wrap around; returns the (min, max) of one cycle.
    pub fn cyclic_range(&self) -> Option<(f64, f64)> {
        match self {
            Self::TrueAnomaly => Some((0.0, 360.0)),
            _ => None,
        }
    }

    pub fn is_cyclic(&self) -> bool {
        self.cyclic_range().is_some()
    }

    pub fn is_apoapsis(&self) -> bool {
        matches!(self, Self::Apoapsis)
    }

    pub fn is_periapsis(&self) -> bool {
        matches!(self, Self::Periapsis)
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Self::ElapsedSecs => "s",
            Self::ElapsedDays => "days",
            Self::X | Self::Y | Self::Z | Self::Rmag => "km",
            Self::VX | Self::VY | Self::VZ | Self::Vmag => "km/s",
            Self::Eccentricity => "",
            Self::TrueAnomaly => "deg",
            Self::Apoapsis | Self::Periapsis => "km^2/s",
        }
    }
}

impl fmt::Display for StopVariable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Epoch;
    use approx::assert_abs_diff_eq;
    use enum_iterator::all;

    #[test]
    fn classification_is_consistent() {
        for var in all::<StopVariable>() {
            if var.is_time_based() {
                assert!(!var.is_cyclic());
                assert!(var.time_multiplier() >= 1.0);
            }
            if var.is_cyclic() {
                let (min, max) = var.cyclic_range().unwrap();
                assert!(max > min);
            }
        }
    }

    #[test]
    fn elapsed_evaluation() {
        let sc = Spacecraft::new(
            "Sat1",
            Epoch::from_gregorian_utc_at_midnight(2026, 1, 1),
            [7000.0, 0.0, 0.0, 0.0, 7.5, 0.0],
        );
        assert_abs_diff_eq!(StopVariable::ElapsedSecs.evaluate(&sc, 120.0), 120.0);
        assert_abs_diff_eq!(
            StopVariable::ElapsedDays.evaluate(&sc, 86_400.0),
            1.0,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(StopVariable::X.evaluate(&sc, 0.0), 7000.0);
        // Circular-ish state at perigee has R dot V of zero
        assert_abs_diff_eq!(StopVariable::Apoapsis.evaluate(&sc, 0.0), 0.0);
    }
}
