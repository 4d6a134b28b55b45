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

use crate::time::Epoch;
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// GM of the Earth, in km^3/s^2. Default central body for shipped dynamics.
pub const EARTH_GM: f64 = 398_600.441_5;

/// A propagated vehicle: Cartesian state, epoch, and the bookkeeping the
/// Propagate executive needs to suppress an immediate re-trigger of the
/// condition that stopped the previous run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Spacecraft {
    pub name: String,
    pub epoch: Epoch,
    /// Position in km, velocity in km/s: `[x, y, z, vx, vy, vz]`.
    pub state: [f64; 6],
    /// Gravitational parameter of the central body, km^3/s^2.
    pub gm: f64,
    /// Names of the stopping conditions that ended the previous Propagate
    /// involving this vehicle. Consulted exactly once on the next run.
    pub last_stop_triggered: Vec<String>,
}

impl Spacecraft {
    pub fn new(name: &str, epoch: Epoch, state: [f64; 6]) -> Self {
        Self {
            name: name.to_string(),
            epoch,
            state,
            gm: EARTH_GM,
            last_stop_triggered: Vec::new(),
        }
    }

    pub fn rmag(&self) -> f64 {
        (self.state[0].powi(2) + self.state[1].powi(2) + self.state[2].powi(2)).sqrt()
    }

    pub fn vmag(&self) -> f64 {
        (self.state[3].powi(2) + self.state[4].powi(2) + self.state[5].powi(2)).sqrt()
    }

    /// Dot product of the position and velocity vectors, in km^2/s. Crosses
    /// zero at each apsis, rising at periapsis and falling at apoapsis.
    pub fn rdotv(&self) -> f64 {
        self.state[0] * self.state[3] + self.state[1] * self.state[4] + self.state[2] * self.state[5]
    }

    /// Eccentricity vector magnitude.
    pub fn ecc(&self) -> f64 {
        let r = self.rmag();
        let v2 = self.vmag().powi(2);
        let rv = self.rdotv();
        let mut evec = [0.0_f64; 3];
        for i in 0..3 {
            evec[i] = ((v2 - self.gm / r) * self.state[i] - rv * self.state[i + 3]) / self.gm;
        }
        (evec[0].powi(2) + evec[1].powi(2) + evec[2].powi(2)).sqrt()
    }

    /// True anomaly in degrees, in [0, 360).
    pub fn ta_deg(&self) -> f64 {
        let r = self.rmag();
        let v2 = self.vmag().powi(2);
        let rv = self.rdotv();
        let mut evec = [0.0_f64; 3];
        for i in 0..3 {
            evec[i] = ((v2 - self.gm / r) * self.state[i] - rv * self.state[i + 3]) / self.gm;
        }
        let emag = (evec[0].powi(2) + evec[1].powi(2) + evec[2].powi(2)).sqrt();
        if emag < f64::EPSILON {
            // Circular orbit, true anomaly undefined: report zero
            return 0.0;
        }
        let cos_ta = ((evec[0] * self.state[0] + evec[1] * self.state[1] + evec[2] * self.state[2])
            / (emag * r))
            .clamp(-1.0, 1.0);
        let mut ta = cos_ta.acos().to_degrees();
        if rv < 0.0 {
            ta = 360.0 - ta;
        }
        ta
    }

    /// Whether `name` stopped the previous Propagate run for this vehicle.
    pub fn was_last_stop_triggered(&self, name: &str) -> bool {
        self.last_stop_triggered.iter().any(|n| n == name)
    }

    pub fn clear_last_stop_triggered(&mut self) {
        self.last_stop_triggered.clear();
    }
}

impl fmt::Display for Spacecraft {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} @ {} pos = [{:.3}, {:.3}, {:.3}] km vel = [{:.6}, {:.6}, {:.6}] km/s",
            self.name,
            self.epoch,
            self.state[0],
            self.state[1],
            self.state[2],
            self.state[3],
            self.state[4],
            self.state[5],
        )
    }
}

/// A set of spacecraft stepped as a single group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Formation {
    pub name: String,
    pub members: Vec<Spacecraft>,
}

impl Formation {
    pub fn new(name: &str, members: Vec<Spacecraft>) -> Self {
        Self {
            name: name.to_string(),
            members,
        }
    }
}

/// Anything the executive can propagate and buffer. A closed sum type so that
/// buffer and restore operations are a `match`, never a downcast.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SpaceObject {
    Spacecraft(Spacecraft),
    Formation(Formation),
}

impl SpaceObject {
    pub fn name(&self) -> &str {
        match self {
            SpaceObject::Spacecraft(sc) => &sc.name,
            SpaceObject::Formation(fm) => &fm.name,
        }
    }

    pub fn epoch(&self) -> Epoch {
        match self {
            SpaceObject::Spacecraft(sc) => sc.epoch,
            SpaceObject::Formation(fm) => fm.members[0].epoch,
        }
    }

    /// Iterate over every vehicle in this object.
    pub fn spacecraft(&self) -> Box<dyn Iterator<Item = &Spacecraft> + '_> {
        match self {
            SpaceObject::Spacecraft(sc) => Box::new(std::iter::once(sc)),
            SpaceObject::Formation(fm) => Box::new(fm.members.iter()),
        }
    }

    pub fn spacecraft_mut(&mut self) -> Box<dyn Iterator<Item = &mut Spacecraft> + '_> {
        match self {
            SpaceObject::Spacecraft(sc) => Box::new(std::iter::once(sc)),
            SpaceObject::Formation(fm) => Box::new(fm.members.iter_mut()),
        }
    }

    /// Number of scalar states this object contributes to an integration vector.
    pub fn dimension(&self) -> usize {
        match self {
            SpaceObject::Spacecraft(_) => 6,
            SpaceObject::Formation(fm) => 6 * fm.members.len(),
        }
    }
}

impl fmt::Display for SpaceObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SpaceObject::Spacecraft(sc) => write!(f, "{sc}"),
            SpaceObject::Formation(fm) => {
                write!(f, "Formation {} ({} members)", fm.name, fm.members.len())
            }
        }
    }
}
