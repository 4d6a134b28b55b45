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

/// Quantum, in seconds, to which every landed step duration is rounded.
/// Matches the epoch granularity of common ephemeris comparison tools so that
/// stop epochs are reproducible across runs and tools.
pub const STEP_QUANTUM_S: f64 = 1e-6;

/// Rounds a duration in seconds to the nearest multiple of [STEP_QUANTUM_S].
pub fn round_to_quantum(dt: f64) -> f64 {
    (dt / STEP_QUANTUM_S).round() * STEP_QUANTUM_S
}

/// Inverse Lagrange interpolation through up to four (value, epoch) samples:
/// evaluates epoch as a cubic in the tracked value, at the goal value.
///
/// Returns `None` if two samples share a value (the polynomial would be
/// degenerate, which happens when the tracked parameter is locally flat).
pub fn lagrange_inverse(values: &[f64], epochs: &[f64], goal: f64) -> Option<f64> {
    debug_assert_eq!(values.len(), epochs.len());
    let n = values.len();
    let mut result = 0.0;
    for i in 0..n {
        let mut basis = 1.0;
        for j in 0..n {
            if i == j {
                continue;
            }
            let denom = values[i] - values[j];
            if denom.abs() < f64::EPSILON {
                return None;
            }
            basis *= (goal - values[j]) / denom;
        }
        result += epochs[i] * basis;
    }
    Some(result)
}

/// Remaps `value` into the cyclic range `[min, max)`.
pub fn put_in_range(value: f64, min: f64, max: f64) -> f64 {
    let range = max - min;
    debug_assert!(range > 0.0);
    let mut out = value;
    while out < min {
        out += range;
    }
    while out >= max {
        out -= range;
    }
    out
}
