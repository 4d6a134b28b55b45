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

use crate::md::propagate::{ExecOpts, PropagationMode};
use serde_derive::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("could not read configuration: {source}"))]
    ReadError { source: std::io::Error },
    #[snafu(display("could not parse configuration: {source}"))]
    ParseError { source: serde_yaml::Error },
    #[snafu(display("invalid configuration: {details}"))]
    InvalidConfig { details: String },
}

/// Serializable executive configuration, loadable from YAML.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecConfig {
    /// One of `""`, `"Synchronized"`, `"BackProp"`.
    #[serde(default)]
    pub mode: String,
    /// Steps between cooperative yields back to the caller. Zero disables yielding.
    #[serde(default = "default_interrupt_freq")]
    pub interrupt_check_frequency: u32,
    /// Tolerance, in tracked value units, for value based stopping conditions.
    #[serde(default = "default_stop_accuracy")]
    pub stop_accuracy: f64,
    /// Tolerance, in seconds, for time based stopping conditions.
    #[serde(default = "default_time_accuracy")]
    pub time_accuracy: f64,
}

fn default_interrupt_freq() -> u32 {
    30
}

fn default_stop_accuracy() -> f64 {
    1e-7
}

fn default_time_accuracy() -> f64 {
    1e-6
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            mode: String::new(),
            interrupt_check_frequency: default_interrupt_freq(),
            stop_accuracy: default_stop_accuracy(),
            time_accuracy: default_time_accuracy(),
        }
    }
}

impl ExecConfig {
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(path).context(ReadSnafu)?;
        let cfg: Self = serde_yaml::from_reader(BufReader::new(file)).context(ParseSnafu)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_str(data: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_yaml::from_str(data).context(ParseSnafu)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<PropagationMode, ConfigError> {
        ensure!(
            self.stop_accuracy > 0.0,
            InvalidConfigSnafu {
                details: format!("stop_accuracy must be positive, got {}", self.stop_accuracy)
            }
        );
        ensure!(
            self.time_accuracy > 0.0,
            InvalidConfigSnafu {
                details: format!("time_accuracy must be positive, got {}", self.time_accuracy)
            }
        );
        PropagationMode::from_mode_str(&self.mode).ok_or_else(|| {
            InvalidConfigSnafu {
                details: format!("unknown propagation mode '{}'", self.mode),
            }
            .build()
        })
    }

    /// Converts this configuration into executive options.
    pub fn to_opts(&self) -> Result<ExecOpts, ConfigError> {
        let mode = self.validate()?;
        Ok(ExecOpts::builder()
            .mode(mode)
            .interrupt_check_frequency(self.interrupt_check_frequency)
            .stop_accuracy(self.stop_accuracy)
            .time_accuracy(self.time_accuracy)
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_yaml() {
        let cfg = ExecConfig::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed = ExecConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(cfg, parsed);
    }

    #[test]
    fn rejects_nonpositive_stop_accuracy() {
        let err = ExecConfig::from_yaml_str("stop_accuracy: 0.0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig { .. }));
    }

    #[test]
    fn rejects_unknown_mode() {
        let err = ExecConfig::from_yaml_str("mode: Turbo").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig { .. }));
    }

    #[test]
    fn parses_synchronized_mode() {
        let cfg = ExecConfig::from_yaml_str("mode: Synchronized").unwrap();
        let opts = cfg.to_opts().unwrap();
        assert_eq!(opts.mode, PropagationMode::Synchronized);
    }
}
