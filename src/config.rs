// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! This module handles firing unit configuration and configuration file
//! parsing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{self, ErrorKind};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/fuseunit/config.toml";

fn duration_secs_f64<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Ok(Duration::from_secs_f64(secs))
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
struct ConnectionConfig {
    device_id: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
struct I2cConfig {
    bus_device: PathBuf,
    #[serde(default = "default_simulation_file")]
    simulation_file: PathBuf,
    chip_addresses: BTreeMap<char, u8>,
}

fn default_simulation_file() -> PathBuf {
    PathBuf::from("/var/lib/fuseunit/simulation.json")
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
struct TimingsConfig {
    #[serde(deserialize_with = "duration_secs_f64")]
    resolution: Duration,
    #[serde(deserialize_with = "duration_secs_f64")]
    ignition: Duration,
    #[serde(deserialize_with = "duration_secs_f64")]
    testloop_period: Duration,
    #[serde(deserialize_with = "duration_secs_f64")]
    heartbeat_period: Duration,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
struct TimeoutsConfig {
    #[serde(deserialize_with = "duration_secs_f64")]
    program_thread: Duration,
    #[serde(deserialize_with = "duration_secs_f64")]
    schedule_thread: Duration,
    #[serde(deserialize_with = "duration_secs_f64")]
    notification: Duration,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
struct TomlSettings {
    connection: ConnectionConfig,
    i2c: I2cConfig,
    timings: TimingsConfig,
    timeouts: TimeoutsConfig,
}

/// Fully resolved runtime configuration: TOML file contents with any CLI
/// overrides already applied.
#[derive(Debug, Clone)]
pub struct Settings {
    pub device_id: String,
    pub bus_device: PathBuf,
    pub simulation_file: PathBuf,
    pub chip_addresses: crate::address::ChipTable,
    pub resolution: Duration,
    pub ignition: Duration,
    pub testloop_period: Duration,
    pub heartbeat_period: Duration,
    pub program_thread_timeout: Duration,
    pub schedule_thread_timeout: Duration,
    pub notification_timeout: Duration,
}

impl Settings {
    pub fn load(path: &Path) -> error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let toml: TomlSettings = toml::from_str(&contents)
            .map_err(|e| ErrorKind::General(format!("config {}: {}", path.display(), e)))?;
        Ok(Self::from_toml(toml))
    }

    fn from_toml(toml: TomlSettings) -> Self {
        Self {
            device_id: toml.connection.device_id,
            bus_device: toml.i2c.bus_device,
            simulation_file: toml.i2c.simulation_file,
            chip_addresses: toml.i2c.chip_addresses,
            resolution: toml.timings.resolution,
            ignition: toml.timings.ignition,
            testloop_period: toml.timings.testloop_period,
            heartbeat_period: toml.timings.heartbeat_period,
            program_thread_timeout: toml.timeouts.program_thread,
            schedule_thread_timeout: toml.timeouts.schedule_thread,
            notification_timeout: toml.timeouts.notification,
        }
    }

    /// Apply `--device-id`/`--bus-device` CLI overrides on top of the
    /// loaded file, matching the teacher's pool/user CLI-override pattern
    /// in the old `main.rs`.
    pub fn apply_cli_overrides(&mut self, matches: &clap::ArgMatches<'_>) {
        if let Some(device_id) = matches.value_of("device-id") {
            self.device_id = device_id.to_string();
        }
        if let Some(bus_device) = matches.value_of("bus-device") {
            self.bus_device = PathBuf::from(bus_device);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [connection]
            device_id = "unit-1"

            [i2c]
            bus_device = "/dev/i2c-1"
            chip_addresses = { a = 32, b = 33 }

            [timings]
            resolution = 0.1
            ignition = 2.0
            testloop_period = 1.0
            heartbeat_period = 5.0

            [timeouts]
            program_thread = 5.0
            schedule_thread = 5.0
            notification = 2.0
        "#;
        let parsed: TomlSettings = toml::from_str(toml).unwrap();
        let settings = Settings::from_toml(parsed);
        assert_eq!(settings.device_id, "unit-1");
        assert_eq!(settings.chip_addresses.get(&'a'), Some(&32));
        assert_eq!(settings.ignition, Duration::from_secs(2));
    }

    #[test]
    fn test_rejects_unknown_field() {
        let toml = r#"
            [connection]
            device_id = "unit-1"
            bogus = true

            [i2c]
            bus_device = "/dev/i2c-1"
            chip_addresses = { a = 32 }

            [timings]
            resolution = 0.1
            ignition = 2.0
            testloop_period = 1.0
            heartbeat_period = 5.0

            [timeouts]
            program_thread = 5.0
            schedule_thread = 5.0
            notification = 2.0
        "#;
        assert!(toml::from_str::<TomlSettings>(toml).is_err());
    }
}
