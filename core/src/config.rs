// -----------------------------------------------------------------------------
// ADR magnet cycle control
//
// This program is free software; you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation; either version 2 of the License, or (at your option) any later
// version.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program; if not, write to the Free Software Foundation, Inc.,
// 59 Temple Place, Suite 330, Boston, MA  02111-1307  USA
//
// -----------------------------------------------------------------------------
//
//! Configuration file handling.

use std::path::{Path, PathBuf};
use serde_derive::Deserialize;


#[derive(Deserialize)]
pub struct Config {
    pub description: Option<String>,
    #[serde(default)]
    pub bus: BusConfig,
    pub instruments: InstrumentsConfig,
    /// Fallback statefile location, used until the registry has one stored.
    #[serde(default = "default_statefile")]
    pub statefile: PathBuf,
}

#[derive(Deserialize, Clone)]
pub struct BusConfig {
    #[serde(default = "default_bus_host")]
    pub host: String,
    #[serde(default = "default_bus_port")]
    pub port: u16,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig { host: default_bus_host(), port: default_bus_port() }
    }
}

impl BusConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Deserialize, Clone)]
pub struct SerialConfig {
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
}

#[derive(Deserialize)]
pub struct InstrumentsConfig {
    pub sim960: SerialConfig,
    pub sim921: SerialConfig,
    pub heatswitch: SerialConfig,
}

fn default_statefile() -> PathBuf {
    "magnet.statefile".into()
}

fn default_bus_host() -> String {
    "localhost".into()
}

fn default_bus_port() -> u16 {
    6379
}

fn default_baudrate() -> u32 {
    9600
}


pub fn load_config(filename: impl AsRef<Path>) -> Result<Config, String> {
    let data = std::fs::read(&filename).map_err(|e| e.to_string())?;
    toml::from_slice(&data).map_err(|e| e.to_string())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let cfg: Config = toml::from_str(r#"
            description = "PICTURE-C ADR"
            statefile = "/data/magnet.statefile"

            [bus]
            host = "10.0.0.5"
            port = 6380

            [instruments.sim960]
            port = "/dev/sim960"

            [instruments.sim921]
            port = "/dev/sim921"

            [instruments.heatswitch]
            port = "/dev/heatswitch"
            baudrate = 115200
        "#).unwrap();
        assert_eq!(cfg.bus.addr(), "10.0.0.5:6380");
        assert_eq!(cfg.instruments.sim960.baudrate, 9600);
        assert_eq!(cfg.instruments.heatswitch.baudrate, 115200);
        assert_eq!(cfg.statefile, PathBuf::from("/data/magnet.statefile"));
    }

    #[test]
    fn bus_defaults() {
        let cfg: Config = toml::from_str(r#"
            [instruments.sim960]
            port = "/dev/sim960"
            [instruments.sim921]
            port = "/dev/sim921"
            [instruments.heatswitch]
            port = "/dev/heatswitch"
        "#).unwrap();
        assert_eq!(cfg.bus.addr(), "localhost:6379");
        assert_eq!(cfg.statefile, PathBuf::from("magnet.statefile"));
    }
}
