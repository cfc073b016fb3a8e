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
//! The settings registry schema.
//!
//! Every settable key carries a contract: either an enumeration mapping
//! user-facing names to instrument command arguments, or a numeric range.
//! Keys targeting an instrument translate into a command line for it; the
//! cycle parameters are registry-only and drive no device command.

use std::fmt;
use hashbrown::HashMap;
use lazy_static::lazy_static;

use crate::errors::{Error, Result};
use crate::instruments::MAX_CURRENT;

// Cycle parameters.
pub const RAMP_SLOPE_KEY: &str = "device-settings:sim960:ramp-rate";
pub const DERAMP_SLOPE_KEY: &str = "device-settings:sim960:deramp-rate";
pub const SOAK_TIME_KEY: &str = "device-settings:sim960:soak-time";
pub const SOAK_CURRENT_KEY: &str = "device-settings:sim960:soak-current";
pub const REGULATION_TEMP_KEY: &str = "device-settings:mkidarray:regulating-temp";
pub const BRIDGE_TEMP_OFFSET_KEY: &str = "device-settings:sim921:temp-offset";

// Engineering keys: read by the controller, never accepted as commands.
pub const UPPER_LIMIT_KEY: &str =
    "device-settings:sim960:enable-temperature-regulation-upper-limit";
pub const COOLDOWN_SCHEDULED_KEY: &str = "device-settings:sim960:cooldown-scheduled";
pub const STATEFILE_PATH_KEY: &str = "device-settings:sim960:statefile";

/// Which end a validated setting is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Sim960,
    Sim921,
    Registry,
}

/// Per-key validation contract.
#[derive(Debug)]
pub enum Contract {
    /// Map of user-facing value to instrument command argument.
    Choice(&'static [(&'static str, &'static str)]),
    /// Inclusive numeric range.
    Range(f64, f64),
}

#[derive(Debug)]
pub struct Setting {
    pub target: Target,
    /// Instrument command mnemonic; empty for registry-only keys.
    pub command: &'static str,
    pub contract: Contract,
}

const ON_OFF: &[(&str, &str)] = &[("off", "0"), ("on", "1")];

lazy_static! {
    /// The full schema, keyed by registry key.
    pub static ref SCHEMA: HashMap<&'static str, Setting> = {
        use self::Contract::*;
        use self::Target::*;
        let mut m = HashMap::new();
        let mut ins = |key, target, command, contract| {
            m.insert(key, Setting { target, command, contract });
        };

        // SIM960 PID controller
        ins("device-settings:sim960:mode", Sim960, "AMAN",
            Choice(&[("manual", "0"), ("pid", "1")]));
        ins("device-settings:sim960:vout-value", Sim960, "MOUT", Range(-10., 10.));
        ins("device-settings:sim960:vout-min-limit", Sim960, "LLIM", Range(-10., 10.));
        ins("device-settings:sim960:vout-max-limit", Sim960, "ULIM", Range(-10., 10.));
        ins("device-settings:sim960:setpoint-mode", Sim960, "INPT",
            Choice(&[("internal", "0"), ("external", "1")]));
        ins("device-settings:sim960:pid-control-vin-setpoint", Sim960, "SETP",
            Range(-10., 10.));
        ins("device-settings:sim960:pid-p:value", Sim960, "GAIN", Range(-1e3, -1e-1));
        ins("device-settings:sim960:pid-i:value", Sim960, "INTG", Range(1e-2, 5e5));
        ins("device-settings:sim960:pid-d:value", Sim960, "DERV", Range(0., 1e1));
        ins("device-settings:sim960:setpoint-ramp-enable", Sim960, "RAMP",
            Choice(ON_OFF));
        ins("device-settings:sim960:setpoint-ramp-rate", Sim960, "RATE",
            Range(1e-3, 1e4));
        ins("device-settings:sim960:pid-p:enabled", Sim960, "PCTL", Choice(ON_OFF));
        ins("device-settings:sim960:pid-i:enabled", Sim960, "ICTL", Choice(ON_OFF));
        ins("device-settings:sim960:pid-d:enabled", Sim960, "DCTL", Choice(ON_OFF));

        // SIM921 resistance bridge
        ins("device-settings:sim921:resistance-range", Sim921, "RANG",
            Choice(&[("20e-3", "0"), ("200e-3", "1"), ("2", "2"), ("20", "3"),
                     ("200", "4"), ("2e3", "5"), ("20e3", "6"), ("200e3", "7"),
                     ("2e6", "8"), ("20e6", "9")]));
        ins("device-settings:sim921:excitation-value", Sim921, "EXCI",
            Choice(&[("0", "-1"), ("3e-6", "0"), ("10e-6", "1"), ("30e-6", "2"),
                     ("100e-6", "3"), ("300e-6", "4"), ("1e-3", "5"), ("3e-3", "6"),
                     ("10e-3", "7"), ("30e-3", "8")]));
        ins("device-settings:sim921:excitation-mode", Sim921, "MODE",
            Choice(&[("passive", "0"), ("current", "1"), ("voltage", "2"),
                     ("power", "3")]));
        ins("device-settings:sim921:time-constant", Sim921, "TCON",
            Choice(&[("0.3", "0"), ("1", "1"), ("3", "2"), ("10", "3"),
                     ("30", "4"), ("100", "5"), ("300", "6")]));
        ins(BRIDGE_TEMP_OFFSET_KEY, Sim921, "TSET", Range(0.050, 40.));
        ins("device-settings:sim921:resistance-offset", Sim921, "RSET",
            Range(1049.08, 63765.1));
        ins("device-settings:sim921:temp-slope", Sim921, "VKEL", Range(0., 1e-2));
        ins("device-settings:sim921:resistance-slope", Sim921, "VOHM", Range(0., 1e-5));
        ins("device-settings:sim921:output-mode", Sim921, "AMAN",
            Choice(&[("scaled", "0"), ("manual", "1")]));
        ins("device-settings:sim921:manual-vout", Sim921, "AOUT", Range(-10., 10.));
        ins("device-settings:sim921:curve-number", Sim921, "CURV",
            Choice(&[("1", "1"), ("2", "2"), ("3", "3")]));

        // Cycle parameters, registry-only.  Slopes above the hardware limit
        // are storable; the machine clips them at use and writes back.
        ins(RAMP_SLOPE_KEY, Registry, "", Range(0., 1.));
        ins(DERAMP_SLOPE_KEY, Registry, "", Range(0., 1.));
        ins(SOAK_CURRENT_KEY, Registry, "", Range(0., MAX_CURRENT));
        ins(SOAK_TIME_KEY, Registry, "", Range(0., 86400.));
        ins(REGULATION_TEMP_KEY, Registry, "", Range(0., 4.));

        m
    };
}

/// All schema keys accepted on the command channel, sorted for determinism.
pub fn commandable_keys() -> Vec<&'static str> {
    let mut keys: Vec<_> = SCHEMA.keys().copied().collect();
    keys.sort_unstable();
    keys
}

/// The keys pushed to the instruments during a full schema initialization.
pub fn device_setting_keys() -> Vec<&'static str> {
    let mut keys: Vec<_> = SCHEMA.iter()
        .filter(|(_, s)| s.target != Target::Registry)
        .map(|(k, _)| *k)
        .collect();
    keys.sort_unstable();
    keys
}

/// A validated setting change, ready to be applied.
#[derive(Debug)]
pub struct SettingCommand {
    /// Canonical registry key.
    pub setting: &'static str,
    /// Canonical value as stored in the registry.
    pub value: String,
    arg: String,
    entry: &'static Setting,
}

impl SettingCommand {
    /// Validate a key/value pair against the schema.
    pub fn new(key: &str, value: &str) -> Result<SettingCommand> {
        let (&setting, entry) = SCHEMA.get_key_value(key).ok_or_else(
            || Error::out_of_range(format!("unknown setting: {}", key)))?;
        let value = value.trim();
        let arg = match entry.contract {
            Contract::Choice(pairs) => {
                match pairs.iter().find(|(name, _)| *name == value) {
                    Some((_, arg)) => (*arg).into(),
                    None => {
                        let options: Vec<_> = pairs.iter().map(|(n, _)| *n).collect();
                        return Err(Error::out_of_range(format!(
                            "invalid value {:?} for {}, options are: {}",
                            value, key, options.join(", "))));
                    }
                }
            }
            Contract::Range(lo, hi) => {
                let num: f64 = value.parse().map_err(
                    |_| Error::out_of_range(format!(
                        "invalid value {:?} for {}, must be a number", value, key)))?;
                if !(lo..=hi).contains(&num) {
                    return Err(Error::out_of_range(format!(
                        "invalid value {} for {}, must be within [{}, {}]",
                        num, key, lo, hi)));
                }
                num.to_string()
            }
        };
        Ok(SettingCommand { setting, value: value.into(), arg, entry })
    }

    pub fn target(&self) -> Target {
        self.entry.target
    }

    /// The command line for the instrument, or None for registry-only keys.
    pub fn device_string(&self) -> Option<String> {
        if self.entry.command.is_empty() {
            None
        } else {
            Some(format!("{} {}", self.entry.command, self.arg))
        }
    }
}

impl fmt::Display for SettingCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.device_string() {
            Some(cmd) => write!(f, "{}={} ({})", self.setting, self.value, cmd),
            None => write!(f, "{}={}", self.setting, self.value),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn choice_mapping() {
        let cmd = SettingCommand::new("device-settings:sim960:mode", "pid").unwrap();
        assert_eq!(cmd.device_string().as_deref(), Some("AMAN 1"));
        assert_eq!(cmd.target(), Target::Sim960);
        let cmd = SettingCommand::new("device-settings:sim921:output-mode", "scaled").unwrap();
        assert_eq!(cmd.device_string().as_deref(), Some("AMAN 0"));
        assert_eq!(cmd.target(), Target::Sim921);
    }

    #[test]
    fn choice_rejects_unknown_value() {
        let err = SettingCommand::new("device-settings:sim960:mode", "auto").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn range_validation() {
        let cmd = SettingCommand::new("device-settings:sim960:pid-p:value", "-16").unwrap();
        assert_eq!(cmd.device_string().as_deref(), Some("GAIN -16"));
        // limits are inclusive
        assert!(SettingCommand::new("device-settings:sim960:pid-p:value", "-1e3").is_ok());
        assert!(SettingCommand::new("device-settings:sim960:pid-p:value", "-0.05").is_err());
        assert!(SettingCommand::new("device-settings:sim960:vout-value", "10.5").is_err());
        assert!(SettingCommand::new(SOAK_CURRENT_KEY, "12").is_err());
    }

    #[test]
    fn range_rejects_garbage() {
        let err = SettingCommand::new(SOAK_TIME_KEY, "forever").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn unknown_key() {
        let err = SettingCommand::new("device-settings:sim960:nonsense", "1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn registry_keys_have_no_device_command() {
        let cmd = SettingCommand::new(RAMP_SLOPE_KEY, "0.005").unwrap();
        assert_eq!(cmd.target(), Target::Registry);
        assert_eq!(cmd.device_string(), None);
    }

    #[test]
    fn engineering_keys_not_commandable() {
        for key in [UPPER_LIMIT_KEY, COOLDOWN_SCHEDULED_KEY, STATEFILE_PATH_KEY] {
            assert!(!commandable_keys().contains(&key));
        }
        assert!(commandable_keys().contains(&RAMP_SLOPE_KEY));
    }

    #[test]
    fn device_keys_exclude_cycle_parameters() {
        let keys = device_setting_keys();
        assert!(keys.contains(&"device-settings:sim960:mode"));
        assert!(keys.contains(&BRIDGE_TEMP_OFFSET_KEY));
        assert!(!keys.contains(&RAMP_SLOPE_KEY));
        assert!(!keys.contains(&REGULATION_TEMP_KEY));
    }
}
