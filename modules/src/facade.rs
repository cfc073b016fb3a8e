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
//! The production instrument facade, combining the three serial drivers.

use std::thread;
use std::time::Duration;
use hashbrown::HashMap;
use log::*;

use adrctl_core::prelude::{DeviceInfo, Instruments, InstrumentsConfig, PidMode,
                           Result, SettingCommand, Target};
use crate::heatswitch::HeatSwitch;
use crate::sim921::Sim921;
use crate::sim960::Sim960;

/// Settle time between consecutive setting commands to one device.
const SETTLE: Duration = Duration::from_millis(100);

pub struct SerialInstruments {
    sim960: Sim960,
    sim921: Sim921,
    heatswitch: HeatSwitch,
}

impl SerialInstruments {
    pub fn connect(cfg: &InstrumentsConfig) -> Result<SerialInstruments> {
        let sim960 = Sim960::connect(&cfg.sim960.port, cfg.sim960.baudrate)
            .map_err(|e| e.amend("connecting to the sim960"))?;
        let sim921 = Sim921::connect(&cfg.sim921.port, cfg.sim921.baudrate)
            .map_err(|e| e.amend("connecting to the sim921"))?;
        let heatswitch = HeatSwitch::connect(&cfg.heatswitch.port, cfg.heatswitch.baudrate)
            .map_err(|e| e.amend("connecting to the heat switch"))?;
        info!("connected: {} {} / {} {} / heat switch fw {}",
              sim960.info().model, sim960.info().serial,
              sim921.info().model, sim921.info().serial,
              heatswitch.firmware());
        Ok(SerialInstruments { sim960, sim921, heatswitch })
    }
}

impl Instruments for SerialInstruments {
    fn device_info(&mut self) -> Result<DeviceInfo> {
        Ok(self.sim960.info().clone())
    }

    fn initialized_at_last_connect(&self) -> bool {
        self.sim960.initialized_at_last_connect()
    }

    fn mode(&mut self) -> Result<PidMode> {
        self.sim960.mode()
    }

    fn set_mode(&mut self, mode: PidMode) -> Result<()> {
        self.sim960.set_mode(mode)
    }

    fn setpoint_current(&mut self) -> Result<f64> {
        self.sim960.manual_current()
    }

    fn set_setpoint_current(&mut self, amps: f64) -> Result<f64> {
        self.sim960.set_manual_current(amps)
    }

    fn input_voltage(&mut self) -> Result<f64> {
        self.sim960.input_voltage()
    }

    fn output_voltage(&mut self) -> Result<f64> {
        self.sim960.output_voltage()
    }

    fn apply_schema_settings(&mut self, settings: &HashMap<String, String>)
                             -> Result<HashMap<String, String>> {
        let mut effective = HashMap::new();
        for (key, value) in settings {
            let cmd = SettingCommand::new(key, value)?;
            match cmd.target() {
                Target::Sim960 => {
                    self.sim960.apply(&cmd)?;
                    thread::sleep(SETTLE);
                }
                Target::Sim921 => {
                    self.sim921.apply(&cmd)?;
                    thread::sleep(SETTLE);
                }
                Target::Registry => {}
            }
            effective.insert(cmd.setting.to_string(), cmd.value.clone());
        }
        Ok(effective)
    }

    fn heatswitch_close(&mut self) -> Result<()> {
        self.heatswitch.close()
    }

    fn heatswitch_open(&mut self) -> Result<()> {
        self.heatswitch.open()
    }

    fn heatswitch_is_closed(&mut self) -> Result<bool> {
        self.heatswitch.is_closed()
    }

    fn heatswitch_is_opened(&mut self) -> Result<bool> {
        self.heatswitch.is_opened()
    }

    fn bridge_to_scaled_output(&mut self) -> Result<()> {
        self.sim921.to_scaled_output()
    }

    fn bridge_to_manual_output(&mut self) -> Result<()> {
        self.sim921.to_manual_output()
    }

    fn bridge_in_scaled_output(&mut self) -> Result<bool> {
        self.sim921.in_scaled_output()
    }

    fn bridge_in_manual_output(&mut self) -> Result<bool> {
        self.sim921.in_manual_output()
    }
}
