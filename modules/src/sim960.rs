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
//! Driver for the SRS SIM960 analog PID controller.
//!
//! The SIM960 output drives the high-current boost board at 1 V/A, so output
//! volts and magnet amps are used interchangeably here.

use std::time::Duration;
use log::*;

use adrctl_core::prelude::{DeviceInfo, Error, PidMode, Result, SettingCommand,
                           MAX_CURRENT};
use crate::support::comm::{self, SerialClient};

const COMMAND_TIMEOUT: Duration = Duration::from_millis(100);

pub struct Sim960 {
    io: SerialClient,
    info: DeviceInfo,
    initialized: bool,
}

impl Sim960 {
    pub fn connect(port: &str, baudrate: u32) -> Result<Sim960> {
        let io = comm::serial_client(port, baudrate, COMMAND_TIMEOUT, "sim960")?;
        let mut dev = Sim960 { io, info: DeviceInfo::default(), initialized: false };
        dev.postconnect()?;
        Ok(dev)
    }

    fn postconnect(&mut self) -> Result<()> {
        let idn = self.io.communicate("*IDN?")?;
        self.info = comm::parse_idn(&idn, "SIM960")?;

        // the PID loop polarity must be negative; this is not a setting that
        // changes during normal operation
        self.io.send("APOL 0")?;
        let polarity = self.io.communicate("APOL?")?;
        if polarity != "0" {
            return Err(Error::protocol(format!(
                "polarity query returned {:?}, setting negative polarity failed",
                polarity)));
        }

        // output limits still at the factory default mean the module lost its
        // configuration since the last connect and needs the full schema
        let llim = self.query_f64("LLIM?")?;
        self.initialized = llim > -10. + 1e-6;
        if !self.initialized {
            warn!("output limits at factory defaults, module was reinitialized");
        }
        Ok(())
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn initialized_at_last_connect(&self) -> bool {
        self.initialized
    }

    fn query_f64(&self, query: &str) -> Result<f64> {
        let reply = self.io.communicate(query)?;
        reply.parse().map_err(
            |_| Error::protocol(format!("expected a number for {}: {:?}", query, reply)))
    }

    pub fn mode(&self) -> Result<PidMode> {
        match self.io.communicate("AMAN?")?.as_str() {
            "0" => Ok(PidMode::Manual(self.manual_current()?)),
            "1" => Ok(PidMode::Pid),
            other => Err(Error::protocol(format!("unexpected AMAN reply: {:?}", other))),
        }
    }

    pub fn set_mode(&self, mode: PidMode) -> Result<()> {
        match mode {
            PidMode::Pid => self.io.send("AMAN 1"),
            PidMode::Manual(setpoint) => {
                self.io.send("AMAN 0")?;
                self.set_manual_current(setpoint).map(|_| ())
            }
        }
    }

    /// The commanded output current in A.
    pub fn manual_current(&self) -> Result<f64> {
        self.query_f64("MOUT?")
    }

    /// Command a new output current; values outside the output range are
    /// clipped with a warning.  Returns the effective value.
    pub fn set_manual_current(&self, amps: f64) -> Result<f64> {
        let clipped = amps.clamp(0., MAX_CURRENT);
        if clipped != amps {
            warn!("requested {:.4} A is outside the output range, using {:.4} A",
                  amps, clipped);
        }
        self.io.send(&format!("MOUT {:.4}", clipped))?;
        Ok(clipped)
    }

    /// Voltage from the bridge at the measure input.
    pub fn input_voltage(&self) -> Result<f64> {
        self.query_f64("MMON?")
    }

    /// Voltage at the output monitor.  In manual mode this follows MOUT, in
    /// PID mode it is whatever the loop computes.
    pub fn output_voltage(&self) -> Result<f64> {
        self.query_f64("OMON?")
    }

    pub fn apply(&self, cmd: &SettingCommand) -> Result<()> {
        debug!("applying {}", cmd);
        match cmd.device_string() {
            Some(line) => self.io.send(&line),
            None => Err(Error::config(
                format!("setting {} has no device command", cmd.setting))),
        }
    }
}
