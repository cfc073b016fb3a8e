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
//! Driver for the SRS SIM921 AC resistance bridge.
//!
//! During a cycle the controller only moves the analog output between manual
//! and scaled mode; the thermometry itself is read out elsewhere.

use std::time::Duration;
use log::*;

use adrctl_core::prelude::{DeviceInfo, Error, Result, SettingCommand};
use crate::support::comm::{self, SerialClient};

const COMMAND_TIMEOUT: Duration = Duration::from_millis(100);

pub struct Sim921 {
    io: SerialClient,
    info: DeviceInfo,
}

impl Sim921 {
    pub fn connect(port: &str, baudrate: u32) -> Result<Sim921> {
        let io = comm::serial_client(port, baudrate, COMMAND_TIMEOUT, "sim921")?;
        let mut dev = Sim921 { io, info: DeviceInfo::default() };
        dev.postconnect()?;
        Ok(dev)
    }

    fn postconnect(&mut self) -> Result<()> {
        let idn = self.io.communicate("*IDN?")?;
        self.info = comm::parse_idn(&idn, "SIM921")?;

        // the scaled output must be proportional to the resistance error,
        // not the temperature error: resistance spans one order of magnitude
        // over the operating range, temperature spans four
        self.io.send("ATEM 0")?;
        let atem = self.io.communicate("ATEM?")?;
        if atem != "0" {
            return Err(Error::protocol(format!(
                "setting ATEM=0 failed, got {:?}; do not operate", atem)));
        }

        // excitation has to be on to measure anything
        self.io.send("EXON 1")?;
        let exon = self.io.communicate("EXON?")?;
        if exon != "1" {
            return Err(Error::protocol(format!(
                "setting EXON=1 failed, got {:?}; unable to operate", exon)));
        }
        Ok(())
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Output follows the scaled resistance error (cycle operation).
    pub fn to_scaled_output(&self) -> Result<()> {
        self.io.send("AMAN 0")
    }

    /// Output is set manually (idle operation).
    pub fn to_manual_output(&self) -> Result<()> {
        self.io.send("AMAN 1")
    }

    pub fn in_scaled_output(&self) -> Result<bool> {
        Ok(self.io.communicate("AMAN?")? == "0")
    }

    pub fn in_manual_output(&self) -> Result<bool> {
        Ok(self.io.communicate("AMAN?")? == "1")
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
