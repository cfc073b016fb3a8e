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
//! Driver for the Arduino actuating the mechanical heat switch.
//!
//! The switch takes seconds to travel, so `open`/`close` only start the
//! motion; callers poll the position until it reports the end stop.

use std::time::Duration;
use log::*;

use adrctl_core::prelude::{Error, Result};
use crate::support::comm::{self, SerialClient};

const COMMAND_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Open,
    Closed,
    Moving,
}

pub struct HeatSwitch {
    io: SerialClient,
    firmware: String,
}

impl HeatSwitch {
    pub fn connect(port: &str, baudrate: u32) -> Result<HeatSwitch> {
        let io = comm::serial_client(port, baudrate, COMMAND_TIMEOUT, "heatswitch")?;
        let firmware = io.communicate("firmware?")?;
        if firmware.is_empty() {
            return Err(Error::protocol("heat switch did not report a firmware version"));
        }
        debug!("heat switch firmware {}", firmware);
        Ok(HeatSwitch { io, firmware })
    }

    pub fn firmware(&self) -> &str {
        &self.firmware
    }

    pub fn open(&self) -> Result<()> {
        self.command("open")
    }

    pub fn close(&self) -> Result<()> {
        self.command("close")
    }

    fn command(&self, cmd: &str) -> Result<()> {
        match self.io.communicate(cmd)?.as_str() {
            "ok" => Ok(()),
            other => Err(Error::protocol(format!(
                "heat switch did not accept {:?}: {:?}", cmd, other))),
        }
    }

    pub fn is_closed(&self) -> Result<bool> {
        Ok(self.position()? == Position::Closed)
    }

    pub fn is_opened(&self) -> Result<bool> {
        Ok(self.position()? == Position::Open)
    }

    fn position(&self) -> Result<Position> {
        match self.io.communicate("position?")?.as_str() {
            "open" => Ok(Position::Open),
            "closed" => Ok(Position::Closed),
            "moving" => Ok(Position::Moving),
            other => Err(Error::protocol(format!(
                "unexpected heat switch position: {:?}", other))),
        }
    }
}
