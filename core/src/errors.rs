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
//! Enumeration of possible controller errors.

use std::{error, fmt, result};


pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Serial or bus transport failure.  Recovered locally: guards evaluate
    /// false, actions warn and noop.
    Io,
    /// Malformed reply from an instrument.  Handled like Io, logged louder.
    Protocol,
    /// A requested setting value failed validation.
    OutOfRange,
    /// A setting or trigger is blocked by the current cycle state.
    State,
    /// The pub/sub bus is unreachable over sustained retries.  Fatal.
    BusLost,
    // Internal
    Config,
    Parsing,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// True for errors a guard or action is allowed to absorb.
    pub fn is_io(&self) -> bool {
        matches!(self.kind, ErrorKind::Io | ErrorKind::Protocol)
    }

    pub fn amend(mut self, msg: &str) -> Self {
        self.message = format!("{} ({})", self.message, msg);
        self
    }

    // Quick construction.

    pub fn io(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Io, message: msg.into() }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Protocol, message: msg.into() }
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::OutOfRange, message: msg.into() }
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::State, message: msg.into() }
    }

    pub fn bus_lost(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::BusLost, message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Config, message: msg.into() }
    }

    pub fn parsing(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Parsing, message: msg.into() }
    }

    fn wire_name(&self) -> &'static str {
        use self::ErrorKind::*;
        match self.kind {
            Io => "IOError",
            Protocol => "ProtocolError",
            OutOfRange => "OutOfRange",
            State => "StateError",
            BusLost => "BusLostError",
            Config | Parsing => "InternalError",
        }
    }
}

/// Allow quick conversion of io::Error to transport errors.
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::io(e.to_string())
    }
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.wire_name(), self.message)
    }
}
