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
//! The typed interface to the magnet instruments.
//!
//! The cycle machine talks to three pieces of hardware: the PID controller
//! that drives the magnet current, the resistance bridge that supplies the
//! temperature error signal, and the heat switch.  This trait is the seam
//! between the machine and the serial drivers, so the machine can be tested
//! against a scripted fake.

use hashbrown::HashMap;
use derive_new::new;

use crate::errors::Result;

/// Hard output limit of the current source (1 V/A boost board on a +-10 V
/// output).
pub const MAX_CURRENT: f64 = 10.0;

/// Hardware slope limit for current changes, in A/s.
pub const MAX_CURRENT_SLOPE: f64 = 0.015;

/// Output mode of the PID controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PidMode {
    /// Output follows a manually commanded setpoint current.
    Manual(f64),
    /// Output is computed by the instrument's PID loop.
    Pid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, new)]
pub struct DeviceInfo {
    pub model: String,
    pub firmware: String,
    pub serial: String,
}

/// Synchronous facade over the three instruments.  Each call may block up to
/// the per-command serial timeout; retries are the caller's business.
pub trait Instruments: Send {
    /// Identification of the PID controller.
    fn device_info(&mut self) -> Result<DeviceInfo>;
    /// False if the controller came up with factory settings, i.e. it lost
    /// its configuration and needs the full schema pushed.
    fn initialized_at_last_connect(&self) -> bool;

    fn mode(&mut self) -> Result<PidMode>;
    fn set_mode(&mut self, mode: PidMode) -> Result<()>;

    /// The commanded setpoint current in A.
    fn setpoint_current(&mut self) -> Result<f64>;
    /// Command a new setpoint current; oversteps are clipped to the hardware
    /// limit with a warning.  Returns the effective value.
    fn set_setpoint_current(&mut self, amps: f64) -> Result<f64>;

    /// Voltage arriving from the bridge at the error input.
    fn input_voltage(&mut self) -> Result<f64>;
    /// Voltage at the current-source control output.
    fn output_voltage(&mut self) -> Result<f64>;

    /// Apply validated schema settings to the instruments they target.
    /// Idempotent; returns the effective values.
    fn apply_schema_settings(&mut self, settings: &HashMap<String, String>)
                             -> Result<HashMap<String, String>>;

    fn heatswitch_close(&mut self) -> Result<()>;
    fn heatswitch_open(&mut self) -> Result<()>;
    fn heatswitch_is_closed(&mut self) -> Result<bool>;
    fn heatswitch_is_opened(&mut self) -> Result<bool>;

    fn bridge_to_scaled_output(&mut self) -> Result<()>;
    fn bridge_to_manual_output(&mut self) -> Result<()>;
    fn bridge_in_scaled_output(&mut self) -> Result<bool>;
    fn bridge_in_manual_output(&mut self) -> Result<bool>;

    /// Raise the setpoint by delta A (clipped at the top).
    fn increment_setpoint(&mut self, delta: f64) -> Result<f64> {
        let cur = self.setpoint_current()?;
        self.set_setpoint_current(cur + delta)
    }

    /// Lower the setpoint by delta A, never below zero.
    fn decrement_setpoint(&mut self, delta: f64) -> Result<f64> {
        let cur = self.setpoint_current()?;
        self.set_setpoint_current((cur - delta).max(0.))
    }

    /// Remove the magnet current: manual mode with a zero setpoint.
    fn kill_current(&mut self) -> Result<()> {
        self.set_mode(PidMode::Manual(0.))
    }
}
