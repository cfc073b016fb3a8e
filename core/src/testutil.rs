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
//! Test doubles: an in-memory bus and a scripted instrument facade.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use crossbeam_channel::{unbounded, Receiver, Sender};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::bus::Bus;
use crate::errors::{Error, Result};
use crate::instruments::{DeviceInfo, Instruments, PidMode, MAX_CURRENT};

/// A statefile path in the system temp directory, unique per test.
pub fn temp_statefile(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("adrctl-test-{}-{}.state", std::process::id(), tag))
}


/// In-memory stand-in for the key-value bus.  Records every `set` so tests
/// can count publications.
#[derive(Default)]
pub struct MemBus {
    data: Mutex<HashMap<String, String>>,
    ts: Mutex<HashMap<String, Vec<(u64, f64)>>>,
    subs: Mutex<Vec<(Vec<String>, Sender<(String, String)>)>>,
    history: Mutex<Vec<(String, String)>>,
    pub fail: AtomicBool,
}

impl MemBus {
    pub fn new() -> Arc<MemBus> {
        Arc::new(MemBus::default())
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            Err(Error::io("bus is down"))
        } else {
            Ok(())
        }
    }

    /// Store a value without recording it in the publication history.
    pub fn seed(&self, key: &str, value: &str) {
        self.data.lock().insert(key.into(), value.into());
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.data.lock().get(key).cloned()
    }

    pub fn set_latest(&self, key: &str, value: f64) {
        self.ts.lock().entry(key.into()).or_default().push((0, value));
    }

    pub fn samples(&self, key: &str) -> Vec<f64> {
        self.ts.lock().get(key).map_or_else(Vec::new, |v| v.iter().map(|s| s.1).collect())
    }

    /// All values ever `set` for the given key, in order.
    pub fn sets_of(&self, key: &str) -> Vec<String> {
        self.history.lock().iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Deliver a message to matching subscribers, like an external publisher.
    pub fn push(&self, channel: &str, payload: &str) {
        self.subs.lock().retain(|(channels, sender)| {
            if channels.iter().any(|ch| ch == channel) {
                sender.send((channel.into(), payload.into())).is_ok()
            } else {
                true
            }
        });
    }
}

impl Bus for MemBus {
    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.data.lock().insert(key.into(), value.into());
        self.history.lock().push((key.into(), value.into()));
        self.push(key, value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.data.lock().get(key).cloned())
    }

    fn add(&self, key: &str, value: f64) -> Result<()> {
        self.check()?;
        self.ts.lock().entry(key.into()).or_default().push((0, value));
        Ok(())
    }

    fn latest(&self, key: &str) -> Result<Option<(u64, f64)>> {
        self.check()?;
        Ok(self.ts.lock().get(key).and_then(|v| v.last().copied()))
    }

    fn create_ts(&self, key: &str) -> Result<()> {
        self.check()?;
        self.ts.lock().entry(key.into()).or_default();
        Ok(())
    }

    fn subscribe(&self, channels: &[String]) -> Result<Receiver<(String, String)>> {
        self.check()?;
        let (sender, receiver) = unbounded();
        self.subs.lock().push((channels.to_vec(), sender));
        Ok(receiver)
    }
}


/// Scripted instrument state, shared between the fake facade handed to the
/// controller and the test that pokes it.
pub struct FakeState {
    pub pid: bool,
    pub setpoint: f64,
    pub hs_closed: bool,
    pub hs_open: bool,
    hs_target: Option<bool>,
    /// Commands are accepted but the switch never moves.
    pub stuck_heatswitch: bool,
    pub bridge_scaled: bool,
    pub initialized: bool,
    pub fail_pid: bool,
    pub fail_all: bool,
    pub close_cmds: usize,
    pub open_cmds: usize,
    pub applied: Vec<(String, String)>,
}

impl Default for FakeState {
    fn default() -> Self {
        FakeState {
            pid: false,
            setpoint: 0.,
            hs_closed: false,
            hs_open: true,
            hs_target: None,
            stuck_heatswitch: false,
            bridge_scaled: false,
            initialized: true,
            fail_pid: false,
            fail_all: false,
            close_cmds: 0,
            open_cmds: 0,
            applied: Vec::new(),
        }
    }
}

impl FakeState {
    /// Let a commanded heat switch motion complete.
    pub fn settle_heatswitch(&mut self) {
        if self.stuck_heatswitch {
            return;
        }
        if let Some(closed) = self.hs_target.take() {
            self.hs_closed = closed;
            self.hs_open = !closed;
        }
    }

    pub fn mode(&self) -> PidMode {
        if self.pid { PidMode::Pid } else { PidMode::Manual(self.setpoint) }
    }
}

pub struct FakeInstruments(pub Arc<Mutex<FakeState>>);

impl FakeInstruments {
    pub fn new() -> (FakeInstruments, Arc<Mutex<FakeState>>) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        (FakeInstruments(Arc::clone(&state)), state)
    }
}

impl Instruments for FakeInstruments {
    fn device_info(&mut self) -> Result<DeviceInfo> {
        if self.0.lock().fail_all {
            return Err(Error::io("sim offline"));
        }
        Ok(DeviceInfo::new("SIM960".into(), "ver2.17".into(), "s/n004242".into()))
    }

    fn initialized_at_last_connect(&self) -> bool {
        self.0.lock().initialized
    }

    fn mode(&mut self) -> Result<PidMode> {
        let state = self.0.lock();
        if state.fail_all {
            return Err(Error::io("sim offline"));
        }
        Ok(state.mode())
    }

    fn set_mode(&mut self, mode: PidMode) -> Result<()> {
        let mut state = self.0.lock();
        if state.fail_all {
            return Err(Error::io("sim offline"));
        }
        match mode {
            PidMode::Pid => {
                if state.fail_pid {
                    return Err(Error::io("sim offline"));
                }
                state.pid = true;
            }
            PidMode::Manual(setpoint) => {
                state.pid = false;
                state.setpoint = setpoint;
            }
        }
        Ok(())
    }

    fn setpoint_current(&mut self) -> Result<f64> {
        let state = self.0.lock();
        if state.fail_all {
            return Err(Error::io("sim offline"));
        }
        Ok(state.setpoint)
    }

    fn set_setpoint_current(&mut self, amps: f64) -> Result<f64> {
        let mut state = self.0.lock();
        if state.fail_all {
            return Err(Error::io("sim offline"));
        }
        state.setpoint = amps.clamp(0., MAX_CURRENT);
        Ok(state.setpoint)
    }

    fn input_voltage(&mut self) -> Result<f64> {
        if self.0.lock().fail_all {
            return Err(Error::io("sim offline"));
        }
        Ok(0.5)
    }

    fn output_voltage(&mut self) -> Result<f64> {
        let state = self.0.lock();
        if state.fail_all {
            return Err(Error::io("sim offline"));
        }
        Ok(state.setpoint)
    }

    fn apply_schema_settings(&mut self, settings: &HashMap<String, String>)
                             -> Result<HashMap<String, String>> {
        let mut state = self.0.lock();
        if state.fail_all {
            return Err(Error::io("sim offline"));
        }
        let mut effective = HashMap::new();
        for (key, value) in settings {
            state.applied.push((key.clone(), value.clone()));
            effective.insert(key.clone(), value.clone());
        }
        Ok(effective)
    }

    fn heatswitch_close(&mut self) -> Result<()> {
        let mut state = self.0.lock();
        if state.fail_all {
            return Err(Error::io("heat switch offline"));
        }
        state.close_cmds += 1;
        state.hs_target = Some(true);
        Ok(())
    }

    fn heatswitch_open(&mut self) -> Result<()> {
        let mut state = self.0.lock();
        if state.fail_all {
            return Err(Error::io("heat switch offline"));
        }
        state.open_cmds += 1;
        state.hs_target = Some(false);
        Ok(())
    }

    fn heatswitch_is_closed(&mut self) -> Result<bool> {
        let state = self.0.lock();
        if state.fail_all {
            return Err(Error::io("heat switch offline"));
        }
        Ok(state.hs_closed)
    }

    fn heatswitch_is_opened(&mut self) -> Result<bool> {
        let state = self.0.lock();
        if state.fail_all {
            return Err(Error::io("heat switch offline"));
        }
        Ok(state.hs_open)
    }

    fn bridge_to_scaled_output(&mut self) -> Result<()> {
        let mut state = self.0.lock();
        if state.fail_all {
            return Err(Error::io("bridge offline"));
        }
        state.bridge_scaled = true;
        Ok(())
    }

    fn bridge_to_manual_output(&mut self) -> Result<()> {
        let mut state = self.0.lock();
        if state.fail_all {
            return Err(Error::io("bridge offline"));
        }
        state.bridge_scaled = false;
        Ok(())
    }

    fn bridge_in_scaled_output(&mut self) -> Result<bool> {
        let state = self.0.lock();
        if state.fail_all {
            return Err(Error::io("bridge offline"));
        }
        Ok(state.bridge_scaled)
    }

    fn bridge_in_manual_output(&mut self) -> Result<bool> {
        let state = self.0.lock();
        if state.fail_all {
            return Err(Error::io("bridge offline"));
        }
        Ok(!state.bridge_scaled)
    }
}
