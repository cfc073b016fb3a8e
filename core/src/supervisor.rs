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
//! The controller supervisor.
//!
//! Owns the machine behind the single lock and runs the long-lived tasks
//! around it: the stepping loop that fires `next` once a second, the
//! telemetry monitor, the command loop fed by the bus subscription, and
//! one-shot cooldown timers.  Also computes the safe initial state after a
//! restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use log::*;
use crossbeam_channel::{tick, Receiver, RecvTimeoutError};
use hashbrown::HashMap;
use mlzutil::time::localtime;
use parking_lot::Mutex;

use crate::bus::Bus;
use crate::errors::{Error, ErrorKind, Result};
use crate::instruments::{Instruments, PidMode, MAX_CURRENT, MAX_CURRENT_SLOPE};
use crate::machine::{CycleState, MagnetController, MAGNET_STATE_KEY};
use crate::persist;
use crate::schema::{self, SettingCommand};

pub const STATUS_KEY: &str = "status:device:sim960:status";
pub const MODEL_KEY: &str = "status:device:sim960:model";
pub const FIRMWARE_KEY: &str = "status:device:sim960:firmware";
pub const SN_KEY: &str = "status:device:sim960:sn";

// Telemetry time series.
pub const OUTPUT_VOLTAGE_KEY: &str = "status:device:sim960:hcfet-control-voltage";
pub const INPUT_VOLTAGE_KEY: &str = "status:device:sim960:vin";
pub const MAGNET_CURRENT_KEY: &str = "status:device:sim960:current-setpoint";

// Magnet commands, arriving on `command:<name>` channels.
pub const COLD_AT_CMD: &str = "be-cold-at";
pub const COLD_NOW_CMD: &str = "get-cold";
pub const ABORT_CMD: &str = "abort-cooldown";
pub const CANCEL_COOLDOWN_CMD: &str = "cancel-scheduled-cooldown";
pub const QUENCH_KEY: &str = "event:quenching";

/// Period of the telemetry monitor.
const QUERY_INTERVAL: Duration = Duration::from_millis(1);
/// Period of the stepping loop.
const STEP_INTERVAL: Duration = Duration::from_secs(1);

const BUS_RETRIES: u32 = 5;
const BUS_RETRY_DELAY: Duration = Duration::from_secs(2);

const SHUTDOWN_POLL: Duration = Duration::from_secs(1);
/// Generous bound on a full deramp at the minimum usable slope.
const SHUTDOWN_TIMEOUT: f64 = 2. * MAX_CURRENT / MAX_CURRENT_SLOPE;


/// All channels the command loop subscribes to.
pub fn command_channels() -> Vec<String> {
    let mut channels: Vec<String> = schema::commandable_keys().iter()
        .map(|key| format!("command:{}", key))
        .collect();
    for cmd in [COLD_AT_CMD, COLD_NOW_CMD, ABORT_CMD, CANCEL_COOLDOWN_CMD, QUENCH_KEY] {
        channels.push(format!("command:{}", cmd));
    }
    channels
}


/// Determine the state to restart into.
///
/// Deramping is always safe: it drives the current toward zero no matter
/// what the hardware is doing.  Everything better than that has to be earned
/// by evidence that we are still in sync with the instruments.
pub fn compute_initial_state(bus: &dyn Bus, sim: &mut dyn Instruments,
                             statefile: &Path) -> CycleState {
    use crate::machine::CycleState::*;

    let fallback = Deramping;
    if !sim.initialized_at_last_connect() {
        // factory settings mean the device had an upset, nothing it reports
        // relates to the previous cycle
        info!("instrument was reinitialized, starting from {}", fallback);
        return fallback;
    }
    match sim.mode() {
        // NB if the heat switch is in the wrong position the device will not
        // stay cold and the machine falls out to deramping on its own
        Ok(PidMode::Pid) => return Regulating,
        Ok(_) => {}
        Err(e) => {
            error!("lost the instrument during startup, defaulting to {}: {}",
                   fallback, e);
            return fallback;
        }
    }

    let mut initial = match persist::load_persisted_state(statefile) {
        (Some(tstamp), Some(state)) if !persist::is_stale(tstamp) => state,
        _ => return fallback,
    };

    if initial == Soaking {
        if let (Ok(current), Ok(soak)) = (sim.setpoint_current(),
                                          bus.get_f64(schema::SOAK_CURRENT_KEY)) {
            if current >= 0.98 * soak && current <= 1.02 * soak {
                initial = Ramping;  // we can recover
            }
        }
    }

    // be sure the heat switch command is actually out
    if initial == HsClosing {
        let _ = sim.heatswitch_close();
    }
    if initial == HsOpening {
        let _ = sim.heatswitch_open();
    }

    // a heat switch position contradicting the persisted state means we are
    // out of sync with the hardware; off/regulating are never resumed blind
    let hs_open = sim.heatswitch_is_opened().unwrap_or(false);
    let hs_closed = sim.heatswitch_is_closed().unwrap_or(false);
    if (matches!(initial, Ramping | Soaking) && hs_open)
        || (initial == Cooling && hs_closed)
        || matches!(initial, Off | Regulating)
    {
        initial = fallback;
    }
    info!("initial state is {}", initial);
    initial
}


#[derive(Clone)]
pub struct Supervisor {
    bus: Arc<dyn Bus>,
    ctl: Arc<Mutex<MagnetController>>,
    run: Arc<AtomicBool>,
}

impl Supervisor {
    /// Bring the controller up: resolve the statefile, recover the cycle
    /// state, publish device info, and push the schema settings if the
    /// instrument lost them.
    pub fn new(bus: Arc<dyn Bus>, mut instruments: Box<dyn Instruments>,
               fallback_statefile: &Path) -> Result<Supervisor> {
        for key in [INPUT_VOLTAGE_KEY, OUTPUT_VOLTAGE_KEY, MAGNET_CURRENT_KEY] {
            if let Err(e) = bus.create_ts(key) {
                warn!("creating time series {} failed: {}", key, e);
            }
        }

        let statefile = match bus.get(schema::STATEFILE_PATH_KEY) {
            Ok(Some(path)) if !path.is_empty() => PathBuf::from(path),
            _ => {
                let path = fallback_statefile.to_path_buf();
                if let Err(e) = bus.set(schema::STATEFILE_PATH_KEY,
                                        &path.to_string_lossy()) {
                    warn!("storing the statefile path failed: {}", e);
                }
                path
            }
        };

        if let Err(e) = bus.set(schema::COOLDOWN_SCHEDULED_KEY, "no") {
            warn!("resetting the cooldown schedule flag failed: {}", e);
        }
        // the upper-limit key is only seeded, an engineer's override survives
        if let Ok(None) = bus.get(schema::UPPER_LIMIT_KEY) {
            let _ = bus.set(schema::UPPER_LIMIT_KEY, "on");
        }

        let initial = compute_initial_state(&*bus, &mut *instruments, &statefile);
        if let Err(e) = bus.set(MAGNET_STATE_KEY, initial.name()) {
            warn!("publishing the initial state failed: {}", e);
        }

        let lost_config = !instruments.initialized_at_last_connect();
        let ctl = MagnetController::new(Arc::clone(&bus), instruments,
                                        statefile, initial);
        let sup = Supervisor { bus, ctl: Arc::new(Mutex::new(ctl)),
                               run: Arc::new(AtomicBool::new(true)) };

        sup.publish_device_info();
        if lost_config {
            info!("instrument lost its configuration, pushing all schema settings");
            sup.push_schema_settings()?;
        }
        Ok(sup)
    }

    pub fn stop(&self) {
        self.run.store(false, Ordering::Relaxed);
    }

    /// Spawn the stepping and telemetry tasks.
    pub fn start(&self) {
        let sup = self.clone();
        thread::spawn(move || sup.step_loop());
        let sup = self.clone();
        thread::spawn(move || sup.monitor_loop());
    }

    fn publish_device_info(&self) {
        let info = match self.ctl.lock().instruments.device_info() {
            Ok(info) => info,
            Err(e) => {
                error!("when checking device info: {}", e);
                Default::default()
            }
        };
        for (key, value) in [(MODEL_KEY, info.model),
                             (FIRMWARE_KEY, info.firmware),
                             (SN_KEY, info.serial)] {
            if let Err(e) = self.bus.set(key, &value) {
                warn!("storing device info failed: {}", e);
            }
        }
    }

    /// Pull every device setting from the registry, apply it through the
    /// facade and write the effective values back so registry and hardware
    /// agree.
    fn push_schema_settings(&self) -> Result<()> {
        let mut settings = HashMap::new();
        for key in schema::device_setting_keys() {
            match self.bus.get(key)? {
                Some(value) => {
                    settings.insert(key.to_string(), value);
                }
                None => return Err(Error::config(
                    format!("setting {} missing from the bus", key))),
            }
        }
        let effective = self.ctl.lock().instruments.apply_schema_settings(&settings)?;
        for (key, value) in &effective {
            if let Err(e) = self.bus.set(key, value) {
                warn!("writing setting {} back failed: {}", key, e);
            }
        }
        Ok(())
    }

    fn step_loop(&self) {
        mlzlog::set_thread_prefix("Step: ");
        let ticker = tick(STEP_INTERVAL);
        while self.run.load(Ordering::Relaxed) {
            if ticker.recv().is_err() {
                break;
            }
            let mut ctl = self.ctl.lock();
            ctl.next();
            debug!("magnet state is {}", ctl.state());
        }
    }

    fn monitor_loop(&self) {
        mlzlog::set_thread_prefix("Monitor: ");
        let ticker = tick(QUERY_INTERVAL);
        while self.run.load(Ordering::Relaxed) {
            if ticker.recv().is_err() {
                break;
            }
            let (iv, ov, cur) = {
                let mut ctl = self.ctl.lock();
                (ctl.instruments.input_voltage().ok(),
                 ctl.instruments.output_voltage().ok(),
                 ctl.instruments.setpoint_current().ok())
            };
            // skip failed reads so no bad data lands in the time series
            for (key, value) in [(INPUT_VOLTAGE_KEY, iv),
                                 (OUTPUT_VOLTAGE_KEY, ov),
                                 (MAGNET_CURRENT_KEY, cur)] {
                if let Some(value) = value {
                    if let Err(e) = self.bus.add(key, value) {
                        warn!("storing magnet telemetry failed: {}", e);
                        break;
                    }
                }
            }
        }
    }

    /// Blocking command loop.  Returns the process exit code: 0 after an
    /// orderly stop, 1 after the bus was lost and the magnet was driven down.
    pub fn command_loop(&self) -> i32 {
        mlzlog::set_thread_prefix("Commands: ");
        let channels = command_channels();
        loop {
            if !self.run.load(Ordering::Relaxed) {
                return 0;
            }
            let messages = match self.subscribe_with_retry(&channels) {
                Some(messages) => messages,
                None => return self.shutdown_on_bus_loss(),
            };
            info!("listening for commands on {} channels", channels.len());
            loop {
                match messages.recv_timeout(Duration::from_millis(500)) {
                    Ok((channel, value)) => self.dispatch(&channel, &value),
                    Err(RecvTimeoutError::Timeout) => {
                        if !self.run.load(Ordering::Relaxed) {
                            return 0;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        warn!("command subscription lost, resubscribing");
                        break;
                    }
                }
            }
        }
    }

    fn subscribe_with_retry(&self, channels: &[String])
                            -> Option<Receiver<(String, String)>> {
        for attempt in 1..=BUS_RETRIES {
            match self.bus.subscribe(channels) {
                Ok(messages) => return Some(messages),
                Err(e) => warn!("subscribing failed (attempt {}/{}): {}",
                                attempt, BUS_RETRIES, e),
            }
            thread::sleep(BUS_RETRY_DELAY);
        }
        None
    }

    /// The bus is gone for good: abort the cycle, wait until the magnet is
    /// off (the stepping task keeps deramping), then report exit code 1.
    fn shutdown_on_bus_loss(&self) -> i32 {
        error!("bus is unreachable, aborting the cycle before exiting");
        self.ctl.lock().abort();
        let deadline = localtime() + SHUTDOWN_TIMEOUT;
        let mut polls = 0u32;
        while self.ctl.lock().state() != CycleState::Off {
            if localtime() > deadline {
                error!("magnet did not reach off before the timeout");
                break;
            }
            if polls % 10 == 0 {
                let current = self.ctl.lock().instruments.setpoint_current()
                    .unwrap_or(f64::NAN);
                info!("waiting for the magnet to deramp from {:.3} A before exiting",
                      current);
            }
            polls += 1;
            thread::sleep(SHUTDOWN_POLL);
        }
        self.stop();
        1
    }

    /// Handle one command from the bus.
    fn dispatch(&self, channel: &str, value: &str) {
        let key = channel.strip_prefix("command:").unwrap_or(channel);
        debug!("received command {}={}", key, value);

        if key == schema::REGULATION_TEMP_KEY {
            self.update_regulation_temp(value);
        } else if schema::SCHEMA.contains_key(key) {
            match SettingCommand::new(key, value) {
                Ok(cmd) => match self.ctl.lock().apply_setting(&cmd) {
                    Ok(()) => {
                        if let Err(e) = self.bus.set(cmd.setting, &cmd.value) {
                            warn!("writing setting {} back failed: {}", cmd.setting, e);
                        }
                    }
                    // blocked settings are already reported, just dropped
                    Err(e) if e.kind() == ErrorKind::State => {}
                    Err(e) => warn!("applying {} failed: {}", cmd, e),
                },
                Err(e) => warn!("ignoring invalid command ({}={}): {}", key, value, e),
            }
        } else if key == ABORT_CMD {
            self.ctl.lock().abort();
        } else if key == QUENCH_KEY {
            self.ctl.lock().quench();
        } else if key == COLD_NOW_CMD {
            if let Err(e) = self.ctl.lock().start() {
                info!("cooldown already in progress: {}", e);
            }
        } else if key == COLD_AT_CMD {
            match value.trim().parse::<f64>() {
                Ok(target) => self.schedule_cooldown(target),
                Err(_) => warn!("ignoring invalid cooldown target {:?}", value),
            }
        } else if key == CANCEL_COOLDOWN_CMD {
            self.ctl.lock().cancel_scheduled_cooldown();
            let _ = self.bus.set(schema::COOLDOWN_SCHEDULED_KEY, "no");
        } else {
            info!("ignoring {}={}", key, value);
        }

        let status = self.ctl.lock().status();
        if let Err(e) = self.bus.set(STATUS_KEY, &status) {
            warn!("storing controller status failed: {}", e);
        }
    }

    /// Arm a one-shot timer that fires `start` early enough to be cold by
    /// the requested time.
    fn schedule_cooldown(&self, be_cold_at: f64) {
        let scheduled = self.ctl.lock().schedule_cooldown(be_cold_at);
        let (fire_at, cancel) = match scheduled {
            Ok(pair) => pair,
            Err(e) => {
                error!("{}", e);
                return;
            }
        };
        if let Err(e) = self.bus.set(schema::COOLDOWN_SCHEDULED_KEY, "yes") {
            warn!("storing the cooldown schedule flag failed: {}", e);
        }
        let sup = self.clone();
        thread::spawn(move || {
            mlzlog::set_thread_prefix("Cooldown: ");
            while localtime() < fire_at {
                if cancel.load(Ordering::Relaxed) {
                    return;
                }
                thread::sleep(Duration::from_millis(500));
            }
            if cancel.load(Ordering::Relaxed) {
                return;
            }
            info!("scheduled cooldown firing");
            {
                let mut ctl = sup.ctl.lock();
                ctl.clear_scheduled_cooldown();
                if let Err(e) = ctl.start() {
                    error!("scheduled cooldown could not start: {}", e);
                }
            }
            let _ = sup.bus.set(schema::COOLDOWN_SCHEDULED_KEY, "no");
        });
    }

    /// A new regulation temperature: store it (the regulation ceiling follows
    /// the registry value) and hand it to the bridge as its temperature
    /// offset.
    fn update_regulation_temp(&self, value: &str) {
        let cmd = match SettingCommand::new(schema::REGULATION_TEMP_KEY, value) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("ignoring invalid regulation temperature {:?}: {}", value, e);
                return;
            }
        };
        if let Err(e) = self.bus.set(cmd.setting, &cmd.value) {
            warn!("storing the regulation temperature failed: {}", e);
        }
        match SettingCommand::new(schema::BRIDGE_TEMP_OFFSET_KEY, value) {
            Ok(bridge_cmd) => match self.ctl.lock().apply_setting(&bridge_cmd) {
                Ok(()) => {
                    let _ = self.bus.set(bridge_cmd.setting, &bridge_cmd.value);
                }
                Err(e) => warn!("updating the bridge temperature offset failed: {}", e),
            },
            Err(e) => warn!("regulation temperature {} not acceptable for the bridge: {}",
                            value, e),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use mlzutil::time::localtime;
    use parking_lot::Mutex;

    use super::*;
    use crate::machine::CycleState::*;
    use crate::schema::{Contract, COOLDOWN_SCHEDULED_KEY, RAMP_SLOPE_KEY,
                        DERAMP_SLOPE_KEY, SOAK_CURRENT_KEY, SOAK_TIME_KEY,
                        REGULATION_TEMP_KEY, STATEFILE_PATH_KEY, SCHEMA};
    use crate::persist::write_persisted_state;
    use crate::testutil::{temp_statefile, FakeInstruments, FakeState, MemBus};

    fn seeded_bus() -> Arc<MemBus> {
        let bus = MemBus::new();
        bus.seed(RAMP_SLOPE_KEY, "0.005");
        bus.seed(DERAMP_SLOPE_KEY, "0.005");
        bus.seed(SOAK_CURRENT_KEY, "9.4");
        bus.seed(SOAK_TIME_KEY, "1800");
        bus.seed(REGULATION_TEMP_KEY, "0.100");
        bus
    }

    fn statefile(tag: &str) -> PathBuf {
        let path = temp_statefile(tag);
        let _ = std::fs::remove_file(&path);
        path
    }

    /// A schema-valid value for any settable key.
    fn valid_value(key: &str) -> String {
        match SCHEMA[key].contract {
            Contract::Choice(pairs) => pairs[0].0.into(),
            Contract::Range(lo, _) => lo.to_string(),
        }
    }

    fn supervisor(tag: &str, prep: impl FnOnce(&mut FakeState))
                  -> (Arc<MemBus>, Arc<Mutex<FakeState>>, Supervisor, PathBuf) {
        let bus = seeded_bus();
        let (fake, state) = FakeInstruments::new();
        prep(&mut state.lock());
        let path = statefile(tag);
        let sup = Supervisor::new(bus.clone(), Box::new(fake), &path).unwrap();
        (bus, state, sup, path)
    }

    // Recovery.

    #[test]
    fn recovery_stale_statefile() {
        let bus = seeded_bus();
        let (mut fake, _state) = FakeInstruments::new();
        let path = statefile("rec-stale");
        std::fs::write(&path, "1000:soaking\n").unwrap();
        assert_eq!(compute_initial_state(&*bus, &mut fake, &path), Deramping);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn recovery_missing_statefile() {
        let bus = seeded_bus();
        let (mut fake, _state) = FakeInstruments::new();
        let path = statefile("rec-missing");
        assert_eq!(compute_initial_state(&*bus, &mut fake, &path), Deramping);
    }

    #[test]
    fn recovery_pid_mode_resumes_regulation() {
        let bus = seeded_bus();
        let (mut fake, state) = FakeInstruments::new();
        state.lock().pid = true;
        let path = statefile("rec-pid");
        assert_eq!(compute_initial_state(&*bus, &mut fake, &path), Regulating);
    }

    #[test]
    fn recovery_lost_config_deramps() {
        let bus = seeded_bus();
        let (mut fake, state) = FakeInstruments::new();
        state.lock().initialized = false;
        state.lock().pid = true;
        let path = statefile("rec-upset");
        assert_eq!(compute_initial_state(&*bus, &mut fake, &path), Deramping);
    }

    #[test]
    fn recovery_soaking_near_soak_downgrades_to_ramping() {
        let bus = seeded_bus();
        let (mut fake, state) = FakeInstruments::new();
        {
            let mut state = state.lock();
            state.setpoint = 9.4;
            state.hs_closed = true;
            state.hs_open = false;
        }
        let path = statefile("rec-soak");
        write_persisted_state(&path, Soaking);
        assert_eq!(compute_initial_state(&*bus, &mut fake, &path), Ramping);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn recovery_soaking_with_sagged_current_stays_soaking() {
        let bus = seeded_bus();
        let (mut fake, state) = FakeInstruments::new();
        {
            let mut state = state.lock();
            state.setpoint = 5.0;  // far from soak, not a recoverable ramp
            state.hs_closed = true;
            state.hs_open = false;
        }
        let path = statefile("rec-soak-sag");
        write_persisted_state(&path, Soaking);
        assert_eq!(compute_initial_state(&*bus, &mut fake, &path), Soaking);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn recovery_heat_switch_mismatch_deramps() {
        let bus = seeded_bus();
        let (mut fake, state) = FakeInstruments::new();
        state.lock().hs_open = true;  // ramping with an open switch is wrong
        let path = statefile("rec-mismatch");
        write_persisted_state(&path, Ramping);
        assert_eq!(compute_initial_state(&*bus, &mut fake, &path), Deramping);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn recovery_persisted_off_deramps() {
        let bus = seeded_bus();
        let (mut fake, _state) = FakeInstruments::new();
        let path = statefile("rec-off");
        write_persisted_state(&path, Off);
        assert_eq!(compute_initial_state(&*bus, &mut fake, &path), Deramping);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn recovery_hs_closing_reissues_the_command() {
        let bus = seeded_bus();
        let (mut fake, state) = FakeInstruments::new();
        {
            let mut state = state.lock();
            state.hs_open = false;  // still moving
            state.hs_closed = false;
        }
        let path = statefile("rec-closing");
        write_persisted_state(&path, HsClosing);
        assert_eq!(compute_initial_state(&*bus, &mut fake, &path), HsClosing);
        assert_eq!(state.lock().close_cmds, 1);
        let _ = std::fs::remove_file(&path);
    }

    // Startup.

    #[test]
    fn startup_publishes_info_and_seeds_keys() {
        let (bus, _fake, _sup, path) = supervisor("boot", |_| {});
        assert_eq!(bus.value(MODEL_KEY).as_deref(), Some("SIM960"));
        assert_eq!(bus.value(FIRMWARE_KEY).as_deref(), Some("ver2.17"));
        assert_eq!(bus.value(COOLDOWN_SCHEDULED_KEY).as_deref(), Some("no"));
        assert_eq!(bus.value(schema::UPPER_LIMIT_KEY).as_deref(), Some("on"));
        assert_eq!(bus.value(STATEFILE_PATH_KEY).as_deref(),
                   Some(&*path.to_string_lossy()));
        assert_eq!(bus.value(MAGNET_STATE_KEY).as_deref(), Some("deramping"));
    }

    #[test]
    fn startup_pushes_schema_after_device_upset() {
        let bus = seeded_bus();
        for key in schema::device_setting_keys() {
            bus.seed(key, &valid_value(key));
        }
        let (fake, state) = FakeInstruments::new();
        state.lock().initialized = false;
        let path = statefile("boot-upset");
        let _sup = Supervisor::new(bus.clone(), Box::new(fake), &path).unwrap();
        assert_eq!(state.lock().applied.len(), schema::device_setting_keys().len());
    }

    #[test]
    fn startup_fails_on_missing_schema_key() {
        let bus = seeded_bus();  // device settings not seeded
        let (fake, state) = FakeInstruments::new();
        state.lock().initialized = false;
        let path = statefile("boot-incomplete");
        assert!(Supervisor::new(bus, Box::new(fake), &path).is_err());
    }

    // Command dispatch.

    #[test]
    fn get_cold_starts_the_cycle() {
        let (bus, state, sup, path) = supervisor("cmd-start", |state| {
            state.hs_closed = true;
            state.hs_open = false;
        });
        // recovered state is deramping, which may start a cooldown
        sup.dispatch("command:get-cold", "");
        assert_eq!(sup.ctl.lock().state(), HsClosing);
        assert_eq!(state.lock().close_cmds, 1);
        assert!(bus.value(STATUS_KEY).is_some());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn setting_command_is_applied_and_written_back() {
        let (bus, state, sup, _path) = supervisor("cmd-setting", |_| {});
        sup.dispatch("command:device-settings:sim960:pid-p:value", "-16");
        assert_eq!(state.lock().applied,
                   [("device-settings:sim960:pid-p:value".to_string(), "-16".to_string())]);
        assert_eq!(bus.value("device-settings:sim960:pid-p:value").as_deref(), Some("-16"));
    }

    #[test]
    fn applying_settings_twice_is_idempotent() {
        let (mut fake, _state) = FakeInstruments::new();
        let mut settings = HashMap::new();
        settings.insert("device-settings:sim960:mode".to_string(), "pid".to_string());
        settings.insert(RAMP_SLOPE_KEY.to_string(), "0.005".to_string());
        let first = fake.apply_schema_settings(&settings).unwrap();
        let second = fake.apply_schema_settings(&settings).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_setting_is_dropped() {
        let (bus, state, sup, _path) = supervisor("cmd-invalid", |_| {});
        sup.dispatch("command:device-settings:sim960:mode", "auto");
        assert!(state.lock().applied.is_empty());
        assert_eq!(bus.value("device-settings:sim960:mode"), None);
    }

    #[test]
    fn blocked_setting_is_dropped() {
        let (bus, state, sup, _path) = supervisor("cmd-blocked", |state| {
            state.pid = true;  // recovers into regulating
        });
        assert_eq!(sup.ctl.lock().state(), Regulating);
        sup.dispatch("command:device-settings:sim960:setpoint-mode", "internal");
        assert!(state.lock().applied.is_empty());
        assert_eq!(bus.value("device-settings:sim960:setpoint-mode"), None);
    }

    #[test]
    fn quench_event_goes_to_off() {
        let (_bus, state, sup, path) = supervisor("cmd-quench", |state| {
            state.setpoint = 5.0;
        });
        sup.dispatch("command:event:quenching", "");
        assert_eq!(sup.ctl.lock().state(), Off);
        assert_eq!(state.lock().setpoint, 0.);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn regulation_temp_update_reaches_the_bridge() {
        let (bus, state, sup, _path) = supervisor("cmd-regtemp", |_| {});
        sup.dispatch("command:device-settings:mkidarray:regulating-temp", "0.090");
        assert_eq!(bus.value(REGULATION_TEMP_KEY).as_deref(), Some("0.090"));
        assert_eq!(state.lock().applied,
                   [(schema::BRIDGE_TEMP_OFFSET_KEY.to_string(), "0.090".to_string())]);
    }

    #[test]
    fn too_soon_cooldown_request_is_rejected() {
        let (bus, _state, sup, _path) = supervisor("cmd-soon", |state| {
            state.setpoint = 9.4;  // deramping that alone takes 1880 s
        });
        let target = localtime() + 1800.;
        sup.dispatch("command:be-cold-at", &target.to_string());
        assert_eq!(bus.value(COOLDOWN_SCHEDULED_KEY).as_deref(), Some("no"));
        assert_eq!(sup.ctl.lock().cooldown_scheduled(), None);
    }

    #[test]
    fn scheduled_cooldown_fires() {
        let (bus, _state, sup, path) = supervisor("cmd-sched", |state| {
            state.hs_closed = true;
            state.hs_open = false;
        });
        // an empty cycle makes the estimate zero, so the timer fires almost
        // immediately
        bus.seed(SOAK_CURRENT_KEY, "0");
        bus.seed(SOAK_TIME_KEY, "0");
        let target = localtime() + 1.;
        sup.dispatch("command:be-cold-at", &target.to_string());
        assert_eq!(bus.value(COOLDOWN_SCHEDULED_KEY).as_deref(), Some("yes"));
        std::thread::sleep(Duration::from_millis(2200));
        assert_eq!(sup.ctl.lock().state(), HsClosing);
        assert_eq!(bus.value(COOLDOWN_SCHEDULED_KEY).as_deref(), Some("no"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn cancel_scheduled_cooldown() {
        let (bus, _state, sup, path) = supervisor("cmd-cancel", |_| {});
        bus.seed(SOAK_CURRENT_KEY, "0");
        bus.seed(SOAK_TIME_KEY, "0");
        let target = localtime() + 3600.;
        sup.dispatch("command:be-cold-at", &target.to_string());
        assert_eq!(bus.value(COOLDOWN_SCHEDULED_KEY).as_deref(), Some("yes"));
        sup.dispatch("command:cancel-scheduled-cooldown", "");
        assert_eq!(bus.value(COOLDOWN_SCHEDULED_KEY).as_deref(), Some("no"));
        assert_eq!(sup.ctl.lock().cooldown_scheduled(), None);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn telemetry_is_published() {
        let (bus, _state, sup, _path) = supervisor("telemetry", |state| {
            state.setpoint = 3.0;
        });
        sup.start();
        std::thread::sleep(Duration::from_millis(100));
        sup.stop();
        assert!(bus.samples(MAGNET_CURRENT_KEY).contains(&3.0));
        assert!(!bus.samples(INPUT_VOLTAGE_KEY).is_empty());
        assert!(!bus.samples(OUTPUT_VOLTAGE_KEY).is_empty());
    }

    // Bus loss.

    #[test]
    fn bus_loss_aborts_deramps_and_exits_one() {
        let (_bus, state, sup, path) = supervisor("bus-lost", |state| {
            state.setpoint = 0.;  // already deramped, off is one step away
        });
        sup.start();
        let code = sup.shutdown_on_bus_loss();
        assert_eq!(code, 1);
        assert_eq!(sup.ctl.lock().state(), Off);
        assert!(!state.lock().pid);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn command_channel_list() {
        let channels = command_channels();
        assert!(channels.contains(&"command:get-cold".into()));
        assert!(channels.contains(&"command:event:quenching".into()));
        assert!(channels.contains(&format!("command:{}", RAMP_SLOPE_KEY)));
        assert!(channels.contains(&format!("command:{}", REGULATION_TEMP_KEY)));
        assert!(!channels.contains(&format!("command:{}", schema::UPPER_LIMIT_KEY)));
    }
}
