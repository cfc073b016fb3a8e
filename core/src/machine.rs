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
//! The magnet cycle state machine.
//!
//! The cooldown is a fixed progression: close the heat switch, ramp the
//! magnet to the soak current, soak, open the heat switch, demagnetize until
//! the array is cold enough to regulate, then hand the output to the PID
//! loop.  `abort` drops back to a controlled deramp from anywhere, `quench`
//! goes straight to off.
//!
//! Transition rules are held in an ordered table and evaluated first-match-
//! wins on every `next` tick.  Guards read the instruments and the registry;
//! any read failure makes a guard false, which keeps the machine where it is
//! instead of progressing on optimistic assumptions.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use log::*;
use hashbrown::HashMap;
use mlzutil::time::localtime;

use crate::bus::Bus;
use crate::errors::{Error, Result};
use crate::instruments::{Instruments, PidMode, MAX_CURRENT_SLOPE};
use crate::persist;
use crate::schema::{SettingCommand, Target,
                    DERAMP_SLOPE_KEY, RAMP_SLOPE_KEY, REGULATION_TEMP_KEY,
                    SOAK_CURRENT_KEY, SOAK_TIME_KEY, UPPER_LIMIT_KEY};

/// Seconds between two `next` steps; current increments are sized for it.
pub const LOOP_INTERVAL: f64 = 1.0;

/// Below this setpoint the current counts as off.
pub const CURRENT_EPSILON: f64 = 1e-3;

/// Fraction of the soak current that still counts as "at soak".
const SOAK_TOLERANCE: f64 = 0.98;

/// The regulation loop is abandoned above this multiple of the regulation
/// temperature (when the upper-limit key is on).
const REGULATE_CEILING_FACTOR: f64 = 1.50;

/// Channel/key carrying the current cycle state.
pub const MAGNET_STATE_KEY: &str = "status:magnet:state";

/// Time series with the latest array temperature, fed by the thermometry
/// monitor.
pub const DEVICE_TEMP_KEY: &str = "status:temps:mkidarray:temp";


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleState {
    Off,
    HsClosing,
    Ramping,
    Soaking,
    HsOpening,
    Cooling,
    Regulating,
    Deramping,
}

use self::CycleState::*;

impl CycleState {
    /// Stable name, used on the bus and in the statefile.
    pub fn name(self) -> &'static str {
        match self {
            Off => "off",
            HsClosing => "hs_closing",
            Ramping => "ramping",
            Soaking => "soaking",
            HsOpening => "hs_opening",
            Cooling => "cooling",
            Regulating => "regulating",
            Deramping => "deramping",
        }
    }

    pub fn from_name(name: &str) -> Option<CycleState> {
        Some(match name {
            "off" => Off,
            "hs_closing" => HsClosing,
            "ramping" => Ramping,
            "soaking" => Soaking,
            "hs_opening" => HsOpening,
            "cooling" => Cooling,
            "regulating" => Regulating,
            "deramping" => Deramping,
            _ => return None,
        })
    }

    /// Only the two resting states may begin a new cooldown.
    pub fn can_start(self) -> bool {
        matches!(self, Off | Deramping)
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}


type Guard = fn(&mut MagnetController) -> bool;
type Action = fn(&mut MagnetController) -> bool;

/// One row of the transition table.  `to: None` means an internal transition:
/// run the action, stay in the state, no entry bookkeeping.
struct Rule {
    from: CycleState,
    guard: Option<Guard>,
    action: Option<Action>,
    to: Option<CycleState>,
}

/// The `next` transition table, evaluated top to bottom per source state.
static RULES: &[Rule] = &[
    // wait until the heat switch reports closed, re-commanding each tick
    Rule { from: HsClosing, guard: Some(MagnetController::heatswitch_closed),
           action: None, to: Some(Ramping) },
    Rule { from: HsClosing, guard: None,
           action: Some(MagnetController::prep_precool), to: None },

    // raise the current a slope step at a time up to the soak current
    Rule { from: Ramping, guard: Some(MagnetController::current_ready_to_soak),
           action: None, to: Some(Soaking) },
    Rule { from: Ramping, guard: None,
           action: Some(MagnetController::increment_current), to: None },

    // hold at the soak current; a sagging current means something is quite
    // wrong and we deramp
    Rule { from: Soaking, guard: Some(MagnetController::soak_holding),
           action: None, to: None },
    Rule { from: Soaking, guard: Some(MagnetController::soak_finished),
           action: Some(MagnetController::prep_demag), to: Some(HsOpening) },
    Rule { from: Soaking, guard: None, action: None, to: Some(Deramping) },

    // wait until the switch is open and the bridge drives the error input
    Rule { from: HsOpening, guard: Some(MagnetController::ready_to_cool),
           action: None, to: Some(Cooling) },
    Rule { from: HsOpening, guard: None,
           action: Some(MagnetController::prep_demag), to: None },

    // demagnetize; a closing heat switch would reheat the salt pill
    Rule { from: Cooling, guard: Some(MagnetController::heatswitch_closed),
           action: None, to: Some(Deramping) },
    Rule { from: Cooling, guard: Some(MagnetController::ready_to_regulate),
           action: Some(MagnetController::to_pid_mode), to: Some(Regulating) },
    Rule { from: Cooling, guard: None,
           action: Some(MagnetController::decrement_current), to: None },

    // regulate until the device warms past the ceiling or drops out of PID
    Rule { from: Regulating, guard: Some(MagnetController::regulation_healthy),
           action: None, to: None },
    Rule { from: Regulating, guard: None, action: None, to: Some(Deramping) },

    Rule { from: Deramping, guard: Some(MagnetController::current_off),
           action: Some(MagnetController::bridge_to_manual), to: Some(Off) },
    Rule { from: Deramping, guard: None,
           action: Some(MagnetController::decrement_current), to: None },

    Rule { from: Off, guard: None, action: None, to: None },
];

/// Settings that must not change underneath an active cycle.
fn blocked_settings(state: CycleState) -> &'static [&'static str] {
    match state {
        Off => &[],
        Regulating => &["device-settings:sim960:vout-value",
                        "device-settings:sim960:mode",
                        "device-settings:sim960:setpoint-mode"],
        _ => &["device-settings:sim960:vout-value",
               "device-settings:sim960:mode"],
    }
}


pub struct MagnetController {
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) instruments: Box<dyn Instruments>,
    state: CycleState,
    pub(crate) entry_time: HashMap<CycleState, f64>,
    statefile: PathBuf,
    scheduled_cooldown: Option<(f64, Arc<AtomicBool>)>,
}

impl MagnetController {
    /// The initial state is taken as-is: no entry bookkeeping runs, so a
    /// recovered `regulating` does not disturb the hardware.
    pub fn new(bus: Arc<dyn Bus>, instruments: Box<dyn Instruments>,
               statefile: PathBuf, initial: CycleState) -> Self {
        let mut entry_time = HashMap::new();
        entry_time.insert(initial, localtime());
        MagnetController { bus, instruments, state: initial, entry_time,
                           statefile, scheduled_cooldown: None }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Run one step: fire the first matching rule for the current state.
    pub fn next(&mut self) {
        for rule in RULES {
            if rule.from != self.state {
                continue;
            }
            if let Some(guard) = rule.guard {
                if !guard(self) {
                    continue;
                }
            }
            if let Some(action) = rule.action {
                if !action(self) {
                    debug!("transition action failed, staying in {}", self.state);
                    return;
                }
            }
            if let Some(to) = rule.to {
                self.enter(to);
            }
            return;
        }
    }

    /// Begin a cooldown.  Only allowed from a resting state.
    pub fn start(&mut self) -> Result<()> {
        if !self.state.can_start() {
            return Err(Error::state(
                format!("cannot start a cooldown from {}", self.state)));
        }
        self.prep_precool();
        self.enter(HsClosing);
        Ok(())
    }

    /// Abandon the cycle and drive the current down in a controlled way.
    pub fn abort(&mut self) {
        self.enter(Deramping);
    }

    /// Superconductivity lost: remove the current immediately.
    pub fn quench(&mut self) {
        self.enter(Off);
    }

    fn enter(&mut self, state: CycleState) {
        debug!("{} -> {}", self.state, state);
        self.state = state;
        self.record_entry();
        if state == Off && !self.kill_current() {
            error!("failed to kill the magnet current on entering off");
        }
    }

    /// Entry bookkeeping: stamp the entry time, persist the state, publish it.
    fn record_entry(&mut self) {
        self.entry_time.insert(self.state, localtime());
        if let Err(e) = self.bus.set(MAGNET_STATE_KEY, self.state.name()) {
            warn!("unable to publish state entry: {}", e);
        }
        persist::write_persisted_state(&self.statefile, self.state);
    }

    // Guards.  All of them evaluate false when a read fails.

    fn heatswitch_closed(&mut self) -> bool {
        self.instruments.heatswitch_is_closed().unwrap_or(false)
    }

    fn heatswitch_opened(&mut self) -> bool {
        self.instruments.heatswitch_is_opened().unwrap_or(false)
    }

    fn bridge_in_scaled(&mut self) -> bool {
        self.instruments.bridge_in_scaled_output().unwrap_or(false)
    }

    fn ready_to_cool(&mut self) -> bool {
        self.heatswitch_opened() && self.bridge_in_scaled()
    }

    fn ready_to_regulate(&mut self) -> bool {
        self.heatswitch_opened() && self.bridge_in_scaled()
            && self.device_ready_for_regulate()
    }

    fn regulation_healthy(&mut self) -> bool {
        self.device_regulatable() && self.in_pid_mode()
    }

    fn soak_holding(&mut self) -> bool {
        self.current_at_soak() && !self.soak_time_expired()
    }

    fn soak_finished(&mut self) -> bool {
        // the current check is repeated so an I/O hiccup in one rule cannot
        // push us forward through the other
        self.current_at_soak() && self.soak_time_expired()
    }

    fn current_ready_to_soak(&mut self) -> bool {
        match (self.instruments.setpoint_current(), self.bus.get_f64(SOAK_CURRENT_KEY)) {
            (Ok(cur), Ok(soak)) => cur >= soak,
            _ => false,
        }
    }

    fn current_at_soak(&mut self) -> bool {
        match (self.instruments.setpoint_current(), self.bus.get_f64(SOAK_CURRENT_KEY)) {
            (Ok(cur), Ok(soak)) => cur >= SOAK_TOLERANCE * soak,
            _ => false,
        }
    }

    fn soak_time_expired(&mut self) -> bool {
        let entered = match self.entry_time.get(&Soaking) {
            Some(&t) => t,
            None => return false,
        };
        match self.bus.get_f64(SOAK_TIME_KEY) {
            Ok(soak_time) => localtime() - entered >= soak_time,
            Err(_) => false,
        }
    }

    fn in_pid_mode(&mut self) -> bool {
        matches!(self.instruments.mode(), Ok(PidMode::Pid))
    }

    fn current_off(&mut self) -> bool {
        matches!(self.instruments.setpoint_current(),
                 Ok(current) if current.abs() <= CURRENT_EPSILON)
    }

    fn device_temp(&mut self) -> Result<f64> {
        self.bus.latest(DEVICE_TEMP_KEY)?
            .map(|(_, temp)| temp)
            .ok_or_else(|| Error::config("no array temperature on the bus"))
    }

    fn device_ready_for_regulate(&mut self) -> bool {
        match (self.device_temp(), self.bus.get_f64(REGULATION_TEMP_KEY)) {
            (Ok(temp), Ok(regtemp)) => temp <= regtemp,
            _ => false,
        }
    }

    /// Whether the PID loop can hold the device at all.  The ceiling sits
    /// well above the regulation temperature so noise on the thermometry
    /// does not kill the loop.  The upper-limit key is an engineering
    /// setting changed directly on the bus.
    fn device_regulatable(&mut self) -> bool {
        match self.bus.get(UPPER_LIMIT_KEY) {
            Ok(Some(flag)) if flag != "on" => true,
            Ok(_) => match (self.device_temp(), self.bus.get_f64(REGULATION_TEMP_KEY)) {
                (Ok(temp), Ok(regtemp)) => temp <= REGULATE_CEILING_FACTOR * regtemp,
                _ => false,
            },
            Err(_) => false,
        }
    }

    // Actions.  Failures are logged and absorbed; only `to_pid_mode` vetoes
    // its transition, since regulation without PID mode is meaningless.

    fn prep_precool(&mut self) -> bool {
        if let Err(e) = self.instruments.heatswitch_close() {
            warn!("closing the heat switch failed: {}", e);
        }
        if let Err(e) = self.instruments.bridge_to_manual_output() {
            warn!("switching the bridge to manual output failed: {}", e);
        }
        true
    }

    fn prep_demag(&mut self) -> bool {
        if let Err(e) = self.instruments.heatswitch_open() {
            warn!("opening the heat switch failed: {}", e);
        }
        if let Err(e) = self.instruments.bridge_to_scaled_output() {
            warn!("switching the bridge to scaled output failed: {}", e);
        }
        true
    }

    fn bridge_to_manual(&mut self) -> bool {
        if let Err(e) = self.instruments.bridge_to_manual_output() {
            warn!("switching the bridge to manual output failed: {}", e);
        }
        true
    }

    fn to_pid_mode(&mut self) -> bool {
        match self.instruments.set_mode(PidMode::Pid) {
            Ok(()) => true,
            Err(e) => {
                warn!("switching to pid mode failed: {}", e);
                false
            }
        }
    }

    fn kill_current(&mut self) -> bool {
        match self.instruments.kill_current() {
            Ok(()) => true,
            Err(e) => {
                warn!("killing the current failed: {}", e);
                false
            }
        }
    }

    /// Slope for the next current step, pulled from the registry.  Falls back
    /// to the hardware limit when the registry is unreachable; an over-limit
    /// registry value is clipped and written back.
    fn slope_from(&mut self, key: &str) -> f64 {
        let limit = MAX_CURRENT_SLOPE;
        let slope = match self.bus.get_f64(key) {
            Ok(slope) => slope.abs(),
            Err(e) => {
                warn!("unable to pull {}, using {} A/s: {}", key, limit, e);
                limit
            }
        };
        if slope > limit {
            warn!("{} above the hardware slope limit, overwriting with {}", key, limit);
            if let Err(e) = self.bus.set(key, &limit.to_string()) {
                info!("overwriting failed: {}", e);
            }
            return limit;
        }
        if slope == 0. {
            warn!("{} set to zero, this will take eternity", key);
        }
        slope
    }

    fn increment_current(&mut self) -> bool {
        let step = self.slope_from(RAMP_SLOPE_KEY) * LOOP_INTERVAL;
        if let Err(e) = self.instruments.increment_setpoint(step) {
            warn!("failed to increment the magnet current: {}", e);
        }
        true
    }

    fn decrement_current(&mut self) -> bool {
        let step = self.slope_from(DERAMP_SLOPE_KEY) * LOOP_INTERVAL;
        if let Err(e) = self.instruments.decrement_setpoint(step) {
            warn!("failed to decrement the magnet current: {}", e);
        }
        true
    }

    // Commanded settings.

    /// Apply a validated setting unless the current state blocks it.
    pub fn apply_setting(&mut self, cmd: &SettingCommand) -> Result<()> {
        if blocked_settings(self.state).contains(&cmd.setting) {
            let msg = format!("setting {} not supported while in state {}",
                              cmd.setting, self.state);
            error!("{}", msg);
            return Err(Error::state(msg));
        }
        if cmd.target() != Target::Registry {
            let mut map = HashMap::new();
            map.insert(cmd.setting.to_string(), cmd.value.clone());
            self.instruments.apply_schema_settings(&map)?;
        }
        Ok(())
    }

    // Cooldown scheduling.

    /// Estimated seconds until `regulating` can be reached from here.
    pub fn min_time_until_cool(&mut self) -> Result<f64> {
        let soak_current = self.bus.get_f64(SOAK_CURRENT_KEY)?;
        let soak_time = self.bus.get_f64(SOAK_TIME_KEY)?;
        let ramp = self.bus.get_f64(RAMP_SLOPE_KEY)?.abs();
        let deramp = self.bus.get_f64(DERAMP_SLOPE_KEY)?.abs();
        let current = self.instruments.setpoint_current()?;

        Ok(match self.state {
            Off | HsClosing | Ramping =>
                (soak_current - current).max(0.) / ramp + soak_time + soak_current / deramp,
            Soaking | HsOpening => {
                let elapsed = self.entry_time.get(&Soaking)
                    .map_or(0., |&entered| localtime() - entered);
                (soak_time - elapsed).max(0.) + soak_current / deramp
            }
            Cooling | Deramping => current / deramp,
            Regulating => 0.,
        })
    }

    /// Register a cooldown that reaches `regulating` by the given wall time.
    /// Returns the trigger time and the cancellation flag for the timer.
    pub fn schedule_cooldown(&mut self, be_cold_at: f64)
                             -> Result<(f64, Arc<AtomicBool>)> {
        if !self.state.can_start() {
            return Err(Error::state("cooldown in progress, abort before scheduling"));
        }
        let needed = self.min_time_until_cool()?;
        let now = localtime();
        if be_cold_at < now + needed {
            return Err(Error::out_of_range(format!(
                "time travel not possible, specify a time at least {:.0} s in the future",
                needed)));
        }
        self.cancel_scheduled_cooldown();
        let cancel = Arc::new(AtomicBool::new(false));
        let fire_at = be_cold_at - needed;
        self.scheduled_cooldown = Some((fire_at, Arc::clone(&cancel)));
        info!("cooldown scheduled to start at {:.0}", fire_at);
        Ok((fire_at, cancel))
    }

    /// Cancel a pending cooldown.  True if there was one.
    pub fn cancel_scheduled_cooldown(&mut self) -> bool {
        match self.scheduled_cooldown.take() {
            Some((fire_at, cancel)) => {
                info!("cancelling cooldown scheduled for {:.0}", fire_at);
                cancel.store(true, Ordering::Relaxed);
                true
            }
            None => {
                debug!("no pending cooldown to cancel");
                false
            }
        }
    }

    /// Drop the schedule handle once the timer has fired.
    pub fn clear_scheduled_cooldown(&mut self) {
        self.scheduled_cooldown = None;
    }

    pub fn cooldown_scheduled(&self) -> Option<f64> {
        self.scheduled_cooldown.as_ref().map(|(fire_at, _)| *fire_at)
    }

    /// Operator-facing status line.
    pub fn status(&mut self) -> String {
        let mut ret = self.state.name().to_string();
        if !matches!(self.state, Off | Regulating) {
            if let Ok(eta) = self.min_time_until_cool() {
                ret.push_str(&format!(", cold in {:.0} s", eta));
            }
        }
        if let Some((fire_at, _)) = &self.scheduled_cooldown {
            ret.push_str(&format!(", cooldown scheduled for {:.0}", fire_at));
        }
        ret
    }
}


#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use mlzutil::time::localtime;
    use parking_lot::Mutex;

    use super::*;
    use crate::errors::ErrorKind;
    use crate::testutil::{temp_statefile, FakeInstruments, FakeState, MemBus};

    fn controller(tag: &str, initial: CycleState)
                  -> (Arc<MemBus>, Arc<Mutex<FakeState>>, MagnetController, PathBuf) {
        let bus = MemBus::new();
        bus.seed(RAMP_SLOPE_KEY, "0.005");
        bus.seed(DERAMP_SLOPE_KEY, "0.005");
        bus.seed(SOAK_CURRENT_KEY, "9.4");
        bus.seed(SOAK_TIME_KEY, "1800");
        bus.seed(REGULATION_TEMP_KEY, "0.100");
        bus.seed(UPPER_LIMIT_KEY, "on");
        let (fake, state) = FakeInstruments::new();
        let path = temp_statefile(tag);
        let _ = std::fs::remove_file(&path);
        let ctl = MagnetController::new(bus.clone(), Box::new(fake),
                                        path.clone(), initial);
        (bus, state, ctl, path)
    }

    fn persisted_state(path: &PathBuf) -> String {
        std::fs::read_to_string(path).unwrap_or_default()
    }

    #[test]
    fn state_names_roundtrip() {
        for state in [Off, HsClosing, Ramping, Soaking, HsOpening,
                      Cooling, Regulating, Deramping] {
            assert_eq!(CycleState::from_name(state.name()), Some(state));
        }
        assert_eq!(CycleState::from_name("molten"), None);
    }

    #[test]
    fn nominal_cooldown() {
        let (bus, fake, mut ctl, path) = controller("nominal", Off);
        let mut trace = vec![ctl.state()];

        ctl.start().unwrap();
        trace.push(ctl.state());
        fake.lock().settle_heatswitch();

        ctl.next();
        trace.push(ctl.state());
        assert_eq!(ctl.state(), Ramping);

        let mut steps = 0;
        while ctl.state() == Ramping {
            ctl.next();
            steps += 1;
            assert!(steps < 2500, "ramp never reached the soak current");
        }
        trace.push(ctl.state());
        assert_eq!(ctl.state(), Soaking);
        assert!((fake.lock().setpoint - 9.4).abs() < 0.01);

        // holds while the soak time has not elapsed
        ctl.next();
        assert_eq!(ctl.state(), Soaking);

        ctl.entry_time.insert(Soaking, localtime() - 2000.);
        ctl.next();
        trace.push(ctl.state());
        assert_eq!(ctl.state(), HsOpening);
        fake.lock().settle_heatswitch();

        ctl.next();
        trace.push(ctl.state());
        assert_eq!(ctl.state(), Cooling);

        bus.set_latest(DEVICE_TEMP_KEY, 0.090);
        ctl.next();
        trace.push(ctl.state());
        assert_eq!(ctl.state(), Regulating);

        assert_eq!(trace, [Off, HsClosing, Ramping, Soaking,
                           HsOpening, Cooling, Regulating]);
        // entering regulating put the instrument into PID mode
        assert!(fake.lock().pid);
        assert!(persisted_state(&path).ends_with(":regulating\n"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn every_entry_is_published_and_persisted() {
        let (bus, fake, mut ctl, path) = controller("entries", Off);

        ctl.start().unwrap();
        assert_eq!(bus.sets_of(MAGNET_STATE_KEY), ["hs_closing"]);
        assert!(persisted_state(&path).ends_with(":hs_closing\n"));

        // an internal transition records nothing new
        ctl.next();
        assert_eq!(bus.sets_of(MAGNET_STATE_KEY).len(), 1);

        fake.lock().settle_heatswitch();
        ctl.next();
        assert_eq!(bus.sets_of(MAGNET_STATE_KEY), ["hs_closing", "ramping"]);
        assert!(persisted_state(&path).ends_with(":ramping\n"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn heat_switch_stuck_closed_never_ramps() {
        let (_bus, fake, mut ctl, path) = controller("stuck-hs", Off);
        fake.lock().stuck_heatswitch = true;

        ctl.start().unwrap();
        for _ in 0..5 {
            ctl.next();
            assert_eq!(ctl.state(), HsClosing);
        }
        // the close command is re-issued on every tick
        assert_eq!(fake.lock().close_cmds, 6);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn no_cooling_until_bridge_output_is_scaled() {
        let (_bus, fake, mut ctl, path) = controller("hs-open-wait", HsOpening);
        {
            let mut fake = fake.lock();
            fake.hs_open = true;
            fake.bridge_scaled = false;
        }
        // the bridge is not scaled yet: stay put and re-command both outputs
        ctl.next();
        assert_eq!(ctl.state(), HsOpening);
        assert_eq!(fake.lock().open_cmds, 1);
        assert!(fake.lock().bridge_scaled);

        ctl.next();
        assert_eq!(ctl.state(), Cooling);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn quench_during_soak_kills_current() {
        let (_bus, fake, mut ctl, path) = controller("quench", Soaking);
        fake.lock().setpoint = 9.4;
        fake.lock().hs_closed = true;
        fake.lock().hs_open = false;

        ctl.quench();
        assert_eq!(ctl.state(), Off);
        let fake = fake.lock();
        assert!(!fake.pid);
        assert_eq!(fake.setpoint, 0.);
        assert!(persisted_state(&path).ends_with(":off\n"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn soak_current_tolerance() {
        let (_bus, fake, mut ctl, path) = controller("soak-low", Soaking);
        fake.lock().setpoint = 0.979 * 9.4;
        ctl.next();
        assert_eq!(ctl.state(), Deramping);

        let (_bus, fake, mut ctl, path2) = controller("soak-ok", Soaking);
        fake.lock().setpoint = 0.981 * 9.4;
        ctl.next();
        assert_eq!(ctl.state(), Soaking);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&path2);
    }

    #[test]
    fn soak_falls_back_to_deramp_when_bus_is_down() {
        let (bus, fake, mut ctl, path) = controller("soak-busdown", Soaking);
        fake.lock().setpoint = 9.4;
        bus.fail.store(true, std::sync::atomic::Ordering::Relaxed);
        ctl.next();
        assert_eq!(ctl.state(), Deramping);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn ramp_rate_above_limit_is_clipped_and_written_back() {
        let (bus, fake, mut ctl, path) = controller("ramp-clip", Ramping);
        bus.seed(RAMP_SLOPE_KEY, "0.02");
        fake.lock().setpoint = 1.0;

        ctl.next();
        assert_eq!(ctl.state(), Ramping);
        assert!((fake.lock().setpoint - 1.015).abs() < 1e-9);
        assert_eq!(bus.value(RAMP_SLOPE_KEY).as_deref(), Some("0.015"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn ramp_rate_zero_makes_no_progress() {
        let (bus, fake, mut ctl, path) = controller("ramp-zero", Ramping);
        bus.seed(RAMP_SLOPE_KEY, "0");
        fake.lock().setpoint = 1.0;

        ctl.next();
        assert_eq!(ctl.state(), Ramping);
        assert_eq!(fake.lock().setpoint, 1.0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn regulation_survives_within_ceiling() {
        let (bus, fake, mut ctl, path) = controller("reg-ok", Regulating);
        fake.lock().pid = true;
        bus.set_latest(DEVICE_TEMP_KEY, 0.120);  // below 1.5 * 0.100
        ctl.next();
        assert_eq!(ctl.state(), Regulating);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn regulation_abandoned_above_ceiling() {
        let (bus, fake, mut ctl, path) = controller("reg-warm", Regulating);
        fake.lock().pid = true;
        bus.set_latest(DEVICE_TEMP_KEY, 0.200);
        ctl.next();
        assert_eq!(ctl.state(), Deramping);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn regulation_ceiling_not_enforced_when_limit_off() {
        let (bus, fake, mut ctl, path) = controller("reg-nolimit", Regulating);
        fake.lock().pid = true;
        bus.seed(UPPER_LIMIT_KEY, "off");
        bus.set_latest(DEVICE_TEMP_KEY, 0.200);
        ctl.next();
        assert_eq!(ctl.state(), Regulating);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn regulation_abandoned_outside_pid_mode() {
        let (bus, fake, mut ctl, path) = controller("reg-nopid", Regulating);
        fake.lock().pid = false;
        bus.set_latest(DEVICE_TEMP_KEY, 0.090);
        ctl.next();
        assert_eq!(ctl.state(), Deramping);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn pid_mode_failure_stays_in_cooling() {
        let (bus, fake, mut ctl, path) = controller("pid-fail", Cooling);
        {
            let mut fake = fake.lock();
            fake.hs_open = true;
            fake.bridge_scaled = true;
            fake.fail_pid = true;
            fake.setpoint = 2.0;
        }
        bus.set_latest(DEVICE_TEMP_KEY, 0.090);
        ctl.next();
        assert_eq!(ctl.state(), Cooling);
        assert!(!fake.lock().pid);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn cooling_decrements_until_cold() {
        let (bus, fake, mut ctl, path) = controller("cooling", Cooling);
        {
            let mut fake = fake.lock();
            fake.hs_open = true;
            fake.bridge_scaled = true;
            fake.setpoint = 2.0;
        }
        bus.set_latest(DEVICE_TEMP_KEY, 0.300);  // too warm to regulate
        ctl.next();
        assert_eq!(ctl.state(), Cooling);
        assert!((fake.lock().setpoint - 1.995).abs() < 1e-9);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn cooling_deramps_when_heat_switch_closes() {
        let (_bus, fake, mut ctl, path) = controller("cooling-hs", Cooling);
        {
            let mut fake = fake.lock();
            fake.hs_open = false;
            fake.hs_closed = true;
            fake.setpoint = 2.0;
        }
        ctl.next();
        assert_eq!(ctl.state(), Deramping);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn deramp_reaches_off() {
        let (_bus, fake, mut ctl, path) = controller("deramp-off", Deramping);
        {
            let mut fake = fake.lock();
            fake.setpoint = 0.0005;
            fake.bridge_scaled = true;
        }
        ctl.next();
        assert_eq!(ctl.state(), Off);
        // the bridge is handed back to manual output on the way out
        assert!(!fake.lock().bridge_scaled);
        assert!(persisted_state(&path).ends_with(":off\n"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn off_is_stable() {
        let (bus, _fake, mut ctl, path) = controller("off-stays", Off);
        ctl.next();
        ctl.next();
        assert_eq!(ctl.state(), Off);
        assert!(bus.sets_of(MAGNET_STATE_KEY).is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn start_blocked_mid_cycle() {
        let (_bus, _fake, mut ctl, path) = controller("start-blocked", Soaking);
        let err = ctl.start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert_eq!(ctl.state(), Soaking);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn blocked_settings_by_state() {
        let (_bus, fake, mut ctl, path) = controller("blocked", Regulating);
        let cmd = SettingCommand::new("device-settings:sim960:setpoint-mode",
                                      "internal").unwrap();
        assert_eq!(ctl.apply_setting(&cmd).unwrap_err().kind(), ErrorKind::State);

        let (_bus, fake2, mut ctl2, path2) = controller("unblocked", Off);
        ctl2.apply_setting(&cmd).unwrap();
        assert_eq!(fake2.lock().applied.len(), 1);
        assert!(fake.lock().applied.is_empty());
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&path2);
    }

    #[test]
    fn min_time_estimates() {
        let (_bus, _fake, mut ctl, path) = controller("estimate", Off);
        // 9.4/0.005 ramp + 1800 soak + 9.4/0.005 deramp
        assert!((ctl.min_time_until_cool().unwrap() - 5560.).abs() < 1.);

        let (_bus2, fake2, mut ctl2, path2) = controller("estimate-deramp", Deramping);
        fake2.lock().setpoint = 2.0;
        assert!((ctl2.min_time_until_cool().unwrap() - 400.).abs() < 1.);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&path2);
    }

    #[test]
    fn schedule_rejected_mid_cycle() {
        let (_bus, _fake, mut ctl, path) = controller("sched-state", Ramping);
        let err = ctl.schedule_cooldown(localtime() + 1e6).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn schedule_rejected_when_too_soon() {
        let (_bus, _fake, mut ctl, path) = controller("sched-soon", Off);
        // the full cycle needs 5560 s, half an hour is not enough
        let err = ctl.schedule_cooldown(localtime() + 1800.).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        assert_eq!(ctl.cooldown_scheduled(), None);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn schedule_and_cancel() {
        let (_bus, _fake, mut ctl, path) = controller("sched-ok", Off);
        let target = localtime() + 6000.;
        let (fire_at, cancel) = ctl.schedule_cooldown(target).unwrap();
        assert!((fire_at - (target - 5560.)).abs() < 1.);
        assert!(!cancel.load(Ordering::Relaxed));
        assert!(ctl.cooldown_scheduled().is_some());

        assert!(ctl.cancel_scheduled_cooldown());
        assert!(cancel.load(Ordering::Relaxed));
        assert_eq!(ctl.cooldown_scheduled(), None);
        assert!(!ctl.cancel_scheduled_cooldown());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn status_line() {
        let (_bus, fake, mut ctl, path) = controller("status", Deramping);
        fake.lock().setpoint = 2.0;
        let status = ctl.status();
        assert!(status.starts_with("deramping, cold in 400 s"), "{}", status);
        let _ = std::fs::remove_file(&path);
    }
}
