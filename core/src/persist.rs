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
//! The persisted cycle state file.
//!
//! A single overwritten line `<unix_seconds>:<state_name>` records the last
//! state entry, so that a restarted controller can resynchronize with the
//! hardware instead of blindly deramping a cold magnet.

use std::fs;
use std::path::Path;
use log::*;
use mlzutil::time::localtime;

use crate::machine::CycleState;

/// A persisted record older than this is ignored during recovery.
pub const MAX_PERSISTED_STATE_LIFE: f64 = 3600.;

/// Overwrite the statefile with the given state and the current wall time.
///
/// Failures are logged but never propagated: losing one statefile write must
/// not keep the machine from progressing.
pub fn write_persisted_state(statefile: &Path, state: CycleState) {
    if let Err(e) = fs::write(statefile, format!("{}:{}\n", localtime(), state.name())) {
        warn!("unable to log state entry to {}: {}", statefile.display(), e);
    }
}

/// Load the persisted state, returning `(None, None)` on any failure.
pub fn load_persisted_state(statefile: &Path) -> (Option<f64>, Option<CycleState>) {
    let content = match fs::read_to_string(statefile) {
        Ok(content) => content,
        Err(_) => return (None, None),
    };
    let line = content.lines().next().unwrap_or("");
    match line.split_once(':') {
        Some((tstamp, name)) => (tstamp.trim().parse().ok(),
                                 CycleState::from_name(name.trim())),
        None => (None, None),
    }
}

/// Whether a persisted timestamp is too old to be trusted.
pub fn is_stale(tstamp: f64) -> bool {
    localtime() - tstamp > MAX_PERSISTED_STATE_LIFE
}
