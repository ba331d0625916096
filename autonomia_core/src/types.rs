//! Core domain types for a guided rowing session.
//!
//! - Workout phases and the transitions allowed between them
//! - The per-tick telemetry snapshot (`Event`)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Phase
// ============================================================================

/// A named stage of a workout.
///
/// Declaration order is the workout order; `Ord` follows it and replay
/// seeking relies on that.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Invalid,
    RestingBpm,
    Pending,
    Calibration,
    Steady,
    Cooldown,
    FullStop,
    Results,
    Shutdown,
}

impl Phase {
    /// Every phase, in workout order
    pub const ALL: [Phase; 9] = [
        Phase::Invalid,
        Phase::RestingBpm,
        Phase::Pending,
        Phase::Calibration,
        Phase::Steady,
        Phase::Cooldown,
        Phase::FullStop,
        Phase::Results,
        Phase::Shutdown,
    ];

    /// Integer code written into recorded logs
    pub fn code(self) -> i32 {
        match self {
            Phase::Invalid => -1,
            Phase::RestingBpm => 0,
            Phase::Pending => 1,
            Phase::Calibration => 2,
            Phase::Steady => 3,
            Phase::Cooldown => 4,
            Phase::FullStop => 5,
            Phase::Results => 6,
            Phase::Shutdown => 7,
        }
    }

    /// Inverse of [`Phase::code`]
    pub fn from_code(code: i64) -> Result<Self> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| i64::from(p.code()) == code)
            .ok_or_else(|| Error::Schema(format!("unknown phase code {}", code)))
    }

    /// Whether `self` may directly follow `prev` when the host sets it.
    ///
    /// Transitions only move forward, except that CALIBRATION may follow
    /// COOLDOWN (next interval) or FULLSTOP (athlete resumed).
    pub fn may_follow(self, prev: Phase) -> bool {
        self >= prev || self.starts_new_interval_after(prev) || self.resumes_after(prev)
    }

    /// CALIBRATION directly after COOLDOWN begins another interval
    fn starts_new_interval_after(self, prev: Phase) -> bool {
        self == Phase::Calibration && prev == Phase::Cooldown
    }

    fn resumes_after(self, prev: Phase) -> bool {
        self == Phase::Calibration && prev == Phase::FullStop
    }

    /// Phases during which the interval runner is fed
    pub fn is_interval(self) -> bool {
        matches!(self, Phase::Calibration | Phase::Steady | Phase::Cooldown)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Invalid => "invalid",
            Phase::RestingBpm => "resting_bpm",
            Phase::Pending => "pending",
            Phase::Calibration => "calibration",
            Phase::Steady => "steady",
            Phase::Cooldown => "cooldown",
            Phase::FullStop => "full_stop",
            Phase::Results => "results",
            Phase::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Event
// ============================================================================

/// Telemetry and derived values for one tick.
///
/// Built by `Session::advance`; the interval runner back-fills the two
/// target fields before the host displays it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub phase: Phase,
    /// Seconds since the session started
    pub time: f64,
    pub bpm: u32,
    pub bpm_rolling_average: f64,
    /// Strokes per minute
    pub cadence: u32,
    pub target_cadence: u32,
    pub watts: u32,
    pub target_watts: u32,
    /// Meters
    pub distance: f64,
    /// Set when the machine query for this tick failed and values are stale
    pub error: bool,
}

impl Default for Event {
    fn default() -> Self {
        Self {
            phase: Phase::Invalid,
            time: 0.0,
            bpm: 0,
            bpm_rolling_average: 0.0,
            cadence: 0,
            target_cadence: 0,
            watts: 0,
            target_watts: 0,
            distance: 0.0,
            error: false,
        }
    }
}

impl Event {
    /// Event returned once a replay has nothing left to deliver
    pub fn end_of_log(time: f64) -> Self {
        Self {
            phase: Phase::Shutdown,
            time,
            ..Self::default()
        }
    }
}
