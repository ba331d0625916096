//! Adaptive target calibration for one workout attempt.
//!
//! During CALIBRATION the runner watches the smoothed heart rate against the
//! target band and accumulates the cadence/watts the athlete was producing
//! while inside it. At STEADY the accumulated average is frozen and becomes
//! the target the athlete is coached to hold.
//!
//! The in-band weighting rule (each new in-band sample weighs one more than
//! the total weight so far) makes later samples dominate quickly. It is kept
//! as-is; see DESIGN.md.

use crate::config::WorkoutConfig;
use crate::filters::CadenceFilter;
use crate::{Event, Phase};

/// Target used when calibration never saw an in-band sample
pub const DEFAULT_TARGET_CADENCE: u32 = 15;
pub const DEFAULT_TARGET_WATTS: u32 = 0;

/// Tempos at or above this are not sent to the metronome
pub const MAX_METRONOME_TEMPO: u32 = 30;

/// Tolerance around the steady target, in strokes/min and watts
const DEAD_BAND: i64 = 1;

/// Keep the accumulator finite over very long in-band runs without changing its ratios
const RESCALE_ABOVE: f64 = 1e180;
const RESCALE_FACTOR: f64 = 1e-150;

/// A cadence/power pair the athlete is asked to hold
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Target {
    pub cadence: u32,
    pub watts: u32,
}

/// What the athlete should do this tick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advice {
    Increase,
    Decrease,
    /// In band (calibration) or on target (steady)
    Hold,
    /// Outside the calibrated phases
    Rest,
}

/// Tempo/volume change for the metronome worker
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetronomeCue {
    Play { tempo: u32, volume: f32 },
    Silence,
}

/// Result of feeding one tick to the runner
#[derive(Clone, Debug, PartialEq)]
pub struct Guidance {
    pub phase: Phase,
    pub advice: Advice,
    /// Cadence after the glitch filter
    pub cadence: u32,
    pub watts: u32,
    pub rolling_bpm: f64,
    /// Target to show and to back-fill into the event, if any
    pub target: Option<Target>,
    /// Display-only +/-1 towards the bias pivot during calibration
    pub nudge: i32,
    pub metronome: Option<MetronomeCue>,
}

/// Stateful calibrator fed one event per tick
#[derive(Clone, Debug)]
pub struct IntervalRunner {
    target_bpm_low: f64,
    target_bpm_high: f64,
    target_bpm_pivot: f64,

    cadence_sum: f64,
    watts_sum: f64,
    weight: f64,
    in_band_seen: bool,

    steady_target: Option<Target>,
    cadence_filter: CadenceFilter,
}

impl IntervalRunner {
    pub fn new(resting_bpm: u32, config: &WorkoutConfig) -> Self {
        let resting = f64::from(resting_bpm);
        let low = resting + f64::from(config.target_bpm_low);
        let high = resting + f64::from(config.target_bpm_high);
        let pivot = lerp(low, high, config.target_bpm_bias);

        tracing::info!(
            "Target band [{}, {}] around resting {} (pivot {:.1})",
            low,
            high,
            resting_bpm,
            pivot
        );

        Self {
            target_bpm_low: low,
            target_bpm_high: high,
            target_bpm_pivot: pivot,
            cadence_sum: 0.0,
            watts_sum: 0.0,
            weight: 0.0,
            in_band_seen: false,
            steady_target: None,
            cadence_filter: CadenceFilter::new(),
        }
    }

    pub fn target_bpm_low(&self) -> f64 {
        self.target_bpm_low
    }

    pub fn target_bpm_high(&self) -> f64 {
        self.target_bpm_high
    }

    pub fn target_bpm_pivot(&self) -> f64 {
        self.target_bpm_pivot
    }

    /// Total weight in the accumulator; 1 right after a retarget
    pub fn sample_weight(&self) -> f64 {
        self.weight
    }

    /// Truncated running average, or the default target while empty
    pub fn accumulated_target(&self) -> Target {
        if self.weight > 0.0 {
            Target {
                cadence: (self.cadence_sum / self.weight) as u32,
                watts: (self.watts_sum / self.weight) as u32,
            }
        } else {
            Target {
                cadence: DEFAULT_TARGET_CADENCE,
                watts: DEFAULT_TARGET_WATTS,
            }
        }
    }

    /// The frozen target, once STEADY has been reached
    pub fn steady_target(&self) -> Option<Target> {
        self.steady_target
    }

    /// Feed one tick recorded while the session was in `phase`
    pub fn update(&mut self, phase: Phase, event: &Event) -> Guidance {
        let cadence = self.cadence_filter.apply(event.cadence);
        let watts = event.watts;
        let rolling_bpm = event.bpm_rolling_average;

        let mut guidance = Guidance {
            phase,
            advice: Advice::Rest,
            cadence,
            watts,
            rolling_bpm,
            target: None,
            nudge: 0,
            metronome: None,
        };

        match phase {
            Phase::Calibration => self.calibrate(&mut guidance),
            Phase::Steady => self.hold_steady(&mut guidance),
            Phase::Cooldown => guidance.metronome = Some(MetronomeCue::Silence),
            _ => {}
        }

        guidance
    }

    fn calibrate(&mut self, guidance: &mut Guidance) {
        // A new interval re-opens the accumulator seeded with the last steady target
        self.steady_target = None;

        let bpm = guidance.rolling_bpm;
        let cadence = f64::from(guidance.cadence);
        let watts = f64::from(guidance.watts);

        if bpm < self.target_bpm_low || bpm > self.target_bpm_high {
            self.retarget(cadence, watts);
            guidance.advice = if bpm < self.target_bpm_low {
                Advice::Increase
            } else {
                Advice::Decrease
            };
        } else {
            let weight = (self.weight + 1.0).max(1.0);
            self.cadence_sum += cadence * weight;
            self.watts_sum += watts * weight;
            self.weight += weight;
            self.in_band_seen = true;
            self.rescale_if_needed();

            guidance.advice = Advice::Hold;
            if self.weight > 0.0 {
                guidance.target = Some(self.accumulated_target());
            }
        }

        guidance.nudge = if bpm <= self.target_bpm_pivot - 1.0 {
            1
        } else if bpm > self.target_bpm_pivot + 1.0 {
            -1
        } else {
            0
        };
    }

    fn retarget(&mut self, cadence: f64, watts: f64) {
        tracing::debug!("Retarget at cadence {} watts {}", cadence, watts);
        self.cadence_sum = cadence;
        self.watts_sum = watts;
        self.weight = 1.0;
    }

    fn rescale_if_needed(&mut self) {
        if self.weight > RESCALE_ABOVE {
            self.cadence_sum *= RESCALE_FACTOR;
            self.watts_sum *= RESCALE_FACTOR;
            self.weight *= RESCALE_FACTOR;
        }
    }

    fn hold_steady(&mut self, guidance: &mut Guidance) {
        let target = match self.steady_target {
            Some(target) => target,
            None => self.freeze(),
        };

        let cadence = i64::from(guidance.cadence);
        let watts = i64::from(guidance.watts);
        let target_cadence = i64::from(target.cadence);
        let target_watts = i64::from(target.watts);

        let above = cadence > target_cadence + DEAD_BAND || watts > target_watts + DEAD_BAND;
        let below = cadence < target_cadence - DEAD_BAND || watts < target_watts - DEAD_BAND;
        guidance.advice = if above {
            Advice::Decrease
        } else if below {
            Advice::Increase
        } else {
            Advice::Hold
        };

        guidance.target = Some(target);
        guidance.metronome = if target.cadence > 0 && target.cadence < MAX_METRONOME_TEMPO {
            Some(MetronomeCue::Play {
                tempo: target.cadence,
                volume: 1.0,
            })
        } else {
            tracing::warn!("Invalid metronome tempo: {}", target.cadence);
            None
        };
    }

    /// Collapse the accumulator into the steady target
    fn freeze(&mut self) -> Target {
        let target = if self.in_band_seen && self.weight > 0.0 {
            Target {
                cadence: (self.cadence_sum / self.weight).floor() as u32,
                watts: (self.watts_sum / self.weight).floor() as u32,
            }
        } else {
            tracing::info!("No in-band calibration samples, using default target");
            Target {
                cadence: DEFAULT_TARGET_CADENCE,
                watts: DEFAULT_TARGET_WATTS,
            }
        };

        self.cadence_sum = f64::from(target.cadence);
        self.watts_sum = f64::from(target.watts);
        self.weight = 1.0;
        self.steady_target = Some(target);

        tracing::info!(
            "Steady target frozen at cadence {} watts {}",
            target.cadence,
            target.watts
        );
        target
    }
}

fn lerp(x: f64, y: f64, alpha: f64) -> f64 {
    (1.0 - alpha) * x + y * alpha
}
