//! Signal filters for noisy machine and heart-rate readings.
//!
//! - Cadence glitch filter
//! - Recency-weighted rolling BPM average
//! - Resting BPM estimator used before the workout starts

use crate::Event;
use std::collections::VecDeque;

/// Cadence below this (strokes/min) is always believed.
pub const CADENCE_TRUST_BELOW: u32 = 35;

/// Trailing window for the rolling BPM average, seconds, inclusive of the current tick.
pub const ROLLING_WINDOW_SECS: f64 = 5.0;

/// Recency exponent for the rolling BPM average.
pub const ROLLING_EXPONENT: f64 = 2.0;

/// Number of samples the resting BPM estimator keeps.
pub const RESTING_WINDOW: usize = 101;

// ============================================================================
// Cadence filter
// ============================================================================

/// Rejects the spurious high cadence the machine sometimes reports at low
/// stroke rates.
///
/// Once a baseline exists, a reading at or above 35 must stay strictly under
/// 1.1x the last accepted value to be accepted; otherwise the last accepted
/// value is repeated.
#[derive(Clone, Debug, Default)]
pub struct CadenceFilter {
    last_valid: Option<u32>,
}

impl CadenceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_valid(&self) -> Option<u32> {
        self.last_valid
    }

    pub fn reset(&mut self) {
        self.last_valid = None;
    }

    /// Filter one raw cadence reading
    pub fn apply(&mut self, cadence: u32) -> u32 {
        if cadence < CADENCE_TRUST_BELOW {
            self.last_valid = Some(cadence);
            return cadence;
        }

        match self.last_valid {
            // c < 1.1 * v in integers, so an exact 1.1x reading is rejected
            Some(valid) if u64::from(cadence) * 10 < u64::from(valid) * 11 => {
                self.last_valid = Some(cadence);
                cadence
            }
            Some(valid) => {
                tracing::debug!("Rejected cadence glitch {} (last valid {})", cadence, valid);
                valid
            }
            None => 0,
        }
    }
}

// ============================================================================
// Weighted rolling average
// ============================================================================

/// A timestamped value
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub time: f64,
    pub value: f64,
}

/// Recency-weighted mean of a chronological window.
///
/// Each sample is weighted by `a^exponent` where `a` is its position in the
/// window's time span (0 for the oldest, 1 for the newest). A single sample
/// is returned as-is; a window with no time span falls back to the plain mean.
/// Returns `None` for an empty window.
pub fn weighted_average(samples: &[Sample], exponent: f64) -> Option<f64> {
    let (first, last) = match (samples.first(), samples.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return None,
    };

    if samples.len() == 1 {
        return Some(first.value);
    }

    let span = last.time - first.time;
    if span <= 0.0 {
        let sum: f64 = samples.iter().map(|s| s.value).sum();
        return Some(sum / samples.len() as f64);
    }

    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for sample in samples {
        let a = (sample.time - first.time) / span;
        let weight = a.powf(exponent);
        weighted += sample.value * weight;
        total_weight += weight;
    }

    if total_weight > 0.0 {
        Some(weighted / total_weight)
    } else {
        Some(last.value)
    }
}

/// Rolling BPM for a new tick at `time` reading `bpm`, given the ticks logged before it.
///
/// Only logged events with time in `(time - 5s, time]` take part.
pub fn rolling_bpm(history: &[Event], time: f64, bpm: u32) -> f64 {
    let cutoff = time - ROLLING_WINDOW_SECS;

    let mut window: Vec<Sample> = history
        .iter()
        .rev()
        .take_while(|e| e.time > cutoff)
        .filter(|e| e.time <= time)
        .map(|e| Sample {
            time: e.time,
            value: f64::from(e.bpm),
        })
        .collect();
    window.reverse();
    window.push(Sample {
        time,
        value: f64::from(bpm),
    });

    weighted_average(&window, ROLLING_EXPONENT).unwrap_or(f64::from(bpm))
}

// ============================================================================
// Resting BPM
// ============================================================================

/// Baseline heart rate measured while the athlete sits still.
#[derive(Clone, Debug, Default)]
pub struct RestingBpmEstimator {
    samples: VecDeque<u32>,
}

impl RestingBpmEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one tick; ignores faulted ticks and readings of 0 or 1
    pub fn observe(&mut self, event: &Event) {
        if event.error || event.bpm <= 1 {
            return;
        }
        self.samples.push_back(event.bpm);
        while self.samples.len() > RESTING_WINDOW {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Floor of the sample mean, once there are at least two samples
    pub fn average(&self) -> Option<u32> {
        if self.samples.len() < 2 {
            return None;
        }
        let sum: u64 = self.samples.iter().map(|&s| u64::from(s)).sum();
        Some((sum / self.samples.len() as u64) as u32)
    }

    /// Mean absolute deviation from [`average`](Self::average)
    pub fn deviation(&self) -> Option<f64> {
        let average = f64::from(self.average()?);
        let total: f64 = self
            .samples
            .iter()
            .map(|&s| (average - f64::from(s)).abs())
            .sum();
        Some(total / self.samples.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Phase;

    fn event_at(time: f64, bpm: u32) -> Event {
        Event {
            phase: Phase::Calibration,
            time,
            bpm,
            ..Event::default()
        }
    }

    #[test]
    fn test_cadence_filter_sequence() {
        let mut filter = CadenceFilter::new();
        assert_eq!(filter.apply(200), 0);
        assert_eq!(filter.last_valid(), None);

        assert_eq!(filter.apply(10), 10);
        assert_eq!(filter.apply(200), 10);
        // below the trust threshold the 1.1x bound does not apply
        assert_eq!(filter.apply(11), 11);
    }

    #[test]
    fn test_cadence_filter_bound_is_exclusive() {
        let mut filter = CadenceFilter::new();
        filter.apply(20);
        assert_eq!(filter.apply(22), 22);
        filter.apply(30);
        assert_eq!(filter.apply(33), 33);
        filter.apply(34);
        // 37 < 37.4
        assert_eq!(filter.apply(37), 37);
        assert_eq!(filter.apply(40), 40);
        // 44 == 40 * 1.1 exactly
        assert_eq!(filter.apply(44), 40);
        assert_eq!(filter.last_valid(), Some(40));
    }

    #[test]
    fn test_cadence_filter_boundary_above_trust_threshold() {
        let mut filter = CadenceFilter::new();
        assert_eq!(filter.apply(34), 34);
        // 37 < 37.4 -> accepted
        assert_eq!(filter.apply(37), 37);
        // 41 >= 40.7 -> rejected, state unchanged
        assert_eq!(filter.apply(41), 37);
        assert_eq!(filter.last_valid(), Some(37));
        // 40 < 40.7 -> accepted
        assert_eq!(filter.apply(40), 40);
    }

    #[test]
    fn test_cadence_filter_reset_forgets_baseline() {
        let mut filter = CadenceFilter::new();
        filter.apply(30);
        filter.reset();
        assert_eq!(filter.apply(50), 0);
        filter.apply(20);
        filter.apply(34);
        // 35 < 37.4 -> accepted; then 40 would need < 38.5
        assert_eq!(filter.apply(35), 35);
        assert_eq!(filter.apply(40), 35);
    }

    #[test]
    fn test_weighted_average_single_sample() {
        let samples = [Sample { time: 3.0, value: 71.0 }];
        for exponent in [0.0, 1.0, 2.0, 5.0] {
            assert_eq!(weighted_average(&samples, exponent), Some(71.0));
        }
    }

    #[test]
    fn test_weighted_average_empty() {
        assert_eq!(weighted_average(&[], 2.0), None);
    }

    #[test]
    fn test_weighted_average_exponent_zero_is_mean() {
        let samples = [
            Sample { time: 0.0, value: 60.0 },
            Sample { time: 1.0, value: 70.0 },
            Sample { time: 2.0, value: 80.0 },
            Sample { time: 4.0, value: 90.0 },
        ];
        let mean = weighted_average(&samples, 0.0).unwrap();
        assert!((mean - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_average_recency_bias() {
        let samples = [
            Sample { time: 0.0, value: 60.0 },
            Sample { time: 1.0, value: 60.0 },
            Sample { time: 2.0, value: 90.0 },
        ];
        // weights 0, 0.25, 1
        let avg = weighted_average(&samples, 2.0).unwrap();
        assert!((avg - (60.0 * 0.25 + 90.0) / 1.25).abs() < 1e-9);
        assert!(avg > 75.0);
    }

    #[test]
    fn test_weighted_average_zero_span() {
        let samples = [
            Sample { time: 1.0, value: 60.0 },
            Sample { time: 1.0, value: 80.0 },
        ];
        assert_eq!(weighted_average(&samples, 2.0), Some(70.0));
    }

    #[test]
    fn test_rolling_bpm_first_tick_is_raw() {
        assert_eq!(rolling_bpm(&[], 0.0, 88), 88.0);
    }

    #[test]
    fn test_rolling_bpm_window_excludes_old_ticks() {
        let history = vec![event_at(0.0, 200), event_at(5.0, 60), event_at(6.0, 60)];
        // tick at 10.0: window (5, 10] keeps only 6.0 and 10.0
        let avg = rolling_bpm(&history, 10.0, 60);
        assert_eq!(avg, 60.0);

        // tick at 9.0: window (4, 9] keeps 5.0, 6.0 and 9.0; 200 at t=0 is gone
        let avg = rolling_bpm(&history, 9.0, 60);
        assert_eq!(avg, 60.0);
    }

    #[test]
    fn test_rolling_bpm_weights_recent_ticks() {
        let history = vec![event_at(0.0, 60), event_at(1.0, 60)];
        let avg = rolling_bpm(&history, 2.0, 90);
        assert!((avg - 78.0).abs() < 1e-9);
    }

    #[test]
    fn test_resting_estimator() {
        let mut resting = RestingBpmEstimator::new();
        resting.observe(&event_at(0.0, 60));
        assert_eq!(resting.average(), None);

        resting.observe(&event_at(1.0, 63));
        resting.observe(&event_at(2.0, 0));
        resting.observe(&Event {
            error: true,
            ..event_at(3.0, 90)
        });
        assert_eq!(resting.len(), 2);
        assert_eq!(resting.average(), Some(61));
        assert_eq!(resting.deviation(), Some(1.5));
    }

    #[test]
    fn test_resting_estimator_keeps_recent_window() {
        let mut resting = RestingBpmEstimator::new();
        for i in 0..150 {
            resting.observe(&event_at(i as f64, if i < 49 { 200 } else { 60 }));
        }
        assert_eq!(resting.len(), RESTING_WINDOW);
        assert_eq!(resting.average(), Some(60));
    }
}
