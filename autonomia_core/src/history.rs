//! Recorded session history.
//!
//! Loads every stored log for review and computes the numbers an external
//! viewer needs to scale its graphs.

use crate::persistence::{LogStore, SessionRecord};
use crate::{Event, Phase, Result};
use std::path::PathBuf;

/// Margin added around the BPM bounds, in beats per minute
pub const BPM_MARGIN: f64 = 5.0;

/// A stored log and its decoded rows
#[derive(Clone, Debug)]
pub struct LoadedSession {
    pub path: PathBuf,
    pub record: SessionRecord,
    pub events: Vec<Event>,
}

/// Load every stored log, oldest first
///
/// Unreadable or malformed logs are skipped with a warning.
pub fn load_all(store: &LogStore) -> Result<Vec<LoadedSession>> {
    let mut sessions = Vec::new();

    for path in store.list()? {
        let loaded = LogStore::load(&path).and_then(|record| {
            let events = record.events()?;
            Ok((record, events))
        });

        match loaded {
            Ok((record, events)) => sessions.push(LoadedSession {
                path,
                record,
                events,
            }),
            Err(e) => {
                tracing::warn!("Skipping session log {:?}: {}", path, e);
            }
        }
    }

    tracing::info!("Loaded {} session logs from {:?}", sessions.len(), store.dir());
    Ok(sessions)
}

/// BPM range across several sessions
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BpmBounds {
    pub min: f64,
    pub max: f64,
    pub range: f64,
}

/// Lowest and highest of raw and smoothed BPM across `logs`, widened by `margin`
///
/// Returns `None` when there are no events at all.
pub fn bpm_bounds<'a, I>(logs: I, margin: f64) -> Option<BpmBounds>
where
    I: IntoIterator<Item = &'a [Event]>,
{
    let mut values = logs.into_iter().flatten().flat_map(|event| {
        [f64::from(event.bpm), event.bpm_rolling_average]
    });

    let first = values.next()?;
    let (min, max) = values.fold((first, first), |(min, max), v| (min.min(v), max.max(v)));

    let min = min - margin;
    let max = max + margin;
    Some(BpmBounds {
        min,
        max,
        range: (max - min).abs(),
    })
}

/// Short description of one session
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSummary {
    pub date: String,
    pub start_time: String,
    pub resting_bpm: u32,
    pub rows: usize,
    /// Seconds from the first to the last row
    pub duration: f64,
    /// Each phase change as (offset from the first row, phase)
    pub phases: Vec<(f64, Phase)>,
    /// Mean of the nonzero raw BPM readings
    pub mean_bpm: Option<f64>,
    pub distance: f64,
}

pub fn summarize(record: &SessionRecord, events: &[Event]) -> SessionSummary {
    let start = events.first().map_or(0.0, |e| e.time);
    let end = events.last().map_or(start, |e| e.time);

    let mut phases: Vec<(f64, Phase)> = Vec::new();
    for event in events {
        if phases.last().map_or(true, |&(_, phase)| phase != event.phase) {
            phases.push((event.time - start, event.phase));
        }
    }

    let beats: Vec<f64> = events
        .iter()
        .filter(|e| e.bpm > 0)
        .map(|e| f64::from(e.bpm))
        .collect();
    let mean_bpm = if beats.is_empty() {
        None
    } else {
        Some(beats.iter().sum::<f64>() / beats.len() as f64)
    };

    let distance = events.iter().map(|e| e.distance).fold(0.0, f64::max);

    SessionSummary {
        date: record.date.clone(),
        start_time: record.start_time.clone(),
        resting_bpm: record.resting_bpm,
        rows: events.len(),
        duration: end - start,
        phases,
        mean_bpm,
        distance,
    }
}
