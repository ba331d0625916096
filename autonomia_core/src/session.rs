//! Workout session: phase, event log and the source of ticks.
//!
//! A live session reads the rowing machine once per tick. A replay session
//! walks a recorded log instead and reproduces the recorded phase changes,
//! so the same host loop can drive either.

use crate::config::{Config, WorkoutConfig};
use crate::filters::rolling_bpm;
use crate::interval::Target;
use crate::persistence::{LogStore, SessionRecord};
use crate::telemetry::{Ergometer, ErgometerFinder, TelemetryReply, TelemetryRequest};
use crate::{Error, Event, Phase, Result};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Session seconds covered by one tick; every phase ticks at this rate
pub const TICK_SECONDS: f64 = 1.0;

/// Replay pacing
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Pace {
    /// Redeliver the last event without moving the cursor
    Paused,
    /// Multiplier applied to every inter-tick sleep
    Scaled(f64),
}

struct LiveSource {
    finder: Box<dyn ErgometerFinder>,
    ergometer: Option<Box<dyn Ergometer>>,
    started: Instant,
    last_reply: Option<TelemetryReply>,
    pulse: Option<u32>,
}

struct ReplaySource {
    rows: Vec<Event>,
    cursor: usize,
    clock: f64,
}

enum Source {
    Live(LiveSource),
    Replay(ReplaySource),
}

/// Everything recorded about one workout
pub struct Session {
    config: WorkoutConfig,
    no_save: bool,
    resting_bpm: u32,
    log: Vec<Event>,
    phase: Phase,
    date: String,
    start_time: String,
    pace: Pace,
    source: Source,
}

impl Session {
    /// Session reading a rowing machine located by `finder`
    pub fn live(config: &Config, finder: Box<dyn ErgometerFinder>) -> Self {
        let now = Local::now();
        Self {
            config: config.workout.clone(),
            no_save: config.data.no_save,
            resting_bpm: 0,
            log: Vec::new(),
            phase: Phase::Invalid,
            date: now.format("%Y_%m_%d").to_string(),
            start_time: now.format("%I:%M %p").to_string(),
            pace: Pace::Scaled(1.0),
            source: Source::Live(LiveSource {
                finder,
                ergometer: None,
                started: Instant::now(),
                last_reply: None,
                pulse: None,
            }),
        }
    }

    /// Session replaying `record`; the header overrides the workout config
    pub fn replay(record: &SessionRecord, config: &Config) -> Result<Self> {
        let rows = record.events()?;
        tracing::info!(
            "Replaying {} rows recorded {} {}",
            rows.len(),
            record.date,
            record.start_time
        );

        Ok(Self {
            config: record.workout(),
            no_save: config.data.no_save,
            resting_bpm: record.resting_bpm,
            log: Vec::with_capacity(rows.len()),
            phase: Phase::Invalid,
            date: record.date.clone(),
            start_time: record.start_time.clone(),
            pace: Pace::Scaled(config.replay.speed),
            source: Source::Replay(ReplaySource {
                rows,
                cursor: 0,
                clock: 0.0,
            }),
        })
    }

    /// Load a recorded log from disk and replay it
    pub fn open_replay(path: &Path, config: &Config) -> Result<Self> {
        let record = LogStore::load(path)?;
        Self::replay(&record, config)
    }

    pub fn is_live(&self) -> bool {
        matches!(self.source, Source::Live(_))
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &WorkoutConfig {
        &self.config
    }

    pub fn resting_bpm(&self) -> u32 {
        self.resting_bpm
    }

    pub fn log(&self) -> &[Event] {
        &self.log
    }

    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn start_time(&self) -> &str {
        &self.start_time
    }

    pub fn pace(&self) -> Pace {
        self.pace
    }

    /// Session clock in seconds: wall time since start when live, the
    /// time of the last delivered row when replaying
    pub fn now(&self) -> f64 {
        match &self.source {
            Source::Live(live) => live.started.elapsed().as_secs_f64(),
            Source::Replay(replay) => replay.clock,
        }
    }

    /// Locate the rowing machine; a replay is always connected
    pub fn connect(&mut self) -> bool {
        match &mut self.source {
            Source::Live(live) => {
                if live.ergometer.is_none() {
                    live.ergometer = live.finder.find();
                    if live.ergometer.is_some() {
                        tracing::info!("Rowing machine connected");
                    }
                }
                live.ergometer.is_some()
            }
            Source::Replay(_) => true,
        }
    }

    /// Whether the athlete has started rowing
    pub fn workout_started(&self) -> bool {
        match &self.source {
            Source::Live(live) => live.last_reply.as_ref().map_or(false, |reply| {
                reply.work_time.map_or(false, |t| t > 0.0)
                    || reply.stroke_state.map_or(false, |s| s > 0)
            }),
            Source::Replay(replay) => replay
                .rows
                .get(replay.cursor)
                .map_or(false, |row| row.phase > Phase::Pending),
        }
    }

    /// Newest BPM from the sensor bridge; preferred over the machine's own reading
    pub fn observe_pulse(&mut self, bpm: u32) {
        if let Source::Live(live) = &mut self.source {
            live.pulse = Some(bpm);
        }
    }

    /// Replays keep the recorded resting BPM
    pub fn set_resting_bpm(&mut self, bpm: u32) {
        if self.is_live() {
            tracing::info!("Resting BPM set to {}", bpm);
            self.resting_bpm = bpm;
        }
    }

    pub fn set_pace(&mut self, pace: Pace) {
        self.pace = pace;
    }

    /// Wait out one tick, scaled by the pace
    pub fn sleep_tick(&self) {
        self.sleep(TICK_SECONDS);
    }

    /// Sleep between ticks, scaled by the pace
    pub fn sleep(&self, seconds: f64) {
        let factor = match self.pace {
            Pace::Paused => 1.0,
            Pace::Scaled(factor) => factor,
        };
        let scaled = seconds * factor;
        if scaled.is_finite() && scaled > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(scaled));
        }
    }

    /// Host-requested phase change.
    ///
    /// Entering RESULTS on a replay first appends every row not yet
    /// delivered, so the saved log matches the recording.
    pub fn set_phase(&mut self, phase: Phase) -> Result<()> {
        if !phase.may_follow(self.phase) {
            return Err(Error::Phase(format!(
                "cannot move from {} to {}",
                self.phase, phase
            )));
        }

        if phase == Phase::Results {
            if let Source::Replay(replay) = &mut self.source {
                let remaining = &replay.rows[replay.cursor..];
                if !remaining.is_empty() {
                    tracing::debug!("Draining {} unplayed rows", remaining.len());
                }
                self.log.extend_from_slice(remaining);
                replay.cursor = replay.rows.len();
            }
        }

        if phase != self.phase {
            tracing::info!("Phase {} -> {}", self.phase, phase);
        }
        self.phase = phase;
        Ok(())
    }

    /// Produce the next tick
    pub fn advance(&mut self) -> Event {
        match self.source {
            Source::Live(_) => self.advance_live(),
            Source::Replay(_) => self.advance_replay(),
        }
    }

    fn advance_live(&mut self) -> Event {
        let Source::Live(live) = &mut self.source else {
            return Event::end_of_log(0.0);
        };

        let request = TelemetryRequest::tick();
        let reply = match live.ergometer.as_mut() {
            Some(ergometer) => ergometer
                .query(&request)
                .and_then(|raw| TelemetryReply::parse(&request, &raw)),
            None => Err(Error::Telemetry("rowing machine not connected".into())),
        };

        let time = live.started.elapsed().as_secs_f64();
        let mut event = match reply {
            Ok(reply) => {
                let event = Event {
                    phase: self.phase,
                    time,
                    bpm: reply.heart_rate.unwrap_or(0),
                    cadence: reply.cadence.unwrap_or(0),
                    watts: reply.power.unwrap_or(0),
                    distance: reply.work_distance.unwrap_or(0.0),
                    ..Event::default()
                };
                live.last_reply = Some(reply);
                event
            }
            Err(e) => {
                tracing::warn!("Machine query failed, repeating last values: {}", e);
                let previous = self.log.last().cloned().unwrap_or_default();
                Event {
                    phase: self.phase,
                    time,
                    bpm: previous.bpm,
                    cadence: previous.cadence,
                    watts: previous.watts,
                    distance: previous.distance,
                    error: true,
                    ..Event::default()
                }
            }
        };

        if let Some(pulse) = live.pulse {
            event.bpm = pulse;
        }
        event.bpm_rolling_average = rolling_bpm(&self.log, event.time, event.bpm);

        tracing::debug!(
            "t={:.1} bpm={} avg={:.1} cadence={} watts={}",
            event.time,
            event.bpm,
            event.bpm_rolling_average,
            event.cadence,
            event.watts
        );
        self.log.push(event.clone());
        event
    }

    fn advance_replay(&mut self) -> Event {
        let Source::Replay(replay) = &mut self.source else {
            return Event::end_of_log(0.0);
        };

        if self.pace == Pace::Paused {
            return self.log.last().cloned().unwrap_or_else(|| Event {
                phase: self.phase,
                time: replay.clock,
                ..Event::default()
            });
        }

        loop {
            let Some(row) = replay.rows.get(replay.cursor) else {
                return Event::end_of_log(replay.clock);
            };

            if row.phase != self.phase {
                // CALIBRATION after COOLDOWN or FULLSTOP opens another interval
                if !row.phase.may_follow(self.phase) {
                    // keep it for the saved log but never surface it
                    self.log.push(row.clone());
                    replay.cursor += 1;
                    continue;
                }

                // boundary row: announce the phase, redeliver once it is official
                tracing::info!("Replay reached {} at {:.1}s", row.phase, row.time);
                self.phase = row.phase;
                replay.clock = row.time;
                return row.clone();
            }

            let event = row.clone();
            replay.cursor += 1;
            replay.clock = event.time;
            self.log.push(event.clone());
            return event;
        }
    }

    /// Record the targets shown for the latest tick.
    ///
    /// Replays keep the recorded targets.
    pub fn back_fill_targets(&mut self, target: Target) {
        if !self.is_live() {
            return;
        }
        if let Some(last) = self.log.last_mut() {
            last.target_cadence = target.cadence;
            last.target_watts = target.watts;
        }
    }

    /// Snapshot for persistence
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord::new(
            &self.date,
            &self.start_time,
            self.resting_bpm,
            &self.config,
            &self.log,
        )
    }

    /// Finish the session: RESULTS, save unless disabled, then SHUTDOWN.
    ///
    /// Returns where the log was written, if it was.
    pub fn shutdown(&mut self, store: Option<&LogStore>) -> Result<Option<PathBuf>> {
        if self.phase < Phase::Results {
            self.set_phase(Phase::Results)?;
        }

        let saved = match store {
            Some(store) if !self.no_save && !self.log.is_empty() => {
                Some(store.save(&self.to_record())?)
            }
            Some(_) => {
                tracing::info!("Not saving session log");
                None
            }
            None => None,
        };

        self.set_phase(Phase::Shutdown)?;
        Ok(saved)
    }
}
