//! One-tick-at-a-time workout driver.
//!
//! The host loop owns the session and both bridges; it calls
//! [`Driver::tick`] once per tick with whatever the athlete pressed and
//! forwards the resulting metronome command. Live sessions move between
//! phases on timers and input, replays follow the recorded phase changes.

use crate::filters::RestingBpmEstimator;
use crate::interval::{Guidance, IntervalRunner, MetronomeCue};
use crate::metronome::MetronomeCommand;
use crate::session::Session;
use crate::{Event, Phase, Result};

/// Athlete input for one tick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Input {
    /// Leave RESTING_BPM or PENDING, or finish from FULLSTOP
    Advance,
    /// End the current interval phase early
    Skip,
    /// Go back to CALIBRATION from FULLSTOP
    Resume,
}

/// Outcome of one tick
#[derive(Clone, Debug, PartialEq)]
pub struct Tick {
    pub event: Event,
    /// Session phase after the tick
    pub phase: Phase,
    pub guidance: Option<Guidance>,
    /// Command for the metronome worker, if anything changed
    pub metronome: Option<MetronomeCommand>,
    /// Seconds left in a timed live phase
    pub remaining: Option<f64>,
    /// The replay has nothing left; the host should shut the session down
    pub finished: bool,
}

/// Phase progression and per-tick guidance for one workout
#[derive(Debug, Default)]
pub struct Driver {
    runner: Option<IntervalRunner>,
    resting: RestingBpmEstimator,
    deadline: Option<f64>,
    interval: u32,
    metronome: Option<(u32, f32)>,
}

impl Driver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runner(&self) -> Option<&IntervalRunner> {
        self.runner.as_ref()
    }

    pub fn resting(&self) -> &RestingBpmEstimator {
        &self.resting
    }

    /// Interval currently running or last run, counting from 1
    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Advance the session by one tick
    pub fn tick(&mut self, session: &mut Session, input: Option<Input>) -> Result<Tick> {
        if session.phase() == Phase::Invalid {
            self.enter(session, Phase::RestingBpm)?;
        }

        let before = session.phase();
        let event = session.advance();

        if event.phase == Phase::Shutdown && !session.is_live() {
            tracing::info!("Replay finished at {:.1}s", event.time);
            let metronome = self.silence();
            return Ok(self.finish(session, event, None, metronome, true));
        }

        // replay announced a recorded phase change; the row comes again next tick
        if session.phase() != before {
            self.entered(session, session.phase());
            let metronome = self.phase_cue(session.phase());
            return Ok(self.finish(session, event, None, metronome, false));
        }

        let mut guidance = None;
        let mut metronome = None;

        match before {
            Phase::RestingBpm => {
                self.resting.observe(&event);
                if session.is_live() && input == Some(Input::Advance) {
                    session.set_resting_bpm(self.resting.average().unwrap_or(event.bpm));
                    self.enter(session, Phase::Pending)?;
                }
            }
            Phase::Pending => {
                if session.is_live()
                    && (input == Some(Input::Advance) || session.workout_started())
                {
                    self.enter(session, Phase::Calibration)?;
                }
            }
            phase if phase.is_interval() => {
                if self.runner.is_none() {
                    self.start_runner(session);
                }
                let update = self.runner.as_mut().map(|runner| runner.update(before, &event));
                if let Some(g) = update {
                    if let Some(target) = g.target {
                        session.back_fill_targets(target);
                    }
                    metronome = g.metronome.and_then(|cue| self.cue(cue));
                    guidance = Some(g);
                }

                if session.is_live() && (input == Some(Input::Skip) || self.expired(session)) {
                    let next = self.next_interval_phase(session, before);
                    self.enter(session, next)?;
                    metronome = self.phase_cue(next).or(metronome);
                }
            }
            Phase::FullStop => {
                if session.is_live() {
                    match input {
                        Some(Input::Resume) => self.enter(session, Phase::Calibration)?,
                        Some(Input::Advance) => self.enter(session, Phase::Results)?,
                        _ => {}
                    }
                }
            }
            _ => {}
        }

        Ok(self.finish(session, event, guidance, metronome, false))
    }

    fn finish(
        &self,
        session: &Session,
        event: Event,
        guidance: Option<Guidance>,
        metronome: Option<MetronomeCommand>,
        finished: bool,
    ) -> Tick {
        let remaining = match (session.is_live(), self.deadline) {
            (true, Some(deadline)) => Some((deadline - session.now()).max(0.0)),
            _ => None,
        };
        Tick {
            event,
            phase: session.phase(),
            guidance,
            metronome,
            remaining,
            finished,
        }
    }

    fn next_interval_phase(&self, session: &Session, phase: Phase) -> Phase {
        match phase {
            Phase::Calibration => Phase::Steady,
            Phase::Steady => Phase::Cooldown,
            _ if self.interval < session.config().intervals => Phase::Calibration,
            _ => Phase::FullStop,
        }
    }

    fn enter(&mut self, session: &mut Session, phase: Phase) -> Result<()> {
        session.set_phase(phase)?;
        self.entered(session, phase);
        Ok(())
    }

    /// Bookkeeping once `phase` is official
    fn entered(&mut self, session: &Session, phase: Phase) {
        let minutes = match phase {
            Phase::Calibration => {
                if self.runner.is_none() {
                    self.start_runner(session);
                }
                self.interval += 1;
                tracing::info!("Interval {} of {}", self.interval, session.config().intervals);
                Some(session.config().calibration_time)
            }
            Phase::Steady => Some(session.config().steady_time),
            Phase::Cooldown => Some(session.config().cooldown_time),
            _ => None,
        };
        self.deadline = minutes.map(|m| session.now() + m * 60.0);
    }

    fn start_runner(&mut self, session: &Session) {
        self.runner = Some(IntervalRunner::new(session.resting_bpm(), session.config()));
    }

    fn expired(&self, session: &Session) -> bool {
        self.deadline.map_or(false, |deadline| session.now() > deadline)
    }

    /// Silence the metronome when leaving the calibrated phases
    fn phase_cue(&mut self, phase: Phase) -> Option<MetronomeCommand> {
        match phase {
            Phase::Cooldown | Phase::FullStop | Phase::Results | Phase::Shutdown => self.silence(),
            _ => None,
        }
    }

    fn silence(&mut self) -> Option<MetronomeCommand> {
        self.cue(MetronomeCue::Silence)
    }

    /// Turn a runner cue into a command, only when something changes
    fn cue(&mut self, cue: MetronomeCue) -> Option<MetronomeCommand> {
        match (cue, self.metronome) {
            (MetronomeCue::Play { tempo, volume }, Some((current, playing)))
                if playing > 0.0 =>
            {
                if current == tempo && playing == volume {
                    return None;
                }
                self.metronome = Some((tempo, volume));
                Some(MetronomeCommand::Tweak { tempo, volume })
            }
            (MetronomeCue::Play { tempo, volume }, _) => {
                self.metronome = Some((tempo, volume));
                Some(MetronomeCommand::Reset { tempo, volume })
            }
            (MetronomeCue::Silence, Some((tempo, playing))) if playing > 0.0 => {
                self.metronome = Some((tempo, 0.0));
                Some(MetronomeCommand::Tweak { tempo, volume: 0.0 })
            }
            (MetronomeCue::Silence, _) => None,
        }
    }
}
