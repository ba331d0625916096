//! Metronome worker.
//!
//! A dedicated thread owns the note output. Beat timing is kept as absolute
//! deadlines on a monotonic clock and checked at a fixed poll rate, so a late
//! poll never shifts the beats that follow it.

use crate::config::MetronomeConfig;
use crate::{Error, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const COMMAND_CAPACITY: usize = 32;

const NANOS_PER_MINUTE: u64 = 60_000_000_000;

const STRONG_NOTE: u8 = 69;
const STRONG_VELOCITY: f32 = 127.0;
const WEAK_NOTE: u8 = 60;
const WEAK_VELOCITY: f32 = 90.0;

/// Sink for note events; the audio backend lives behind it
pub trait NoteOutput: Send + 'static {
    fn program_change(&mut self, program: u8) -> Result<()>;

    fn note_on(&mut self, note: u8, velocity: u8) -> Result<()>;

    fn note_off(&mut self, note: u8) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Output that only logs, for headless runs
#[derive(Clone, Debug, Default)]
pub struct LoggingOutput;

impl NoteOutput for LoggingOutput {
    fn program_change(&mut self, program: u8) -> Result<()> {
        tracing::info!("metronome program {}", program);
        Ok(())
    }

    fn note_on(&mut self, note: u8, velocity: u8) -> Result<()> {
        tracing::debug!("note on {} velocity {}", note, velocity);
        Ok(())
    }

    fn note_off(&mut self, note: u8) -> Result<()> {
        tracing::debug!("note off {}", note);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        tracing::info!("metronome output closed");
        Ok(())
    }
}

/// Host to worker
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetronomeCommand {
    /// Restart the measure now
    Reset { tempo: u32, volume: f32 },
    /// Change tempo/volume, keeping the beat count
    Tweak { tempo: u32, volume: f32 },
    /// Select an instrument
    Program(u8),
    Halt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoteEvent {
    On { note: u8, velocity: u8 },
    Off { note: u8 },
}

/// Beat timing with nanosecond deadlines.
///
/// `tempo` is strokes per minute; each stroke is split into `meter` beats.
/// Beat 0 of a measure is accented. Every note is released half a beat
/// after it starts.
#[derive(Clone, Debug)]
pub struct Scheduler {
    meter: u32,
    volume: f32,
    beat: u64,
    half_beat: u64,
    index: u32,
    next_beat: u64,
    next_rest: Option<u64>,
    sounding: Option<u8>,
}

impl Scheduler {
    pub fn new(meter: u32, now: u64) -> Self {
        Self {
            meter: meter.max(1),
            volume: 0.0,
            beat: 0,
            half_beat: 0,
            index: 0,
            next_beat: now,
            next_rest: None,
            sounding: None,
        }
    }

    /// Nanoseconds per beat; 0 while silent
    pub fn beat(&self) -> u64 {
        self.beat
    }

    pub fn next_beat(&self) -> u64 {
        self.next_beat
    }

    pub fn next_rest(&self) -> Option<u64> {
        self.next_rest
    }

    /// Beat counter within the measure
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn reset(&mut self, tempo: u32, volume: f32, now: u64) {
        self.index = 0;
        self.next_beat = now;
        self.next_rest = None;
        self.set_tempo(tempo, volume);
    }

    /// Adopt a new tempo without restarting the measure; the next beat is
    /// pulled in if the new tempo would reach it sooner
    pub fn tweak(&mut self, tempo: u32, volume: f32, now: u64) {
        self.set_tempo(tempo, volume);

        let sooner = now.saturating_add(self.beat);
        if sooner < self.next_beat {
            self.next_beat = sooner;
            if self.next_rest.is_some() {
                self.next_rest = Some(self.next_beat.saturating_sub(self.half_beat));
            }
        }
    }

    fn set_tempo(&mut self, tempo: u32, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        self.beat = if tempo > 0 {
            NANOS_PER_MINUTE / u64::from(tempo) / u64::from(self.meter)
        } else {
            0
        };
        self.half_beat = self.beat / 2;
    }

    /// Note events due at `now`
    pub fn poll(&mut self, now: u64) -> Vec<NoteEvent> {
        let mut due = Vec::new();

        if self.volume > 0.0 && self.beat > 0 && now >= self.next_beat {
            let (note, velocity) = if self.index == 0 {
                (STRONG_NOTE, STRONG_VELOCITY)
            } else {
                (WEAK_NOTE, WEAK_VELOCITY)
            };
            if let Some(previous) = self.sounding.take() {
                due.push(NoteEvent::Off { note: previous });
            }
            due.push(NoteEvent::On {
                note,
                velocity: (velocity * self.volume) as u8,
            });
            self.sounding = Some(note);

            self.next_beat += self.beat;
            self.next_rest = Some(self.next_beat - self.half_beat);
            self.index = (self.index + 1) % self.meter;
        }

        if let Some(rest) = self.next_rest {
            if now >= rest {
                if let Some(note) = self.sounding.take() {
                    due.push(NoteEvent::Off { note });
                }
                self.next_rest = None;
            }
        }

        due
    }

    /// Release whatever is still sounding
    pub fn release(&mut self) -> Option<NoteEvent> {
        self.next_rest = None;
        self.sounding.take().map(|note| NoteEvent::Off { note })
    }
}

/// Owned handle to a running metronome worker
pub struct Metronome {
    commands: SyncSender<MetronomeCommand>,
    worker: Option<JoinHandle<()>>,
}

impl Metronome {
    pub fn start<O: NoteOutput>(output: O, config: &MetronomeConfig) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::sync_channel(COMMAND_CAPACITY);
        let worker = MetronomeWorker {
            output,
            program: config.program,
            meter: config.meter,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            commands: command_rx,
        };

        let handle = thread::Builder::new()
            .name("metronome".into())
            .spawn(move || worker.run())
            .map_err(|e| Error::Worker(format!("failed to spawn metronome worker: {}", e)))?;

        tracing::info!("Metronome started");
        Ok(Self {
            commands: command_tx,
            worker: Some(handle),
        })
    }

    pub fn reset(&self, tempo: u32, volume: f32) {
        self.send(MetronomeCommand::Reset { tempo, volume });
    }

    pub fn tweak(&self, tempo: u32, volume: f32) {
        self.send(MetronomeCommand::Tweak { tempo, volume });
    }

    pub fn program(&self, program: u8) {
        self.send(MetronomeCommand::Program(program));
    }

    /// Queue a command without blocking; dropped if the worker is backed up
    pub fn send(&self, command: MetronomeCommand) {
        match self.commands.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(command)) => {
                tracing::warn!("Metronome queue full, dropping {:?}", command);
            }
            Err(TrySendError::Disconnected(command)) => {
                tracing::warn!("Metronome worker gone, dropping {:?}", command);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, |worker| !worker.is_finished())
    }

    pub fn stop(mut self) -> Result<()> {
        self.halt()
    }

    fn halt(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        let _ = self.commands.send(MetronomeCommand::Halt);
        worker
            .join()
            .map_err(|_| Error::Worker("metronome worker panicked".into()))?;
        tracing::info!("Metronome stopped");
        Ok(())
    }
}

impl Drop for Metronome {
    fn drop(&mut self) {
        if let Err(e) = self.halt() {
            tracing::error!("Failed to stop metronome: {}", e);
        }
    }
}

struct MetronomeWorker<O> {
    output: O,
    program: u8,
    meter: u32,
    poll_interval: Duration,
    commands: Receiver<MetronomeCommand>,
}

impl<O: NoteOutput> MetronomeWorker<O> {
    fn run(mut self) {
        let started = Instant::now();
        let now = || started.elapsed().as_nanos() as u64;

        if let Err(e) = self.output.program_change(self.program) {
            tracing::warn!("Failed to select metronome program: {}", e);
        }

        let mut scheduler = Scheduler::new(self.meter, now());

        loop {
            match self.commands.recv_timeout(self.poll_interval) {
                Ok(MetronomeCommand::Halt) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(MetronomeCommand::Reset { tempo, volume }) => {
                    tracing::debug!("metronome reset tempo {} volume {}", tempo, volume);
                    scheduler.reset(tempo, volume, now());
                }
                Ok(MetronomeCommand::Tweak { tempo, volume }) => {
                    scheduler.tweak(tempo, volume, now());
                }
                Ok(MetronomeCommand::Program(program)) => {
                    if let Err(e) = self.output.program_change(program) {
                        tracing::warn!("Failed to select metronome program: {}", e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            for event in scheduler.poll(now()) {
                self.play(event);
            }
        }

        if let Some(event) = scheduler.release() {
            self.play(event);
        }
        if let Err(e) = self.output.close() {
            tracing::warn!("Failed to close metronome output: {}", e);
        }
    }

    fn play(&mut self, event: NoteEvent) {
        let result = match event {
            NoteEvent::On { note, velocity } => self.output.note_on(note, velocity),
            NoteEvent::Off { note } => self.output.note_off(note),
        };
        if let Err(e) = result {
            tracing::warn!("Metronome output failed: {}", e);
        }
    }
}
