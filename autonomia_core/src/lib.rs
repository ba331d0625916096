#![forbid(unsafe_code)]

//! Core engine for Autonomia guided rowing workouts.
//!
//! This crate provides:
//! - Domain types (phases, per-tick events)
//! - Signal filters and adaptive target calibration
//! - Live and replay sessions
//! - Heart-rate sensor and metronome bridges
//! - Persistence (session logs, CSV export, history)

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod telemetry;
pub mod filters;
pub mod interval;
pub mod session;
pub mod persistence;
pub mod csv_export;
pub mod history;
pub mod heart_rate;
pub mod sensor;
pub mod metronome;
pub mod driver;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use interval::{Advice, Guidance, IntervalRunner, MetronomeCue, Target};
pub use session::{Pace, Session};
pub use persistence::{LogStore, SessionRecord};
pub use sensor::{SensorBridge, SensorEvent, SensorMessage};
pub use metronome::{LoggingOutput, Metronome, MetronomeCommand};
pub use driver::{Driver, Input, Tick};
