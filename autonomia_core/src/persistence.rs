//! Recorded session logs with file locking.
//!
//! A finished session is written as one JSON document per workout. Rows are
//! positional arrays; the header names them. Files written before the
//! `schema_version` field existed are read by sniffing the row width.

use crate::config::WorkoutConfig;
use crate::{Error, Event, Phase, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Version written by [`SessionRecord::new`]
pub const SCHEMA_VERSION: u32 = 2;

/// Names of the positional values in a full log row
pub const LOG_HEADERS: [&str; 9] = [
    "phase",
    "elapsed_time",
    "bpm",
    "cadence",
    "watts",
    "distance",
    "target_cadence",
    "target_watts",
    "bpm_rolling_average",
];

const FULL_ROW: usize = 9;
const LEGACY_ROW: usize = 6;

const LOG_SUFFIX: &str = "_rowing_log";

/// A session as stored on disk
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Absent in files written by older versions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,

    pub date: String,
    pub start_time: String,
    pub resting_bpm: u32,
    pub intervals: u32,
    pub calibration_time: f64,
    pub steady_time: f64,
    pub cooldown_time: f64,
    pub target_low: i32,
    pub target_high: i32,

    #[serde(default = "default_target_bias")]
    pub target_bias: f64,

    #[serde(default)]
    pub log_headers: Vec<String>,

    pub log: Vec<Vec<Value>>,
}

fn default_target_bias() -> f64 {
    0.5
}

impl SessionRecord {
    /// Build a current-schema record from a finished session's parts
    pub fn new(
        date: &str,
        start_time: &str,
        resting_bpm: u32,
        workout: &WorkoutConfig,
        log: &[Event],
    ) -> Self {
        Self {
            schema_version: Some(SCHEMA_VERSION),
            date: date.to_string(),
            start_time: start_time.to_string(),
            resting_bpm,
            intervals: workout.intervals,
            calibration_time: workout.calibration_time,
            steady_time: workout.steady_time,
            cooldown_time: workout.cooldown_time,
            target_low: workout.target_bpm_low,
            target_high: workout.target_bpm_high,
            target_bias: workout.target_bpm_bias,
            log_headers: LOG_HEADERS.iter().map(|h| h.to_string()).collect(),
            log: log.iter().map(encode_row).collect(),
        }
    }

    /// Workout settings carried in the header
    pub fn workout(&self) -> WorkoutConfig {
        WorkoutConfig {
            target_bpm_low: self.target_low,
            target_bpm_high: self.target_high,
            target_bpm_bias: self.target_bias,
            intervals: self.intervals,
            calibration_time: self.calibration_time,
            steady_time: self.steady_time,
            cooldown_time: self.cooldown_time,
        }
    }

    /// Whether this record predates explicit schema versions
    pub fn is_legacy(&self) -> bool {
        self.schema_version.is_none()
    }

    /// Decode every row into an event
    pub fn events(&self) -> Result<Vec<Event>> {
        match self.schema_version {
            Some(version) if version > SCHEMA_VERSION => Err(Error::Schema(format!(
                "schema version {} is newer than supported version {}",
                version, SCHEMA_VERSION
            ))),
            _ => self
                .log
                .iter()
                .enumerate()
                .map(|(index, row)| self.decode_row(index, row))
                .collect(),
        }
    }

    fn decode_row(&self, index: usize, row: &[Value]) -> Result<Event> {
        let legacy_shape = self.is_legacy() && row.len() == LEGACY_ROW;
        if row.len() != FULL_ROW && !legacy_shape {
            return Err(Error::Schema(format!(
                "row {} has {} values, expected {}",
                index,
                row.len(),
                if self.is_legacy() { "6 or 9" } else { "9" }
            )));
        }

        let phase = Phase::from_code(integer(row, index, 0)?)?;
        let bpm = unsigned(row, index, 2)?;
        let mut event = Event {
            phase,
            time: float(row, index, 1)?,
            bpm,
            bpm_rolling_average: f64::from(bpm),
            cadence: unsigned(row, index, 3)?,
            watts: unsigned(row, index, 4)?,
            distance: float(row, index, 5)?,
            target_cadence: 0,
            target_watts: 0,
            error: false,
        };

        if row.len() == FULL_ROW {
            event.target_cadence = unsigned(row, index, 6)?;
            event.target_watts = unsigned(row, index, 7)?;
            event.bpm_rolling_average = float(row, index, 8)?;
        }

        Ok(event)
    }
}

fn encode_row(event: &Event) -> Vec<Value> {
    vec![
        json!(event.phase.code()),
        json!(event.time),
        json!(event.bpm),
        json!(event.cadence),
        json!(event.watts),
        json!(event.distance),
        json!(event.target_cadence),
        json!(event.target_watts),
        json!(event.bpm_rolling_average),
    ]
}

fn float(row: &[Value], index: usize, column: usize) -> Result<f64> {
    row[column].as_f64().ok_or_else(|| bad_value(row, index, column))
}

fn integer(row: &[Value], index: usize, column: usize) -> Result<i64> {
    let value = &row[column];
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        .ok_or_else(|| bad_value(row, index, column))
}

fn unsigned(row: &[Value], index: usize, column: usize) -> Result<u32> {
    u32::try_from(integer(row, index, column)?).map_err(|_| bad_value(row, index, column))
}

fn bad_value(row: &[Value], index: usize, column: usize) -> Error {
    Error::Schema(format!(
        "row {} has invalid {}: {}",
        index, LOG_HEADERS[column], row[column]
    ))
}

/// Directory of recorded session logs
#[derive(Clone, Debug)]
pub struct LogStore {
    dir: PathBuf,
}

impl LogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// First unused file name for a session recorded on `date`
    pub fn next_path(&self, date: &str) -> PathBuf {
        let first = self.dir.join(format!("{}{}.json", date, LOG_SUFFIX));
        if !first.exists() {
            return first;
        }
        (1..)
            .map(|n| self.dir.join(format!("{}{}_{}.json", date, LOG_SUFFIX, n)))
            .find(|path| !path.exists())
            .unwrap_or(first)
    }

    /// Write a record under a fresh name
    ///
    /// Atomically writes the record by:
    /// 1. Writing to a locked temp file in the log directory
    /// 2. Syncing to disk
    /// 3. Renaming it into place without clobbering an existing log
    pub fn save(&self, record: &SessionRecord) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;

        let temp = NamedTempFile::new_in(&self.dir)?;
        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string(record)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        let path = self.next_path(&record.date);
        temp.persist_noclobber(&path)
            .map_err(|e| Error::Io(e.error))?;

        tracing::info!("Saved session log with {} rows to {:?}", record.log.len(), path);
        Ok(path)
    }

    /// Read a record with a shared lock
    pub fn load(path: &Path) -> Result<SessionRecord> {
        let file = File::open(path)?;
        file.lock_shared()?;

        let mut contents = String::new();
        let read = std::io::BufReader::new(&file).read_to_string(&mut contents);
        file.unlock()?;
        read?;

        let record: SessionRecord = serde_json::from_str(&contents)?;
        if record.is_legacy() {
            tracing::debug!("Loaded legacy session log {:?}", path);
        } else {
            tracing::debug!("Loaded session log {:?}", path);
        }
        Ok(record)
    }

    /// Recorded logs in the directory, sorted by name (oldest date first)
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if is_log_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn is_log_file(path: &Path) -> bool {
    let is_json = path.extension().map_or(false, |ext| ext == "json");
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    is_json && stem.contains(LOG_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log() -> Vec<Event> {
        vec![
            Event {
                phase: Phase::RestingBpm,
                time: 0.0,
                bpm: 61,
                bpm_rolling_average: 61.0,
                ..Event::default()
            },
            Event {
                phase: Phase::Calibration,
                time: 1.5,
                bpm: 74,
                bpm_rolling_average: 72.25,
                cadence: 21,
                watts: 118,
                distance: 12.3,
                target_cadence: 21,
                target_watts: 118,
                error: false,
            },
        ]
    }

    fn sample_record() -> SessionRecord {
        SessionRecord::new(
            "2024_04_12",
            "07:15 AM",
            61,
            &WorkoutConfig::default(),
            &sample_log(),
        )
    }

    #[test]
    fn test_record_roundtrip_through_events() {
        let record = sample_record();
        assert_eq!(record.schema_version, Some(SCHEMA_VERSION));
        assert_eq!(record.log_headers.len(), 9);
        assert_eq!(record.events().unwrap(), sample_log());
    }

    #[test]
    fn test_rows_are_written_with_integer_phase() {
        let json = serde_json::to_string(&sample_record()).unwrap();
        assert!(json.contains("[2,1.5,74,21,118,12.3,21,118,72.25]"));
    }

    #[test]
    fn test_legacy_six_value_rows() {
        let json = r#"{
            "date": "2023_11_02", "start_time": "06:00 PM", "resting_bpm": 58,
            "intervals": 2, "calibration_time": 2, "steady_time": 10, "cooldown_time": 1,
            "target_low": 10, "target_high": 20,
            "log": [[0, 0.0, 58, 0, 0, 0.0], [2, 3.0, 70, 22, 120, 40.5]]
        }"#;
        let record: SessionRecord = serde_json::from_str(json).unwrap();
        assert!(record.is_legacy());
        assert_eq!(record.target_bias, 0.5);

        let events = record.events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].phase, Phase::Calibration);
        assert_eq!(events[1].target_cadence, 0);
        assert_eq!(events[1].target_watts, 0);
        assert_eq!(events[1].bpm_rolling_average, 70.0);
        assert_eq!(record.workout().intervals, 2);
    }

    #[test]
    fn test_legacy_nine_value_rows() {
        let json = r#"{
            "date": "2024_01_05", "start_time": "08:00 AM", "resting_bpm": 60,
            "intervals": 1, "calibration_time": 2, "steady_time": 10, "cooldown_time": 1,
            "target_low": 10, "target_high": 20,
            "log": [[3, 5.0, 76, 24, 110, 90.0, 24, 108, 75.5]]
        }"#;
        let record: SessionRecord = serde_json::from_str(json).unwrap();
        let events = record.events().unwrap();
        assert_eq!(events[0].phase, Phase::Steady);
        assert_eq!(events[0].target_watts, 108);
        assert_eq!(events[0].bpm_rolling_average, 75.5);
    }

    #[test]
    fn test_unknown_row_width_is_schema_error() {
        let mut record = sample_record();
        record.schema_version = None;
        record.log.push(vec![json!(2), json!(1.0), json!(70)]);
        assert!(matches!(record.events(), Err(Error::Schema(_))));
    }

    #[test]
    fn test_versioned_record_rejects_short_rows() {
        let mut record = sample_record();
        record.log[0].truncate(6);
        assert!(matches!(record.events(), Err(Error::Schema(_))));
    }

    #[test]
    fn test_newer_schema_version_is_rejected() {
        let mut record = sample_record();
        record.schema_version = Some(SCHEMA_VERSION + 1);
        assert!(record.events().is_err());
    }

    #[test]
    fn test_store_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(temp_dir.path().join("logs"));

        let path = store.save(&sample_record()).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "2024_04_12_rowing_log.json"
        );

        let loaded = LogStore::load(&path).unwrap();
        assert_eq!(loaded, sample_record());
    }

    #[test]
    fn test_store_never_overwrites() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(temp_dir.path());

        let first = store.save(&sample_record()).unwrap();
        let second = store.save(&sample_record()).unwrap();
        let third = store.save(&sample_record()).unwrap();

        assert_ne!(first, second);
        assert!(second.ends_with("2024_04_12_rowing_log_1.json"));
        assert!(third.ends_with("2024_04_12_rowing_log_2.json"));
    }

    #[test]
    fn test_atomic_save_leaves_no_temp_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(temp_dir.path());
        store.save(&sample_record()).unwrap();

        let entries: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1, "Expected only the log, found {:?}", entries);
    }

    #[test]
    fn test_list_is_sorted_and_filtered() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(temp_dir.path());

        let mut later = sample_record();
        later.date = "2024_05_01".into();
        store.save(&later).unwrap();
        store.save(&sample_record()).unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), "x").unwrap();
        std::fs::write(temp_dir.path().join("config.json"), "{}").unwrap();

        let names: Vec<_> = store
            .list()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["2024_04_12_rowing_log.json", "2024_05_01_rowing_log.json"]
        );
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(temp_dir.path().join("missing"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_load_corrupted_file_is_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("2024_01_01_rowing_log.json");
        std::fs::write(&path, "{ invalid json }").unwrap();
        assert!(matches!(LogStore::load(&path), Err(Error::Json(_))));
    }
}
