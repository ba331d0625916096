//! CSV export of a recorded session log.

use crate::persistence::SessionRecord;
use crate::{Event, Result};
use std::fs::File;
use std::path::Path;

/// A row in the CSV output; field names match the log headers
#[derive(Debug, serde::Serialize)]
struct CsvRow {
    phase: i32,
    elapsed_time: f64,
    bpm: u32,
    cadence: u32,
    watts: u32,
    distance: f64,
    target_cadence: u32,
    target_watts: u32,
    bpm_rolling_average: f64,
}

impl From<&Event> for CsvRow {
    fn from(event: &Event) -> Self {
        CsvRow {
            phase: event.phase.code(),
            elapsed_time: event.time,
            bpm: event.bpm,
            cadence: event.cadence,
            watts: event.watts,
            distance: event.distance,
            target_cadence: event.target_cadence,
            target_watts: event.target_watts,
            bpm_rolling_average: event.bpm_rolling_average,
        }
    }
}

/// Write every row of `record` to `csv_path`, replacing the file
///
/// Legacy rows are written with the defaults they decode to. Returns the
/// number of rows written.
pub fn export_csv(record: &SessionRecord, csv_path: &Path) -> Result<usize> {
    let events = record.events()?;

    if let Some(parent) = csv_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(csv_path)?;
    let mut writer = csv::WriterBuilder::new().has_headers(true).from_writer(file);

    for event in &events {
        writer.serialize(CsvRow::from(event))?;
    }

    // Flush and sync to disk
    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    tracing::info!("Exported {} rows to {:?}", events.len(), csv_path);
    Ok(events.len())
}
