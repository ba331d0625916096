//! Typed request/response contract for the rowing machine.
//!
//! The machine driver itself is external. It answers a query for a set of
//! fields with a small list of raw integers per field; this module turns that
//! into a struct with one typed member per field and rejects replies that
//! are missing something we asked for.

use crate::{Error, Result};
use std::collections::{BTreeSet, HashMap};

/// Telemetry the machine can be asked for
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TelemetryField {
    WorkTime,
    WorkDistance,
    Cadence,
    Power,
    HeartRate,
    StrokeState,
}

impl TelemetryField {
    /// Command name understood by the machine driver
    pub fn command(self) -> &'static str {
        match self {
            TelemetryField::WorkTime => "CSAFE_PM_GET_WORKTIME",
            TelemetryField::WorkDistance => "CSAFE_PM_GET_WORKDISTANCE",
            TelemetryField::Cadence => "CSAFE_GETCADENCE_CMD",
            TelemetryField::Power => "CSAFE_GETPOWER_CMD",
            TelemetryField::HeartRate => "CSAFE_GETHRCUR_CMD",
            TelemetryField::StrokeState => "CSAFE_PM_GET_STROKESTATE",
        }
    }
}

/// A set of fields to fetch in one round trip
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetryRequest {
    fields: BTreeSet<TelemetryField>,
}

impl TelemetryRequest {
    pub fn new(fields: impl IntoIterator<Item = TelemetryField>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    /// Everything a live session reads each tick
    pub fn tick() -> Self {
        Self::new([
            TelemetryField::WorkTime,
            TelemetryField::WorkDistance,
            TelemetryField::Cadence,
            TelemetryField::Power,
            TelemetryField::HeartRate,
            TelemetryField::StrokeState,
        ])
    }

    pub fn fields(&self) -> impl Iterator<Item = TelemetryField> + '_ {
        self.fields.iter().copied()
    }

    pub fn contains(&self, field: TelemetryField) -> bool {
        self.fields.contains(&field)
    }
}

/// Raw reply as delivered by the driver
pub type RawTelemetry = HashMap<TelemetryField, Vec<i64>>;

/// Validated reply; a member is `Some` exactly when it was requested
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TelemetryReply {
    /// Seconds
    pub work_time: Option<f64>,
    /// Meters
    pub work_distance: Option<f64>,
    /// Strokes per minute
    pub cadence: Option<u32>,
    pub power: Option<u32>,
    pub heart_rate: Option<u32>,
    pub stroke_state: Option<u32>,
}

impl TelemetryReply {
    /// Validate a raw reply against the request that produced it
    pub fn parse(request: &TelemetryRequest, raw: &RawTelemetry) -> Result<Self> {
        let mut reply = TelemetryReply::default();

        for field in request.fields() {
            let values = raw
                .get(&field)
                .filter(|values| !values.is_empty())
                .ok_or_else(|| {
                    Error::Telemetry(format!("reply is missing {}", field.command()))
                })?;

            match field {
                TelemetryField::WorkTime => {
                    reply.work_time = Some(values[0] as f64 / 100.0);
                }
                TelemetryField::WorkDistance => {
                    let tenths = values.get(1).copied().unwrap_or(0);
                    reply.work_distance = Some(values[0] as f64 + tenths as f64 / 10.0);
                }
                TelemetryField::Cadence => reply.cadence = Some(non_negative(field, values[0])?),
                TelemetryField::Power => reply.power = Some(non_negative(field, values[0])?),
                TelemetryField::HeartRate => {
                    reply.heart_rate = Some(non_negative(field, values[0])?)
                }
                TelemetryField::StrokeState => {
                    reply.stroke_state = Some(non_negative(field, values[0])?)
                }
            }
        }

        Ok(reply)
    }
}

fn non_negative(field: TelemetryField, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        Error::Telemetry(format!("{} out of range: {}", field.command(), value))
    })
}

/// A connected rowing machine
pub trait Ergometer: Send {
    /// One request/response round trip
    fn query(&mut self, request: &TelemetryRequest) -> Result<RawTelemetry>;
}

/// Locates a rowing machine; `None` means not found yet
pub trait ErgometerFinder {
    fn find(&mut self) -> Option<Box<dyn Ergometer>>;
}
