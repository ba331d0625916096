//! GATT heart-rate measurement and battery level decoding.

use crate::{Error, Result};
use uuid::Uuid;

/// Heart-rate service, used to filter advertisements
pub const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

/// Heart-rate measurement characteristic (notifications)
pub const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// Battery level characteristic (read)
pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

const VALUE_FORMAT_U16: u8 = 0b0000_0001;
const ENERGY_EXPENDED_PRESENT: u8 = 0b0000_1000;
const RR_INTERVAL_PRESENT: u8 = 0b0001_0000;

const ENERGY_EXPENDED_BYTES: usize = 2;
const RR_INTERVAL_BYTES: usize = 2;

/// One decoded heart-rate notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartRateMeasurement {
    pub bpm: u32,
    /// `None` when the sensor does not send RR intervals at all
    pub rr_intervals: Option<Vec<u16>>,
}

impl HeartRateMeasurement {
    /// A usable beat needs at least one RR interval
    pub fn has_rr_intervals(&self) -> bool {
        self.rr_intervals.as_ref().map_or(false, |rr| !rr.is_empty())
    }
}

/// Decode a heart-rate measurement packet
pub fn decode(packet: &[u8]) -> Result<HeartRateMeasurement> {
    let (&flags, body) = packet
        .split_first()
        .ok_or_else(|| Error::Decode("empty heart-rate packet".into()))?;

    let bpm_bytes = if flags & VALUE_FORMAT_U16 != 0 { 2 } else { 1 };
    if body.len() < bpm_bytes {
        return Err(Error::Decode(format!(
            "heart-rate packet too short: {} bytes",
            packet.len()
        )));
    }

    let bpm = match bpm_bytes {
        2 => u32::from(u16::from_le_bytes([body[0], body[1]])),
        _ => u32::from(body[0]),
    };

    let mut offset = bpm_bytes;
    if flags & ENERGY_EXPENDED_PRESENT != 0 {
        offset += ENERGY_EXPENDED_BYTES;
    }

    let rr_intervals = if flags & RR_INTERVAL_PRESENT != 0 {
        let rest = body.get(offset..).unwrap_or(&[]);
        Some(
            rest.chunks_exact(RR_INTERVAL_BYTES)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect(),
        )
    } else {
        None
    };

    Ok(HeartRateMeasurement { bpm, rr_intervals })
}

/// Decode a battery level read, in percent
pub fn decode_battery(value: &[u8]) -> Result<u8> {
    value
        .first()
        .copied()
        .ok_or_else(|| Error::Decode("empty battery level".into()))
}
