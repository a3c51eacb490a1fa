//! Plot, sensor, and slot records as the rest of the controller sees them.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Reachability of a sensor, and the derived on/off state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Up,
    Down,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Up => "UP",
            Status::Down => "DOWN",
        }
    }

    /// Slot status that mirrors a plot's irrigation flag.
    pub fn for_irrigated(is_irrigated: bool) -> Self {
        if is_irrigated {
            Status::Up
        } else {
            Status::Down
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "UP" => Ok(Status::Up),
            "DOWN" => Ok(Status::Down),
            other => bail!("unknown status '{other}' (use UP/DOWN)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CropType {
    Rice,
    Beans,
}

impl CropType {
    pub fn as_str(self) -> &'static str {
        match self {
            CropType::Rice => "RICE",
            CropType::Beans => "BEANS",
        }
    }

    /// Square metres of plot one timing slot covers for this crop.
    fn area_per_slot(self) -> f64 {
        match self {
            CropType::Rice => 1.0,
            CropType::Beans => 2.0,
        }
    }

    /// Slot count for a `length` x `width` plot, rounded up, never zero.
    pub fn slots_for_area(self, length: f64, width: f64) -> u32 {
        let slots = (length * width / self.area_per_slot()).ceil();
        if slots.is_finite() && slots >= 1.0 {
            slots.min(u32::MAX as f64) as u32
        } else {
            1
        }
    }
}

impl FromStr for CropType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "RICE" => Ok(CropType::Rice),
            "BEANS" => Ok(CropType::Beans),
            other => bail!("unknown crop type '{other}' (use RICE/BEANS)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sensor {
    pub id: i64,
    pub code: String,
    pub status: Status,
    pub plot_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slot {
    pub id: i64,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plot {
    pub id: i64,
    pub code: String,
    pub length: f64,
    pub width: f64,

    pub crop_type: Option<CropType>,
    pub water_amount: i64,

    pub is_irrigated: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_irrigation_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_irrigation_time: Option<OffsetDateTime>,

    /// Attempts made by the current (or last exhausted) retry campaign.
    pub sensor_call_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sensor_call_time: Option<OffsetDateTime>,
    pub has_alert: bool,

    pub sensor: Option<Sensor>,
    pub slots: Vec<Slot>,
}

impl Plot {
    /// A plot without a sensor counts as unreachable.
    pub fn sensor_is_up(&self) -> bool {
        self.sensor.as_ref().map(|s| s.status) == Some(Status::Up)
    }
}

#[cfg(test)]
impl Plot {
    /// True when every slot mirrors the irrigation flag.
    pub fn slots_consistent(&self) -> bool {
        let expected = Status::for_irrigated(self.is_irrigated);
        self.slots.iter().all(|s| s.status == expected)
    }
}

// ---------------------------------------------------------------------------
// Timestamps (persisted as unix milliseconds)
// ---------------------------------------------------------------------------

pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

pub fn to_millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_millis(ms: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000).ok()
}

// ===========================================================================
// Tests
// ===========================================================================
