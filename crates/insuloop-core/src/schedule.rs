//! # Therapy Schedules
//!
//! Time-of-day banded values: glucose target range, insulin sensitivity,
//! and scheduled basal rate all vary across the day in bands.
//!
//! ## Invariants
//! - A schedule has at least one band.
//! - Bands are sorted by start minute, strictly increasing, first at 00:00.
//! - Lookups never fail: every minute of the day falls in exactly one band.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LoopError;

pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// One schedule band: `value` applies from `start_minute` (minutes past
/// midnight, pump clock) until the next band begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleBand<T> {
    pub start_minute: u32,
    pub value: T,
}

/// A daily repeating schedule of banded values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySchedule<T> {
    bands: Vec<ScheduleBand<T>>,
}

impl<T> DailySchedule<T> {
    /// Validate and build a schedule.
    pub fn new(bands: Vec<ScheduleBand<T>>) -> Result<Self, LoopError> {
        if bands.is_empty() {
            return Err(LoopError::Configuration(
                "schedule requires at least one band".to_string(),
            ));
        }
        if bands[0].start_minute != 0 {
            return Err(LoopError::Configuration(
                "first schedule band must start at midnight".to_string(),
            ));
        }
        for pair in bands.windows(2) {
            if pair[1].start_minute <= pair[0].start_minute {
                return Err(LoopError::Configuration(format!(
                    "schedule bands out of order at minute {}",
                    pair[1].start_minute
                )));
            }
        }
        if let Some(last) = bands.last()
            && last.start_minute >= MINUTES_PER_DAY
        {
            return Err(LoopError::Configuration(format!(
                "schedule band start {} exceeds the day",
                last.start_minute
            )));
        }
        Ok(Self { bands })
    }

    /// Single-band convenience constructor.
    pub fn flat(value: T) -> Self {
        Self {
            bands: vec![ScheduleBand {
                start_minute: 0,
                value,
            }],
        }
    }

    /// The band value in force at `at`.
    pub fn value_at(&self, at: DateTime<Utc>) -> &T {
        let minute = at.hour() * 60 + at.minute();
        let idx = self
            .bands
            .partition_point(|band| band.start_minute <= minute)
            .saturating_sub(1);
        &self.bands[idx].value
    }

    pub fn bands(&self) -> &[ScheduleBand<T>] {
        &self.bands
    }
}

/// A glucose target corridor in mg/dL.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetRange {
    pub min_mgdl: f64,
    pub max_mgdl: f64,
}

impl TargetRange {
    pub fn midpoint(&self) -> f64 {
        (self.min_mgdl + self.max_mgdl) / 2.0
    }

    pub fn contains(&self, value_mgdl: f64) -> bool {
        value_mgdl >= self.min_mgdl && value_mgdl <= self.max_mgdl
    }
}
