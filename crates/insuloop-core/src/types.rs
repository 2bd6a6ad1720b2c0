//! # Loop Domain Types
//!
//! The glucose / effect / dose vocabulary of the closed loop.
//!
//! ## Conventions
//! - Glucose values and deltas are mg/dL.
//! - Insulin rates are units/hour; boluses are units.
//! - All timestamps are `DateTime<Utc>`.
//! - Effect series are finite, ordered by timestamp, and start at or after
//!   the reference glucose sample they were computed against.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Glucose
// =============================================================================

/// A single glucose reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlucoseSample {
    /// When the sample was taken.
    pub start_date: DateTime<Utc>,
    /// Glucose concentration in mg/dL.
    pub quantity_mgdl: f64,
    /// Originating sensor/session identifier.
    pub provenance: String,
}

impl GlucoseSample {
    pub fn new(start_date: DateTime<Utc>, quantity_mgdl: f64, provenance: impl Into<String>) -> Self {
        Self {
            start_date,
            quantity_mgdl,
            provenance: provenance.into(),
        }
    }

    /// Key that orders samples monotonically across sources.
    pub fn order_key(&self) -> (DateTime<Utc>, &str) {
        (self.start_date, self.provenance.as_str())
    }
}

/// One point of modeled glucose change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectPoint {
    pub start_date: DateTime<Utc>,
    /// Modeled glucose change in mg/dL (signed).
    pub delta_mgdl: f64,
}

/// A finite, time-ordered series of glucose deltas attributable to one
/// input (momentum, carbs, or insulin).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EffectSeries(Vec<EffectPoint>);

impl EffectSeries {
    /// Build a series, ordering points by timestamp.
    pub fn new(mut points: Vec<EffectPoint>) -> Self {
        points.sort_by_key(|p| p.start_date);
        Self(points)
    }

    pub fn points(&self) -> &[EffectPoint] {
        &self.0
    }

    pub fn first(&self) -> Option<&EffectPoint> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&EffectPoint> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One point of the forward-projected glucose timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictedGlucose {
    pub start_date: DateTime<Utc>,
    pub value_mgdl: f64,
}

// =============================================================================
// Dosing
// =============================================================================

/// A temporary basal instruction produced by the dose math, pending
/// freshness and device gating before enactment.
#[derive(Debug, Clone, PartialEq)]
pub struct TempBasalRecommendation {
    /// Commanded rate in units/hour.
    pub rate_units_per_hour: f64,
    /// How long the override should run.
    pub duration: Duration,
    /// When the recommendation was produced. Enactment requires this to be
    /// strictly less than the freshness window old.
    pub issued_at: DateTime<Utc>,
}

/// The most recently enacted temporary basal, as reconciled against the
/// device acknowledgement. Fed back into the next recommendation so the
/// loop does not oscillate against its own last command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempBasal {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Acknowledged rate in units/hour.
    pub rate_units_per_hour: f64,
}

impl TempBasal {
    pub fn duration(&self) -> Duration {
        self.end_date - self.start_date
    }
}

/// A bolus the loop has dispatched but whose insulin effect may not yet be
/// reflected by the dose store. Retained briefly so bolus recommendations
/// subtract it rather than double-dose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BolusRecord {
    pub units: f64,
    pub enacted_at: DateTime<Utc>,
}

/// Device echo for a temp basal command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempBasalAck {
    /// Rate the pump actually programmed, units/hour.
    pub rate_units_per_hour: f64,
    /// Time remaining on the programmed temp, as reported by the pump clock.
    pub time_remaining: Duration,
}

// =============================================================================
// Pump & carbs
// =============================================================================

/// Most recent pump telemetry relevant to the loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpStatus {
    /// Pump-clock timestamp of the status broadcast.
    pub clock_date: DateTime<Utc>,
    /// Time remaining on the currently running temp basal.
    pub time_remaining: Duration,
}

/// A carbohydrate entry as the user records it.
#[derive(Debug, Clone, PartialEq)]
pub struct CarbEntry {
    pub start_date: DateTime<Utc>,
    pub grams: f64,
    /// Expected absorption horizon; stores substitute a default when absent.
    pub absorption: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, minute, 0).unwrap()
    }

    #[test]
    fn test_effect_series_orders_points() {
        let series = EffectSeries::new(vec![
            EffectPoint {
                start_date: ts(10),
                delta_mgdl: 2.0,
            },
            EffectPoint {
                start_date: ts(5),
                delta_mgdl: 1.0,
            },
        ]);
        assert_eq!(series.first().unwrap().start_date, ts(5));
        assert_eq!(series.last().unwrap().start_date, ts(10));
    }

    #[test]
    fn test_glucose_order_key_breaks_ties_by_provenance() {
        let a = GlucoseSample::new(ts(0), 120.0, "cgm-a");
        let b = GlucoseSample::new(ts(0), 121.0, "cgm-b");
        assert!(a.order_key() < b.order_key());
    }

    #[test]
    fn test_temp_basal_duration() {
        let basal = TempBasal {
            start_date: ts(0),
            end_date: ts(30),
            rate_units_per_hour: 0.8,
        };
        assert_eq!(basal.duration(), Duration::minutes(30));
    }
}
