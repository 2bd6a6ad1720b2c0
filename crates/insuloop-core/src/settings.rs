//! Therapy settings snapshot.
//!
//! The engine reads settings once at the start of a prediction step and
//! holds the snapshot for the whole step; schedules edited mid-step only
//! take effect on the next tick.

use serde::{Deserialize, Serialize};

use crate::schedule::{DailySchedule, TargetRange};

/// Everything the dose math needs from configuration. Any field may be
/// absent while the user is still onboarding; the dosing paths demand
/// their required subset through [`TherapySettings::for_temp_basal`] /
/// [`TherapySettings::for_bolus`] and fail with `MissingData` when the
/// view comes back `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TherapySettings {
    /// Hard ceiling for any commanded basal rate, units/hour.
    pub max_basal_rate: Option<f64>,
    /// Hard ceiling for any single bolus, units.
    pub max_bolus: Option<f64>,
    /// Glucose target corridor by time of day.
    pub target_range: Option<DailySchedule<TargetRange>>,
    /// Insulin sensitivity (mg/dL per unit) by time of day.
    pub sensitivity: Option<DailySchedule<f64>>,
    /// Scheduled basal rate (units/hour) by time of day.
    pub basal_schedule: Option<DailySchedule<f64>>,
}

/// The complete input set for a temp-basal recommendation, borrowed from
/// a snapshot that has every required field.
#[derive(Debug, Clone, Copy)]
pub struct TempBasalSettings<'a> {
    pub max_basal_rate: f64,
    pub target_range: &'a DailySchedule<TargetRange>,
    pub sensitivity: &'a DailySchedule<f64>,
    pub basal_schedule: &'a DailySchedule<f64>,
}

/// The complete input set for a bolus recommendation.
#[derive(Debug, Clone, Copy)]
pub struct BolusSettings<'a> {
    pub max_bolus: f64,
    pub target_range: &'a DailySchedule<TargetRange>,
    pub sensitivity: &'a DailySchedule<f64>,
    pub basal_schedule: &'a DailySchedule<f64>,
}

impl TherapySettings {
    /// Temp-basal view, or `None` while any required field is absent.
    pub fn for_temp_basal(&self) -> Option<TempBasalSettings<'_>> {
        Some(TempBasalSettings {
            max_basal_rate: self.max_basal_rate?,
            target_range: self.target_range.as_ref()?,
            sensitivity: self.sensitivity.as_ref()?,
            basal_schedule: self.basal_schedule.as_ref()?,
        })
    }

    /// Bolus view, or `None` while any required field is absent.
    pub fn for_bolus(&self) -> Option<BolusSettings<'_>> {
        Some(BolusSettings {
            max_bolus: self.max_bolus?,
            target_range: self.target_range.as_ref()?,
            sensitivity: self.sensitivity.as_ref()?,
            basal_schedule: self.basal_schedule.as_ref()?,
        })
    }
}
