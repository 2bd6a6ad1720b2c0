//! External math kernels.
//!
//! The prediction and dose-recommendation math live outside the engine;
//! these seams carry exactly the inputs the decision pipeline assembles.
//! Kernel contract: the returned prediction's first point carries the
//! latest glucose sample's timestamp.

use chrono::Duration;
use insuloop_core::{
    DailySchedule, EffectSeries, GlucoseSample, LoopError, PredictedGlucose, TargetRange, TempBasal,
};

/// Sums the three effect series onto the latest glucose sample.
pub trait PredictionMath: Send + Sync {
    fn predict(
        &self,
        latest_glucose: &GlucoseSample,
        momentum: &EffectSeries,
        carbs: &EffectSeries,
        insulin: &EffectSeries,
    ) -> Result<Vec<PredictedGlucose>, LoopError>;
}

/// Inputs to a temp-basal recommendation, snapshotted for one decision.
pub struct TempBasalInputs<'a> {
    pub prediction: &'a [PredictedGlucose],
    pub last_temp_basal: Option<&'a TempBasal>,
    pub max_basal_rate: f64,
    pub target_range: &'a DailySchedule<TargetRange>,
    pub sensitivity: &'a DailySchedule<f64>,
    pub basal_schedule: &'a DailySchedule<f64>,
    /// Permit a below-range temp when the projection says glucose will
    /// rise back into range on its own.
    pub allow_predictive_temp_below_range: bool,
}

/// Inputs to a bolus recommendation.
pub struct BolusInputs<'a> {
    pub prediction: &'a [PredictedGlucose],
    pub max_bolus: f64,
    pub target_range: &'a DailySchedule<TargetRange>,
    pub sensitivity: &'a DailySchedule<f64>,
    pub basal_schedule: &'a DailySchedule<f64>,
}

/// Dose-recommendation math.
pub trait DoseMath: Send + Sync {
    /// A temp basal nudging the projection toward target, or `None` when
    /// the scheduled basal already suffices.
    fn recommend_temp_basal(
        &self,
        inputs: TempBasalInputs<'_>,
    ) -> Result<Option<(f64, Duration)>, LoopError>;

    /// Units of insulin to bring the projection to target. The caller
    /// subtracts any pending bolus.
    fn recommend_bolus(&self, inputs: BolusInputs<'_>) -> Result<f64, LoopError>;
}
