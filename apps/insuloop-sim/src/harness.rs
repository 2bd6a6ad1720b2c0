//! In-memory collaborators backing a simulation run.
//!
//! These stand in for the real glucose/carb/dose stores, the pump stack,
//! and the math kernels. They are deliberately simple models: linear
//! momentum, linear carb absorption, exponential-ish insulin decay. The
//! engine under test treats them exactly like production services.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use insuloop_core::{
    CarbEntry, EffectPoint, EffectSeries, GlucoseSample, LoopError, PredictedGlucose, PumpStatus,
    TargetRange, TempBasalAck, TherapySettings,
};
use insuloop_engine::math::{BolusInputs, TempBasalInputs};
use insuloop_engine::{
    CarbStore, DeviceManager, DoseMath, DoseStore, GlucoseStore, KeyValueStore, PredictionMath,
    PumpDevice, PumpOps, SettingsProvider,
};

const EFFECT_STEP_MINUTES: i64 = 5;

// =============================================================================
// Glucose store
// =============================================================================

pub struct SimGlucoseStore {
    sample: Mutex<Option<GlucoseSample>>,
    slope_mgdl_per_min: Mutex<f64>,
}

impl SimGlucoseStore {
    pub fn new() -> Self {
        Self {
            sample: Mutex::new(None),
            slope_mgdl_per_min: Mutex::new(0.0),
        }
    }

    /// Feed the next sensor reading; the momentum kernel extrapolates the
    /// provided slope.
    pub fn push_sample(&self, sample: GlucoseSample, slope_mgdl_per_min: f64) {
        *self.sample.lock() = Some(sample);
        *self.slope_mgdl_per_min.lock() = slope_mgdl_per_min;
    }
}

#[async_trait]
impl GlucoseStore for SimGlucoseStore {
    async fn latest_glucose(&self) -> Option<GlucoseSample> {
        self.sample.lock().clone()
    }

    async fn momentum_effect(&self) -> Result<EffectSeries, LoopError> {
        let sample = self
            .sample
            .lock()
            .clone()
            .ok_or_else(|| LoopError::MissingData("no glucose history".to_string()))?;
        let slope = *self.slope_mgdl_per_min.lock();
        // Momentum blends to zero across a 20-minute horizon.
        let points = (1..=4)
            .map(|i| {
                let fade = 1.0 - (i as f64 - 1.0) / 4.0;
                EffectPoint {
                    start_date: sample.start_date
                        + Duration::minutes(EFFECT_STEP_MINUTES * i as i64),
                    delta_mgdl: slope * EFFECT_STEP_MINUTES as f64 * fade,
                }
            })
            .collect();
        Ok(EffectSeries::new(points))
    }
}

// =============================================================================
// Carb store
// =============================================================================

pub struct SimCarbStore {
    entries: Mutex<Vec<CarbEntry>>,
    carb_ratio_mgdl_per_gram: f64,
}

impl SimCarbStore {
    pub fn new(carb_ratio_mgdl_per_gram: f64) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            carb_ratio_mgdl_per_gram,
        }
    }
}

#[async_trait]
impl CarbStore for SimCarbStore {
    async fn glucose_effects(&self, start: DateTime<Utc>) -> Result<EffectSeries, LoopError> {
        let entries = self.entries.lock();
        let mut points = Vec::new();
        for entry in entries.iter() {
            let absorption = entry.absorption.unwrap_or_else(|| Duration::hours(3));
            let end = entry.start_date + absorption;
            if end <= start {
                continue;
            }
            let steps = (absorption.num_minutes() / EFFECT_STEP_MINUTES).max(1);
            let rise_per_step = entry.grams * self.carb_ratio_mgdl_per_gram / steps as f64;
            for i in 1..=steps {
                let at = entry.start_date + Duration::minutes(EFFECT_STEP_MINUTES * i);
                if at > start && at <= end {
                    points.push(EffectPoint {
                        start_date: at,
                        delta_mgdl: rise_per_step,
                    });
                }
            }
        }
        Ok(EffectSeries::new(points))
    }

    async fn add_carb_entry(&self, entry: CarbEntry) -> Result<CarbEntry, LoopError> {
        self.entries.lock().push(entry.clone());
        Ok(entry)
    }
}

// =============================================================================
// Dose store — fed by the pump tape so enacted insulin suppresses later
// projections
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct SimDose {
    pub at: DateTime<Utc>,
    pub units: f64,
}

pub struct SimDoseStore {
    doses: Arc<Mutex<Vec<SimDose>>>,
    sensitivity_mgdl_per_unit: f64,
}

impl SimDoseStore {
    pub fn new(doses: Arc<Mutex<Vec<SimDose>>>, sensitivity_mgdl_per_unit: f64) -> Self {
        Self {
            doses,
            sensitivity_mgdl_per_unit,
        }
    }
}

#[async_trait]
impl DoseStore for SimDoseStore {
    async fn glucose_effects(&self, start: DateTime<Utc>) -> Result<EffectSeries, LoopError> {
        let doses = self.doses.lock();
        let mut points = Vec::new();
        for dose in doses.iter() {
            // Four hours of activity, linear decay.
            let steps = 4 * 60 / EFFECT_STEP_MINUTES;
            let drop_per_step = dose.units * self.sensitivity_mgdl_per_unit / steps as f64;
            for i in 1..=steps {
                let at = dose.at + Duration::minutes(EFFECT_STEP_MINUTES * i);
                if at > start {
                    points.push(EffectPoint {
                        start_date: at,
                        delta_mgdl: -drop_per_step,
                    });
                }
            }
        }
        Ok(EffectSeries::new(points))
    }
}

// =============================================================================
// Pump
// =============================================================================

pub struct SimPump {
    status: Mutex<Option<PumpStatus>>,
    commands: Arc<Mutex<Vec<String>>>,
    doses: Arc<Mutex<Vec<SimDose>>>,
    clock_now: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl SimPump {
    pub fn new(
        commands: Arc<Mutex<Vec<String>>>,
        doses: Arc<Mutex<Vec<SimDose>>>,
        clock_now: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self {
        Self {
            status: Mutex::new(None),
            commands,
            doses,
            clock_now,
        }
    }

    pub fn broadcast_status(&self, status: PumpStatus) {
        *self.status.lock() = Some(status);
    }
}

#[async_trait]
impl PumpOps for SimPump {
    async fn set_temp_basal(
        &self,
        rate_units_per_hour: f64,
        duration: Duration,
    ) -> Result<TempBasalAck, LoopError> {
        let now = (self.clock_now)();
        self.commands.lock().push(format!(
            "temp_basal rate={:.2} U/h duration={} min",
            rate_units_per_hour,
            duration.num_minutes()
        ));
        // Book the temp's insulin over its duration as a lump dose.
        let units = rate_units_per_hour * duration.num_minutes() as f64 / 60.0;
        self.doses.lock().push(SimDose { at: now, units });
        Ok(TempBasalAck {
            rate_units_per_hour,
            time_remaining: duration,
        })
    }

    async fn set_normal_bolus(&self, units: f64) -> Result<(), LoopError> {
        let now = (self.clock_now)();
        self.commands.lock().push(format!("bolus {:.2} U", units));
        self.doses.lock().push(SimDose { at: now, units });
        Ok(())
    }
}

pub struct SimDevice {
    pump: Arc<SimPump>,
}

impl SimDevice {
    pub fn new(pump: Arc<SimPump>) -> Self {
        Self { pump }
    }
}

#[async_trait]
impl PumpDevice for SimDevice {
    fn ops(&self) -> Option<Arc<dyn PumpOps>> {
        Some(self.pump.clone())
    }

    fn status(&self) -> Option<PumpStatus> {
        *self.pump.status.lock()
    }

    fn last_tuned(&self) -> Option<DateTime<Utc>> {
        None
    }

    async fn tune(&self) -> Result<(), LoopError> {
        Ok(())
    }
}

pub struct SimDeviceManager {
    device: Arc<dyn PumpDevice>,
}

impl SimDeviceManager {
    pub fn new(device: Arc<dyn PumpDevice>) -> Self {
        Self { device }
    }
}

impl DeviceManager for SimDeviceManager {
    fn device(&self) -> Option<Arc<dyn PumpDevice>> {
        Some(self.device.clone())
    }
}

// =============================================================================
// Settings, preferences
// =============================================================================

pub struct FixedSettingsProvider(pub TherapySettings);

#[async_trait]
impl SettingsProvider for FixedSettingsProvider {
    async fn therapy_settings(&self) -> TherapySettings {
        self.0.clone()
    }
}

#[derive(Default)]
pub struct MemoryPreferences {
    map: Mutex<HashMap<String, bool>>,
}

impl KeyValueStore for MemoryPreferences {
    fn bool_for_key(&self, key: &str) -> Option<bool> {
        self.map.lock().get(key).copied()
    }

    fn set_bool(&self, key: &str, value: bool) {
        self.map.lock().insert(key.to_string(), value);
    }
}

// =============================================================================
// Math kernels
// =============================================================================

/// Reference prediction: cumulative effect deltas on top of the latest
/// sample, first point pinned to the sample's timestamp.
pub struct SimPredictionMath;

impl PredictionMath for SimPredictionMath {
    fn predict(
        &self,
        latest_glucose: &GlucoseSample,
        momentum: &EffectSeries,
        carbs: &EffectSeries,
        insulin: &EffectSeries,
    ) -> Result<Vec<PredictedGlucose>, LoopError> {
        let mut deltas: Vec<EffectPoint> = momentum
            .points()
            .iter()
            .chain(carbs.points())
            .chain(insulin.points())
            .copied()
            .filter(|p| p.start_date > latest_glucose.start_date)
            .collect();
        deltas.sort_by_key(|p| p.start_date);

        let mut value = latest_glucose.quantity_mgdl;
        let mut out = vec![PredictedGlucose {
            start_date: latest_glucose.start_date,
            value_mgdl: value,
        }];
        for point in deltas {
            value += point.delta_mgdl;
            match out.last_mut() {
                Some(last) if last.start_date == point.start_date => last.value_mgdl = value,
                _ => out.push(PredictedGlucose {
                    start_date: point.start_date,
                    value_mgdl: value,
                }),
            }
        }
        Ok(out)
    }
}

/// Reference dose math: proportional correction against the eventual
/// projected glucose.
pub struct SimDoseMath;

impl SimDoseMath {
    fn eventual(prediction: &[PredictedGlucose]) -> Option<&PredictedGlucose> {
        prediction.last()
    }
}

impl DoseMath for SimDoseMath {
    fn recommend_temp_basal(
        &self,
        inputs: TempBasalInputs<'_>,
    ) -> Result<Option<(f64, Duration)>, LoopError> {
        let Some(eventual) = Self::eventual(inputs.prediction) else {
            return Ok(None);
        };
        let range: &TargetRange = inputs.target_range.value_at(eventual.start_date);
        let sensitivity = *inputs.sensitivity.value_at(eventual.start_date);
        let scheduled = *inputs.basal_schedule.value_at(eventual.start_date);

        let lowest = inputs
            .prediction
            .iter()
            .map(|p| p.value_mgdl)
            .fold(f64::INFINITY, f64::min);

        // A dip below range only suspends when the projection does not
        // recover on its own.
        if lowest < range.min_mgdl
            && !(inputs.allow_predictive_temp_below_range && eventual.value_mgdl >= range.min_mgdl)
        {
            return Ok(Some((0.0, Duration::minutes(30))));
        }

        let excess = eventual.value_mgdl - range.midpoint();
        if excess <= 0.0 {
            return Ok(None);
        }
        // Deliver the correction over the next half hour.
        let correction_units = excess / sensitivity;
        let rate = (scheduled + correction_units * 2.0).clamp(0.0, inputs.max_basal_rate);
        if (rate - scheduled).abs() < 0.05 {
            return Ok(None);
        }
        Ok(Some((rate, Duration::minutes(30))))
    }

    fn recommend_bolus(&self, inputs: BolusInputs<'_>) -> Result<f64, LoopError> {
        let Some(eventual) = Self::eventual(inputs.prediction) else {
            return Ok(0.0);
        };
        let range: &TargetRange = inputs.target_range.value_at(eventual.start_date);
        let sensitivity = *inputs.sensitivity.value_at(eventual.start_date);
        let excess = eventual.value_mgdl - range.midpoint();
        if excess <= 0.0 {
            return Ok(0.0);
        }
        Ok((excess / sensitivity).clamp(0.0, inputs.max_bolus))
    }
}
