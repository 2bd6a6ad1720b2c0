//! # Loop State & Invalidation Graph
//!
//! The cached slots the engine carries between ticks, with the causal
//! invalidation rules expressed as explicit transition functions. Every
//! mutation path funnels through `set_effect` / `set_prediction` /
//! `set_recommendation`; nothing else may assign the cached slots.
//!
//! ## Invalidation rules
//! - Assigning any of momentum/carbs/insulin (to a value or to `None`)
//!   clears the prediction.
//! - Assigning the prediction clears the recommendation.
//! - Assigning insulin additionally expires a pending bolus that has aged
//!   past retention.
//!
//! All three propagations happen inside the same call, so they are atomic
//! with the triggering write under the serial queue discipline.

use chrono::{DateTime, Utc};
use insuloop_core::{
    BolusRecord, EffectSeries, LoopError, PredictedGlucose, TempBasal, TempBasalRecommendation,
};

use crate::freshness::bolus_is_expired;

/// The three independently invalidatable effect slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectSlot {
    Momentum,
    Carbs,
    Insulin,
}

impl EffectSlot {
    pub const ALL: [EffectSlot; 3] = [EffectSlot::Momentum, EffectSlot::Carbs, EffectSlot::Insulin];

    pub fn name(&self) -> &'static str {
        match self {
            EffectSlot::Momentum => "momentum",
            EffectSlot::Carbs => "carbs",
            EffectSlot::Insulin => "insulin",
        }
    }
}

/// Everything the engine remembers between ticks. Reconstructable from the
/// collaborator stores; never persisted.
#[derive(Debug, Default)]
pub struct LoopState {
    momentum: Option<EffectSeries>,
    carbs: Option<EffectSeries>,
    insulin: Option<EffectSeries>,
    prediction: Option<Vec<PredictedGlucose>>,
    recommendation: Option<TempBasalRecommendation>,

    /// Most recently enacted temp basal, fed back into the dose math.
    pub last_temp_basal: Option<TempBasal>,
    /// Bolus awaiting reflection in the insulin effect.
    pub last_bolus: Option<BolusRecord>,
    /// Timestamp of the most recent full decision cycle.
    pub last_completed: Option<DateTime<Utc>>,
    /// Error that aborted the most recent cycle, if any.
    pub last_error: Option<LoopError>,
    /// Set between a pump status frame and the post-quiet-window run;
    /// suppresses observer notification while true.
    pub waiting_for_sentry: bool,
    /// Last time a radio retune was requested (attempt cooldown).
    pub last_retune_attempt: Option<DateTime<Utc>>,
}

impl LoopState {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Transition functions (the invalidation graph)
    // -------------------------------------------------------------------------

    /// Assign an effect slot. Clears the prediction (and therefore the
    /// recommendation); an insulin assignment also expires an aged pending
    /// bolus.
    pub fn set_effect(&mut self, slot: EffectSlot, value: Option<EffectSeries>, now: DateTime<Utc>) {
        match slot {
            EffectSlot::Momentum => self.momentum = value,
            EffectSlot::Carbs => self.carbs = value,
            EffectSlot::Insulin => {
                self.insulin = value;
                if let Some(bolus) = self.last_bolus
                    && bolus_is_expired(now, bolus.enacted_at)
                {
                    self.last_bolus = None;
                }
            }
        }
        self.set_prediction(None);
    }

    /// Assign the prediction. Clears the recommendation.
    pub fn set_prediction(&mut self, value: Option<Vec<PredictedGlucose>>) {
        self.prediction = value;
        self.recommendation = None;
    }

    /// Assign the recommendation. Terminal node of the graph.
    pub fn set_recommendation(&mut self, value: Option<TempBasalRecommendation>) {
        self.recommendation = value;
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn effect(&self, slot: EffectSlot) -> Option<&EffectSeries> {
        match slot {
            EffectSlot::Momentum => self.momentum.as_ref(),
            EffectSlot::Carbs => self.carbs.as_ref(),
            EffectSlot::Insulin => self.insulin.as_ref(),
        }
    }

    /// Slots the refresh coordinator still needs to fill.
    pub fn missing_effects(&self) -> Vec<EffectSlot> {
        EffectSlot::ALL
            .into_iter()
            .filter(|slot| self.effect(*slot).is_none())
            .collect()
    }

    pub fn effects_complete(&self) -> bool {
        self.missing_effects().is_empty()
    }

    pub fn prediction(&self) -> Option<&Vec<PredictedGlucose>> {
        self.prediction.as_ref()
    }

    pub fn recommendation(&self) -> Option<&TempBasalRecommendation> {
        self.recommendation.as_ref()
    }
}
