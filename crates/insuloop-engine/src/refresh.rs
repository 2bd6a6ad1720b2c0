//! # Refresh Coordinator
//!
//! Repopulates whichever effect slots are missing by fanning out to the
//! collaborator stores in parallel and joining before returning. A
//! per-effect failure nulls that slot and is logged; it never aborts the
//! sibling requests. The decision pipeline decides afterwards whether the
//! surviving slots are enough to predict.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use insuloop_core::{EffectSeries, LoopError};
use tracing::warn;

use crate::clock::Clock;
use crate::state::{EffectSlot, LoopState};
use crate::stores::{CarbStore, DoseStore, GlucoseStore};

/// Fill every missing effect slot. Requests are anchored at the latest
/// glucose sample's start date and run concurrently; the call returns
/// once all of them have settled.
pub async fn refresh_missing(
    state: &mut LoopState,
    glucose_store: Option<&Arc<dyn GlucoseStore>>,
    carb_store: Option<&Arc<dyn CarbStore>>,
    dose_store: Option<&Arc<dyn DoseStore>>,
    clock: &dyn Clock,
) {
    let missing = state.missing_effects();
    if missing.is_empty() {
        return;
    }

    let anchor = match glucose_store {
        Some(store) => store.latest_glucose().await.map(|s| s.start_date),
        None => None,
    };

    let momentum = async {
        if !missing.contains(&EffectSlot::Momentum) {
            return None;
        }
        Some(match glucose_store {
            Some(store) => store.momentum_effect().await,
            None => Err(LoopError::MissingData(
                "glucose store not available".to_string(),
            )),
        })
    };

    let carbs = async {
        if !missing.contains(&EffectSlot::Carbs) {
            return None;
        }
        Some(match (carb_store, anchor) {
            (None, _) => Err(LoopError::MissingData("carb store not available".to_string())),
            (_, None) => Err(LoopError::MissingData(
                "latest glucose sample not available".to_string(),
            )),
            (Some(store), Some(anchor)) => store.glucose_effects(anchor).await,
        })
    };

    let insulin = async {
        if !missing.contains(&EffectSlot::Insulin) {
            return None;
        }
        Some(match (dose_store, anchor) {
            (None, _) => Err(LoopError::MissingData("dose store not available".to_string())),
            (_, None) => Err(LoopError::MissingData(
                "latest glucose sample not available".to_string(),
            )),
            (Some(store), Some(anchor)) => store.glucose_effects(anchor).await,
        })
    };

    let (momentum, carbs, insulin) = tokio::join!(momentum, carbs, insulin);

    // Results land back on the decision step that launched them.
    let now = clock.now();
    apply(state, EffectSlot::Momentum, momentum, now);
    apply(state, EffectSlot::Carbs, carbs, now);
    apply(state, EffectSlot::Insulin, insulin, now);
}

fn apply(
    state: &mut LoopState,
    slot: EffectSlot,
    outcome: Option<Result<EffectSeries, LoopError>>,
    now: DateTime<Utc>,
) {
    match outcome {
        None => {}
        Some(Ok(series)) => state.set_effect(slot, Some(series), now),
        Some(Err(error)) => {
            warn!("[REFRESH] {} effect refresh failed: {}", slot.name(), error);
            state.set_effect(slot, None, now);
        }
    }
}
