//! # Dosing Gate
//!
//! Final pre-enactment checks and post-enactment reconciliation. Every
//! function here is one step on the decision queue; the device call in the
//! middle is the queue's only suspension point, so a decision can never
//! issue two commands concurrently.
//!
//! Gate order is frozen: freshness first, then device availability, then
//! dispatch. A stale recommendation is retained (not cleared) so status
//! readers can still see what the loop wanted to do.

use std::sync::Weak;

use chrono::{DateTime, Utc};
use insuloop_core::{LoopError, TempBasal, TherapySettings};
use tracing::info;

use crate::device::{DeviceManager, PumpOps};
use crate::freshness::{input_is_fresh, recommendation_is_enactable};
use crate::math::{BolusInputs, DoseMath};
use crate::state::LoopState;

/// Resolve the pump command session, or the error naming what is missing.
fn command_session(
    devices: &Weak<dyn DeviceManager>,
) -> Result<std::sync::Arc<dyn PumpOps>, LoopError> {
    let manager = devices
        .upgrade()
        .ok_or_else(|| LoopError::Connection("pump device manager is gone".to_string()))?;
    let device = manager
        .device()
        .ok_or_else(|| LoopError::Connection("no pump device connected".to_string()))?;
    device
        .ops()
        .ok_or_else(|| LoopError::Configuration("pump command session not configured".to_string()))
}

/// Enact the cached temp basal recommendation, if any.
///
/// Succeeds trivially with no recommendation. On acknowledgement the
/// enacted dose is reconstructed from the pump clock's time remaining, the
/// recommendation is consumed, and `last_temp_basal` feeds the next
/// decision.
pub async fn set_recommended_temp_basal(
    state: &mut LoopState,
    devices: &Weak<dyn DeviceManager>,
    now: DateTime<Utc>,
) -> Result<(), LoopError> {
    let Some(recommendation) = state.recommendation().cloned() else {
        return Ok(());
    };

    if !recommendation_is_enactable(now, recommendation.issued_at) {
        return Err(LoopError::StaleData(format!(
            "temp basal recommendation issued at {} is too old to enact",
            recommendation.issued_at
        )));
    }

    let ops = command_session(devices)?;
    let ack = ops
        .set_temp_basal(recommendation.rate_units_per_hour, recommendation.duration)
        .await?;

    let end_date = now + ack.time_remaining;
    let start_date = end_date - recommendation.duration;
    info!(
        rate = ack.rate_units_per_hour,
        duration_minutes = recommendation.duration.num_minutes(),
        "[DOSING] temp basal enacted"
    );
    state.last_temp_basal = Some(TempBasal {
        start_date,
        end_date,
        rate_units_per_hour: ack.rate_units_per_hour,
    });
    state.set_recommendation(None);
    Ok(())
}

/// Compute a bolus recommendation from the cached prediction, netting out
/// a pending bolus the insulin effect does not yet reflect.
pub fn recommend_bolus(
    state: &LoopState,
    settings: &TherapySettings,
    dose_math: &dyn DoseMath,
    now: DateTime<Utc>,
) -> Result<f64, LoopError> {
    let prediction = state.prediction().ok_or_else(|| {
        LoopError::MissingData("cannot recommend bolus without a glucose prediction".to_string())
    })?;
    let bolus_settings = settings.for_bolus().ok_or_else(|| {
        LoopError::MissingData("therapy settings incomplete for bolus recommendation".to_string())
    })?;
    let first = prediction.first().ok_or_else(|| {
        LoopError::MissingData("glucose prediction is empty".to_string())
    })?;
    if !input_is_fresh(now, first.start_date) {
        return Err(LoopError::StaleData(format!(
            "glucose prediction anchored at {} exceeds the recency interval",
            first.start_date
        )));
    }

    let units = dose_math.recommend_bolus(BolusInputs {
        prediction,
        max_bolus: bolus_settings.max_bolus,
        target_range: bolus_settings.target_range,
        sensitivity: bolus_settings.sensitivity,
        basal_schedule: bolus_settings.basal_schedule,
    })?;
    let pending = state.last_bolus.map(|b| b.units).unwrap_or(0.0);
    Ok((units - pending).max(0.0))
}

/// Deliver a bolus. Zero or negative units are a no-op; a successful
/// dispatch records the pending bolus for later netting.
pub async fn enact_bolus(
    state: &mut LoopState,
    devices: &Weak<dyn DeviceManager>,
    units: f64,
    now: DateTime<Utc>,
) -> Result<(), LoopError> {
    if units <= 0.0 {
        return Ok(());
    }

    let ops = command_session(devices)?;
    ops.set_normal_bolus(units).await.map_err(|e| match e {
        LoopError::Communication(_) => e,
        other => LoopError::Communication(other.to_string()),
    })?;

    info!(units, "[DOSING] bolus enacted");
    state.last_bolus = Some(insuloop_core::BolusRecord {
        units,
        enacted_at: now,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PumpDevice;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use insuloop_core::{
        BolusRecord, DailySchedule, PredictedGlucose, PumpStatus, TargetRange, TempBasalAck,
        TempBasalRecommendation,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
    }

    // -------------------------------------------------------------------------
    // Device doubles
    // -------------------------------------------------------------------------

    #[derive(Default)]
    struct CommandTape {
        temp_basals: Vec<(f64, i64)>,
        boluses: Vec<f64>,
    }

    struct FakeOps {
        tape: Arc<Mutex<CommandTape>>,
        fail: Option<LoopError>,
    }

    #[async_trait]
    impl PumpOps for FakeOps {
        async fn set_temp_basal(
            &self,
            rate_units_per_hour: f64,
            duration: Duration,
        ) -> Result<TempBasalAck, LoopError> {
            if let Some(error) = &self.fail {
                return Err(error.clone());
            }
            self.tape
                .lock()
                .temp_basals
                .push((rate_units_per_hour, duration.num_minutes()));
            Ok(TempBasalAck {
                rate_units_per_hour,
                time_remaining: duration,
            })
        }

        async fn set_normal_bolus(&self, units: f64) -> Result<(), LoopError> {
            if let Some(error) = &self.fail {
                return Err(error.clone());
            }
            self.tape.lock().boluses.push(units);
            Ok(())
        }
    }

    struct FakeDevice {
        ops: Option<Arc<dyn PumpOps>>,
    }

    #[async_trait]
    impl PumpDevice for FakeDevice {
        fn ops(&self) -> Option<Arc<dyn PumpOps>> {
            self.ops.clone()
        }

        fn status(&self) -> Option<PumpStatus> {
            None
        }

        fn last_tuned(&self) -> Option<DateTime<Utc>> {
            None
        }

        async fn tune(&self) -> Result<(), LoopError> {
            Ok(())
        }
    }

    struct FakeManager {
        device: Option<Arc<dyn PumpDevice>>,
    }

    impl DeviceManager for FakeManager {
        fn device(&self) -> Option<Arc<dyn PumpDevice>> {
            self.device.clone()
        }
    }

    fn manager_with_ops(
        fail: Option<LoopError>,
    ) -> (Arc<dyn DeviceManager>, Arc<Mutex<CommandTape>>) {
        let tape = Arc::new(Mutex::new(CommandTape::default()));
        let ops: Arc<dyn PumpOps> = Arc::new(FakeOps {
            tape: tape.clone(),
            fail,
        });
        let device: Arc<dyn PumpDevice> = Arc::new(FakeDevice { ops: Some(ops) });
        let manager: Arc<dyn DeviceManager> = Arc::new(FakeManager {
            device: Some(device),
        });
        (manager, tape)
    }

    fn state_with_recommendation(issued_at: DateTime<Utc>) -> LoopState {
        let mut state = LoopState::new();
        state.set_prediction(Some(vec![PredictedGlucose {
            start_date: t0(),
            value_mgdl: 160.0,
        }]));
        state.set_recommendation(Some(TempBasalRecommendation {
            rate_units_per_hour: 0.8,
            duration: Duration::minutes(30),
            issued_at,
        }));
        state
    }

    // -------------------------------------------------------------------------
    // Temp basal gate
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_no_recommendation_succeeds_without_device() {
        let mut state = LoopState::new();
        let devices: Weak<dyn DeviceManager> = Weak::<FakeManager>::new();
        assert!(
            set_recommended_temp_basal(&mut state, &devices, t0())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_stale_recommendation_refused_and_retained() {
        let (manager, tape) = manager_with_ops(None);
        let mut state = state_with_recommendation(t0());
        let devices = Arc::downgrade(&manager);

        // Exactly five minutes old: stale by the strict convention.
        let result =
            set_recommended_temp_basal(&mut state, &devices, t0() + Duration::minutes(5)).await;
        assert!(matches!(result, Err(LoopError::StaleData(_))));
        assert!(state.recommendation().is_some(), "recommendation retained");
        assert!(tape.lock().temp_basals.is_empty(), "no device call");
    }

    #[tokio::test]
    async fn test_enactment_reconciles_last_temp_basal() {
        let (manager, tape) = manager_with_ops(None);
        let mut state = state_with_recommendation(t0());
        let devices = Arc::downgrade(&manager);

        let now = t0() + Duration::minutes(1);
        set_recommended_temp_basal(&mut state, &devices, now)
            .await
            .unwrap();

        assert_eq!(tape.lock().temp_basals, vec![(0.8, 30)]);
        assert!(state.recommendation().is_none());
        let last = state.last_temp_basal.clone().unwrap();
        assert_eq!(last.rate_units_per_hour, 0.8);
        assert_eq!(last.end_date - last.start_date, Duration::minutes(30));
        assert_eq!(last.end_date, now + Duration::minutes(30));
    }

    #[tokio::test]
    async fn test_missing_device_and_session_map_to_error_kinds() {
        let mut state = state_with_recommendation(t0());

        let manager: Arc<dyn DeviceManager> = Arc::new(FakeManager { device: None });
        let result =
            set_recommended_temp_basal(&mut state, &Arc::downgrade(&manager), t0()).await;
        assert!(matches!(result, Err(LoopError::Connection(_))));

        let device: Arc<dyn PumpDevice> = Arc::new(FakeDevice { ops: None });
        let manager: Arc<dyn DeviceManager> = Arc::new(FakeManager {
            device: Some(device),
        });
        let result =
            set_recommended_temp_basal(&mut state, &Arc::downgrade(&manager), t0()).await;
        assert!(matches!(result, Err(LoopError::Configuration(_))));
        assert!(state.recommendation().is_some());
    }

    #[tokio::test]
    async fn test_device_failure_propagates_and_keeps_recommendation() {
        let (manager, _tape) =
            manager_with_ops(Some(LoopError::Communication("no ack".to_string())));
        let mut state = state_with_recommendation(t0());

        let result =
            set_recommended_temp_basal(&mut state, &Arc::downgrade(&manager), t0()).await;
        assert!(matches!(result, Err(LoopError::Communication(_))));
        assert!(state.recommendation().is_some());
        assert!(state.last_temp_basal.is_none());
    }

    // -------------------------------------------------------------------------
    // Bolus recommendation
    // -------------------------------------------------------------------------

    struct FixedBolusMath(f64);

    impl DoseMath for FixedBolusMath {
        fn recommend_temp_basal(
            &self,
            _inputs: crate::math::TempBasalInputs<'_>,
        ) -> Result<Option<(f64, Duration)>, LoopError> {
            Ok(None)
        }

        fn recommend_bolus(&self, _inputs: BolusInputs<'_>) -> Result<f64, LoopError> {
            Ok(self.0)
        }
    }

    fn bolus_settings() -> TherapySettings {
        TherapySettings {
            max_basal_rate: Some(3.0),
            max_bolus: Some(6.0),
            target_range: Some(DailySchedule::flat(TargetRange {
                min_mgdl: 90.0,
                max_mgdl: 120.0,
            })),
            sensitivity: Some(DailySchedule::flat(45.0)),
            basal_schedule: Some(DailySchedule::flat(0.8)),
        }
    }

    #[test]
    fn test_pending_bolus_is_subtracted_and_clamped() {
        let mut state = LoopState::new();
        state.set_prediction(Some(vec![PredictedGlucose {
            start_date: t0(),
            value_mgdl: 180.0,
        }]));
        state.last_bolus = Some(BolusRecord {
            units: 3.0,
            enacted_at: t0() - Duration::minutes(2),
        });

        let units =
            recommend_bolus(&state, &bolus_settings(), &FixedBolusMath(4.5), t0()).unwrap();
        assert!((units - 1.5).abs() < f64::EPSILON);

        let units =
            recommend_bolus(&state, &bolus_settings(), &FixedBolusMath(2.0), t0()).unwrap();
        assert_eq!(units, 0.0);
    }

    #[test]
    fn test_bolus_requires_prediction_and_settings() {
        let state = LoopState::new();
        let result = recommend_bolus(&state, &bolus_settings(), &FixedBolusMath(1.0), t0());
        assert!(matches!(result, Err(LoopError::MissingData(_))));

        let mut state = LoopState::new();
        state.set_prediction(Some(vec![PredictedGlucose {
            start_date: t0(),
            value_mgdl: 180.0,
        }]));
        let mut incomplete = bolus_settings();
        incomplete.max_bolus = None;
        let result = recommend_bolus(&state, &incomplete, &FixedBolusMath(1.0), t0());
        assert!(matches!(result, Err(LoopError::MissingData(_))));
    }

    #[test]
    fn test_bolus_rejects_stale_prediction() {
        let mut state = LoopState::new();
        state.set_prediction(Some(vec![PredictedGlucose {
            start_date: t0(),
            value_mgdl: 180.0,
        }]));
        let result = recommend_bolus(
            &state,
            &bolus_settings(),
            &FixedBolusMath(1.0),
            t0() + Duration::minutes(16),
        );
        assert!(matches!(result, Err(LoopError::StaleData(_))));
    }

    // -------------------------------------------------------------------------
    // Bolus enactment
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_zero_units_is_a_no_op() {
        let mut state = LoopState::new();
        let devices: Weak<dyn DeviceManager> = Weak::<FakeManager>::new();
        assert!(enact_bolus(&mut state, &devices, 0.0, t0()).await.is_ok());
        assert!(state.last_bolus.is_none());
    }

    #[tokio::test]
    async fn test_successful_bolus_records_pending() {
        let (manager, tape) = manager_with_ops(None);
        let mut state = LoopState::new();

        enact_bolus(&mut state, &Arc::downgrade(&manager), 2.5, t0())
            .await
            .unwrap();

        assert_eq!(tape.lock().boluses, vec![2.5]);
        assert_eq!(
            state.last_bolus,
            Some(BolusRecord {
                units: 2.5,
                enacted_at: t0()
            })
        );
    }

    #[tokio::test]
    async fn test_failed_bolus_surfaces_communication_error() {
        let (manager, _tape) =
            manager_with_ops(Some(LoopError::StaleData("pump clock drift".to_string())));
        let mut state = LoopState::new();

        let result = enact_bolus(&mut state, &Arc::downgrade(&manager), 2.5, t0()).await;
        assert!(matches!(result, Err(LoopError::Communication(_))));
        assert!(state.last_bolus.is_none());
    }
}
