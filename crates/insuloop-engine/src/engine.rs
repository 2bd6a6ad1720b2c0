//! # Loop Engine
//!
//! The serialized decision pipeline and its event ingress.
//!
//! ## Serial access discipline
//! All engine state lives inside a single worker task that drains a
//! bounded command channel. Ingress signals, loop ticks, status reads,
//! carb entry, bolus enactment, and the dosing switch each arrive as one
//! command and run to completion before the next is taken, so at most one
//! logical step touches the state at a time. Collaborator I/O is awaited
//! inside the owning step; its results publish on the same step.
//!
//! ## Tick shape
//! refresh missing effects → validate recency → predict → recommend →
//! (dosing enabled) enact. Exactly one `DataUpdated` event per settled
//! tick; notification is suppressed during the pump's telemetry burst and
//! owned by the dosing gate in the dosing-enabled path.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use insuloop_core::{
    CarbEntry, GlucoseSample, LoopError, PredictedGlucose, TempBasal, TempBasalRecommendation,
    TherapySettings,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::decision_log::{DecisionLogger, DecisionRecord, EffectsLog, ErrorLog, RecommendationLog};
use crate::device::DeviceManager;
use crate::dosing;
use crate::events::{LoopEvent, LoopSignal};
use crate::freshness::{SENTRY_QUIET_WINDOW, input_is_fresh, recency_interval, retune_cooldown};
use crate::math::{DoseMath, PredictionMath, TempBasalInputs};
use crate::refresh::refresh_missing;
use crate::state::{EffectSlot, LoopState};
use crate::stores::{
    AnalyticsSink, CarbStore, DoseStore, GlucoseStore, KeyValueStore, SettingsProvider,
};

/// Key under which the dosing switch round-trips through the preference
/// store.
pub const DOSING_ENABLED_KEY: &str = "insuloop.dosingEnabled";

/// The loop always permits a below-range temp when the projection recovers
/// on its own.
pub const ALLOW_PREDICTIVE_TEMP_BELOW_RANGE: bool = true;

/// Everything the engine is wired to at start.
pub struct LoopServices {
    pub clock: Arc<dyn Clock>,
    pub glucose_store: Option<Arc<dyn GlucoseStore>>,
    pub carb_store: Option<Arc<dyn CarbStore>>,
    pub dose_store: Option<Arc<dyn DoseStore>>,
    pub settings: Arc<dyn SettingsProvider>,
    pub preferences: Arc<dyn KeyValueStore>,
    pub analytics: Arc<dyn AnalyticsSink>,
    /// Non-owning: the device manager outlives the engine by construction.
    pub devices: Weak<dyn DeviceManager>,
    pub prediction_math: Arc<dyn PredictionMath>,
    pub dose_math: Arc<dyn DoseMath>,
    pub decision_log: Option<DecisionLogger>,
}

/// Snapshot returned by `get_status`.
#[derive(Debug, Clone)]
pub struct LoopStatus {
    pub prediction: Option<Vec<PredictedGlucose>>,
    pub recommendation: Option<TempBasalRecommendation>,
    pub last_temp_basal: Option<TempBasal>,
    pub last_completed: Option<DateTime<Utc>>,
    /// Error from the status refresh itself, if the update failed.
    pub error: Option<LoopError>,
}

enum LoopCommand {
    Signal(LoopSignal),
    SentryElapsed,
    RunLoop,
    GetStatus(oneshot::Sender<LoopStatus>),
    AddCarbEntry(CarbEntry, oneshot::Sender<Result<f64, LoopError>>),
    EnactBolus(f64, oneshot::Sender<Result<(), LoopError>>),
    SetDosingEnabled(bool),
    Shutdown,
}

fn queue_closed() -> LoopError {
    LoopError::Connection("decision queue is closed".to_string())
}

/// Handle to a running decision engine.
///
/// `start` spawns the worker and ingress tasks; `stop` tears both down,
/// releasing the signal subscription and any pending sentry timer.
pub struct LoopEngine {
    cmd_tx: mpsc::Sender<LoopCommand>,
    events_tx: broadcast::Sender<LoopEvent>,
    worker: JoinHandle<()>,
    ingress: JoinHandle<()>,
}

impl LoopEngine {
    pub fn start(services: LoopServices, signals: broadcast::Receiver<LoopSignal>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(32);

        let dosing_enabled = services
            .preferences
            .bool_for_key(DOSING_ENABLED_KEY)
            .unwrap_or(false);

        let worker = LoopWorker {
            state: LoopState::new(),
            services,
            dosing_enabled,
            events_tx: events_tx.clone(),
            cmd_tx: cmd_tx.clone(),
            sentry_timer: None,
        };
        let worker_handle = tokio::spawn(worker.run(cmd_rx));
        let ingress = tokio::spawn(forward_signals(signals, cmd_tx.clone()));

        Self {
            cmd_tx,
            events_tx,
            worker: worker_handle,
            ingress,
        }
    }

    /// Observe `DataUpdated` / `Running` events.
    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.events_tx.subscribe()
    }

    /// Fire-and-forget decision tick.
    pub async fn run_loop(&self) {
        if self.cmd_tx.send(LoopCommand::RunLoop).await.is_err() {
            warn!("[ENGINE] run_loop dropped: decision queue closed");
        }
    }

    /// Refresh and read the loop's view of the world. Never enacts.
    pub async fn get_status(&self) -> Result<LoopStatus, LoopError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(LoopCommand::GetStatus(tx))
            .await
            .map_err(|_| queue_closed())?;
        rx.await.map_err(|_| queue_closed())
    }

    /// Record a carb entry and return the resulting bolus recommendation.
    pub async fn add_carb_entry(&self, entry: CarbEntry) -> Result<f64, LoopError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(LoopCommand::AddCarbEntry(entry, tx))
            .await
            .map_err(|_| queue_closed())?;
        rx.await.map_err(|_| queue_closed())?
    }

    /// Deliver a bolus through the dosing gate.
    pub async fn enact_bolus(&self, units: f64) -> Result<(), LoopError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(LoopCommand::EnactBolus(units, tx))
            .await
            .map_err(|_| queue_closed())?;
        rx.await.map_err(|_| queue_closed())?
    }

    /// Flip the dosing switch; persisted and announced.
    pub async fn set_dosing_enabled(&self, enabled: bool) {
        if self
            .cmd_tx
            .send(LoopCommand::SetDosingEnabled(enabled))
            .await
            .is_err()
        {
            warn!("[ENGINE] set_dosing_enabled dropped: decision queue closed");
        }
    }

    /// Tear down the worker, the ingress subscription, and any pending
    /// sentry timer.
    pub async fn stop(mut self) {
        self.ingress.abort();
        let _ = self.cmd_tx.send(LoopCommand::Shutdown).await;
        let _ = (&mut self.worker).await;
    }
}

impl Drop for LoopEngine {
    fn drop(&mut self) {
        self.ingress.abort();
        self.worker.abort();
    }
}

async fn forward_signals(
    mut signals: broadcast::Receiver<LoopSignal>,
    tx: mpsc::Sender<LoopCommand>,
) {
    loop {
        match signals.recv().await {
            Ok(signal) => {
                if tx.send(LoopCommand::Signal(signal)).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("[ENGINE] ingress lagged, skipped {} signals", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

// =============================================================================
// Worker — owns all engine state
// =============================================================================

struct LoopWorker {
    state: LoopState,
    services: LoopServices,
    dosing_enabled: bool,
    events_tx: broadcast::Sender<LoopEvent>,
    cmd_tx: mpsc::Sender<LoopCommand>,
    sentry_timer: Option<JoinHandle<()>>,
}

impl LoopWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<LoopCommand>) {
        info!(
            "[ENGINE] Decision worker started (dosing_enabled={})",
            self.dosing_enabled
        );
        while let Some(command) = rx.recv().await {
            match command {
                LoopCommand::Signal(signal) => self.handle_signal(signal).await,
                LoopCommand::SentryElapsed => self.sentry_elapsed().await,
                LoopCommand::RunLoop => self.run_loop().await,
                LoopCommand::GetStatus(reply) => {
                    let status = self.get_status().await;
                    let _ = reply.send(status);
                }
                LoopCommand::AddCarbEntry(entry, reply) => {
                    let result = self.add_carb_entry(entry).await;
                    let _ = reply.send(result);
                }
                LoopCommand::EnactBolus(units, reply) => {
                    let now = self.services.clock.now();
                    let result =
                        dosing::enact_bolus(&mut self.state, &self.services.devices, units, now)
                            .await;
                    let _ = reply.send(result);
                }
                LoopCommand::SetDosingEnabled(enabled) => self.set_dosing_enabled(enabled),
                LoopCommand::Shutdown => break,
            }
        }
        if let Some(timer) = self.sentry_timer.take() {
            timer.abort();
        }
        info!("[ENGINE] Decision worker stopped");
    }

    // -------------------------------------------------------------------------
    // Event ingress
    // -------------------------------------------------------------------------

    async fn handle_signal(&mut self, signal: LoopSignal) {
        let now = self.services.clock.now();
        match signal {
            LoopSignal::GlucoseUpdated => {
                self.state.set_effect(EffectSlot::Momentum, None, now);
                self.notify();
                self.maybe_retune(now);
            }
            LoopSignal::PumpStatusUpdated => {
                self.state.waiting_for_sentry = true;
                let _ = self.events_tx.send(LoopEvent::Running);
                self.schedule_sentry_run();
            }
            LoopSignal::CarbEntriesUpdated => {
                self.state.set_effect(EffectSlot::Carbs, None, now);
                self.notify();
            }
        }
    }

    /// Arm the post-sentry timer. A fresh frame supersedes any pending
    /// timer, so a telemetry burst settles into a single loop run after
    /// the last frame's quiet window.
    fn schedule_sentry_run(&mut self) {
        if let Some(previous) = self.sentry_timer.take() {
            previous.abort();
        }
        let tx = self.cmd_tx.clone();
        self.sentry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(SENTRY_QUIET_WINDOW).await;
            let _ = tx.send(LoopCommand::SentryElapsed).await;
        }));
    }

    async fn sentry_elapsed(&mut self) {
        self.sentry_timer = None;
        self.state.waiting_for_sentry = false;
        let now = self.services.clock.now();
        self.state.set_effect(EffectSlot::Insulin, None, now);
        self.run_loop().await;
    }

    /// Glucose arrived but pump telemetry has gone quiet: ask for a radio
    /// retune, at most once per cooldown.
    fn maybe_retune(&mut self, now: DateTime<Utc>) {
        let Some(manager) = self.services.devices.upgrade() else {
            return;
        };
        let Some(device) = manager.device() else {
            return;
        };
        let status_stale = device
            .status()
            .map(|s| now - s.clock_date > recency_interval())
            .unwrap_or(true);
        if !status_stale {
            return;
        }
        let tuned_recently = device
            .last_tuned()
            .map(|t| now - t <= recency_interval())
            .unwrap_or(false);
        if tuned_recently {
            return;
        }
        if let Some(attempted) = self.state.last_retune_attempt
            && now - attempted <= retune_cooldown()
        {
            return;
        }
        self.state.last_retune_attempt = Some(now);
        info!("[ENGINE] Pump status stale, requesting radio retune");
        tokio::spawn(async move {
            match device.tune().await {
                Ok(()) => info!("[ENGINE] Radio retune completed"),
                Err(error) => warn!("[ENGINE] Radio retune failed: {}", error),
            }
        });
    }

    /// One `DataUpdated` per settled tick; muted during the sentry burst.
    fn notify(&self) {
        if self.state.waiting_for_sentry {
            return;
        }
        let _ = self.events_tx.send(LoopEvent::DataUpdated);
    }

    // -------------------------------------------------------------------------
    // Decision pipeline
    // -------------------------------------------------------------------------

    async fn run_loop(&mut self) {
        self.state.last_error = None;
        if let Err(error) = self.update().await {
            self.record_error(error);
            self.notify();
            return;
        }

        if !self.dosing_enabled {
            let now = self.services.clock.now();
            self.record_completed(now);
            self.notify();
            return;
        }

        // Dosing path: the gate owns the terminal notification.
        let now = self.services.clock.now();
        match dosing::set_recommended_temp_basal(&mut self.state, &self.services.devices, now).await
        {
            Ok(()) => {
                let settled = self.services.clock.now();
                self.record_completed(settled);
            }
            Err(error) => self.record_error(error),
        }
        self.notify();
    }

    async fn get_status(&mut self) -> LoopStatus {
        let error = self.update().await.err();
        LoopStatus {
            prediction: self.state.prediction().cloned(),
            recommendation: self.state.recommendation().cloned(),
            last_temp_basal: self.state.last_temp_basal.clone(),
            last_completed: self.state.last_completed,
            error,
        }
    }

    async fn add_carb_entry(&mut self, entry: CarbEntry) -> Result<f64, LoopError> {
        let store = self
            .services
            .carb_store
            .clone()
            .ok_or_else(|| LoopError::MissingData("carb store not available".to_string()))?;
        store.add_carb_entry(entry).await?;

        let now = self.services.clock.now();
        self.state.set_effect(EffectSlot::Carbs, None, now);
        self.update().await?;

        let settings = self.services.settings.therapy_settings().await;
        dosing::recommend_bolus(
            &self.state,
            &settings,
            self.services.dose_math.as_ref(),
            self.services.clock.now(),
        )
    }

    fn set_dosing_enabled(&mut self, enabled: bool) {
        self.dosing_enabled = enabled;
        self.services.preferences.set_bool(DOSING_ENABLED_KEY, enabled);
        info!("[ENGINE] dosing_enabled set to {}", enabled);
        self.notify();
    }

    fn record_completed(&mut self, at: DateTime<Utc>) {
        self.state.last_completed = Some(at);
        self.services.analytics.loop_completed(at);
    }

    fn record_error(&mut self, error: LoopError) {
        warn!("[LOOP] cycle aborted: {}", error);
        self.services.analytics.loop_errored(&error);
        self.state.last_error = Some(error);
    }

    /// Refresh, then (re)build prediction and recommendation if needed.
    /// A cached prediction short-circuits; a failed rebuild leaves the
    /// prediction absent.
    async fn update(&mut self) -> Result<(), LoopError> {
        refresh_missing(
            &mut self.state,
            self.services.glucose_store.as_ref(),
            self.services.carb_store.as_ref(),
            self.services.dose_store.as_ref(),
            self.services.clock.as_ref(),
        )
        .await;

        if self.state.prediction().is_some() {
            return Ok(());
        }

        let result = self.predict_and_recommend().await;
        if result.is_err() {
            self.state.set_prediction(None);
        }
        result
    }

    async fn predict_and_recommend(&mut self) -> Result<(), LoopError> {
        let now = self.services.clock.now();
        // Settings snapshot for the whole step; mid-step edits wait for
        // the next tick.
        let settings = self.services.settings.therapy_settings().await;
        let latest = match &self.services.glucose_store {
            Some(store) => store.latest_glucose().await,
            None => None,
        };
        let pump_status_at = self.pump_status_date();

        let result = self.predict_inner(now, &settings, latest.as_ref(), pump_status_at);
        self.log_decision(now, latest, pump_status_at, result.as_ref().err());
        result
    }

    fn predict_inner(
        &mut self,
        now: DateTime<Utc>,
        settings: &TherapySettings,
        latest: Option<&GlucoseSample>,
        pump_status_at: Option<DateTime<Utc>>,
    ) -> Result<(), LoopError> {
        let glucose = latest.ok_or_else(|| {
            LoopError::MissingData("latest glucose sample not available".to_string())
        })?;
        let pump_at = pump_status_at
            .ok_or_else(|| LoopError::MissingData("pump status not available".to_string()))?;

        if !input_is_fresh(now, glucose.start_date) {
            return Err(LoopError::StaleData(format!(
                "glucose sample at {} exceeds the recency interval",
                glucose.start_date
            )));
        }
        if !input_is_fresh(now, pump_at) {
            return Err(LoopError::StaleData(format!(
                "pump status at {} exceeds the recency interval",
                pump_at
            )));
        }

        let (Some(momentum), Some(carbs), Some(insulin)) = (
            self.state.effect(EffectSlot::Momentum),
            self.state.effect(EffectSlot::Carbs),
            self.state.effect(EffectSlot::Insulin),
        ) else {
            return Err(LoopError::MissingData(
                "Cannot predict glucose due to missing effect data".to_string(),
            ));
        };

        let prediction = self
            .services
            .prediction_math
            .predict(glucose, momentum, carbs, insulin)?;
        self.state.set_prediction(Some(prediction));

        let dosing_settings = settings.for_temp_basal().ok_or_else(|| {
            LoopError::MissingData(
                "therapy settings incomplete for temp basal recommendation".to_string(),
            )
        })?;

        let proposal = self.services.dose_math.recommend_temp_basal(TempBasalInputs {
            prediction: self.state.prediction().map(Vec::as_slice).unwrap_or(&[]),
            last_temp_basal: self.state.last_temp_basal.as_ref(),
            max_basal_rate: dosing_settings.max_basal_rate,
            target_range: dosing_settings.target_range,
            sensitivity: dosing_settings.sensitivity,
            basal_schedule: dosing_settings.basal_schedule,
            allow_predictive_temp_below_range: ALLOW_PREDICTIVE_TEMP_BELOW_RANGE,
        })?;

        self.state
            .set_recommendation(proposal.map(|(rate, duration)| TempBasalRecommendation {
                rate_units_per_hour: rate,
                duration,
                issued_at: now,
            }));
        Ok(())
    }

    fn pump_status_date(&self) -> Option<DateTime<Utc>> {
        self.services
            .devices
            .upgrade()?
            .device()?
            .status()
            .map(|s| s.clock_date)
    }

    fn log_decision(
        &self,
        at: DateTime<Utc>,
        glucose: Option<GlucoseSample>,
        pump_status_at: Option<DateTime<Utc>>,
        error: Option<&LoopError>,
    ) {
        let Some(logger) = &self.services.decision_log else {
            return;
        };
        logger.log(DecisionRecord {
            at,
            glucose,
            pump_status_at,
            effects: EffectsLog {
                momentum_points: self.state.effect(EffectSlot::Momentum).map(|s| s.len()),
                carb_points: self.state.effect(EffectSlot::Carbs).map(|s| s.len()),
                insulin_points: self.state.effect(EffectSlot::Insulin).map(|s| s.len()),
            },
            error: error.map(|e| ErrorLog {
                code: e.code(),
                detail: e.to_string(),
            }),
            prediction: self.state.prediction().cloned(),
            recommendation: self.state.recommendation().map(|r| RecommendationLog {
                rate_units_per_hour: r.rate_units_per_hour,
                duration_minutes: r.duration.num_minutes(),
                issued_at: r.issued_at,
            }),
        });
    }
}
