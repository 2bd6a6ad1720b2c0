//! # Insuloop Sim
//!
//! Scenario-driven simulator for the loop decision engine: synthetic
//! glucose, in-memory stores, and a scripted pump, with the real engine
//! making every decision. Useful for eyeballing gate behavior and for
//! generating decision logs to analyze offline.

mod harness;
mod scenario;

use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, TimeZone, Utc};
use clap::Parser;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use insuloop_core::{
    DailySchedule, GlucoseSample, PumpStatus, TargetRange, TherapySettings,
};
use insuloop_engine::engine::DOSING_ENABLED_KEY;
use insuloop_engine::{
    Clock, DecisionLogger, DeviceManager, KeyValueStore, LoopEngine, LoopEvent, LoopServices,
    LoopSignal, ManualClock,
};

use harness::{
    FixedSettingsProvider, MemoryPreferences, SimCarbStore, SimDevice, SimDeviceManager,
    SimDoseMath, SimDoseStore, SimGlucoseStore, SimPredictionMath, SimPump,
};
use scenario::Scenario;

#[derive(Parser, Debug)]
#[command(name = "insuloop-sim")]
#[command(about = "Insuloop - closed-loop decision engine simulator")]
#[command(version)]
struct Cli {
    /// Path to a scenario TOML file; omit to run the built-in scenario
    #[arg(short, long)]
    scenario: Option<String>,

    /// Override the scenario's dosing switch
    #[arg(long)]
    dosing: Option<bool>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let telemetry = insuloop_core::observability::init("insuloop-sim");

    let mut scenario = match &cli.scenario {
        Some(path) => Scenario::load(path)?,
        None => Scenario::default_scenario(),
    };
    if let Some(dosing) = cli.dosing {
        scenario.sim.dosing_enabled = dosing;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    runtime.block_on(run(scenario, telemetry.run_id().to_string()))
}

fn therapy_settings(scenario: &Scenario) -> TherapySettings {
    TherapySettings {
        max_basal_rate: Some(scenario.therapy.max_basal_rate),
        max_bolus: Some(scenario.therapy.max_bolus),
        target_range: Some(DailySchedule::flat(TargetRange {
            min_mgdl: scenario.therapy.target_min_mgdl,
            max_mgdl: scenario.therapy.target_max_mgdl,
        })),
        sensitivity: Some(DailySchedule::flat(scenario.therapy.sensitivity_mgdl_per_unit)),
        basal_schedule: Some(DailySchedule::flat(scenario.therapy.scheduled_basal_rate)),
    }
}

async fn run(scenario: Scenario, run_id: String) -> anyhow::Result<()> {
    let start = Utc.with_ymd_and_hms(2026, 3, 14, 6, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));

    // Shared dose ledger: the pump writes, the dose store reads.
    let doses = Arc::new(Mutex::new(Vec::new()));
    let commands = Arc::new(Mutex::new(Vec::new()));

    let clock_for_pump = clock.clone();
    let pump = Arc::new(SimPump::new(
        commands.clone(),
        doses.clone(),
        Arc::new(move || clock_for_pump.now()),
    ));
    let device = Arc::new(SimDevice::new(pump.clone()));
    let manager: Arc<dyn DeviceManager> = Arc::new(SimDeviceManager::new(device));

    let glucose_store = Arc::new(SimGlucoseStore::new());
    let carb_store = Arc::new(SimCarbStore::new(3.5));
    let dose_store = Arc::new(SimDoseStore::new(
        doses.clone(),
        scenario.therapy.sensitivity_mgdl_per_unit,
    ));

    let preferences = Arc::new(MemoryPreferences::default());
    preferences.set_bool(DOSING_ENABLED_KEY, scenario.sim.dosing_enabled);

    // Same run_id as the tracing file, so decisions and log lines join.
    let decision_log = match &scenario.sim.decision_log_dir {
        Some(dir) => Some(DecisionLogger::new(dir.into(), &run_id, 1024)?),
        None => None,
    };

    let (signals_tx, _) = broadcast::channel(16);
    let services = LoopServices {
        clock: clock.clone(),
        glucose_store: Some(glucose_store.clone()),
        carb_store: Some(carb_store.clone()),
        dose_store: Some(dose_store.clone()),
        settings: Arc::new(FixedSettingsProvider(therapy_settings(&scenario))),
        preferences,
        analytics: Arc::new(insuloop_engine::stores::TracingAnalytics),
        devices: Arc::downgrade(&manager),
        prediction_math: Arc::new(SimPredictionMath),
        dose_math: Arc::new(SimDoseMath),
        decision_log,
    };
    let engine = LoopEngine::start(services, signals_tx.subscribe());
    let mut events = engine.subscribe();

    info!(
        ticks = scenario.sim.ticks,
        dosing = scenario.sim.dosing_enabled,
        "[SIM] starting run"
    );
    println!(
        "{:>6} {:>9} {:>10} {:>12}  {}",
        "minute", "glucose", "eventual", "last temp", "note"
    );

    let mut pending_carbs = scenario.carbs.clone();
    for tick in 0..scenario.sim.ticks {
        let minute = tick as i64 * scenario.sim.tick_minutes;
        let now = clock.now();

        let value = glucose_trace(&scenario, minute);
        glucose_store.push_sample(
            GlucoseSample::new(now, value, "sim-cgm"),
            scenario.glucose.slope_mgdl_per_min,
        );
        pump.broadcast_status(PumpStatus {
            clock_date: now,
            time_remaining: Duration::zero(),
        });

        // New sample invalidates momentum, exactly as live ingress would.
        signals_tx
            .send(LoopSignal::GlucoseUpdated)
            .context("engine ingress gone")?;
        wait_for(&mut events, LoopEvent::DataUpdated).await?;

        let mut note = String::new();
        let (due, rest): (Vec<_>, Vec<_>) = pending_carbs
            .into_iter()
            .partition(|carb| carb.at_minute <= minute);
        pending_carbs = rest;
        for carb in due {
            note = format!("carbs {:.0} g", carb.grams);
            let units = engine
                .add_carb_entry(insuloop_core::CarbEntry {
                    start_date: now,
                    grams: carb.grams,
                    absorption: None,
                })
                .await;
            match units {
                Ok(units) if units > 0.0 => {
                    engine.enact_bolus(units).await.ok();
                    note.push_str(&format!(", bolus {units:.2} U"));
                }
                Ok(_) => {}
                Err(e) => note.push_str(&format!(", bolus refused: {e}")),
            }
        }

        engine.run_loop().await;
        wait_for(&mut events, LoopEvent::DataUpdated).await?;

        let status = engine
            .get_status()
            .await
            .map_err(|e| anyhow::anyhow!("status read failed: {e}"))?;
        let eventual = status
            .prediction
            .as_ref()
            .and_then(|p| p.last())
            .map(|p| format!("{:.0}", p.value_mgdl))
            .unwrap_or_else(|| "-".to_string());
        let last_temp = status
            .last_temp_basal
            .as_ref()
            .map(|t| format!("{:.2} U/h", t.rate_units_per_hour))
            .unwrap_or_else(|| "-".to_string());
        if let Some(error) = &status.error {
            note = format!("{note} [{error}]");
        }
        println!(
            "{:>6} {:>9.0} {:>10} {:>12}  {}",
            minute, value, eventual, last_temp, note
        );

        clock.advance(Duration::minutes(scenario.sim.tick_minutes));
    }

    engine.stop().await;

    println!("\npump command log:");
    for command in commands.lock().iter() {
        println!("  {}", command);
    }
    let total_units: f64 = doses.lock().iter().map(|d| d.units).sum();
    println!("total insulin booked: {:.2} U", total_units);
    Ok(())
}

fn glucose_trace(scenario: &Scenario, minute: i64) -> f64 {
    let base = scenario.glucose.start_mgdl + scenario.glucose.slope_mgdl_per_min * minute as f64;
    let wobble =
        scenario.glucose.wobble_mgdl * (minute as f64 / 60.0 * std::f64::consts::PI).sin();
    (base + wobble).max(40.0)
}

async fn wait_for(
    events: &mut broadcast::Receiver<LoopEvent>,
    want: LoopEvent,
) -> anyhow::Result<()> {
    loop {
        let got = tokio::time::timeout(std::time::Duration::from_secs(30), events.recv())
            .await
            .context("timed out waiting for loop event")??;
        if got == want {
            return Ok(());
        }
    }
}
