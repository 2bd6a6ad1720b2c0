//! Scenario configuration for simulation runs.

use serde::Deserialize;

/// Root scenario schema.
#[derive(Debug, Deserialize, Clone)]
pub struct Scenario {
    pub sim: SimInfo,
    pub glucose: GlucoseInfo,
    pub therapy: TherapyInfo,
    #[serde(default)]
    pub carbs: Vec<CarbInfo>,
}

/// Run shape: how many ticks, how far apart.
#[derive(Debug, Deserialize, Clone)]
pub struct SimInfo {
    pub ticks: u32,
    #[serde(default = "default_tick_minutes")]
    pub tick_minutes: i64,
    #[serde(default)]
    pub dosing_enabled: bool,
    pub decision_log_dir: Option<String>,
}

fn default_tick_minutes() -> i64 {
    5
}

/// Synthetic glucose trace: a line plus a sinusoidal meal-ish wobble.
#[derive(Debug, Deserialize, Clone)]
pub struct GlucoseInfo {
    pub start_mgdl: f64,
    #[serde(default)]
    pub slope_mgdl_per_min: f64,
    #[serde(default)]
    pub wobble_mgdl: f64,
}

/// Flat therapy settings for the run.
#[derive(Debug, Deserialize, Clone)]
pub struct TherapyInfo {
    pub max_basal_rate: f64,
    pub max_bolus: f64,
    pub target_min_mgdl: f64,
    pub target_max_mgdl: f64,
    pub sensitivity_mgdl_per_unit: f64,
    pub scheduled_basal_rate: f64,
}

/// A carb entry injected mid-run.
#[derive(Debug, Deserialize, Clone)]
pub struct CarbInfo {
    pub at_minute: i64,
    pub grams: f64,
}

impl Scenario {
    /// Load a scenario from a TOML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|_| anyhow::anyhow!("Could not find scenario file: {}", path))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("Failed to parse scenario: {}", e))
    }

    /// Built-in default used when no file is given.
    pub fn default_scenario() -> Self {
        Self {
            sim: SimInfo {
                ticks: 36,
                tick_minutes: 5,
                dosing_enabled: true,
                decision_log_dir: None,
            },
            glucose: GlucoseInfo {
                start_mgdl: 150.0,
                slope_mgdl_per_min: -0.2,
                wobble_mgdl: 12.0,
            },
            therapy: TherapyInfo {
                max_basal_rate: 3.0,
                max_bolus: 6.0,
                target_min_mgdl: 90.0,
                target_max_mgdl: 120.0,
                sensitivity_mgdl_per_unit: 45.0,
                scheduled_basal_rate: 0.8,
            },
            carbs: vec![CarbInfo {
                at_minute: 45,
                grams: 25.0,
            }],
        }
    }
}
