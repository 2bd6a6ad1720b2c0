//! # Collaborator Store Interfaces
//!
//! The engine consumes glucose, carb, and dose data through these seams
//! and treats the implementations as thread-safe external services that
//! own their internal concurrency. Any store may be absent at wiring time
//! (onboarding, hardware not paired); the refresh coordinator converts an
//! absent store into `MissingData` rather than panicking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use insuloop_core::{CarbEntry, EffectSeries, GlucoseSample, LoopError, TherapySettings};

/// Glucose history and the momentum kernel built on it.
#[async_trait]
pub trait GlucoseStore: Send + Sync {
    /// Most recent sample, if any.
    async fn latest_glucose(&self) -> Option<GlucoseSample>;

    /// Short-horizon extrapolation of the recent glucose slope.
    async fn momentum_effect(&self) -> Result<EffectSeries, LoopError>;
}

/// Carbohydrate intake records and their modeled glucose effects.
#[async_trait]
pub trait CarbStore: Send + Sync {
    /// Modeled glucose rise from outstanding carb absorption, starting at
    /// or after `start`.
    async fn glucose_effects(&self, start: DateTime<Utc>) -> Result<EffectSeries, LoopError>;

    /// Persist a new entry; returns the stored form.
    async fn add_carb_entry(&self, entry: CarbEntry) -> Result<CarbEntry, LoopError>;
}

/// Insulin dose records and their modeled glucose effects.
#[async_trait]
pub trait DoseStore: Send + Sync {
    /// Modeled glucose suppression from outstanding insulin activity,
    /// starting at or after `start`.
    async fn glucose_effects(&self, start: DateTime<Utc>) -> Result<EffectSeries, LoopError>;
}

/// Source of the therapy settings snapshot. Read once per prediction step.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn therapy_settings(&self) -> TherapySettings;
}

/// Durable user preferences (currently just the dosing switch).
pub trait KeyValueStore: Send + Sync {
    fn bool_for_key(&self, key: &str) -> Option<bool>;
    fn set_bool(&self, key: &str, value: bool);
}

/// Receives loop lifecycle transitions for analytics and the
/// loop-not-running watchdog. Implementations re-arm the watchdog on every
/// completion.
pub trait AnalyticsSink: Send + Sync {
    fn loop_completed(&self, at: DateTime<Utc>);
    fn loop_errored(&self, error: &LoopError);
}

/// Default sink: structured log lines only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnalytics;

impl AnalyticsSink for TracingAnalytics {
    fn loop_completed(&self, at: DateTime<Utc>) {
        tracing::info!(completed_at = %at, "loop cycle completed");
    }

    fn loop_errored(&self, error: &LoopError) {
        tracing::warn!(code = error.code(), %error, "loop cycle errored");
    }
}
