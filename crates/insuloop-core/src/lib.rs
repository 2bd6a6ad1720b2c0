//! # Insuloop Core
//!
//! Domain types shared across the insuloop closed-loop delivery system.
//!
//! This crate carries no engine logic: it defines the glucose / effect /
//! dose vocabulary, the time-of-day banded therapy schedules, the error
//! taxonomy, and the tracing bootstrap. The decision engine itself lives in
//! `insuloop-engine`.

pub mod error;
pub mod observability;
pub mod schedule;
pub mod settings;
pub mod types;

pub use error::LoopError;
pub use schedule::{DailySchedule, ScheduleBand, TargetRange};
pub use settings::{BolusSettings, TempBasalSettings, TherapySettings};
pub use types::{
    BolusRecord, CarbEntry, EffectPoint, EffectSeries, GlucoseSample, PredictedGlucose, PumpStatus,
    TempBasal, TempBasalAck, TempBasalRecommendation,
};
