//! # Insuloop Engine
//!
//! The loop decision engine: a concurrent effect cache with causally
//! ordered invalidation, a serialized decision pipeline, and the freshness
//! and device gates that guard dosing.
//!
//! ## Architecture
//! - **State** (`state`): four cached slots (momentum, carbs, insulin,
//!   prediction) plus the recommendation, with the invalidation graph
//!   expressed as explicit transition functions.
//! - **Refresh** (`refresh`): parallel fan-out to the collaborator stores
//!   that repopulates missing effects.
//! - **Engine** (`engine`): a single-consumer command channel drained by one
//!   worker task; every read and write of engine state is one step on that
//!   queue. Ingress signals, loop ticks, status reads, carb entry, and
//!   dosing all funnel through it.
//! - **Dosing** (`dosing`): pre-enactment freshness/device gates and
//!   post-enactment state reconciliation.
//!
//! ## Hard rules
//! - If any effect is absent, the prediction is absent; if the prediction
//!   is absent, the recommendation is absent.
//! - Nothing is enacted on inputs older than the recency interval, nor on a
//!   recommendation at or past the freshness window.
//! - On any ambiguity the engine does nothing and records the error.

pub mod clock;
pub mod decision_log;
pub mod device;
pub mod dosing;
pub mod engine;
pub mod events;
pub mod freshness;
pub mod math;
pub mod refresh;
pub mod state;
pub mod stores;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision_log::{DecisionLogger, DecisionRecord};
pub use device::{DeviceManager, PumpDevice, PumpOps};
pub use engine::{LoopEngine, LoopServices, LoopStatus};
pub use events::{LoopEvent, LoopSignal};
pub use math::{DoseMath, PredictionMath};
pub use state::{EffectSlot, LoopState};
pub use stores::{AnalyticsSink, CarbStore, DoseStore, GlucoseStore, KeyValueStore, SettingsProvider};
