//! # Pump Device Seam
//!
//! The pump radio is a process-wide exclusive resource; commands are
//! serialized by the decision worker, so implementations may assume at
//! most one outstanding command.
//!
//! The engine holds the device manager as a `Weak` handle: the manager
//! outlives the engine by construction, and the engine must never keep a
//! torn-down radio stack alive.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use insuloop_core::{LoopError, PumpStatus, TempBasalAck};

/// Owns the currently paired pump, if any.
pub trait DeviceManager: Send + Sync {
    /// The connected device, or `None` while unpaired / out of range.
    fn device(&self) -> Option<Arc<dyn PumpDevice>>;
}

/// One paired pump.
#[async_trait]
pub trait PumpDevice: Send + Sync {
    /// Command session for dosing, or `None` when the channel is not yet
    /// configured.
    fn ops(&self) -> Option<Arc<dyn PumpOps>>;

    /// Most recent telemetry frame.
    fn status(&self) -> Option<PumpStatus>;

    /// When the radio was last tuned to the pump's frequency.
    fn last_tuned(&self) -> Option<DateTime<Utc>>;

    /// Retune the radio. Slow; callers fire and forget.
    async fn tune(&self) -> Result<(), LoopError>;
}

/// The dosing command channel.
#[async_trait]
pub trait PumpOps: Send + Sync {
    /// Program a temporary basal; the ack echoes the programmed rate and
    /// the pump clock's view of time remaining.
    async fn set_temp_basal(
        &self,
        rate_units_per_hour: f64,
        duration: Duration,
    ) -> Result<TempBasalAck, LoopError>;

    /// Deliver a normal bolus.
    async fn set_normal_bolus(&self, units: f64) -> Result<(), LoopError>;
}
