//! # Freshness Gates
//!
//! The loop's time-based safety constants and the comparisons built on
//! them. These substitute for explicit timeouts: stale work is discarded
//! here at the gate rather than cancelled midway.
//!
//! ## Boundary conventions (frozen)
//! - Inputs (glucose, pump status): fresh iff `age <= RECENCY`. A sample
//!   exactly 15:00.000 old is still fresh.
//! - Recommendations: enactable iff `age < FRESHNESS`, strict. A
//!   recommendation exactly 5:00.000 old is stale.
//! - Pending bolus: cleared on insulin reassignment iff `age >= RETENTION`.

use chrono::{DateTime, Duration, Utc};

/// Freshness window for glucose samples and pump status.
pub fn recency_interval() -> Duration {
    Duration::minutes(15)
}

/// Maximum age of a recommendation at enactment.
pub fn recommendation_freshness() -> Duration {
    Duration::minutes(5)
}

/// How long a dispatched bolus is retained for pending-bolus subtraction.
pub fn bolus_retention() -> Duration {
    Duration::minutes(5)
}

/// Minimum spacing between radio retune attempts.
pub fn retune_cooldown() -> Duration {
    recency_interval()
}

/// Quiet window after a pump status frame, sized to outlast the pump's
/// telemetry burst pattern (groups of 3 frames, 5 seconds apart).
pub const SENTRY_QUIET_WINDOW: std::time::Duration = std::time::Duration::from_secs(11);

/// Input freshness: age at or under the recency interval passes.
pub fn input_is_fresh(now: DateTime<Utc>, stamped: DateTime<Utc>) -> bool {
    now - stamped <= recency_interval()
}

/// Recommendation freshness: strictly younger than the window to enact.
pub fn recommendation_is_enactable(now: DateTime<Utc>, issued_at: DateTime<Utc>) -> bool {
    now - issued_at < recommendation_freshness()
}

/// Pending-bolus expiry: at or past retention clears the record.
pub fn bolus_is_expired(now: DateTime<Utc>, enacted_at: DateTime<Utc>) -> bool {
    now - enacted_at >= bolus_retention()
}
