//! Inbound and outbound loop signals.

/// External change signals the engine subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSignal {
    /// A new glucose sample landed in the glucose store.
    GlucoseUpdated,
    /// The pump broadcast a status frame.
    PumpStatusUpdated,
    /// Carb entries were added, edited, or deleted.
    CarbEntriesUpdated,
}

/// Events the engine broadcasts to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    /// A decision cycle settled (success or error). Exactly one per tick.
    DataUpdated,
    /// A cycle is about to start (emitted immediately on pump status,
    /// before the sentry quiet window elapses).
    Running,
}
