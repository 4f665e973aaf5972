//! Events pushed to registered observers: state changes, per-line build
//! progress, and tool status from temperature polling.

use std::time::Duration;

use crate::{model::ToolModel, state::MachineState};

/// A machine state transition.
#[derive(Debug, Clone, Copy)]
pub struct StateChangeEvent {
    /// The state before the transition.
    pub previous: MachineState,
    /// The state after the transition.
    pub current: MachineState,
}

/// Build progress, emitted once per processed line.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    /// Wall-clock time since the build started.
    pub elapsed: Duration,
    /// Estimated total build time, zero when no estimate was made.
    pub estimated_total: Duration,
    /// Lines handed to the parser so far, warmup and cooldown included.
    pub lines_processed: usize,
    /// Total lines in the build, warmup and cooldown included.
    pub lines_total: usize,
}

/// Snapshot of the active tool after a temperature poll.
#[derive(Debug, Clone)]
pub struct ToolStatusEvent {
    /// The active tool.
    pub tool: ToolModel,
}

/// Observer of controller events.
///
/// Callbacks run synchronously on the worker task; keep them short and
/// hand anything slow to a channel. The emitter snapshots the listener
/// list before dispatch, so adding or removing listeners from inside a
/// callback affects the next event, not the current one.
pub trait MachineListener: Send + Sync {
    /// The machine state changed. Also delivered once on registration
    /// with the current state.
    fn state_changed(&self, _event: &StateChangeEvent) {}

    /// A build made progress.
    fn progress(&self, _event: &ProgressEvent) {}

    /// A temperature poll completed.
    fn tool_status(&self, _event: &ToolStatusEvent) {}
}
