//! Messages exchanged between the scanner, the coordinator and the supervisor.
//!
//! The only channel that drives process lifecycle is the single-slot
//! `RestartSignal` channel; everything else is informational.

use std::time::SystemTime;

use tokio::sync::mpsc;

/// A request for the process supervisor's control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartSignal {
    /// Terminate the current instance (if any) and launch a new one.
    Restart,
    /// Terminate the current instance (if any) and leave nothing running.
    StopOnly,
}

impl RestartSignal {
    /// Whether a new instance is launched after termination.
    pub fn relaunches(self) -> bool {
        matches!(self, RestartSignal::Restart)
    }
}

/// Creates the single-slot channel carrying `RestartSignal`s.
///
/// With a capacity of one, a sender waits until the control loop has taken the
/// previous signal off the channel before its own is accepted.
pub fn restart_channel() -> (mpsc::Sender<RestartSignal>, mpsc::Receiver<RestartSignal>) {
    mpsc::channel(1)
}

/// One detected batch of modifications in the watched tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Wall-clock time at which the first modified entry was observed.
    pub detected_at: SystemTime,
    /// Number of entries newer than the previous observation point.
    pub modified: usize,
    /// Number of entries that could not be inspected during the pass.
    pub skipped: usize,
}

/// Lifecycle notifications emitted by the process supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A new instance was started.
    Launched { pid: u32 },
    /// The tracked instance exited and has been waited on.
    Exited { pid: u32, code: Option<i32> },
    /// The interrupt could not be delivered or the grace period ran out.
    Escalated { pid: u32 },
    /// The binary could not be started.
    LaunchFailed { error: String },
}
