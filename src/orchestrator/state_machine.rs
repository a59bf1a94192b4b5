//! Legal job status transitions.
//!
//! ```text
//! queued ──► preparing ──► running ──► verifying ──► succeeded
//!                            │  ▲          │
//!                            ▼  │          ▼
//!                  waiting_reboot ─► resuming     retrying ──► running
//!
//! every non-terminal status may also go to failed, cancelled or timed_out
//! ```

use crate::error::JobError;
use crate::orchestrator::JobStatus;

use JobStatus::*;

/// Statuses reachable from `from` in one step. Terminal statuses have none.
pub fn allowed_targets(from: JobStatus) -> &'static [JobStatus] {
    match from {
        Queued => &[Preparing, Cancelled, Failed, TimedOut],
        Preparing => &[Running, Failed, Cancelled, TimedOut],
        Running => &[WaitingReboot, Verifying, Retrying, Failed, Cancelled, TimedOut],
        WaitingReboot => &[Resuming, Failed, Cancelled, TimedOut],
        Resuming => &[Running, Verifying, Retrying, Failed, Cancelled, TimedOut],
        Verifying => &[Succeeded, Retrying, Failed, Cancelled, TimedOut],
        Retrying => &[Running, Failed, Cancelled, TimedOut],
        Succeeded | Failed | Cancelled | TimedOut => &[],
    }
}

pub fn is_legal(from: JobStatus, to: JobStatus) -> bool {
    allowed_targets(from).contains(&to)
}

/// Check a transition, distinguishing a no-op from a missing edge.
pub fn validate(from: JobStatus, to: JobStatus) -> Result<(), JobError> {
    if from == to {
        return Err(JobError::AlreadyInState(from));
    }
    if !is_legal(from, to) {
        return Err(JobError::InvalidTransition { from, to });
    }
    Ok(())
}

pub fn is_terminal(status: JobStatus) -> bool {
    matches!(status, Succeeded | Failed | Cancelled | TimedOut)
}
