//! Job orchestration core: job types, the status state machine and the
//! job store contract.

pub mod state_machine;
mod types;

pub use types::{EventInput, EventLevel, Job, JobEvent, JobStatus, NewJob, TransitionInput};
pub(crate) use types::require_positive_id;

/// Job kind for cloud server provisioning.
pub const KIND_PROVISION_SERVER: &str = "provision_server";

/// Job kind that restarts a systemd unit through the node agent.
pub const KIND_RESTART_SERVICE: &str = "restart_service";

/// Event type used for step progress on a job timeline.
pub const EVENT_STEP_UPDATE: &str = "step_update";

/// Event type appended when a job is accepted.
pub const EVENT_JOB_CREATED: &str = "job_created";

/// Human-readable label for a job kind.
pub fn kind_label(kind: &str) -> String {
    match kind {
        KIND_PROVISION_SERVER => "Server provisioning".to_string(),
        KIND_RESTART_SERVICE => "Service restart".to_string(),
        "configure_server" => "Server configuration".to_string(),
        "delete_server" => "Server deletion".to_string(),
        other => {
            let spaced = other.replace('_', " ");
            let mut chars = spaced.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => "Job".to_string(),
            }
        }
    }
}
