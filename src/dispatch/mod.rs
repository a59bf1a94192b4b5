//! Job dispatch: routes a claimed job to the node agent or to the local
//! playbook runner, and completes agent jobs when their results arrive.

mod agent;
mod completer;
mod local;

pub use agent::AgentRunner;
pub use completer::Completer;
pub use local::{JobEventSink, LocalRunner};

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agent::Hub;
use crate::error::DispatchError;
use crate::orchestrator::{Job, KIND_RESTART_SERVICE};

/// Kinds that the node agent can execute natively.
pub const AGENT_KINDS: &[&str] = &[KIND_RESTART_SERVICE];

pub fn is_agent_kind(kind: &str) -> bool {
    AGENT_KINDS.contains(&kind)
}

/// Executes one dispatched job.
///
/// A runner records failures on the job itself and returns `Ok`; an `Err`
/// means the failure could not be recorded.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &Job, cancel: &CancellationToken) -> Result<(), DispatchError>;
}

/// Chooses a runner per job.
pub struct Dispatcher {
    hub: Arc<Hub>,
    agent: Arc<dyn JobRunner>,
    local: Arc<dyn JobRunner>,
    local_kinds: HashSet<String>,
}

impl Dispatcher {
    /// `local_kinds` are the kinds with a configured playbook.
    pub fn new(
        hub: Arc<Hub>,
        agent: Arc<dyn JobRunner>,
        local: Arc<dyn JobRunner>,
        local_kinds: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            hub,
            agent,
            local,
            local_kinds: local_kinds.into_iter().collect(),
        }
    }

    /// True if some runner can take `kind`.
    pub fn handles(&self, kind: &str) -> bool {
        is_agent_kind(kind) || self.local_kinds.contains(kind)
    }

    pub async fn dispatch(&self, job: &Job, cancel: &CancellationToken) -> Result<(), DispatchError> {
        let connected = match job.server_id {
            Some(server_id) => self.hub.is_connected(server_id).await,
            None => false,
        };

        if is_agent_kind(&job.kind) && connected {
            tracing::debug!(job_id = job.id, kind = %job.kind, "Dispatching to agent");
            return self.agent.run(job, cancel).await;
        }
        if self.local_kinds.contains(&job.kind) {
            tracing::debug!(job_id = job.id, kind = %job.kind, "Dispatching to local runner");
            return self.local.run(job, cancel).await;
        }
        if is_agent_kind(&job.kind) {
            // No session and no playbook: the agent runner records the miss.
            return self.agent.run(job, cancel).await;
        }
        Err(DispatchError::NoRunner(job.kind.clone()))
    }
}
