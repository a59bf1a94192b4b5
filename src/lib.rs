//! fleetplane: control plane for a fleet of managed server nodes.
//!
//! Durable jobs move through a validated state machine and are executed by
//! a pool of workers. Node agents hold mutually authenticated WebSocket
//! sessions; a liveness monitor tracks them. Nodes bootstrap with
//! single-use registration tokens exchanged for certificates from an
//! internal CA. A separate queued-task runner retries external playbook
//! runs with backoff.

pub mod activity;
pub mod agent;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod orchestrator;
pub mod pki;
pub mod provider;
pub mod registration;
pub mod runner;
pub mod server;
pub mod servers;
pub mod shutdown;
pub mod tasks;
pub mod worker;
