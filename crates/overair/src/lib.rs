//! Update workflow engine for an on-device IoT update agent.
//!
//! The agent receives update deployments from a cloud service, downloads
//! and verifies their payloads, realizes them through pluggable content
//! handlers, persists its progress across reboots and restarts, and
//! reports state back over a reported-properties channel.
//!
//! The crate is organized around a single-threaded workflow engine
//! ([`workflow::WorkflowEngine`]) fed by one worker thread
//! (`overair-queue`), with the trust chain (`overair-trust`), the source
//! update cache (`overair-cache`), and backoff scheduling
//! (`overair-retry`) factored into sibling crates. The [`facade::Agent`]
//! is what hosts and transports talk to.
//!
//! At most one deployment is in flight per device at any time; every state
//! transition is persisted before it is reported, so recovery after a
//! crash never double-reports success.

pub mod config;
pub mod content;
pub mod criteria;
pub mod download;
pub mod error;
pub mod facade;
pub mod handler;
pub mod persistence;
pub mod plugin;
pub mod report;
pub mod sandbox;
pub mod simulator;
pub mod types;
pub mod verify;
pub mod workflow;

pub use config::AgentConfig;
pub use error::AgentError;
pub use facade::Agent;
pub use types::{Deployment, ReportedState, StepOutcome, UpdateId, UpdateType, WorkflowStep};
pub use workflow::WorkflowEngine;
