//! Render worker.
//!
//! This crate provides:
//! - Worker agent draining a batch through claim, render, upload and acknowledge
//! - Lease heartbeats running beside each render
//! - Periodic expired-lease sweeps for crash recovery
//! - Failure classification and graceful shutdown

pub mod agent;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod logging;
pub mod metrics;

pub use agent::{jittered, CycleOutcome, WorkerAgent, WorkerSummary};
pub use config::WorkerConfig;
pub use error::{CycleFailure, WorkerError, WorkerResult};
pub use heartbeat::{LeaseHeartbeat, LeaseState};
pub use logging::CycleLogger;
