//! Core pipeline logic.
//!
//! This module contains:
//! - Detector: Maps a revision range to the changed services
//! - Builder / Publisher / Deployer / Verifier: Per-service stage executors
//! - EventStore: Append-only run log
//! - Pipeline: Pipeline definitions and loading
//! - Orchestrator: The run controller

pub mod budgets;
pub mod builder;
pub mod deployer;
pub mod detector;
pub mod event_store;
pub mod orchestrator;
pub mod pipeline;
pub mod publisher;
pub mod verifier;

// Re-export commonly used types
pub use budgets::StageBudgets;
pub use builder::{BuildExecutor, StageCursor};
pub use deployer::DeployDriver;
pub use detector::{ChangeDetector, DetectError, Detection};
pub use event_store::{generate_idempotency_key, hash_input, EventStore};
pub use orchestrator::{
    ControllerState, Orchestrator, RunError, RunOutcome, RunReport, RunRequest,
};
pub use pipeline::{Pipeline, RetryPolicy, ServiceSpec, ToolchainSpec};
pub use publisher::{PublishExecutor, PublishReport};
pub use verifier::Verifier;
