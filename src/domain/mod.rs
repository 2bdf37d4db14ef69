//! Domain types for the deltaship pipeline.
//!
//! This module contains the core data structures:
//! - Service: Descriptors, registry, change sets and revision ranges
//! - Outcome: Per-stage results and the run's outcome table
//! - Events: Immutable records of state changes
//! - Run: Run history reconstructed from events

pub mod events;
pub mod outcome;
pub mod run;
pub mod service;

// Re-export commonly used types
pub use events::{Event, EventType, StageStatus};
pub use outcome::{
    ArtifactRef, BranchFailure, BuildReport, BuildResult, DeployResult, Instance, OutcomeStatus,
    OutcomeTable, PublishResult, RolloutStatus, ServiceOutcome, Stage, StageOutcome, StepRecord,
    VerifyReport,
};
pub use run::{Run, RunState};
pub use service::{ChangeSet, DeploymentTarget, RevisionRange, ServiceDescriptor, ServiceRegistry};
