//! deltaship - change-driven selective build and deploy
//!
//! Given a monorepo of independently deployable services and a revision
//! range, deltaship works out which services the range touched and runs only
//! those through install, test, package, publish, deploy and verify.
//!
//! # Architecture
//!
//! - Services are uniform descriptors derived from the pipeline definition
//! - Each changed service runs as an isolated branch; one failing branch
//!   never stops its siblings
//! - Every run is recorded as immutable events and can be inspected later
//!
//! # Modules
//!
//! - `adapters`: External systems (git, toolchain, docker, helm/kubectl, credentials)
//! - `core`: Detection, stage executors, run controller, event store
//! - `domain`: Data structures (ServiceDescriptor, ChangeSet, outcomes, Event, Run)
//! - `config`: Environment configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Process everything since the last successful run
//! deltaship run
//!
//! # Process an explicit range
//! deltaship run --previous main~3 --current main
//!
//! # Check run status
//! deltaship status <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use self::core::{Orchestrator, Pipeline, RunOutcome, RunReport, RunRequest};
pub use domain::{ChangeSet, Event, EventType, OutcomeTable, Run, RunState, ServiceDescriptor};
