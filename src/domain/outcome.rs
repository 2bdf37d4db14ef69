//! Per-service stage results and the run's outcome table.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::events::StageStatus;

/// A stage within a service branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Install declared dependencies
    Install,

    /// Run the test suite
    Test,

    /// Build the image
    Package,

    /// Push the image tags
    Publish,

    /// Converge the release to the new image
    Deploy,

    /// Confirm the rollout is serving
    Verify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Install => "Install",
            Stage::Test => "Test",
            Stage::Package => "Package",
            Stage::Publish => "Publish",
            Stage::Deploy => "Deploy",
            Stage::Verify => "Verify",
        };
        f.write_str(name)
    }
}

/// Result of a stage that may legitimately not apply to a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage ran and succeeded
    Completed,

    /// Nothing to do for this service (e.g. no test suite)
    NotApplicable(String),
}

/// Record of one executed stage within a branch
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub stage: Stage,
    pub status: StageStatus,
    pub duration_ms: u64,
    pub detail: Option<String>,
}

/// A packaged image and its two tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub repository: String,
    pub build_tag: String,
    pub latest_tag: String,
}

impl ArtifactRef {
    pub fn new(repository: impl Into<String>, build_id: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            build_tag: build_id.into(),
            latest_tag: "latest".to_string(),
        }
    }

    /// Image reference for the unique build tag
    pub fn build_image(&self) -> String {
        format!("{}:{}", self.repository, self.build_tag)
    }

    /// All image references to build and push (deduplicated)
    pub fn images(&self) -> Vec<String> {
        let mut images = vec![self.build_image()];
        let latest = format!("{}:{}", self.repository, self.latest_tag);
        if !images.contains(&latest) {
            images.push(latest);
        }
        images
    }
}

/// Result of the install → test → package sequence
#[derive(Debug, Clone)]
pub enum BuildResult {
    Success { artifact: ArtifactRef },
    Failed { stage: Stage, reason: String },
    TimedOut { stage: Stage, budget: Duration },
}

/// Build result plus the stages it went through
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub service: String,
    pub steps: Vec<StepRecord>,
    pub result: BuildResult,
}

/// Result of pushing an artifact's tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    Published {
        digest: String,
        tags: Vec<String>,
        attempts: u32,
    },
    Failed {
        reason: String,
    },
    TimedOut {
        budget: Duration,
    },
}

/// Result of asking the platform to converge a release
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployResult {
    Converged,
    /// The platform refused or failed the upgrade
    Rejected { reason: String },
    TimedOut { budget: Duration },
}

/// Rollout progress as seen by the verifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Pending,
    Progressing,
    Healthy,
    TimedOut,
    Failed,
}

impl RolloutStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Healthy | Self::TimedOut | Self::Failed)
    }
}

impl fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RolloutStatus::Pending => "pending",
            RolloutStatus::Progressing => "progressing",
            RolloutStatus::Healthy => "healthy",
            RolloutStatus::TimedOut => "timed out",
            RolloutStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl Default for RolloutStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// A running (or not) instance of a released service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub phase: String,
    pub ready: bool,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.phase == "Running" && self.ready
    }
}

/// What the verifier concluded about one release
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub status: RolloutStatus,
    /// The platform reported the rollout as finished
    pub rollout_completed: bool,
    pub instances: Vec<Instance>,
    pub detail: Option<String>,
}

impl VerifyReport {
    pub fn running_instances(&self) -> usize {
        self.instances.iter().filter(|i| i.is_running()).count()
    }

    /// Rollout claimed success but nothing is serving
    pub fn is_inconsistent(&self) -> bool {
        self.status == RolloutStatus::Failed && self.rollout_completed
    }
}

/// Failure scoped to a single service branch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BranchFailure {
    #[error("{service}: {stage} failed: {reason}")]
    Stage {
        service: String,
        stage: Stage,
        reason: String,
    },

    #[error("{service}: {stage} timed out after {budget_secs}s")]
    Timeout {
        service: String,
        stage: Stage,
        budget_secs: u64,
    },

    #[error("{service}: rollout reported healthy but no instances are running")]
    InconsistentRollout { service: String },
}

impl BranchFailure {
    pub fn service(&self) -> &str {
        match self {
            Self::Stage { service, .. }
            | Self::Timeout { service, .. }
            | Self::InconsistentRollout { service } => service,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::Stage { stage, .. } | Self::Timeout { stage, .. } => *stage,
            Self::InconsistentRollout { .. } => Stage::Verify,
        }
    }
}

/// Final status of a service branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Healthy,
    Failed,
    TimedOut,
}

/// One row of the outcome table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOutcome {
    pub service: String,
    pub stage_reached: Stage,
    pub status: OutcomeStatus,
    pub detail: Option<String>,
}

impl ServiceOutcome {
    /// A branch that made it through verification
    pub fn healthy(service: impl Into<String>, running_instances: usize) -> Self {
        Self {
            service: service.into(),
            stage_reached: Stage::Verify,
            status: OutcomeStatus::Healthy,
            detail: Some(format!("{} running instance(s)", running_instances)),
        }
    }

    /// A branch that ended in a failure
    pub fn from_failure(failure: &BranchFailure) -> Self {
        let status = match failure {
            BranchFailure::Timeout { .. } => OutcomeStatus::TimedOut,
            _ => OutcomeStatus::Failed,
        };

        Self {
            service: failure.service().to_string(),
            stage_reached: failure.stage(),
            status,
            detail: Some(failure.to_string()),
        }
    }

    /// Short label such as `Healthy`, `Failed@Test` or `TimedOut@Deploy`
    pub fn label(&self) -> String {
        match self.status {
            OutcomeStatus::Healthy => "Healthy".to_string(),
            OutcomeStatus::Failed => format!("Failed@{}", self.stage_reached),
            OutcomeStatus::TimedOut => format!("TimedOut@{}", self.stage_reached),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == OutcomeStatus::Healthy
    }
}

/// Per-service outcome table for a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeTable {
    pub rows: Vec<ServiceOutcome>,
}

impl OutcomeTable {
    pub fn new(rows: Vec<ServiceOutcome>) -> Self {
        Self { rows }
    }

    pub fn get(&self, service: &str) -> Option<&ServiceOutcome> {
        self.rows.iter().find(|r| r.service == service)
    }

    pub fn all_healthy(&self) -> bool {
        self.rows.iter().all(ServiceOutcome::is_healthy)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ServiceOutcome> {
        self.rows.iter().filter(|r| !r.is_healthy())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Render as a fixed-width table
    pub fn render(&self) -> String {
        let mut out = format!("{:<28} {:<10} {:<18}\n", "SERVICE", "STAGE", "RESULT");
        out.push_str(&"-".repeat(58));
        out.push('\n');
        for row in &self.rows {
            out.push_str(&format!(
                "{:<28} {:<10} {:<18}\n",
                row.service,
                row.stage_reached.to_string(),
                row.label()
            ));
        }
        out
    }
}
