//! Pipeline controller.
//!
//! Drives a run through its states:
//!
//! ```text
//! Init → DetectingChanges → NoOpDone                                  ┐
//!                         → Building → Publishing → Deploying         ├→ Cleanup → Success | Failure
//!                           → Verifying → Done                        ┘
//! ```
//!
//! Each fan-out stage spawns one task per surviving service. A failed branch
//! drops out of later stages without affecting its siblings. Cleanup runs
//! exactly once on every path.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{Adapters, Credentials};
use crate::config::ResolvedConfig;
use crate::domain::{
    ArtifactRef, BranchFailure, BuildResult, ChangeSet, DeployResult, Event, EventType,
    OutcomeTable, PublishResult, RevisionRange, RolloutStatus, Run, ServiceDescriptor,
    ServiceOutcome, ServiceRegistry, Stage, StageStatus,
};

use super::builder::{BuildExecutor, StageCursor};
use super::deployer::DeployDriver;
use super::detector::{ChangeDetector, DetectError};
use super::event_store::{generate_idempotency_key, EventStore};
use super::pipeline::Pipeline;
use super::publisher::PublishExecutor;
use super::verifier::Verifier;

/// Controller states, in the order a run can pass through them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Init,
    DetectingChanges,
    NoOpDone,
    Building,
    Publishing,
    Deploying,
    Verifying,
    Done,
    Cleanup,
    Success,
    Failure,
}

/// Errors that abort a whole run
#[derive(Debug, Error)]
pub enum RunError {
    #[error("change detection failed: {0}")]
    Detection(#[from] DetectError),

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

/// How a run ended
#[derive(Debug)]
pub enum RunOutcome {
    /// No service was touched; nothing was built
    NothingChanged,

    /// Every changed service went through its branch
    Finished(OutcomeTable),

    /// The run stopped before (or while) fanning out
    Aborted(RunError),
}

/// What the controller hands back for a run
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub range: Option<RevisionRange>,
    pub build_id: Option<String>,
    pub outcome: RunOutcome,
    /// States the controller passed through
    pub states: Vec<ControllerState>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        match &self.outcome {
            RunOutcome::NothingChanged => true,
            RunOutcome::Finished(table) => table.all_healthy(),
            RunOutcome::Aborted(_) => false,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self.outcome, RunOutcome::NothingChanged)
    }

    pub fn table(&self) -> Option<&OutcomeTable> {
        match &self.outcome {
            RunOutcome::Finished(table) => Some(table),
            _ => None,
        }
    }

    /// Process exit code for the run
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

/// Revision range requested by the caller
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub previous: Option<String>,
    pub current: Option<String>,
}

/// Appends events for one run
struct RunLog<'a> {
    store: &'a EventStore,
    run_id: Uuid,
}

impl RunLog<'_> {
    fn run_event(
        &self,
        event_type: EventType,
        suffix: &str,
        summary: String,
        status: StageStatus,
    ) -> Event {
        Event::new(
            self.run_id,
            event_type,
            format!("{}:{}", self.run_id, suffix),
            summary,
            status,
        )
    }

    fn stage_event(
        &self,
        service: &str,
        stage: Stage,
        event_type: EventType,
        status: StageStatus,
        input: &str,
        summary: String,
    ) -> Event {
        Event::new(
            self.run_id,
            event_type,
            generate_idempotency_key(self.run_id, stage, service, input),
            summary,
            status,
        )
        .for_stage(service, stage)
    }

    async fn append(&self, event: Event) -> Result<()> {
        self.store.append(&event).await
    }

    /// Record that a stage started for each service
    async fn stage_started(
        &self,
        services: impl Iterator<Item = &ServiceDescriptor>,
        stage: Stage,
        input: &str,
    ) -> Result<()> {
        for service in services {
            let event = self.stage_event(
                &service.id,
                stage,
                EventType::StageStarted,
                StageStatus::Running,
                input,
                format!("{} started for {}", stage, service.id),
            );
            self.append(event).await?;
        }
        Ok(())
    }

    /// Record a finished stage: completed, or the branch failure that ended it
    async fn stage_finished(
        &self,
        service: &str,
        stage: Stage,
        input: &str,
        result: Result<String, &BranchFailure>,
    ) -> Result<()> {
        let event = match result {
            Ok(summary) => self.stage_event(
                service,
                stage,
                EventType::StageCompleted,
                StageStatus::Completed,
                input,
                summary,
            ),
            Err(failure) => {
                let (event_type, status) = match failure {
                    BranchFailure::Timeout { .. } => (EventType::StageTimedOut, StageStatus::TimedOut),
                    _ => (EventType::StageFailed, StageStatus::Failed),
                };
                self.stage_event(service, stage, event_type, status, input, failure.to_string())
                    .with_error(failure.to_string())
            }
        };

        self.append(event).await
    }
}

/// Spawn one task per item and collect results in item order
async fn fan_out<I, T, F, Fut>(items: Vec<I>, work: F) -> Vec<(I, Result<T, JoinError>)>
where
    I: Clone,
    T: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
{
    let handles: Vec<_> = items
        .into_iter()
        .map(|item| {
            let handle = tokio::spawn(work(item.clone()));
            (item, handle)
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (item, handle) in handles {
        results.push((item, handle.await));
    }
    results
}

fn panicked(service: &str, stage: Stage, err: JoinError) -> BranchFailure {
    BranchFailure::Stage {
        service: service.to_string(),
        stage,
        reason: format!("branch task aborted: {}", err),
    }
}

/// Main pipeline controller
pub struct Orchestrator {
    pipeline: Pipeline,
    config: ResolvedConfig,
    adapters: Adapters,
    registry: ServiceRegistry,
}

impl Orchestrator {
    /// Create a controller for a validated pipeline
    pub fn new(pipeline: Pipeline, config: ResolvedConfig, adapters: Adapters) -> Result<Self> {
        pipeline.validate()?;
        let registry = pipeline.registry(config.registry()?, &config.release_prefix);

        Ok(Self {
            pipeline,
            config,
            adapters,
            registry,
        })
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Execute one pipeline run
    #[instrument(skip(self, request), fields(pipeline = %self.pipeline.name))]
    pub async fn run(&self, request: RunRequest) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let runs_dir = self.config.runs_dir();
        info!(%run_id, "Starting pipeline run");

        let store = match EventStore::open(&runs_dir, run_id).await {
            Ok(store) => store,
            Err(e) => {
                self.cleanup(None).await;
                return Err(e);
            }
        };
        let log = RunLog {
            store: &store,
            run_id,
        };

        let mut report = RunReport {
            run_id,
            range: None,
            build_id: None,
            outcome: RunOutcome::NothingChanged,
            states: vec![ControllerState::Init],
        };

        let outcome = match self.drive(&log, &runs_dir, request, &mut report).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %format!("{:#}", e), "Run aborted");
                RunOutcome::Aborted(RunError::Infrastructure(format!("{:#}", e)))
            }
        };
        report.outcome = outcome;

        report.states.push(ControllerState::Cleanup);
        self.cleanup(Some(&log)).await;

        let final_event = if report.is_success() {
            report.states.push(ControllerState::Success);
            info!(%run_id, noop = report.is_noop(), "Run succeeded");
            log.run_event(
                EventType::RunCompleted,
                "complete",
                format!("Pipeline '{}' completed", self.pipeline.name),
                StageStatus::Completed,
            )
        } else {
            report.states.push(ControllerState::Failure);
            let reason = failure_summary(&report.outcome);
            error!(%run_id, %reason, "Run failed");
            log.run_event(
                EventType::RunFailed,
                "complete",
                format!("Pipeline '{}' failed", self.pipeline.name),
                StageStatus::Failed,
            )
            .with_error(reason)
        };

        if let Err(e) = log.append(final_event).await {
            warn!(error = %e, "Failed to record run completion");
        }

        Ok(report)
    }

    async fn drive(
        &self,
        log: &RunLog<'_>,
        runs_dir: &Path,
        request: RunRequest,
        report: &mut RunReport,
    ) -> Result<RunOutcome> {
        let started = log
            .run_event(
                EventType::RunStarted,
                "start",
                format!("Pipeline '{}' started", self.pipeline.name),
                StageStatus::Running,
            )
            .with_data(json!({ "pipeline": self.pipeline.name }));
        log.append(started).await?;

        let last_successful = match last_successful_revision(runs_dir, &self.pipeline.name).await {
            Ok(revision) => revision,
            Err(e) => {
                warn!(error = %e, "Could not read previous runs");
                None
            }
        };
        let range = RevisionRange::resolve(
            request.previous,
            request.current,
            self.config.previous_revision.clone(),
            last_successful,
        );

        report.states.push(ControllerState::DetectingChanges);
        let detector = ChangeDetector::new(self.adapters.revisions.clone());
        let detection = match detector.detect(&self.registry, &range).await {
            Ok(detection) => detection,
            Err(e) => {
                error!(error = %e, "Change detection failed");
                return Ok(RunOutcome::Aborted(RunError::Detection(e)));
            }
        };
        report.range = Some(detection.range.clone());

        if detection.change_set.is_empty() {
            report.states.push(ControllerState::NoOpDone);
            info!("Nothing changed");
            let event = log
                .run_event(
                    EventType::NothingChanged,
                    "detect",
                    format!(
                        "No service changed in {}..{}",
                        detection.range.previous, detection.range.current
                    ),
                    StageStatus::Completed,
                )
                .with_data(json!({
                    "previous": detection.range.previous,
                    "current": detection.range.current,
                }));
            log.append(event).await?;
            return Ok(RunOutcome::NothingChanged);
        }

        let build_id = self
            .config
            .build_id
            .clone()
            .unwrap_or_else(|| detection.range.current.clone());
        report.build_id = Some(build_id.clone());

        let event = log
            .run_event(
                EventType::ChangesDetected,
                "detect",
                format!("Changed services: {}", detection.change_set.ids().join(", ")),
                StageStatus::Completed,
            )
            .with_data(json!({
                "previous": detection.range.previous,
                "current": detection.range.current,
                "build_id": build_id,
                "services": detection.change_set.ids(),
            }));
        log.append(event).await?;

        let credentials = match self
            .adapters
            .credentials
            .acquire(&self.config.credentials_ref)
            .await
        {
            Ok(credentials) => Arc::new(credentials),
            Err(e) => {
                let reason = format!(
                    "could not acquire credentials '{}': {:#}",
                    self.config.credentials_ref, e
                );
                error!(%reason, "Aborting run");
                return Ok(RunOutcome::Aborted(RunError::Infrastructure(reason)));
            }
        };

        let table = self
            .fan_out_stages(log, &detection.change_set, &build_id, credentials, report)
            .await?;

        report.states.push(ControllerState::Done);
        if let Err(e) = log.store.store_report(&table).await {
            warn!(error = %e, "Failed to store outcome report");
        }

        Ok(RunOutcome::Finished(table))
    }

    async fn fan_out_stages(
        &self,
        log: &RunLog<'_>,
        change_set: &ChangeSet,
        build_id: &str,
        credentials: Arc<Credentials>,
        report: &mut RunReport,
    ) -> Result<OutcomeTable> {
        let budgets = self.pipeline.timeouts.clone();
        let namespace = self.config.namespace.clone();
        let mut failures: HashMap<String, BranchFailure> = HashMap::new();
        let mut healthy: HashMap<String, usize> = HashMap::new();

        // Build
        report.states.push(ControllerState::Building);
        let builder = Arc::new(BuildExecutor::new(
            self.adapters.toolchain.clone(),
            self.adapters.builder.clone(),
            budgets.clone(),
            build_id,
        ));
        log.stage_started(change_set.services().iter(), Stage::Install, build_id)
            .await?;

        let branches: Vec<(ServiceDescriptor, StageCursor)> = change_set
            .services()
            .iter()
            .map(|service| (service.clone(), StageCursor::new()))
            .collect();
        let results = fan_out(branches, |(service, cursor)| {
            let builder = builder.clone();
            async move { builder.build_tracked(&service, &cursor).await }
        })
        .await;

        let mut built: Vec<(ServiceDescriptor, ArtifactRef)> = Vec::new();
        for ((service, cursor), joined) in results {
            let build = match joined {
                Ok(build) => build,
                Err(e) => {
                    let stage = cursor.get();
                    let failure = panicked(&service.id, stage, e);
                    log.stage_finished(&service.id, stage, build_id, Err(&failure))
                        .await?;
                    failures.insert(service.id.clone(), failure);
                    continue;
                }
            };

            for step in &build.steps {
                let (event_type, summary) = match step.status {
                    StageStatus::Completed => (EventType::StageCompleted, format!("{} completed", step.stage)),
                    StageStatus::Skipped => (EventType::StageSkipped, format!("{} not applicable", step.stage)),
                    StageStatus::TimedOut => (EventType::StageTimedOut, format!("{} timed out", step.stage)),
                    _ => (EventType::StageFailed, format!("{} failed", step.stage)),
                };
                let mut event = log
                    .stage_event(&service.id, step.stage, event_type, step.status, build_id, summary)
                    .with_duration(step.duration_ms);
                if let Some(detail) = &step.detail {
                    event = if step.status == StageStatus::Skipped {
                        event.with_data(json!({ "reason": detail }))
                    } else {
                        event.with_error(detail.clone())
                    };
                }
                log.append(event).await?;
            }

            match build.result {
                BuildResult::Success { artifact } => built.push((service, artifact)),
                BuildResult::Failed { stage, reason } => {
                    failures.insert(
                        service.id.clone(),
                        BranchFailure::Stage {
                            service: service.id.clone(),
                            stage,
                            reason,
                        },
                    );
                }
                BuildResult::TimedOut { stage, budget } => {
                    failures.insert(
                        service.id.clone(),
                        BranchFailure::Timeout {
                            service: service.id.clone(),
                            stage,
                            budget_secs: budget.as_secs(),
                        },
                    );
                }
            }
        }

        // Publish
        report.states.push(ControllerState::Publishing);
        let publisher = Arc::new(PublishExecutor::new(
            self.adapters.registry.clone(),
            credentials,
            budgets.clone(),
            self.pipeline.publish_retry.clone(),
        ));
        log.stage_started(built.iter().map(|(s, _)| s), Stage::Publish, build_id)
            .await?;

        let results = fan_out(built, |(service, artifact)| {
            let publisher = publisher.clone();
            async move { publisher.publish(&service, &artifact).await }
        })
        .await;

        let mut published: Vec<(ServiceDescriptor, ArtifactRef)> = Vec::new();
        for ((service, artifact), joined) in results {
            let input = artifact.build_image();
            let publish = match joined {
                Ok(publish) => publish,
                Err(e) => {
                    let failure = panicked(&service.id, Stage::Publish, e);
                    log.stage_finished(&service.id, Stage::Publish, &input, Err(&failure))
                        .await?;
                    failures.insert(service.id.clone(), failure);
                    continue;
                }
            };

            for (n, note) in publish.retries.iter().enumerate() {
                let mut event = log
                    .stage_event(
                        &service.id,
                        Stage::Publish,
                        EventType::StageRetrying,
                        StageStatus::Running,
                        &input,
                        format!("Publish retry {}", n + 1),
                    )
                    .with_error(note.clone());
                event.idempotency_key = format!("{}:retry:{}", event.idempotency_key, n + 1);
                log.append(event).await?;
            }

            match publish.result {
                PublishResult::Published { digest, tags, attempts } => {
                    let event = log
                        .stage_event(
                            &service.id,
                            Stage::Publish,
                            EventType::StageCompleted,
                            StageStatus::Completed,
                            &input,
                            format!("Published {} ({} attempts)", digest, attempts),
                        )
                        .with_data(json!({ "digest": digest, "tags": tags }));
                    log.append(event).await?;
                    published.push((service, artifact));
                }
                PublishResult::Failed { reason } => {
                    let failure = BranchFailure::Stage {
                        service: service.id.clone(),
                        stage: Stage::Publish,
                        reason,
                    };
                    log.stage_finished(&service.id, Stage::Publish, &input, Err(&failure))
                        .await?;
                    failures.insert(service.id.clone(), failure);
                }
                PublishResult::TimedOut { budget } => {
                    let failure = BranchFailure::Timeout {
                        service: service.id.clone(),
                        stage: Stage::Publish,
                        budget_secs: budget.as_secs(),
                    };
                    log.stage_finished(&service.id, Stage::Publish, &input, Err(&failure))
                        .await?;
                    failures.insert(service.id.clone(), failure);
                }
            }
        }

        // Deploy
        report.states.push(ControllerState::Deploying);
        let driver = Arc::new(DeployDriver::new(
            self.adapters.platform.clone(),
            budgets.clone(),
            namespace.clone(),
        ));
        log.stage_started(published.iter().map(|(s, _)| s), Stage::Deploy, build_id)
            .await?;

        let results = fan_out(published, |(service, artifact)| {
            let driver = driver.clone();
            async move { driver.deploy(&service, &artifact).await }
        })
        .await;

        let mut deployed: Vec<ServiceDescriptor> = Vec::new();
        for ((service, artifact), joined) in results {
            let input = artifact.build_image();
            let failure = match joined {
                Ok(DeployResult::Converged) => {
                    log.stage_finished(
                        &service.id,
                        Stage::Deploy,
                        &input,
                        Ok(format!("{} converged to {}", service.release_name, artifact.build_tag)),
                    )
                    .await?;
                    deployed.push(service);
                    continue;
                }
                Ok(DeployResult::Rejected { reason }) => BranchFailure::Stage {
                    service: service.id.clone(),
                    stage: Stage::Deploy,
                    reason,
                },
                Ok(DeployResult::TimedOut { budget }) => BranchFailure::Timeout {
                    service: service.id.clone(),
                    stage: Stage::Deploy,
                    budget_secs: budget.as_secs(),
                },
                Err(e) => panicked(&service.id, Stage::Deploy, e),
            };
            log.stage_finished(&service.id, Stage::Deploy, &input, Err(&failure))
                .await?;
            failures.insert(service.id.clone(), failure);
        }

        // Verify
        report.states.push(ControllerState::Verifying);
        let verifier = Arc::new(Verifier::new(
            self.adapters.platform.clone(),
            budgets,
            namespace,
        ));
        log.stage_started(deployed.iter(), Stage::Verify, build_id)
            .await?;

        let results = fan_out(deployed, |service| {
            let verifier = verifier.clone();
            async move { verifier.verify(&service).await }
        })
        .await;

        for (service, joined) in results {
            let input = service.release_name.clone();
            let failure = match joined {
                Ok(verify) if verify.status == RolloutStatus::Healthy => {
                    let running = verify.running_instances();
                    log.stage_finished(
                        &service.id,
                        Stage::Verify,
                        &input,
                        Ok(format!("{} running instance(s)", running)),
                    )
                    .await?;
                    healthy.insert(service.id.clone(), running);
                    continue;
                }
                Ok(verify) if verify.is_inconsistent() => BranchFailure::InconsistentRollout {
                    service: service.id.clone(),
                },
                Ok(verify) if verify.status == RolloutStatus::TimedOut => BranchFailure::Timeout {
                    service: service.id.clone(),
                    stage: Stage::Verify,
                    budget_secs: self.pipeline.timeouts.verify_seconds,
                },
                Ok(verify) => BranchFailure::Stage {
                    service: service.id.clone(),
                    stage: Stage::Verify,
                    reason: verify
                        .detail
                        .unwrap_or_else(|| format!("rollout ended as {:?}", verify.status)),
                },
                Err(e) => panicked(&service.id, Stage::Verify, e),
            };
            log.stage_finished(&service.id, Stage::Verify, &input, Err(&failure))
                .await?;
            failures.insert(service.id.clone(), failure);
        }

        let rows = change_set
            .services()
            .iter()
            .map(|service| match failures.get(&service.id) {
                Some(failure) => ServiceOutcome::from_failure(failure),
                None => ServiceOutcome::healthy(
                    service.id.clone(),
                    healthy.get(&service.id).copied().unwrap_or_default(),
                ),
            })
            .collect();

        Ok(OutcomeTable::new(rows))
    }

    /// Run every cleanup hook once; failures are logged, never escalated
    async fn cleanup(&self, log: Option<&RunLog<'_>>) {
        for hook in &self.adapters.cleanup {
            let name = hook.name().to_string();
            let (event_type, status, failure) = match hook.cleanup().await {
                Ok(()) => {
                    info!(hook = %name, "Cleanup finished");
                    (EventType::CleanupCompleted, StageStatus::Completed, None)
                }
                Err(e) => {
                    let reason = format!("{:#}", e);
                    warn!(hook = %name, error = %reason, "Cleanup failed");
                    (EventType::CleanupFailed, StageStatus::Failed, Some(reason))
                }
            };

            let Some(log) = log else { continue };
            let mut event = Event::new(
                log.run_id,
                event_type,
                format!("{}:cleanup:{}", log.run_id, name),
                format!("Cleanup '{}'", name),
                status,
            );
            if let Some(reason) = failure {
                event = event.with_error(reason);
            }
            if let Err(e) = log.append(event).await {
                warn!(hook = %name, error = %e, "Failed to record cleanup");
            }
        }
    }
}

fn failure_summary(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::NothingChanged => String::new(),
        RunOutcome::Finished(table) => table
            .failures()
            .map(|row| format!("{}: {}", row.service, row.label()))
            .collect::<Vec<_>>()
            .join(", "),
        RunOutcome::Aborted(e) => e.to_string(),
    }
}

/// Load a run by ID from its event log
pub async fn load_run(runs_dir: &Path, run_id: Uuid) -> Result<Run> {
    if !runs_dir.join(run_id.to_string()).exists() {
        anyhow::bail!("Run {} not found", run_id);
    }

    let store = EventStore::open(runs_dir, run_id).await?;
    let events = store.replay().await?;

    if events.is_empty() {
        anyhow::bail!("Run {} not found", run_id);
    }

    Run::from_events(&events).context("Failed to reconstruct run state")
}

/// List recent runs, most recent first
pub async fn list_runs(runs_dir: &Path, limit: usize) -> Result<Vec<Run>> {
    let run_ids = EventStore::list_runs(runs_dir).await?;
    let mut runs = Vec::new();

    for run_id in run_ids {
        if let Ok(run) = load_run(runs_dir, run_id).await {
            runs.push(run);
        }
    }

    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    runs.truncate(limit);

    Ok(runs)
}

/// Current revision of the most recent successful run of a pipeline
pub async fn last_successful_revision(runs_dir: &Path, pipeline_name: &str) -> Result<Option<String>> {
    let runs = list_runs(runs_dir, usize::MAX).await?;

    Ok(runs
        .into_iter()
        .filter(|run| run.pipeline_name == pipeline_name && run.is_successful())
        .find_map(|run| run.range.map(|range| range.current)))
}
