//! Build executor: install → test → package for one service.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::{error, info, instrument, warn};

use crate::adapters::{PackageBuilder, Toolchain};
use crate::domain::{
    ArtifactRef, BuildReport, BuildResult, ServiceDescriptor, Stage, StageOutcome, StageStatus,
    StepRecord,
};

use super::budgets::StageBudgets;

/// Stage a build branch is currently in, readable after its task is gone
#[derive(Debug, Clone)]
pub struct StageCursor(Arc<Mutex<Stage>>);

impl StageCursor {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Stage::Install)))
    }

    pub fn set(&self, stage: Stage) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = stage;
    }

    pub fn get(&self) -> Stage {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for StageCursor {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the build stages of a service branch
pub struct BuildExecutor {
    toolchain: Arc<dyn Toolchain>,
    builder: Arc<dyn PackageBuilder>,
    budgets: StageBudgets,
    build_id: String,
}

impl BuildExecutor {
    pub fn new(
        toolchain: Arc<dyn Toolchain>,
        builder: Arc<dyn PackageBuilder>,
        budgets: StageBudgets,
        build_id: impl Into<String>,
    ) -> Self {
        Self {
            toolchain,
            builder,
            budgets,
            build_id: build_id.into(),
        }
    }

    /// Build one service. Never fails the caller; failures are in the report.
    pub async fn build(&self, service: &ServiceDescriptor) -> BuildReport {
        self.build_tracked(service, &StageCursor::new()).await
    }

    /// Like [`build`](Self::build), moving `cursor` to each stage before it runs
    #[instrument(skip(self, service, cursor), fields(service = %service.id))]
    pub async fn build_tracked(&self, service: &ServiceDescriptor, cursor: &StageCursor) -> BuildReport {
        let mut steps = Vec::new();
        let result = self.run_stages(service, cursor, &mut steps).await;

        match &result {
            BuildResult::Success { artifact } => {
                info!(image = %artifact.build_image(), "Build succeeded")
            }
            BuildResult::Failed { stage, reason } => {
                error!(%stage, %reason, "Build failed")
            }
            BuildResult::TimedOut { stage, budget } => {
                error!(%stage, budget_secs = budget.as_secs(), "Build timed out")
            }
        }

        BuildReport {
            service: service.id.clone(),
            steps,
            result,
        }
    }

    async fn run_stages(
        &self,
        service: &ServiceDescriptor,
        cursor: &StageCursor,
        steps: &mut Vec<StepRecord>,
    ) -> BuildResult {
        cursor.set(Stage::Install);
        if let Err(result) = self
            .step(Stage::Install, steps, self.toolchain.install(service))
            .await
        {
            return result;
        }

        cursor.set(Stage::Test);
        if let Err(result) = self
            .step(Stage::Test, steps, self.toolchain.test(service))
            .await
        {
            return result;
        }

        cursor.set(Stage::Package);
        let artifact = ArtifactRef::new(&service.image_repository, &self.build_id);
        let images = artifact.images();
        let package = async {
            self.builder
                .build(service, &images)
                .await
                .map(|_| StageOutcome::Completed)
        };
        if let Err(result) = self.step(Stage::Package, steps, package).await {
            return result;
        }

        BuildResult::Success { artifact }
    }

    /// Run one stage under its budget and record it
    async fn step<F>(
        &self,
        stage: Stage,
        steps: &mut Vec<StepRecord>,
        work: F,
    ) -> Result<(), BuildResult>
    where
        F: Future<Output = anyhow::Result<StageOutcome>>,
    {
        let budget = self.budgets.budget_for(stage);
        let started = Instant::now();
        let outcome = tokio::time::timeout(budget, work).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let record = |status: StageStatus, detail: Option<String>| StepRecord {
            stage,
            status,
            duration_ms,
            detail,
        };

        match outcome {
            Ok(Ok(StageOutcome::Completed)) => {
                info!(%stage, duration_ms, "Stage completed");
                steps.push(record(StageStatus::Completed, None));
                Ok(())
            }
            Ok(Ok(StageOutcome::NotApplicable(reason))) => {
                info!(%stage, %reason, "Stage not applicable");
                steps.push(record(StageStatus::Skipped, Some(reason)));
                Ok(())
            }
            Ok(Err(e)) => {
                let reason = format!("{:#}", e);
                steps.push(record(StageStatus::Failed, Some(reason.clone())));
                Err(BuildResult::Failed { stage, reason })
            }
            Err(_) => {
                warn!(%stage, budget_secs = budget.as_secs(), "Stage exceeded its budget");
                steps.push(record(
                    StageStatus::TimedOut,
                    Some(format!("exceeded {}s budget", budget.as_secs())),
                ));
                Err(BuildResult::TimedOut { stage, budget })
            }
        }
    }
}
