//! Rollout verification.
//!
//! Polls the platform until the release reports a finished rollout, then
//! confirms that instances are actually running. A rollout that claims
//! success with nothing running is treated as a failure.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, instrument, warn};

use crate::adapters::{Platform, RolloutProbe};
use crate::domain::{DeploymentTarget, RolloutStatus, ServiceDescriptor, Stage, VerifyReport};

use super::budgets::StageBudgets;

pub struct Verifier {
    platform: Arc<dyn Platform>,
    budgets: StageBudgets,
    namespace: String,
}

impl Verifier {
    pub fn new(platform: Arc<dyn Platform>, budgets: StageBudgets, namespace: impl Into<String>) -> Self {
        Self {
            platform,
            budgets,
            namespace: namespace.into(),
        }
    }

    #[instrument(skip(self, service), fields(service = %service.id))]
    pub async fn verify(&self, service: &ServiceDescriptor) -> VerifyReport {
        let budget = self.budgets.budget_for(Stage::Verify);
        let target = service.target(&self.namespace);

        let observed = Mutex::new(RolloutStatus::default());

        let verdict = tokio::time::timeout(budget, self.check(&target, &observed)).await;

        let report = match verdict {
            Ok(report) => report,
            Err(_) => {
                let last = *observed.lock().unwrap_or_else(PoisonError::into_inner);
                VerifyReport {
                    status: RolloutStatus::TimedOut,
                    rollout_completed: false,
                    instances: Vec::new(),
                    detail: Some(format!("rollout still {} after {}s", last, budget.as_secs())),
                }
            }
        };

        info!(status = ?report.status, running = report.running_instances(), "Verification finished");
        report
    }

    async fn check(&self, target: &DeploymentTarget, observed: &Mutex<RolloutStatus>) -> VerifyReport {
        if let Err(detail) = self.poll_until_terminal(target, observed).await {
            return VerifyReport {
                status: RolloutStatus::Failed,
                rollout_completed: false,
                instances: Vec::new(),
                detail: Some(detail),
            };
        }

        // Keep asking until the instance list can be read; the outer budget bounds this
        let instances = loop {
            match self.platform.list_instances(target).await {
                Ok(instances) => break instances,
                Err(e) => {
                    warn!(error = %e, "Listing instances failed, retrying");
                    tokio::time::sleep(self.budgets.poll_interval()).await;
                }
            }
        };

        let running = instances.iter().filter(|i| i.is_running()).count();
        if running == 0 {
            return VerifyReport {
                status: RolloutStatus::Failed,
                rollout_completed: true,
                instances,
                detail: Some("rollout reported complete but no instances are running".to_string()),
            };
        }

        VerifyReport {
            status: RolloutStatus::Healthy,
            rollout_completed: true,
            instances,
            detail: None,
        }
    }

    /// Ok once the rollout completed, Err(detail) when the platform reports failure
    ///
    /// Every answer is recorded in `observed`, which outlives an expired budget.
    async fn poll_until_terminal(
        &self,
        target: &DeploymentTarget,
        observed: &Mutex<RolloutStatus>,
    ) -> Result<(), String> {
        loop {
            match self.platform.rollout_status(target).await {
                Ok(answer) => {
                    let status = match &answer {
                        RolloutProbe::Pending => RolloutStatus::Pending,
                        RolloutProbe::Progressing(detail) => {
                            debug!(%detail, "Rollout progressing");
                            RolloutStatus::Progressing
                        }
                        RolloutProbe::Complete => RolloutStatus::Healthy,
                        RolloutProbe::Failed(_) => RolloutStatus::Failed,
                    };
                    *observed.lock().unwrap_or_else(PoisonError::into_inner) = status;

                    if status.is_terminal() {
                        return match answer {
                            RolloutProbe::Failed(detail) => Err(detail),
                            _ => Ok(()),
                        };
                    }
                }
                Err(e) => warn!(error = %e, "Rollout status check failed"),
            }

            tokio::time::sleep(self.budgets.poll_interval()).await;
        }
    }
}
