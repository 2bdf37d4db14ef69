//! Deploy driver: converges a service's release to a published artifact.

use std::sync::Arc;

use tracing::{error, info, instrument};

use crate::adapters::{Convergence, Platform};
use crate::domain::{ArtifactRef, DeployResult, ServiceDescriptor, Stage};

use super::budgets::StageBudgets;

pub struct DeployDriver {
    platform: Arc<dyn Platform>,
    budgets: StageBudgets,
    namespace: String,
}

impl DeployDriver {
    pub fn new(platform: Arc<dyn Platform>, budgets: StageBudgets, namespace: impl Into<String>) -> Self {
        Self {
            platform,
            budgets,
            namespace: namespace.into(),
        }
    }

    /// Upgrade (or install) the release, blocking up to the deploy budget.
    ///
    /// The budget is handed to the platform and also enforced locally, so a
    /// platform that ignores its own timeout still ends in `TimedOut`.
    #[instrument(skip(self, service, artifact), fields(service = %service.id))]
    pub async fn deploy(&self, service: &ServiceDescriptor, artifact: &ArtifactRef) -> DeployResult {
        let budget = self.budgets.budget_for(Stage::Deploy);
        let target = service.target(&self.namespace);

        info!(
            release = %target.release_name,
            namespace = %target.namespace,
            tag = %artifact.build_tag,
            "Deploying"
        );

        let upgrade = self
            .platform
            .upgrade(&target, &artifact.repository, &artifact.build_tag, budget);

        match tokio::time::timeout(budget, upgrade).await {
            Ok(Ok(Convergence::Converged)) => DeployResult::Converged,
            Ok(Ok(Convergence::TimedOut)) | Err(_) => {
                error!(budget_secs = budget.as_secs(), "Deploy did not converge in time");
                DeployResult::TimedOut { budget }
            }
            Ok(Err(e)) => {
                let reason = format!("{:#}", e);
                error!(%reason, "Deploy rejected");
                DeployResult::Rejected { reason }
            }
        }
    }
}
