//! Publish executor: pushes a built artifact's tags to the registry.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, instrument, warn};

use crate::adapters::{ArtifactRegistry, Credentials, RegistrySession};
use crate::domain::{ArtifactRef, PublishResult, ServiceDescriptor, Stage};

use super::budgets::StageBudgets;
use super::pipeline::RetryPolicy;

/// Publish result plus the retries it took
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub service: String,
    pub result: PublishResult,
    /// One note per retried push
    pub retries: Vec<String>,
}

/// Pushes artifacts with run-scoped credentials
pub struct PublishExecutor {
    registry: Arc<dyn ArtifactRegistry>,
    credentials: Arc<Credentials>,
    budgets: StageBudgets,
    retry: RetryPolicy,
}

impl PublishExecutor {
    pub fn new(
        registry: Arc<dyn ArtifactRegistry>,
        credentials: Arc<Credentials>,
        budgets: StageBudgets,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            credentials,
            budgets,
            retry,
        }
    }

    /// Push both tags of an artifact; the whole call runs under the publish budget
    #[instrument(skip(self, service, artifact), fields(service = %service.id))]
    pub async fn publish(&self, service: &ServiceDescriptor, artifact: &ArtifactRef) -> PublishReport {
        let budget = self.budgets.budget_for(Stage::Publish);
        let mut retries = Vec::new();

        let result = match tokio::time::timeout(budget, self.push_all(artifact, &mut retries)).await
        {
            Ok(result) => result,
            Err(_) => {
                error!(budget_secs = budget.as_secs(), "Publish timed out");
                PublishResult::TimedOut { budget }
            }
        };

        PublishReport {
            service: service.id.clone(),
            result,
            retries,
        }
    }

    async fn push_all(&self, artifact: &ArtifactRef, retries: &mut Vec<String>) -> PublishResult {
        let session = match self.registry.authenticate(&self.credentials).await {
            Ok(session) => session,
            Err(e) => {
                return PublishResult::Failed {
                    reason: format!("registry authentication failed: {:#}", e),
                }
            }
        };

        let images = artifact.images();
        let mut digests = Vec::with_capacity(images.len());
        let mut attempts = 0;

        for image in &images {
            match self.push_with_retry(&session, image, retries).await {
                Ok((digest, used)) => {
                    attempts += used;
                    digests.push(digest);
                }
                Err(e) => {
                    return PublishResult::Failed {
                        reason: format!("push of {} failed: {:#}", image, e),
                    }
                }
            }
        }

        if digests.windows(2).any(|pair| pair[0] != pair[1]) {
            return PublishResult::Failed {
                reason: format!("content mismatch between tags: {}", digests.join(" != ")),
            };
        }

        let digest = digests.into_iter().next().unwrap_or_default();
        info!(%digest, tags = images.len(), "Published");

        PublishResult::Published {
            digest,
            tags: images,
            attempts,
        }
    }

    async fn push_with_retry(
        &self,
        session: &RegistrySession,
        image: &str,
        retries: &mut Vec<String>,
    ) -> Result<(String, u32)> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self.registry.push(session, image).await {
                Ok(digest) => return Ok((digest, attempt)),
                Err(e) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        %image,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Push failed, retrying"
                    );
                    retries.push(format!("attempt {} of {}: {:#}", attempt, image, e));
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
