//! Time budgets for pipeline stages.
//!
//! Every stage runs under a budget so a hung external command ends its branch
//! with a timeout instead of stalling the whole run:
//! - install/test/package/publish (default: 1800s = 30 min)
//! - deploy/verify (default: 300s = 5 min)
//! - rollout polling interval (default: 5000ms)

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::Stage;

/// Per-stage time budgets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageBudgets {
    #[serde(default = "default_build_budget")]
    pub install_seconds: u64,

    #[serde(default = "default_build_budget")]
    pub test_seconds: u64,

    #[serde(default = "default_build_budget")]
    pub package_seconds: u64,

    #[serde(default = "default_build_budget")]
    pub publish_seconds: u64,

    /// Convergence budget handed to the platform (default: 300 = 5 min)
    #[serde(default = "default_rollout_budget")]
    pub deploy_seconds: u64,

    /// Rollout polling budget (default: 300 = 5 min)
    #[serde(default = "default_rollout_budget")]
    pub verify_seconds: u64,

    /// Delay between rollout status polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_build_budget() -> u64 {
    1800
} // 30 min
fn default_rollout_budget() -> u64 {
    300
} // 5 min
fn default_poll_interval() -> u64 {
    5000
}

impl Default for StageBudgets {
    fn default() -> Self {
        Self {
            install_seconds: default_build_budget(),
            test_seconds: default_build_budget(),
            package_seconds: default_build_budget(),
            publish_seconds: default_build_budget(),
            deploy_seconds: default_rollout_budget(),
            verify_seconds: default_rollout_budget(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl StageBudgets {
    /// Budget for a stage
    pub fn budget_for(&self, stage: Stage) -> Duration {
        let seconds = match stage {
            Stage::Install => self.install_seconds,
            Stage::Test => self.test_seconds,
            Stage::Package => self.package_seconds,
            Stage::Publish => self.publish_seconds,
            Stage::Deploy => self.deploy_seconds,
            Stage::Verify => self.verify_seconds,
        };
        Duration::from_secs(seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Stages whose budget is zero (never satisfiable)
    pub fn zero_budgets(&self) -> Vec<Stage> {
        [
            Stage::Install,
            Stage::Test,
            Stage::Package,
            Stage::Publish,
            Stage::Deploy,
            Stage::Verify,
        ]
        .into_iter()
        .filter(|stage| self.budget_for(*stage).is_zero())
        .collect()
    }
}
