//! Run state and reconstruction from events.
//!
//! A Run represents a single execution of the pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::events::{Event, EventType, StageStatus};
use super::outcome::Stage;
use super::service::RevisionRange;

/// A pipeline execution run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Name of the pipeline being executed
    pub pipeline_name: String,

    /// Resolved revision range (once detection succeeded)
    pub range: Option<RevisionRange>,

    /// Build identifier used for image tags
    pub build_id: Option<String>,

    /// Services in the change set
    pub changed_services: Vec<String>,

    /// Current state of the run
    pub state: RunState,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run completed (if applicable)
    pub completed_at: Option<DateTime<Utc>>,

    /// Latest status of each stage per service
    pub service_statuses: BTreeMap<String, BTreeMap<Stage, StageStatus>>,

    /// Cleanup hooks that reported back (success or failure)
    pub cleanup_events: usize,
}

impl Run {
    /// Create a new run for a pipeline
    pub fn new(id: Uuid, pipeline_name: String) -> Self {
        Self {
            id,
            pipeline_name,
            range: None,
            build_id: None,
            changed_services: Vec::new(),
            state: RunState::Running,
            started_at: Utc::now(),
            completed_at: None,
            service_statuses: BTreeMap::new(),
            cleanup_events: 0,
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut run = Self::new(first_event.run_id, String::new());
        run.started_at = first_event.timestamp;

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
                if let Some(name) = data_str(event, "pipeline") {
                    self.pipeline_name = name;
                }
            }
            EventType::ChangesDetected => {
                self.apply_range(event);
                self.build_id = data_str(event, "build_id");
                self.changed_services = event
                    .data
                    .as_ref()
                    .and_then(|d| d.get("services"))
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
            }
            EventType::NothingChanged => {
                self.apply_range(event);
                self.changed_services.clear();
            }
            EventType::StageStarted
            | EventType::StageCompleted
            | EventType::StageSkipped
            | EventType::StageFailed
            | EventType::StageTimedOut
            | EventType::StageRetrying => {
                if let (Some(service), Some(stage)) = (&event.service, event.stage) {
                    self.service_statuses
                        .entry(service.clone())
                        .or_default()
                        .insert(stage, event.status);
                }
            }
            EventType::RunCompleted => {
                self.state = if self.changed_services.is_empty() {
                    RunState::NothingChanged
                } else {
                    RunState::Completed
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                self.state = RunState::Failed {
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::CleanupCompleted | EventType::CleanupFailed => {
                self.cleanup_events += 1;
            }
        }
    }

    fn apply_range(&mut self, event: &Event) {
        if let (Some(previous), Some(current)) =
            (data_str(event, "previous"), data_str(event, "current"))
        {
            self.range = Some(RevisionRange::new(previous, current));
        }
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }

    /// Check if the run ended successfully (including no-op runs)
    pub fn is_successful(&self) -> bool {
        matches!(self.state, RunState::Completed | RunState::NothingChanged)
    }

    /// Latest recorded status of a service's stage
    pub fn stage_status(&self, service: &str, stage: Stage) -> Option<StageStatus> {
        self.service_statuses
            .get(service)
            .and_then(|stages| stages.get(&stage))
            .copied()
    }
}

fn data_str(event: &Event, key: &str) -> Option<String> {
    event
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// State of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Currently executing
    Running,

    /// Finished without any changed service
    NothingChanged,

    /// Every changed service ended healthy
    Completed,

    /// A branch failed or the run was aborted
    Failed { error: String },
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running
    }
}

impl RunState {
    pub fn label(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::NothingChanged => "no-op",
            RunState::Completed => "completed",
            RunState::Failed { .. } => "failed",
        }
    }
}
