//! Event types for the run log.
//!
//! All state changes of a pipeline run are recorded as immutable events in an
//! append-only log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::outcome::Stage;

/// A single event in the append-only run log.
///
/// Events are the source of truth for run history. The state of any run can
/// be reconstructed by replaying its events in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Service branch (if applicable)
    pub service: Option<String>,

    /// Stage within the branch (if applicable)
    pub stage: Option<Stage>,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key format: "{run_id}:{stage}:{service}:{input_hash}"
    pub idempotency_key: String,

    /// Human-readable summary (NO secrets)
    pub payload_summary: String,

    /// Status of the stage/run
    pub status: StageStatus,

    /// Time taken in milliseconds (for finished stages)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,

    /// Structured payload (revision range, change set, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
        status: StageStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            service: None,
            stage: None,
            event_type,
            idempotency_key,
            payload_summary,
            status,
            duration_ms: None,
            error: None,
            data: None,
        }
    }

    /// Scope the event to a service stage
    pub fn for_stage(mut self, service: impl Into<String>, stage: Stage) -> Self {
        self.service = Some(service.into());
        self.stage = Some(stage);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Types of events that can occur during a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// Change detection found services to process
    ChangesDetected,

    /// Change detection found nothing to do
    NothingChanged,

    /// A stage started for a service
    StageStarted,

    /// A stage completed for a service
    StageCompleted,

    /// A stage did not apply to a service
    StageSkipped,

    /// A stage failed for a service
    StageFailed,

    /// A stage exceeded its time budget
    StageTimedOut,

    /// A stage is being retried after failure
    StageRetrying,

    /// All branches finished healthy
    RunCompleted,

    /// At least one branch failed, or the run was aborted
    RunFailed,

    /// A cleanup hook finished
    CleanupCompleted,

    /// A cleanup hook failed (never fails the run)
    CleanupFailed,
}

/// Status of a stage or run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not yet started
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully
    Completed,

    /// Failed (with error)
    Failed,

    /// Did not apply
    Skipped,

    /// Exceeded its time budget
    TimedOut,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}
