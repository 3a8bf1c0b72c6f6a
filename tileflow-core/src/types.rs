use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// UTC wall-clock timestamp.
pub type Timestamp = DateTime<Utc>;

/// Fraction of work done, clamped to [0.0, 1.0].
pub type Progress = f64;

// ─── Job payload ──────────────────────────────────────────────

/// The kinds of analysis a job can request. The executor dispatches on this;
/// the scheduler treats it as opaque.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    CellSegmentation,
    TissueMask,
}

// ─── Job state machine ────────────────────────────────────────

/// Job lifecycle states. Transitions are validated by the store:
/// PENDING→RUNNING, PENDING→CANCELLED, RUNNING→SUCCEEDED, RUNNING→FAILED.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    /// Returns true if no further transition out of this state is legal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Cancelled)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

// ─── Workflow ─────────────────────────────────────────────────

/// A workflow groups jobs for one user. Status and progress are derived from
/// the member jobs; nothing else mutates them after creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: Uuid,
    pub user_id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub progress: Progress,
    pub created_at: Timestamp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowCreate {
    pub name: String,
}

// ─── Job ──────────────────────────────────────────────────────

/// A single unit of work within a workflow. `branch_id` is the serialization
/// boundary: jobs sharing a `(user, workflow, branch)` run strictly in
/// enqueue order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: String,
    pub branch_id: String,

    pub job_type: JobType,
    pub image_path: String,
    #[serde(default)]
    pub params: HashMap<String, String>,

    pub state: JobState,
    pub progress: Progress,

    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,

    pub result_path: Option<String>,
    pub error_message: Option<String>,
}

/// Request body for enqueueing a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobCreate {
    pub workflow_id: Uuid,
    pub branch_id: String,
    pub job_type: JobType,
    pub image_path: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
}
