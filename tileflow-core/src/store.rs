use crate::error::StoreError;
use crate::types::{Job, JobCreate, JobState, Timestamp, Workflow};
use async_trait::async_trait;
use uuid::Uuid;

/// Field patch applied together with a state transition. Only the fields the
/// transition needs are set; everything else is left untouched.
#[derive(Clone, Debug, Default)]
pub struct JobStateUpdate {
    pub progress: Option<f64>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub error_message: Option<String>,
    pub result_path: Option<String>,
}

/// Persistence seam for workflows and jobs.
///
/// Every operation is atomic with respect to every other. The scheduler and
/// the HTTP layer operate exclusively through this trait; the in-memory
/// implementation is the reference, a durable backend must preserve the
/// atomicity of `set_job_state` and the insertion order of
/// `list_jobs_for_workflow`.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    // ── Workflows ──

    async fn create_workflow(&self, user_id: &str, name: &str) -> Result<Workflow, StoreError>;
    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError>;
    async fn list_workflows_for_user(&self, user_id: &str) -> Result<Vec<Workflow>, StoreError>;
    /// Replace the derived fields (status, progress) of an existing workflow.
    async fn update_workflow(&self, wf: &Workflow) -> Result<(), StoreError>;

    // ── Jobs ──

    /// Create a PENDING job and append it to its workflow's ordered job
    /// list. Fails with `WorkflowNotFound` if the workflow does not exist or
    /// belongs to a different user.
    async fn create_job(&self, user_id: &str, req: JobCreate) -> Result<Job, StoreError>;
    async fn get_job(&self, id: Uuid) -> Result<Job, StoreError>;
    /// All jobs of a workflow, in enqueue order.
    async fn list_jobs_for_workflow(&self, workflow_id: Uuid) -> Result<Vec<Job>, StoreError>;

    /// Transition a job and apply the field patch in one atomic step.
    /// Rejects transitions outside the lifecycle DAG without mutating
    /// anything. Returns the updated job.
    async fn set_job_state(
        &self,
        id: Uuid,
        next: JobState,
        update: JobStateUpdate,
    ) -> Result<Job, StoreError>;

    /// Streamed progress write for a RUNNING job: clamped to [0, 1] and
    /// monotonic non-decreasing. A write against a job that is no longer
    /// RUNNING is dropped, keeping terminal progress frozen.
    async fn set_job_progress(&self, id: Uuid, value: f64) -> Result<(), StoreError>;
}
