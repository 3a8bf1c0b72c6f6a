use crate::error::StoreError;
use crate::store::{JobStateUpdate, WorkflowStore};
use crate::types::{Job, JobCreate, JobState, Workflow, WorkflowStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

struct Inner {
    workflows: HashMap<Uuid, Workflow>,
    jobs: HashMap<Uuid, Job>,
    /// workflow_id → job ids in enqueue order.
    workflow_jobs: HashMap<Uuid, Vec<Uuid>>,
}

/// In-memory implementation of `WorkflowStore`. The single write lock makes
/// every operation serializable; nothing async happens while it is held.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                workflows: HashMap::new(),
                jobs: HashMap::new(),
                workflow_jobs: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    // ── Workflows ──

    async fn create_workflow(&self, user_id: &str, name: &str) -> Result<Workflow, StoreError> {
        let wf = Workflow {
            workflow_id: Uuid::now_v7(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            status: WorkflowStatus::Pending,
            progress: 0.0,
            created_at: Utc::now(),
        };
        let mut w = self.inner.write().await;
        w.workflows.insert(wf.workflow_id, wf.clone());
        w.workflow_jobs.entry(wf.workflow_id).or_default();
        Ok(wf)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, StoreError> {
        let r = self.inner.read().await;
        r.workflows
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(id))
    }

    async fn list_workflows_for_user(&self, user_id: &str) -> Result<Vec<Workflow>, StoreError> {
        let r = self.inner.read().await;
        let mut out: Vec<Workflow> = r
            .workflows
            .values()
            .filter(|wf| wf.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|wf| wf.created_at);
        Ok(out)
    }

    async fn update_workflow(&self, wf: &Workflow) -> Result<(), StoreError> {
        let mut w = self.inner.write().await;
        let existing = w
            .workflows
            .get_mut(&wf.workflow_id)
            .ok_or(StoreError::WorkflowNotFound(wf.workflow_id))?;
        existing.status = wf.status;
        existing.progress = wf.progress;
        Ok(())
    }

    // ── Jobs ──

    async fn create_job(&self, user_id: &str, req: JobCreate) -> Result<Job, StoreError> {
        let mut w = self.inner.write().await;
        let owned = w
            .workflows
            .get(&req.workflow_id)
            .map(|wf| wf.user_id == user_id)
            .unwrap_or(false);
        if !owned {
            return Err(StoreError::WorkflowNotFound(req.workflow_id));
        }

        let job = Job {
            job_id: Uuid::now_v7(),
            workflow_id: req.workflow_id,
            user_id: user_id.to_string(),
            branch_id: req.branch_id,
            job_type: req.job_type,
            image_path: req.image_path,
            params: req.params,
            state: JobState::Pending,
            progress: 0.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result_path: None,
            error_message: None,
        };
        w.jobs.insert(job.job_id, job.clone());
        w.workflow_jobs
            .entry(job.workflow_id)
            .or_default()
            .push(job.job_id);
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Job, StoreError> {
        let r = self.inner.read().await;
        r.jobs.get(&id).cloned().ok_or(StoreError::JobNotFound(id))
    }

    async fn list_jobs_for_workflow(&self, workflow_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let r = self.inner.read().await;
        let ids = r
            .workflow_jobs
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        Ok(ids.iter().filter_map(|id| r.jobs.get(id).cloned()).collect())
    }

    async fn set_job_state(
        &self,
        id: Uuid,
        next: JobState,
        update: JobStateUpdate,
    ) -> Result<Job, StoreError> {
        let mut w = self.inner.write().await;
        let job = w.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if !job.state.can_transition_to(next) {
            return Err(StoreError::IllegalTransition {
                from: job.state,
                to: next,
            });
        }

        job.state = next;
        if let Some(p) = update.progress {
            job.progress = p.clamp(0.0, 1.0);
        }
        if let Some(t) = update.started_at {
            job.started_at = Some(t);
        }
        if let Some(t) = update.completed_at {
            job.completed_at = Some(t);
        }
        if let Some(msg) = update.error_message {
            job.error_message = Some(msg);
        }
        if let Some(path) = update.result_path {
            job.result_path = Some(path);
        }
        Ok(job.clone())
    }

    async fn set_job_progress(&self, id: Uuid, value: f64) -> Result<(), StoreError> {
        let mut w = self.inner.write().await;
        let job = w.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if job.state == JobState::Running {
            job.progress = job.progress.max(value.clamp(0.0, 1.0));
        }
        Ok(())
    }
}
