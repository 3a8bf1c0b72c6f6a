use crate::error::StoreError;
use crate::store::WorkflowStore;
use crate::types::{JobState, WorkflowStatus};
use uuid::Uuid;

/// Recompute a workflow's derived status and progress from its job set.
///
/// Progress is the arithmetic mean over all member jobs. Status precedence:
/// RUNNING, then FAILED, then SUCCEEDED once every job is terminal
/// (CANCELLED counts as satisfied), else PENDING. RUNNING outranking FAILED
/// keeps a workflow visibly in flight while a sibling branch still works.
pub async fn recompute_workflow(
    store: &dyn WorkflowStore,
    workflow_id: Uuid,
) -> Result<(), StoreError> {
    let mut workflow = store.get_workflow(workflow_id).await?;
    let jobs = store.list_jobs_for_workflow(workflow_id).await?;

    if jobs.is_empty() {
        workflow.status = WorkflowStatus::Pending;
        workflow.progress = 0.0;
    } else {
        workflow.progress = jobs.iter().map(|j| j.progress).sum::<f64>() / jobs.len() as f64;
        workflow.status = if jobs.iter().any(|j| j.state == JobState::Running) {
            WorkflowStatus::Running
        } else if jobs.iter().any(|j| j.state == JobState::Failed) {
            WorkflowStatus::Failed
        } else if jobs.iter().all(|j| j.state.is_terminal()) {
            WorkflowStatus::Succeeded
        } else {
            WorkflowStatus::Pending
        };
    }

    store.update_workflow(&workflow).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobStateUpdate;
    use crate::store_memory::MemoryStore;
    use crate::types::{JobCreate, JobType};
    use std::collections::HashMap;

    async fn setup(states: &[JobState]) -> (MemoryStore, Uuid) {
        let store = MemoryStore::new();
        let wf = store.create_workflow("u1", "wf").await.unwrap();
        for (idx, state) in states.iter().enumerate() {
            let job = store
                .create_job(
                    "u1",
                    JobCreate {
                        workflow_id: wf.workflow_id,
                        branch_id: format!("b{idx}"),
                        job_type: JobType::TissueMask,
                        image_path: "/slides/x.svs".to_string(),
                        params: HashMap::new(),
                    },
                )
                .await
                .unwrap();
            match state {
                JobState::Pending => {}
                JobState::Running => {
                    store
                        .set_job_state(job.job_id, JobState::Running, JobStateUpdate::default())
                        .await
                        .unwrap();
                }
                JobState::Cancelled => {
                    store
                        .set_job_state(job.job_id, JobState::Cancelled, JobStateUpdate::default())
                        .await
                        .unwrap();
                }
                terminal => {
                    store
                        .set_job_state(job.job_id, JobState::Running, JobStateUpdate::default())
                        .await
                        .unwrap();
                    store
                        .set_job_state(
                            job.job_id,
                            *terminal,
                            JobStateUpdate {
                                progress: Some(1.0),
                                ..Default::default()
                            },
                        )
                        .await
                        .unwrap();
                }
            }
        }
        (store, wf.workflow_id)
    }

    async fn rollup(states: &[JobState]) -> WorkflowStatus {
        let (store, wf_id) = setup(states).await;
        recompute_workflow(&store, wf_id).await.unwrap();
        store.get_workflow(wf_id).await.unwrap().status
    }

    #[tokio::test]
    async fn empty_workflow_stays_pending() {
        assert_eq!(rollup(&[]).await, WorkflowStatus::Pending);
    }

    #[tokio::test]
    async fn running_outranks_failed() {
        use JobState::*;
        assert_eq!(rollup(&[Failed, Running]).await, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn failed_outranks_succeeded_and_pending() {
        use JobState::*;
        assert_eq!(
            rollup(&[Succeeded, Failed, Pending]).await,
            WorkflowStatus::Failed
        );
    }

    #[tokio::test]
    async fn cancelled_counts_as_satisfied() {
        use JobState::*;
        assert_eq!(
            rollup(&[Succeeded, Cancelled]).await,
            WorkflowStatus::Succeeded
        );
        assert_eq!(rollup(&[Cancelled]).await, WorkflowStatus::Succeeded);
    }

    #[tokio::test]
    async fn pending_jobs_keep_the_workflow_pending() {
        use JobState::*;
        assert_eq!(
            rollup(&[Succeeded, Pending]).await,
            WorkflowStatus::Pending
        );
    }

    #[tokio::test]
    async fn progress_is_the_mean_over_jobs() {
        use JobState::*;
        let (store, wf_id) = setup(&[Succeeded, Pending]).await;
        recompute_workflow(&store, wf_id).await.unwrap();
        let wf = store.get_workflow(wf_id).await.unwrap();
        assert!((wf.progress - 0.5).abs() < 1e-9);
    }
}
