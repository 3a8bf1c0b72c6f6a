//! The admission and dispatch engine.
//!
//! A single dispatcher task converts PENDING jobs to RUNNING whenever the
//! admission gate allows, workers execute them on a bounded pool, and every
//! completion, cancellation, or enqueue wakes the dispatcher through one
//! level-triggered event. All concurrency bookkeeping lives behind one
//! scheduler mutex; job and workflow records live behind the store. The two
//! locks are only ever taken in that order.

use crate::branch_queue::{BranchKey, BranchQueueSet};
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::executor::{JobExecutor, ProgressReporter};
use crate::progress::recompute_workflow;
use crate::rate_limit::RateLimiter;
use crate::store::{JobStateUpdate, WorkflowStore};
use crate::types::{Job, JobCreate, JobState, Workflow, WorkflowStatus};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

/// Bookkeeping guarded by the scheduler mutex. The gate reads all of it in
/// one critical section, so the four admission predicates are evaluated
/// against a consistent snapshot.
struct SchedState {
    queues: BranchQueueSet,
    running_count: usize,
    /// `(user_id, branch_id)` pairs with a RUNNING job. Branch exclusion is
    /// per user across workflows, matching the queue discipline's intent of
    /// serializing a tenant's branch.
    running_branches: HashSet<(String, String)>,
    /// Users currently holding a fairness slot. A user keeps the slot while
    /// it has RUNNING jobs, and also while drained-but-still-queued, so a
    /// tenant's branch pipeline is not preempted between its own jobs.
    active_users: HashSet<String>,
    running_by_user: HashMap<String, usize>,
    limiter: RateLimiter,
}

struct SchedulerInner {
    config: SchedulerConfig,
    store: Arc<dyn WorkflowStore>,
    executor: Arc<dyn JobExecutor>,
    state: Mutex<SchedState>,
    /// Level-triggered dispatcher wake-up: `notify_one` stores a permit when
    /// nobody is waiting, so a wake that races a dispatch pass is not lost.
    event: Notify,
    worker_slots: Arc<Semaphore>,
    stopping: AtomicBool,
}

/// Outcome of considering one head-of-branch candidate.
enum Admission {
    Admitted,
    /// Gate said no. Carries the rate-limit retry delay when (R) was the
    /// blocking predicate and a slot will free up on its own.
    Blocked(Option<Duration>),
    /// Candidate was stale or vanished; nothing to wait for.
    Skipped,
}

/// Multi-tenant workflow job scheduler: per-branch FIFO, bounded distinct
/// active users, a global worker cap, and per-user dispatch rate limiting.
///
/// One instance owns its store, executor, dispatcher task, and worker pool;
/// several instances can coexist (tests run many side by side). The HTTP
/// layer delegates to the public methods here.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn WorkflowStore>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        let limiter = RateLimiter::new(config.user_job_rate_limit, config.user_job_rate_window);
        let worker_slots = Arc::new(Semaphore::new(config.max_workers));
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                store,
                executor,
                state: Mutex::new(SchedState {
                    queues: BranchQueueSet::new(),
                    running_count: 0,
                    running_branches: HashSet::new(),
                    active_users: HashSet::new(),
                    running_by_user: HashMap::new(),
                    limiter,
                }),
                event: Notify::new(),
                worker_slots,
                stopping: AtomicBool::new(false),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn store(&self) -> Arc<dyn WorkflowStore> {
        self.inner.store.clone()
    }

    // ── Lifecycle ──

    /// Spawn the dispatcher task. Idempotent; calling after `stop` begins a
    /// fresh lifecycle over the surviving store.
    pub async fn start(&self) {
        let mut guard = self.dispatcher.lock().await;
        if guard.is_some() {
            return;
        }
        self.inner.stopping.store(false, Ordering::SeqCst);
        *guard = Some(tokio::spawn(dispatcher_loop(self.inner.clone())));
        tracing::info!("scheduler started ({} worker slots)", self.inner.config.max_workers);
    }

    /// Reject new work, wake the dispatcher so it can observe the stop flag,
    /// and wait for it and all outstanding workers to finish. The store
    /// survives for inspection.
    pub async fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.event.notify_one();
        let handle = self.dispatcher.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!("dispatcher task join failed: {err}");
            }
        }
        tracing::info!("scheduler stopped");
    }

    // ── Workflows ──

    pub async fn create_workflow(
        &self,
        user_id: &str,
        name: &str,
    ) -> Result<Workflow, SchedulerError> {
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }
        Ok(self.inner.store.create_workflow(user_id, name).await?)
    }

    pub async fn list_workflows(&self, user_id: &str) -> Result<Vec<Workflow>, SchedulerError> {
        Ok(self.inner.store.list_workflows_for_user(user_id).await?)
    }

    /// Jobs of one workflow in enqueue order; `NotFound` when the workflow
    /// does not exist or belongs to someone else.
    pub async fn list_jobs(
        &self,
        user_id: &str,
        workflow_id: Uuid,
    ) -> Result<Vec<Job>, SchedulerError> {
        let wf = self.inner.store.get_workflow(workflow_id).await?;
        if wf.user_id != user_id {
            return Err(crate::error::StoreError::WorkflowNotFound(workflow_id).into());
        }
        Ok(self.inner.store.list_jobs_for_workflow(workflow_id).await?)
    }

    // ── Jobs ──

    /// Create a PENDING job, append it to its branch queue, and wake the
    /// dispatcher. Admission happens asynchronously; the caller gets the
    /// PENDING record back immediately.
    pub async fn enqueue_job(
        &self,
        user_id: &str,
        payload: JobCreate,
    ) -> Result<Job, SchedulerError> {
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }

        let job = self.inner.store.create_job(user_id, payload).await?;
        let key = BranchKey::new(&job.user_id, job.workflow_id, &job.branch_id);
        {
            let mut st = self.inner.state.lock().await;
            st.queues.append(key, job.job_id);
        }
        self.inner.event.notify_one();
        tracing::info!(
            "enqueued job {} (user {}, branch {})",
            job.job_id,
            job.user_id,
            job.branch_id
        );
        Ok(job)
    }

    pub async fn get_job(&self, user_id: &str, job_id: Uuid) -> Result<Job, SchedulerError> {
        let job = self.inner.store.get_job(job_id).await?;
        if job.user_id != user_id {
            return Err(crate::error::StoreError::JobNotFound(job_id).into());
        }
        Ok(job)
    }

    /// Cancel a PENDING job. Cancelling anything past PENDING is an
    /// idempotent no-op that returns the job unchanged; RUNNING jobs are not
    /// preemptible.
    pub async fn cancel_job(&self, user_id: &str, job_id: Uuid) -> Result<Job, SchedulerError> {
        let (cancelled, was_head) = {
            let mut st = self.inner.state.lock().await;

            let job = self.inner.store.get_job(job_id).await?;
            if job.user_id != user_id {
                return Err(crate::error::StoreError::JobNotFound(job_id).into());
            }
            if job.state != JobState::Pending {
                return Ok(job);
            }

            let cancelled = self
                .inner
                .store
                .set_job_state(
                    job_id,
                    JobState::Cancelled,
                    JobStateUpdate {
                        progress: Some(0.0),
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;

            let key = BranchKey::new(&job.user_id, job.workflow_id, &job.branch_id);
            let was_head = st.queues.remove_if_present(&key, job_id);

            // A user with nothing running and nothing queued no longer needs
            // its fairness slot.
            if st.running_by_user.get(&job.user_id).copied().unwrap_or(0) == 0
                && !st.queues.user_has_entries(&job.user_id)
            {
                st.active_users.remove(&job.user_id);
            }

            (cancelled, was_head)
        };

        if was_head == Some(true) {
            self.inner.event.notify_one();
        }
        recompute_workflow(self.inner.store.as_ref(), cancelled.workflow_id).await?;

        tracing::info!("cancelled job {} (user {})", job_id, user_id);
        Ok(cancelled)
    }
}

// ── Dispatcher ──

async fn dispatcher_loop(inner: Arc<SchedulerInner>) {
    let mut workers: JoinSet<()> = JoinSet::new();

    loop {
        while workers.try_join_next().is_some() {}
        if inner.stopping.load(Ordering::SeqCst) {
            break;
        }

        let (admitted, retry_after) = dispatch_pass(&inner, &mut workers).await;
        if admitted > 0 {
            // A freed or newly filled slot may admit a further head.
            continue;
        }

        match retry_after {
            Some(delay) => {
                tokio::select! {
                    _ = inner.event.notified() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => inner.event.notified().await,
        }
    }

    while workers.join_next().await.is_some() {}
}

/// One pass over every branch head. Returns how many jobs were admitted and,
/// when some candidate was rate-limited, the shortest delay after which one
/// of them becomes admissible again.
async fn dispatch_pass(
    inner: &Arc<SchedulerInner>,
    workers: &mut JoinSet<()>,
) -> (usize, Option<Duration>) {
    let heads: Vec<(BranchKey, Uuid)> = {
        let st = inner.state.lock().await;
        st.queues
            .head_candidates()
            .map(|(key, id)| (key.clone(), id))
            .collect()
    };

    let mut admitted = 0;
    let mut retry_after: Option<Duration> = None;
    for (key, job_id) in heads {
        if inner.stopping.load(Ordering::SeqCst) {
            break;
        }
        match try_admit_head(inner, workers, &key, job_id).await {
            Admission::Admitted => admitted += 1,
            Admission::Blocked(Some(delay)) => {
                retry_after = Some(retry_after.map_or(delay, |d| d.min(delay)));
            }
            Admission::Blocked(None) | Admission::Skipped => {}
        }
    }
    (admitted, retry_after)
}

/// Evaluate the admission gate for one candidate and, if it passes, commit
/// the PENDING→RUNNING transition and spawn its worker. The whole decision
/// runs under the scheduler mutex so the gate's predicates cannot be
/// invalidated between check and commit.
async fn try_admit_head(
    inner: &Arc<SchedulerInner>,
    workers: &mut JoinSet<()>,
    key: &BranchKey,
    job_id: Uuid,
) -> Admission {
    let cfg = &inner.config;
    let mut st = inner.state.lock().await;

    let job = match inner.store.get_job(job_id).await {
        Ok(job) => job,
        Err(_) => {
            st.queues.remove_if_present(key, job_id);
            return Admission::Skipped;
        }
    };
    match job.state {
        JobState::Pending => {}
        // The branch's current occupant; popped by its worker on completion.
        JobState::Running => return Admission::Skipped,
        _ => {
            st.queues.remove_if_present(key, job_id);
            return Admission::Skipped;
        }
    }

    // Worker capacity, active-user cap, branch exclusion. Checked before the
    // rate limiter because admitting records a rate-limit slot.
    if st.running_count >= cfg.max_workers {
        return Admission::Blocked(None);
    }
    if !st.active_users.contains(&job.user_id) && st.active_users.len() >= cfg.max_active_users {
        return Admission::Blocked(None);
    }
    let branch_pair = (job.user_id.clone(), job.branch_id.clone());
    if st.running_branches.contains(&branch_pair) {
        return Admission::Blocked(None);
    }

    let now = tokio::time::Instant::now();
    if !st.limiter.try_admit(&job.user_id, now) {
        tracing::debug!("job {} rate limited (user {})", job.job_id, job.user_id);
        return Admission::Blocked(st.limiter.retry_after(&job.user_id, now));
    }

    // (W) already held, so a permit is available.
    let permit = match inner.worker_slots.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => return Admission::Blocked(None),
    };

    let job = match inner
        .store
        .set_job_state(
            job_id,
            JobState::Running,
            JobStateUpdate {
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
    {
        Ok(job) => job,
        Err(err) => {
            tracing::error!("failed to start job {job_id}: {err}");
            st.queues.remove_if_present(key, job_id);
            return Admission::Skipped;
        }
    };

    st.running_count += 1;
    st.running_branches.insert(branch_pair);
    st.active_users.insert(job.user_id.clone());
    *st.running_by_user.entry(job.user_id.clone()).or_insert(0) += 1;
    drop(st);

    if let Ok(mut wf) = inner.store.get_workflow(job.workflow_id).await {
        if wf.status == WorkflowStatus::Pending {
            wf.status = WorkflowStatus::Running;
            if let Err(err) = inner.store.update_workflow(&wf).await {
                tracing::error!("failed to mark workflow {} running: {err}", wf.workflow_id);
            }
        }
    }

    tracing::info!(
        "dispatched job {} (user {}, branch {})",
        job.job_id,
        job.user_id,
        job.branch_id
    );

    workers.spawn(run_worker(inner.clone(), permit, job, key.clone()));
    Admission::Admitted
}

// ── Worker ──

/// Execute one admitted job and release everything it held. The executor
/// runs in its own task so that a panic inside it surfaces as a join error
/// here; the bookkeeping release below runs on every path.
async fn run_worker(
    inner: Arc<SchedulerInner>,
    permit: OwnedSemaphorePermit,
    job: Job,
    key: BranchKey,
) {
    let outcome = {
        let store = inner.store.clone();
        let executor = inner.executor.clone();
        let job = job.clone();
        tokio::spawn(async move {
            let reporter = ProgressReporter::new(store, job.job_id);
            executor.execute(&job, &reporter).await
        })
        .await
    };

    let completed_at = Some(Utc::now());
    let record = match outcome {
        Ok(Ok(result_path)) => {
            inner
                .store
                .set_job_state(
                    job.job_id,
                    JobState::Succeeded,
                    JobStateUpdate {
                        progress: Some(1.0),
                        completed_at,
                        result_path: Some(result_path.to_string_lossy().into_owned()),
                        ..Default::default()
                    },
                )
                .await
        }
        Ok(Err(err)) => {
            tracing::warn!("job {} failed: {err:#}", job.job_id);
            inner
                .store
                .set_job_state(
                    job.job_id,
                    JobState::Failed,
                    JobStateUpdate {
                        error_message: Some(format!("{err:#}")),
                        completed_at,
                        ..Default::default()
                    },
                )
                .await
        }
        Err(join_err) => {
            tracing::error!("executor task for job {} died: {join_err}", job.job_id);
            inner
                .store
                .set_job_state(
                    job.job_id,
                    JobState::Failed,
                    JobStateUpdate {
                        error_message: Some(format!("executor task died: {join_err}")),
                        completed_at,
                        ..Default::default()
                    },
                )
                .await
        }
    };
    if let Err(err) = record {
        tracing::error!("failed to record terminal state for job {}: {err}", job.job_id);
    }

    {
        let mut st = inner.state.lock().await;

        let popped = st.queues.pop_head(&key);
        if popped != Some(job.job_id) {
            tracing::error!("branch head mismatch while releasing job {}", job.job_id);
        }

        st.running_count = st.running_count.saturating_sub(1);
        st.running_branches
            .remove(&(job.user_id.clone(), job.branch_id.clone()));

        match st.running_by_user.get_mut(&job.user_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                st.running_by_user.remove(&job.user_id);
                // The fairness slot is released only once the tenant has
                // fully drained; queued work keeps the slot reserved.
                if !st.queues.user_has_entries(&job.user_id) {
                    st.active_users.remove(&job.user_id);
                }
            }
            None => {}
        }
    }

    if let Err(err) = recompute_workflow(inner.store.as_ref(), job.workflow_id).await {
        tracing::error!("workflow rollup failed for {}: {err}", job.workflow_id);
    }

    drop(permit);
    inner.event.notify_one();
}
