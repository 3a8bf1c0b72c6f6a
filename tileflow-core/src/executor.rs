use crate::store::WorkflowStore;
use crate::types::{Job, JobType};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Handed to the executor so it can stream progress without seeing the
/// store. Writes are clamped and monotonic on the store side; a failed write
/// is logged and dropped rather than aborting the job.
pub struct ProgressReporter {
    store: Arc<dyn WorkflowStore>,
    job_id: Uuid,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn WorkflowStore>, job_id: Uuid) -> Self {
        Self { store, job_id }
    }

    pub async fn report(&self, value: f64) {
        if let Err(err) = self.store.set_job_progress(self.job_id, value).await {
            tracing::warn!(job_id = %self.job_id, error = %err, "dropping progress update");
        }
    }
}

/// The pluggable workload. The scheduler only requires that `execute`
/// returns in finite time with either a result artifact path or an error,
/// and that progress reports are non-decreasing in [0, 1].
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job, progress: &ProgressReporter) -> Result<PathBuf>;
}

/// Default executor: simulates tiled whole-slide processing and writes the
/// result artifact under `results_dir/<user_id>/`. The real inference
/// pipelines live outside this service; this keeps the scheduler exercisable
/// end to end with realistic long-running, progress-reporting jobs.
pub struct TileExecutor {
    results_dir: PathBuf,
}

impl TileExecutor {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }

    async fn output_dir(&self, job: &Job) -> Result<PathBuf> {
        let dir = self.results_dir.join(&job.user_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create results dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Tiled segmentation: one JSONL record per tile, progress per tile.
    async fn run_cell_segmentation(
        &self,
        job: &Job,
        progress: &ProgressReporter,
    ) -> Result<PathBuf> {
        let tiles = param(job, "tiles", 16usize)?.max(1);
        let tile_ms = param(job, "tile_ms", 5u64)?;

        let mut lines = String::new();
        for idx in 0..tiles {
            tokio::time::sleep(Duration::from_millis(tile_ms)).await;

            let record = serde_json::json!({
                "tile": idx,
                "image_path": job.image_path,
                "cells_detected": (idx * 7 + 3) % 41,
            });
            lines.push_str(&record.to_string());
            lines.push('\n');

            progress.report((idx + 1) as f64 / tiles as f64).await;
        }

        let out_path = self
            .output_dir(job)
            .await?
            .join(format!("{}_cells.jsonl", job.job_id));
        tokio::fs::write(&out_path, lines)
            .await
            .with_context(|| format!("write {}", out_path.display()))?;
        Ok(out_path)
    }

    /// Low-resolution tissue mask: an 8x8 coverage grid.
    async fn run_tissue_mask(&self, job: &Job, progress: &ProgressReporter) -> Result<PathBuf> {
        let tile_ms = param(job, "tile_ms", 5u64)?;
        let (tiles_x, tiles_y) = (8usize, 8usize);
        let total = tiles_x * tiles_y;

        let mut mask = vec![vec![0u8; tiles_x]; tiles_y];
        for idx in 0..total {
            tokio::time::sleep(Duration::from_millis(tile_ms)).await;
            let (y, x) = (idx / tiles_x, idx % tiles_x);
            mask[y][x] = u8::from((x + y) % 3 != 0);
            progress.report((idx + 1) as f64 / total as f64).await;
        }

        let out_path = self
            .output_dir(job)
            .await?
            .join(format!("{}_tissue_mask.json", job.job_id));
        let body = serde_json::json!({
            "image_path": job.image_path,
            "width": tiles_x,
            "height": tiles_y,
            "mask": mask,
        });
        tokio::fs::write(&out_path, body.to_string())
            .await
            .with_context(|| format!("write {}", out_path.display()))?;
        Ok(out_path)
    }
}

fn param<T: std::str::FromStr>(job: &Job, key: &str, default: T) -> Result<T> {
    match job.params.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid {key} parameter: {raw:?}")),
        None => Ok(default),
    }
}

#[async_trait]
impl JobExecutor for TileExecutor {
    async fn execute(&self, job: &Job, progress: &ProgressReporter) -> Result<PathBuf> {
        match job.job_type {
            JobType::CellSegmentation => self.run_cell_segmentation(job, progress).await,
            JobType::TissueMask => self.run_tissue_mask(job, progress).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobStateUpdate;
    use crate::store_memory::MemoryStore;
    use crate::types::{JobCreate, JobState};
    use std::collections::HashMap;

    async fn running_job(store: &MemoryStore, job_type: JobType, params: HashMap<String, String>) -> Job {
        let wf = store.create_workflow("u1", "wf").await.unwrap();
        let job = store
            .create_job(
                "u1",
                JobCreate {
                    workflow_id: wf.workflow_id,
                    branch_id: "b".to_string(),
                    job_type,
                    image_path: "/slides/a.svs".to_string(),
                    params,
                },
            )
            .await
            .unwrap();
        store
            .set_job_state(job.job_id, JobState::Running, JobStateUpdate::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn segmentation_writes_one_record_per_tile() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let exec = TileExecutor::new(dir.path());

        let params = HashMap::from([
            ("tiles".to_string(), "4".to_string()),
            ("tile_ms".to_string(), "0".to_string()),
        ]);
        let job = running_job(&store, JobType::CellSegmentation, params).await;
        let reporter = ProgressReporter::new(store.clone(), job.job_id);

        let path = exec.execute(&job, &reporter).await.unwrap();
        let body = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(body.lines().count(), 4);
        assert!(path.starts_with(dir.path().join("u1")));

        let stored = store.get_job(job.job_id).await.unwrap();
        assert_eq!(stored.progress, 1.0);
    }

    #[tokio::test]
    async fn tissue_mask_writes_a_grid() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let exec = TileExecutor::new(dir.path());

        let params = HashMap::from([("tile_ms".to_string(), "0".to_string())]);
        let job = running_job(&store, JobType::TissueMask, params).await;
        let reporter = ProgressReporter::new(store.clone(), job.job_id);

        let path = exec.execute(&job, &reporter).await.unwrap();
        let body: serde_json::Value =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(body["width"], 8);
        assert_eq!(body["mask"].as_array().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn malformed_params_fail_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let exec = TileExecutor::new(dir.path());

        let params = HashMap::from([("tiles".to_string(), "not-a-number".to_string())]);
        let job = running_job(&store, JobType::CellSegmentation, params).await;
        let reporter = ProgressReporter::new(store.clone(), job.job_id);

        let err = exec.execute(&job, &reporter).await.unwrap_err();
        assert!(err.to_string().contains("tiles"));
    }
}
