use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the admission gate and worker pool.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Cap on concurrently RUNNING jobs across all users.
    pub max_workers: usize,
    /// Cap on distinct users holding a RUNNING job at once.
    pub max_active_users: usize,
    /// Max dispatches per user within `user_job_rate_window`.
    pub user_job_rate_limit: usize,
    pub user_job_rate_window: Duration,
    /// Root directory for result artifacts, laid out as
    /// `<results_dir>/<user_id>/<job_id>_<suffix>`.
    pub results_dir: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_active_users: 3,
            user_job_rate_limit: 20,
            user_job_rate_window: Duration::from_secs(10),
            results_dir: PathBuf::from("./results"),
        }
    }
}

impl SchedulerConfig {
    /// Apply environment overrides (`MAX_WORKERS`, `MAX_ACTIVE_USERS`,
    /// `USER_JOB_RATE_LIMIT`, `USER_JOB_RATE_WINDOW_SECS`, `RESULTS_DIR`).
    /// A set-but-malformed value is a configuration error.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = read_env("MAX_WORKERS")? {
            cfg.max_workers = v;
        }
        if let Some(v) = read_env("MAX_ACTIVE_USERS")? {
            cfg.max_active_users = v;
        }
        if let Some(v) = read_env("USER_JOB_RATE_LIMIT")? {
            cfg.user_job_rate_limit = v;
        }
        if let Some(v) = read_env::<u64>("USER_JOB_RATE_WINDOW_SECS")? {
            cfg.user_job_rate_window = Duration::from_secs(v);
        }
        if let Ok(dir) = std::env::var("RESULTS_DIR") {
            cfg.results_dir = PathBuf::from(dir);
        }
        Ok(cfg)
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(None),
    }
}
