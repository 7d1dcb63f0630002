//! Directory layout and per-job configuration, resolved once from the
//! environment and command-line overrides.

use crate::catalog::JobSpec;
use crate::session::partition::parse_worker_id;
use crate::session::{JobConfig, RatePolicy, ResumePolicy, DEFAULT_WORKERS};
use crate::util::env::{env_opt, env_parse, env_parse_opt};
use std::path::{Path, PathBuf};

/// `data/{raw,staging,error_logs}` next to a `config/` directory holding `sessions.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestPaths {
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
}

impl HarvestPaths {
    pub fn new(data_dir: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            config_dir: config_dir.into(),
        }
    }

    /// `HARVEST_DATA_DIR` (default `./data`) and `HARVEST_CONFIG_DIR` (default `./config`).
    pub fn from_env() -> Self {
        Self::new(
            env_opt("HARVEST_DATA_DIR").unwrap_or_else(|| "data".to_string()),
            env_opt("HARVEST_CONFIG_DIR").unwrap_or_else(|| "config".to_string()),
        )
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn raw(&self, name: &str) -> PathBuf {
        self.raw_dir().join(name)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn error_log(&self, job: &str) -> PathBuf {
        self.data_dir.join("error_logs").join(format!("{job}_errors.jsonl"))
    }

    pub fn session_file(&self) -> PathBuf {
        self.config_dir.join("sessions.json")
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

/// Command-line overrides; `None` falls back to the environment, then the job's defaults.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub worker: Option<u32>,
    pub workers: Option<u32>,
    pub restart: bool,
    pub overwrite: bool,
    pub range: Option<(i64, i64)>,
    pub remote: bool,
    pub delay_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
}

/// Session key of a job: the job name, suffixed `-w<id>` for a sharded worker.
pub fn session_key(job: &str, worker: Option<u32>) -> String {
    match worker {
        Some(w) => format!("{job}-w{w}"),
        None => job.to_string(),
    }
}

/// Worker count and identifier: CLI first, then `HARVEST_WORKERS` / `HARVEST_WORKER_ID`.
pub fn resolve_worker(opts: &RunOptions) -> anyhow::Result<(Option<u32>, u32)> {
    let workers = opts
        .workers
        .unwrap_or_else(|| env_parse("HARVEST_WORKERS", DEFAULT_WORKERS));
    if workers == 0 {
        anyhow::bail!("worker count must be at least 1");
    }
    let worker = match opts.worker {
        Some(w) => Some(parse_worker_id(&w.to_string(), workers)?),
        None => match env_opt("HARVEST_WORKER_ID") {
            Some(raw) => Some(parse_worker_id(&raw, workers)?),
            None => None,
        },
    };
    Ok((worker, workers))
}

pub fn job_config(spec: &JobSpec, paths: &HarvestPaths, opts: &RunOptions) -> anyhow::Result<JobConfig> {
    let (worker, workers) = resolve_worker(opts)?;
    let job_name = session_key(spec.name, worker);

    let delay_ms = opts
        .delay_ms
        .or_else(|| env_parse_opt("HARVEST_DELAY_MS"))
        .unwrap_or(spec.delay_ms);
    let jitter_ms = opts
        .jitter_ms
        .or_else(|| env_parse_opt("HARVEST_JITTER_MS"))
        .unwrap_or(spec.jitter_ms);

    Ok(JobConfig {
        sources: spec.sources.iter().map(|name| paths.raw(name)).collect(),
        dataset: paths.raw(spec.dataset),
        staging_dir: paths.staging_dir(),
        error_log: paths.error_log(&job_name),
        session_file: paths.session_file(),
        worker,
        workers,
        manual_range: opts.range,
        resume: if opts.restart {
            ResumePolicy::Restart
        } else {
            ResumePolicy::Resume
        },
        overwrite: opts.overwrite,
        remote: opts.remote,
        rate: RatePolicy::from_millis(delay_ms, jitter_ms),
        job_name,
    })
}
