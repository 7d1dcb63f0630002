//! One job invocation end to end: work source, session resume or restart,
//! overwrite, crash recovery, the extraction loop and a finalize that runs
//! however the loop ends.

use super::dataset::{ConsolidatedDataset, MergeReport};
use super::error::{ExtractError, SessionError, SessionResult};
use super::error_log::ErrorLog;
use super::finalize::Finalizer;
use super::partition::{self, Partition};
use super::staging::StagingSink;
use super::state::SessionState;
use super::store::SessionStore;
use super::tracker::{LoopExit, ProgressTracker, RatePolicy, StopSignal};
use super::work::WorkSource;
use crate::extract::Extractor;
use crate::remote::RemoteSync;
use crate::util::fs::basename;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// What to do with a session already stored for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumePolicy {
    #[default]
    Resume,
    /// Plan a new range and overwrite the stored one.
    Restart,
}

/// Everything one invocation needs, built once and never mutated.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Session key and staging file prefix; unique per concurrent worker.
    pub job_name: String,
    pub sources: Vec<PathBuf>,
    pub dataset: PathBuf,
    pub staging_dir: PathBuf,
    pub error_log: PathBuf,
    pub session_file: PathBuf,
    pub worker: Option<u32>,
    pub workers: u32,
    /// Explicit `[start, end]`; always starts a new session.
    pub manual_range: Option<(i64, i64)>,
    pub resume: ResumePolicy,
    /// Erase the dataset (and its remote mirror) before the first staging write.
    pub overwrite: bool,
    pub remote: bool,
    pub rate: RatePolicy,
}

impl JobConfig {
    pub fn store(&self) -> SessionStore {
        SessionStore::new(&self.session_file)
    }

    pub fn error_log(&self) -> ErrorLog {
        ErrorLog::new(&self.error_log)
    }

    pub fn consolidated(&self) -> SessionResult<ConsolidatedDataset> {
        ConsolidatedDataset::new(&self.dataset)
    }

    pub fn staging_for(&self, partition: Partition) -> StagingSink {
        StagingSink::for_partition(&self.staging_dir, &self.job_name, partition)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Exhausted,
    Pending,
}

impl RunStatus {
    fn of(state: &SessionState) -> Self {
        if state.is_exhausted() {
            RunStatus::Exhausted
        } else {
            RunStatus::Pending
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Exhausted => f.write_str("partition exhausted"),
            RunStatus::Pending => f.write_str("partition still pending, resume later"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub job: String,
    pub state: SessionState,
    pub status: RunStatus,
    /// `None` when the partition had nothing pending and the loop never ran.
    pub exit: Option<LoopExit>,
    pub attempted: usize,
    pub produced: usize,
    pub failed: usize,
    pub recovered: Option<MergeReport>,
    pub merge: MergeReport,
    pub uploaded: bool,
}

pub struct SessionRunner {
    config: JobConfig,
    remote: Option<Box<dyn RemoteSync>>,
}

impl SessionRunner {
    pub fn new(config: JobConfig) -> Self {
        Self {
            config,
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: Box<dyn RemoteSync>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    fn remote(&self) -> SessionResult<Option<&dyn RemoteSync>> {
        if !self.config.remote {
            return Ok(None);
        }
        match self.remote.as_deref() {
            Some(remote) => Ok(Some(remote)),
            None => Err(SessionError::invalid_state(
                &self.config.job_name,
                "remote mode requested but no remote backend is configured",
            )),
        }
    }

    /// Fetch missing source files from the remote, then load them.
    pub async fn load_source(&self) -> SessionResult<WorkSource> {
        if let Some(remote) = self.remote()? {
            for path in &self.config.sources {
                if path.is_file() {
                    continue;
                }
                let name = basename(path);
                if remote.download(&name, path).await {
                    info!(target: "remote", %name, "work source fetched");
                }
            }
        }
        WorkSource::load(&self.config.sources)
    }

    /// Stored session (resume) or a newly planned one, persisted before any work.
    pub fn open_session(&self, store: &SessionStore, len: usize) -> SessionResult<SessionState> {
        let cfg = &self.config;
        let job = cfg.job_name.as_str();
        let restart = cfg.resume == ResumePolicy::Restart || cfg.manual_range.is_some();

        if !restart {
            if let Some(state) = store.read(job)? {
                if !state.partition().is_empty() && state.end_idx >= len as i64 {
                    return Err(SessionError::invalid_state(
                        job,
                        format!(
                            "stored range {state} exceeds the work list of {len} items; run with --restart"
                        ),
                    ));
                }
                info!(target: "session", job, %state, phase = %state.phase(), "resuming session");
                return Ok(state);
            }
        }

        let planned = match cfg.manual_range {
            Some((start, end)) => partition::manual(len, start, end)?,
            None => partition::plan(len, cfg.worker, cfg.workers)?,
        };
        let state = SessionState::fresh(planned);
        store.write(job, state)?;
        info!(target: "session", job, %state, worker = ?cfg.worker, workers = cfg.workers, "new session");
        Ok(state)
    }

    /// Erase the dataset, its mirror and any leftover staging file.
    async fn apply_overwrite(
        &self,
        dataset: &ConsolidatedDataset,
        staging: &mut StagingSink,
    ) -> SessionResult<()> {
        // remote first: a mirror that survives would be fetched back at finalize
        if let Some(remote) = self.remote()? {
            let name = basename(dataset.path());
            if remote.erase(&name).await {
                warn!(target: "remote", %name, "overwrite: remote dataset erased");
            } else {
                match remote.lookup(&name).await {
                    Ok(false) => {}
                    Ok(true) => {
                        return Err(SessionError::Remote {
                            name,
                            detail: "overwrite: remote dataset could not be erased".to_string(),
                        })
                    }
                    Err(detail) => {
                        return Err(SessionError::Remote {
                            name,
                            detail: format!("overwrite: remote dataset state unknown ({detail})"),
                        })
                    }
                }
            }
        }
        if dataset.erase()? {
            warn!(target: "session", path = %dataset.path().display(), "overwrite: local dataset erased");
        }
        if staging.remove()? {
            warn!(target: "session", path = %staging.path().display(), "overwrite: leftover staging discarded");
        }
        Ok(())
    }

    /// Run the job. A fatal extractor error still finalizes first and is then
    /// returned as [`SessionError::Aborted`].
    pub async fn run(&self, extractor: &dyn Extractor, stop: StopSignal) -> SessionResult<RunSummary> {
        let cfg = &self.config;
        let job = cfg.job_name.as_str();
        let remote = self.remote()?;

        let source = self.load_source().await?;
        let store = cfg.store();
        let mut state = self.open_session(&store, source.len())?;

        let dataset = cfg.consolidated()?;
        let errors = cfg.error_log();
        let mut staging = cfg.staging_for(state.partition());
        let finalizer = Finalizer::new(&store, &dataset, &errors, remote);

        if cfg.overwrite {
            self.apply_overwrite(&dataset, &mut staging).await?;
        }

        let recovered = match finalizer.recover(job, &state, &source, &mut staging).await? {
            Some(outcome) => {
                state = outcome.state;
                Some(outcome.merge)
            }
            None => None,
        };

        let items = source.pending(state.curr_idx, state.partition());
        if items.is_empty() {
            info!(target: "session", job, %state, "no pending items");
            return Ok(RunSummary {
                job: job.to_string(),
                state,
                status: RunStatus::of(&state),
                exit: None,
                attempted: 0,
                produced: 0,
                failed: 0,
                recovered,
                merge: MergeReport::default(),
                uploaded: false,
            });
        }

        info!(
            target: "session",
            job,
            pending = items.len(),
            from = state.curr_idx,
            to = state.end_idx,
            "extraction started"
        );

        let (exit, report) = {
            let mut tracker =
                ProgressTracker::new(extractor, &mut staging, &errors, cfg.rate, stop);
            let caught = AssertUnwindSafe(tracker.run(items, state.curr_idx, state.end_idx))
                .catch_unwind()
                .await;
            let exit = match caught {
                Ok(exit) => exit,
                Err(payload) => {
                    let reason = panic_reason(payload.as_ref());
                    error!(target: "session", job, %reason, "extractor panicked");
                    LoopExit::Fatal(ExtractError::fatal(format!("extractor panicked: {reason}")))
                }
            };
            (exit, tracker.into_report())
        };

        let outcome = match finalizer.finalize(job, &state, report.attempted, &mut staging).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if let LoopExit::Fatal(fatal) = &exit {
                    error!(target: "session", job, error = %fatal, "loop had aborted before finalize failed");
                }
                error!(
                    target: "finalize",
                    job,
                    error = %err,
                    staging = %staging.path().display(),
                    "finalize failed; staging and session left as they were"
                );
                return Err(err);
            }
        };

        let status = RunStatus::of(&outcome.state);
        info!(
            target: "session",
            job,
            attempted = report.attempted,
            produced = report.produced,
            failed = report.failed,
            state = %outcome.state,
            "{status}"
        );

        if let LoopExit::Fatal(fatal) = exit {
            return Err(SessionError::Aborted(fatal));
        }

        Ok(RunSummary {
            job: job.to_string(),
            state: outcome.state,
            status,
            exit: Some(exit),
            attempted: report.attempted,
            produced: report.produced,
            failed: report.failed,
            recovered,
            merge: outcome.merge,
            uploaded: outcome.uploaded,
        })
    }

    /// Merge a leftover staging file without extracting anything.
    pub async fn finalize_only(&self) -> SessionResult<Option<RunSummary>> {
        let cfg = &self.config;
        let job = cfg.job_name.as_str();
        let store = cfg.store();
        let Some(state) = store.read(job)? else {
            return Ok(None);
        };
        let source = self.load_source().await?;
        let dataset = cfg.consolidated()?;
        let errors = cfg.error_log();
        let mut staging = cfg.staging_for(state.partition());
        let finalizer = Finalizer::new(&store, &dataset, &errors, self.remote()?);

        let Some(outcome) = finalizer.recover(job, &state, &source, &mut staging).await? else {
            return Ok(None);
        };
        Ok(Some(RunSummary {
            job: job.to_string(),
            state: outcome.state,
            status: RunStatus::of(&outcome.state),
            exit: None,
            attempted: 0,
            produced: 0,
            failed: 0,
            recovered: Some(outcome.merge),
            merge: outcome.merge,
            uploaded: outcome.uploaded,
        }))
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::error::PartitionError;
    use std::fs;

    fn config(dir: &std::path::Path) -> JobConfig {
        JobConfig {
            job_name: "details".into(),
            sources: vec![dir.join("raw").join("appids_list.json")],
            dataset: dir.join("raw").join("games_info.jsonl.gz"),
            staging_dir: dir.join("staging"),
            error_log: dir.join("error_logs").join("details.jsonl"),
            session_file: dir.join("config").join("sessions.json"),
            worker: None,
            workers: 6,
            manual_range: None,
            resume: ResumePolicy::Resume,
            overwrite: false,
            remote: false,
            rate: RatePolicy::None,
        }
    }

    #[test]
    fn new_session_is_written_before_work() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.worker = Some(2);
        let runner = SessionRunner::new(cfg);
        let store = runner.config().store();
        let state = runner.open_session(&store, 12).unwrap();
        assert_eq!(state, SessionState::fresh(Partition::new(2, 3)));
        assert_eq!(store.read("details").unwrap(), Some(state));
    }

    #[test]
    fn resume_returns_stored_state_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SessionRunner::new(config(dir.path()));
        let store = runner.config().store();
        let stored = SessionState {
            start_idx: 0,
            curr_idx: 7,
            end_idx: 9,
        };
        store.write("details", stored).unwrap();
        assert_eq!(runner.open_session(&store, 10).unwrap(), stored);
    }

    #[test]
    fn restart_replans() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.resume = ResumePolicy::Restart;
        let runner = SessionRunner::new(cfg);
        let store = runner.config().store();
        store
            .write(
                "details",
                SessionState {
                    start_idx: 0,
                    curr_idx: 7,
                    end_idx: 9,
                },
            )
            .unwrap();
        let state = runner.open_session(&store, 20).unwrap();
        assert_eq!(state, SessionState::fresh(Partition::new(0, 19)));
    }

    #[test]
    fn shrunk_work_list_is_refused_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SessionRunner::new(config(dir.path()));
        let store = runner.config().store();
        store
            .write("details", SessionState::fresh(Partition::new(0, 9)))
            .unwrap();
        let err = runner.open_session(&store, 5).unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { .. }));
    }

    #[test]
    fn manual_range_is_checked_against_the_list() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.manual_range = Some((3, 12));
        let runner = SessionRunner::new(cfg);
        let store = runner.config().store();
        let err = runner.open_session(&store, 10).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Partition(PartitionError::InvalidRange { start: 3, end: 12, len: 10 })
        ));
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn remote_mode_without_backend_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.remote = true;
        fs::create_dir_all(dir.path().join("raw")).unwrap();
        fs::write(&cfg.sources[0], "[1, 2]").unwrap();
        let runner = SessionRunner::new(cfg);
        assert!(runner.load_source().await.is_err());
    }

    #[test]
    fn panic_payloads_are_described() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_reason(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_reason(boxed.as_ref()), "bang");
    }
}
