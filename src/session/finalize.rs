//! Merge of a run's staging file into the consolidated dataset.
//!
//! Order on disk: dataset swap, then session write, then staging delete. A
//! failure at any step leaves every later artifact untouched, and because a
//! merge never adds an id twice, replaying a half-finished finalize is safe.

use super::dataset::{ConsolidatedDataset, MergeReport};
use super::error::{SessionError, SessionResult};
use super::error_log::ErrorLog;
use super::staging::StagingSink;
use super::state::SessionState;
use super::store::SessionStore;
use super::work::{ItemId, WorkSource};
use crate::remote::RemoteSync;
use crate::util::fs::{basename, remove_if_exists};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub merge: MergeReport,
    pub state: SessionState,
    /// Dataset (and error log, when present) confirmed on the remote.
    pub uploaded: bool,
}

impl FinalizeOutcome {
    pub fn exhausted(&self) -> bool {
        self.state.is_exhausted()
    }
}

pub struct Finalizer<'a> {
    store: &'a SessionStore,
    dataset: &'a ConsolidatedDataset,
    errors: &'a ErrorLog,
    remote: Option<&'a dyn RemoteSync>,
}

impl<'a> Finalizer<'a> {
    pub fn new(
        store: &'a SessionStore,
        dataset: &'a ConsolidatedDataset,
        errors: &'a ErrorLog,
        remote: Option<&'a dyn RemoteSync>,
    ) -> Self {
        Self {
            store,
            dataset,
            errors,
            remote,
        }
    }

    /// Merge `staging` and move `curr_idx` forward by `attempted`.
    pub async fn finalize(
        &self,
        job: &str,
        state: &SessionState,
        attempted: usize,
        staging: &mut StagingSink,
    ) -> SessionResult<FinalizeOutcome> {
        let next = state.advanced(job, attempted)?;
        let incoming = staging.read_all()?;

        let merge = if incoming.is_empty() {
            MergeReport::default()
        } else {
            if let Some(remote) = self.remote {
                self.fetch_dataset(remote).await?;
            }
            self.dataset.merge(incoming)?
        };

        self.store.write(job, next)?;
        if staging.remove()? {
            info!(target: "finalize", path = %staging.path().display(), "staging file merged and removed");
        }

        info!(
            target: "finalize",
            job,
            added = merge.added,
            duplicates = merge.skipped_duplicates,
            curr_idx = next.curr_idx,
            end_idx = next.end_idx,
            "session saved"
        );

        let uploaded = match self.remote {
            Some(remote) => self.publish(remote).await,
            None => false,
        };

        Ok(FinalizeOutcome {
            merge,
            state: next,
            uploaded,
        })
    }

    /// Merge a staging file left behind by an interrupted run.
    ///
    /// `curr_idx` only moves over the leading items from `curr_idx` that the
    /// file shows as attempted (a record or a failure marker); anything after
    /// the first gap is redone. Returns `None` when there is nothing to recover.
    pub async fn recover(
        &self,
        job: &str,
        state: &SessionState,
        source: &WorkSource,
        staging: &mut StagingSink,
    ) -> SessionResult<Option<FinalizeOutcome>> {
        if !staging.exists() {
            return Ok(None);
        }
        let attempted: HashSet<ItemId> = staging.attempted_ids()?;
        let covered = source
            .pending(state.curr_idx, state.partition())
            .iter()
            .take_while(|item| attempted.contains(&item.id))
            .count();
        warn!(
            target: "finalize",
            job,
            path = %staging.path().display(),
            attempted = attempted.len(),
            advance = covered,
            "recovering staging file from an interrupted run"
        );
        self.finalize(job, state, covered, staging).await.map(Some)
    }

    /// Bring the remote copy down when there is no local one to merge into.
    async fn fetch_dataset(&self, remote: &dyn RemoteSync) -> SessionResult<()> {
        if self.dataset.exists() {
            return Ok(());
        }
        let name = basename(self.dataset.path());
        match remote.lookup(&name).await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(detail) => {
                return Err(SessionError::Remote {
                    name,
                    detail: format!("cannot tell whether the remote dataset exists ({detail}); staging kept"),
                })
            }
        }
        if remote.download(&name, self.dataset.path()).await {
            info!(target: "remote", %name, "dataset fetched before merge");
            Ok(())
        } else {
            Err(SessionError::Remote {
                name,
                detail: "download before merge failed; staging kept".to_string(),
            })
        }
    }

    /// Upload dataset and error log; local copies go only after a confirmed upload.
    async fn publish(&self, remote: &dyn RemoteSync) -> bool {
        let mut ok = true;

        if self.dataset.exists() {
            if remote.upload(self.dataset.path()).await {
                if let Err(err) = self.dataset.erase() {
                    warn!(target: "remote", error = %err, "uploaded dataset but could not remove local copy");
                }
            } else {
                warn!(target: "remote", path = %self.dataset.path().display(), "dataset upload failed; local copy kept");
                ok = false;
            }
        }

        if self.errors.exists() {
            let name = basename(self.errors.path());
            if remote.exists(&name).await {
                let mut scratch = PathBuf::from(self.errors.path());
                scratch.set_file_name(format!("{name}.remote"));
                if remote.download(&name, &scratch).await {
                    if let Err(err) = self.errors.prepend_from(&scratch) {
                        warn!(target: "remote", error = %err, "could not fold remote error log");
                    }
                }
                let _ = remove_if_exists(&scratch);
            }
            if remote.upload(self.errors.path()).await {
                let _ = remove_if_exists(self.errors.path());
            } else {
                warn!(target: "remote", %name, "error log upload failed; local copy kept");
                ok = false;
            }
        }

        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::DirectoryRemote;
    use async_trait::async_trait;
    use std::path::Path;
    use crate::session::partition::Partition;
    use crate::session::work::WorkItem;
    use serde_json::{json, Value};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: SessionStore,
        dataset: ConsolidatedDataset,
        errors: ErrorLog,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("config").join("sessions.json"));
        let dataset = ConsolidatedDataset::new(dir.path().join("raw").join("games_info.jsonl.gz")).unwrap();
        let errors = ErrorLog::new(dir.path().join("error_logs").join("details.jsonl"));
        Fixture {
            dir,
            store,
            dataset,
            errors,
        }
    }

    /// Store that cannot answer whether anything exists.
    struct Unreachable;

    #[async_trait]
    impl RemoteSync for Unreachable {
        fn describe(&self) -> String {
            "unreachable".into()
        }
        async fn lookup(&self, _name: &str) -> Result<bool, String> {
            Err("connection refused".into())
        }
        async fn upload(&self, _local: &Path) -> bool {
            false
        }
        async fn download(&self, _name: &str, _local: &Path) -> bool {
            false
        }
        async fn erase(&self, _name: &str) -> bool {
            false
        }
    }

    fn ids(records: &[Value]) -> Vec<i64> {
        let mut out: Vec<i64> = records.iter().filter_map(|r| r["id"].as_i64()).collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn crashed_run_is_merged_without_duplicates() {
        let fx = fixture();
        fx.dataset.merge(vec![json!({"id": 100, "name": "old"})]).unwrap();

        let state = SessionState::fresh(Partition::new(0, 9));
        fx.store.write("details", state).unwrap();
        let mut staging = StagingSink::for_partition(&fx.dir.path().join("staging"), "details", state.partition());
        for id in 100..105 {
            staging.append(&json!({"id": id})).unwrap();
        }

        let source =
            WorkSource::from_items((100..110i64).map(WorkItem::new).collect()).unwrap();
        let finalizer = Finalizer::new(&fx.store, &fx.dataset, &fx.errors, None);
        let outcome = finalizer
            .recover("details", &state, &source, &mut staging)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(ids(&fx.dataset.load().unwrap()), vec![100, 101, 102, 103, 104]);
        assert_eq!(outcome.merge.skipped_duplicates, 1);
        assert_eq!(outcome.state.curr_idx, 5);
        assert_eq!(outcome.state.end_idx, 9);
        assert!(!outcome.exhausted());
        assert_eq!(fx.store.read("details").unwrap(), Some(outcome.state));
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn recovery_stops_at_first_gap() {
        let fx = fixture();
        let state = SessionState::fresh(Partition::new(0, 4));
        let mut staging = StagingSink::at(fx.dir.path().join("d_0_4.jsonl"));
        for id in [0, 1, 3] {
            staging.append(&json!({"id": id})).unwrap();
        }
        let source = WorkSource::from_items((0..5i64).map(WorkItem::new).collect()).unwrap();
        let finalizer = Finalizer::new(&fx.store, &fx.dataset, &fx.errors, None);
        let outcome = finalizer
            .recover("d", &state, &source, &mut staging)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.state.curr_idx, 2);
        assert_eq!(outcome.merge.added, 3);
    }

    #[tokio::test]
    async fn recovery_steps_over_items_marked_failed() {
        let fx = fixture();
        let state = SessionState::fresh(Partition::new(0, 9));
        let mut staging = StagingSink::at(fx.dir.path().join("d_0_9.jsonl"));
        staging.append(&json!({"id": 0})).unwrap();
        staging.mark_failed(&ItemId::Int(1), "http 500").unwrap();
        for id in 2..6 {
            staging.append(&json!({"id": id})).unwrap();
        }
        let source = WorkSource::from_items((0..10i64).map(WorkItem::new).collect()).unwrap();
        let finalizer = Finalizer::new(&fx.store, &fx.dataset, &fx.errors, None);
        let outcome = finalizer
            .recover("d", &state, &source, &mut staging)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.state.curr_idx, 6);
        assert_eq!(outcome.merge.added, 5);
        assert_eq!(ids(&fx.dataset.load().unwrap()), vec![0, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn nothing_to_recover_without_staging_file() {
        let fx = fixture();
        let state = SessionState::fresh(Partition::new(0, 4));
        let mut staging = StagingSink::at(fx.dir.path().join("d_0_4.jsonl"));
        let source = WorkSource::from_items((0..5i64).map(WorkItem::new).collect()).unwrap();
        let finalizer = Finalizer::new(&fx.store, &fx.dataset, &fx.errors, None);
        assert!(finalizer
            .recover("d", &state, &source, &mut staging)
            .await
            .unwrap()
            .is_none());
        assert!(fx.store.read("d").unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_dataset_write_leaves_staging_and_session() {
        let fx = fixture();
        // a regular file where the dataset directory should be
        let blocker = fx.dir.path().join("blocked");
        fs::write(&blocker, b"").unwrap();
        let dataset = ConsolidatedDataset::new(blocker.join("out.jsonl.gz")).unwrap();

        let state = SessionState::fresh(Partition::new(0, 9));
        fx.store.write("details", state).unwrap();
        let mut staging = StagingSink::at(fx.dir.path().join("details_0_9.jsonl"));
        staging.append(&json!({"id": 1})).unwrap();
        let before = fs::read(staging.path()).unwrap();

        let finalizer = Finalizer::new(&fx.store, &dataset, &fx.errors, None);
        assert!(finalizer.finalize("details", &state, 1, &mut staging).await.is_err());
        assert_eq!(fs::read(staging.path()).unwrap(), before);
        assert_eq!(fx.store.read("details").unwrap(), Some(state));
    }

    #[tokio::test]
    async fn last_item_marks_partition_exhausted() {
        let fx = fixture();
        let state = SessionState {
            start_idx: 0,
            curr_idx: 3,
            end_idx: 4,
        };
        let mut staging = StagingSink::at(fx.dir.path().join("d_0_4.jsonl"));
        staging.append(&json!({"id": 3})).unwrap();
        let finalizer = Finalizer::new(&fx.store, &fx.dataset, &fx.errors, None);
        let outcome = finalizer.finalize("d", &state, 2, &mut staging).await.unwrap();
        assert!(outcome.exhausted());
        assert_eq!(outcome.state.curr_idx, 5);
    }

    #[tokio::test]
    async fn remote_mode_merges_into_remote_copy_and_uploads() {
        let fx = fixture();
        let remote = DirectoryRemote::new(fx.dir.path().join("bucket"));

        // seed the remote with an earlier dataset, then drop the local copy
        fx.dataset.merge(vec![json!({"id": 1})]).unwrap();
        assert!(remote.upload(fx.dataset.path()).await);
        fx.dataset.erase().unwrap();

        let bucket_log = fx.dir.path().join("bucket").join("details.jsonl");
        fs::write(&bucket_log, "{\"7\":\"older\"}\n").unwrap();
        fx.errors.record(&ItemId::Int(9), "newer").unwrap();

        let state = SessionState::fresh(Partition::new(0, 9));
        let mut staging = StagingSink::at(fx.dir.path().join("details_0_9.jsonl"));
        staging.append(&json!({"id": 2})).unwrap();

        let finalizer = Finalizer::new(&fx.store, &fx.dataset, &fx.errors, Some(&remote as &dyn RemoteSync));
        let outcome = finalizer.finalize("details", &state, 2, &mut staging).await.unwrap();
        assert!(outcome.uploaded);
        assert!(!fx.dataset.exists());
        assert!(!fx.errors.exists());

        let mirrored = ConsolidatedDataset::new(fx.dir.path().join("bucket").join("games_info.jsonl.gz")).unwrap();
        assert_eq!(ids(&mirrored.load().unwrap()), vec![1, 2]);
        let log = ErrorLog::new(bucket_log);
        let logged: Vec<_> = log.entries().unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(logged, vec!["7", "9"]);
    }

    #[tokio::test]
    async fn unknown_remote_state_keeps_staging_and_session() {
        let fx = fixture();
        let state = SessionState::fresh(Partition::new(0, 9));
        fx.store.write("details", state).unwrap();
        let mut staging = StagingSink::at(fx.dir.path().join("details_0_9.jsonl"));
        staging.append(&json!({"id": 3})).unwrap();
        let before = fs::read(staging.path()).unwrap();

        let remote = Unreachable;
        let finalizer = Finalizer::new(&fx.store, &fx.dataset, &fx.errors, Some(&remote as &dyn RemoteSync));
        let err = finalizer.finalize("details", &state, 1, &mut staging).await.unwrap_err();
        assert!(matches!(err, SessionError::Remote { .. }));
        assert!(!fx.dataset.exists());
        assert_eq!(fs::read(staging.path()).unwrap(), before);
        assert_eq!(fx.store.read("details").unwrap(), Some(state));
    }
}
