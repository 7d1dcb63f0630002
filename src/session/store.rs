use super::error::{SessionError, SessionResult};
use super::state::SessionState;
use crate::util::fs::write_atomic;
use indexmap::IndexMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One JSON document holding `{job_name: {start_idx, curr_idx, end_idx}}`.
///
/// Every write is a read-modify-write of the whole document followed by an
/// atomic rename, so entries of other jobs survive. Two processes sharing the
/// document must not write concurrently (see DESIGN.md, worker isolation).
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> SessionResult<IndexMap<String, SessionState>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(IndexMap::new()),
            Err(err) => return Err(SessionError::io(&self.path, err)),
        };
        if raw.trim().is_empty() {
            return Ok(IndexMap::new());
        }
        serde_json::from_str(&raw).map_err(|e| SessionError::json(&self.path, e))
    }

    pub fn read(&self, job: &str) -> SessionResult<Option<SessionState>> {
        let state = self.entries()?.shift_remove(job);
        if let Some(state) = &state {
            state.validate(job)?;
        }
        Ok(state)
    }

    pub fn write(&self, job: &str, state: SessionState) -> SessionResult<()> {
        state.validate(job)?;
        let mut entries = self.entries()?;
        entries.insert(job.to_string(), state);
        self.persist(&entries)?;
        debug!(target: "session", job, %state, "session state persisted");
        Ok(())
    }

    /// Drop a job's entry; `false` when there was none.
    pub fn remove(&self, job: &str) -> SessionResult<bool> {
        let mut entries = self.entries()?;
        if entries.shift_remove(job).is_none() {
            return Ok(false);
        }
        self.persist(&entries)?;
        Ok(true)
    }

    fn persist(&self, entries: &IndexMap<String, SessionState>) -> SessionResult<()> {
        let json =
            serde_json::to_vec_pretty(entries).map_err(|e| SessionError::json(&self.path, e))?;
        write_atomic(&self.path, &json).map_err(|e| SessionError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::partition::Partition;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("config").join("sessions.json"));
        (dir, store)
    }

    #[test]
    fn missing_document_reads_as_absent() {
        let (_dir, store) = store();
        assert!(store.read("details").unwrap().is_none());
        assert!(store.entries().unwrap().is_empty());
    }

    #[test]
    fn write_then_read_round_trips_and_keeps_other_jobs() {
        let (_dir, store) = store();
        let a = SessionState::fresh(Partition::new(0, 9));
        let b = SessionState::fresh(Partition::new(10, 19));
        store.write("details", a).unwrap();
        store.write("reviews", b).unwrap();

        let a2 = a.advanced("details", 3).unwrap();
        store.write("details", a2).unwrap();

        assert_eq!(store.read("details").unwrap(), Some(a2));
        assert_eq!(store.read("reviews").unwrap(), Some(b));
        let keys: Vec<_> = store.entries().unwrap().into_keys().collect();
        assert_eq!(keys, vec!["details", "reviews"]);
    }

    #[test]
    fn document_uses_plain_index_fields() {
        let (_dir, store) = store();
        store
            .write("details-w2", SessionState::fresh(Partition::new(4, 7)))
            .unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(
            raw,
            serde_json::json!({"details-w2": {"start_idx": 4, "curr_idx": 4, "end_idx": 7}})
        );
    }

    #[test]
    fn remove_drops_only_the_named_job() {
        let (_dir, store) = store();
        store
            .write("a", SessionState::fresh(Partition::new(0, 1)))
            .unwrap();
        store
            .write("b", SessionState::fresh(Partition::new(0, 1)))
            .unwrap();
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert!(store.read("b").unwrap().is_some());
    }

    #[test]
    fn rejects_inconsistent_entries() {
        let (_dir, store) = store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(
            store.path(),
            r#"{"details": {"start_idx": 5, "curr_idx": 2, "end_idx": 9}}"#,
        )
        .unwrap();
        assert!(matches!(
            store.read("details"),
            Err(SessionError::InvalidState { .. })
        ));
    }
}
