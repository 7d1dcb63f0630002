use super::error::{SessionError, SessionResult};
use super::partition::Partition;
use super::work::ItemId;
use crate::util::fs::{ensure_parent, remove_if_exists};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Key of the marker line written for an item that failed softly.
const FAILED_KEY: &str = "_failed";

/// Append-only JSONL log of the records produced by the in-flight run.
///
/// The file name is derived from the job and its partition bounds, so a run
/// interrupted before finalize leaves a file the next run for the same
/// partition finds again. Items that failed softly leave a marker line
/// (`{"id": .., "_failed": reason}`) so that a crash does not make them look
/// unattempted; markers are never returned as records.
#[derive(Debug)]
pub struct StagingSink {
    path: PathBuf,
    file: Option<File>,
    written: usize,
}

impl StagingSink {
    pub fn file_name(job: &str, partition: Partition) -> String {
        format!("{job}_{}_{}.jsonl", partition.start, partition.end)
    }

    pub fn for_partition(dir: &Path, job: &str, partition: Partition) -> Self {
        Self::at(dir.join(Self::file_name(job, partition)))
    }

    pub fn at(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Records appended through this handle.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Append one record and push it to disk before returning.
    pub fn append(&mut self, record: &Value) -> SessionResult<()> {
        self.write_line(record)?;
        self.written += 1;
        Ok(())
    }

    /// Note that `id` was attempted without producing a record.
    pub fn mark_failed(&mut self, id: &ItemId, reason: &str) -> SessionResult<()> {
        let mut marker = Map::new();
        marker.insert("id".to_string(), id.to_value());
        marker.insert(FAILED_KEY.to_string(), Value::from(reason));
        self.write_line(&Value::Object(marker))
    }

    fn write_line(&mut self, value: &Value) -> SessionResult<()> {
        let mut line =
            serde_json::to_vec(value).map_err(|e| SessionError::json(&self.path, e))?;
        line.push(b'\n');
        let path = self.path.clone();
        let file = self.open().map_err(|e| SessionError::io(&path, e))?;
        file.write_all(&line)
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_data())
            .map_err(|e| SessionError::io(&path, e))
    }

    fn open(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            ensure_parent(&self.path)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.file = Some(file);
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(io::Error::new(io::ErrorKind::Other, "staging file not open")),
        }
    }

    /// Every complete record in the file, failure markers excluded.
    pub fn read_all(&self) -> SessionResult<Vec<Value>> {
        Ok(self
            .read_lines()?
            .into_iter()
            .filter(|line| !is_marker(line))
            .collect())
    }

    /// Ids with a record or a failure marker in the file.
    pub fn attempted_ids(&self) -> SessionResult<HashSet<ItemId>> {
        Ok(self
            .read_lines()?
            .iter()
            .filter_map(ItemId::of_record)
            .collect())
    }

    /// Lines that do not parse (a write torn by a crash) are skipped with a warning.
    fn read_lines(&self) -> SessionResult<Vec<Value>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(SessionError::io(&self.path, err)),
        };
        let mut out = Vec::new();
        for (lineno, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(v) => out.push(v),
                Err(err) => warn!(
                    target: "finalize",
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %err,
                    "skipping unreadable staging line"
                ),
            }
        }
        Ok(out)
    }

    /// Close and delete the file; later appends start a new one.
    pub fn remove(&mut self) -> SessionResult<bool> {
        self.file = None;
        remove_if_exists(&self.path).map_err(|e| SessionError::io(&self.path, e))
    }
}

fn is_marker(line: &Value) -> bool {
    line.get(FAILED_KEY).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn name_is_derived_from_partition() {
        assert_eq!(
            StagingSink::file_name("details-w2", Partition::new(1000, 1999)),
            "details-w2_1000_1999.jsonl"
        );
        let dir = tempfile::tempdir().unwrap();
        let a = StagingSink::for_partition(dir.path(), "d", Partition::new(0, 9));
        let b = StagingSink::for_partition(dir.path(), "d", Partition::new(0, 9));
        assert_eq!(a.path(), b.path());
    }

    #[test]
    fn appends_survive_a_new_handle() {
        let dir = tempfile::tempdir().unwrap();
        let part = Partition::new(0, 9);
        let mut sink = StagingSink::for_partition(&dir.path().join("staging"), "d", part);
        sink.append(&json!({"id": 1})).unwrap();
        sink.append(&json!({"id": 2})).unwrap();
        assert_eq!(sink.written(), 2);
        drop(sink);

        let mut again = StagingSink::for_partition(&dir.path().join("staging"), "d", part);
        again.append(&json!({"id": 3})).unwrap();
        let ids: Vec<_> = again.read_all().unwrap().iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn torn_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d_0_9.jsonl");
        fs::write(&path, "{\"id\":1}\n{\"id\":2}\n{\"id\":").unwrap();
        let sink = StagingSink::at(path);
        assert_eq!(sink.read_all().unwrap().len(), 2);
    }

    #[test]
    fn failure_markers_count_as_attempted_but_are_not_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = StagingSink::at(dir.path().join("d_0_9.jsonl"));
        sink.append(&json!({"id": 0})).unwrap();
        sink.mark_failed(&ItemId::Int(1), "appdetails: success=false").unwrap();
        sink.append(&json!({"id": 2})).unwrap();

        assert_eq!(sink.written(), 2);
        let ids: Vec<_> = sink.read_all().unwrap().iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(0), json!(2)]);
        let attempted = sink.attempted_ids().unwrap();
        assert_eq!(attempted.len(), 3);
        assert!(attempted.contains(&ItemId::Int(1)));
    }

    #[test]
    fn remove_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = StagingSink::at(dir.path().join("d_0_0.jsonl"));
        assert!(sink.read_all().unwrap().is_empty());
        sink.append(&json!({"id": 1})).unwrap();
        assert!(sink.remove().unwrap());
        assert!(!sink.exists());
        assert!(!sink.remove().unwrap());
    }
}
