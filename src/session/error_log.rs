use super::error::{SessionError, SessionResult};
use super::work::ItemId;
use crate::util::fs::{ensure_parent, write_atomic};
use serde_json::{Map, Value};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Diagnostic JSONL of `{id: reason}` lines. Never merged into a dataset.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn record(&self, id: &ItemId, reason: &str) -> SessionResult<()> {
        let mut entry = Map::new();
        entry.insert(id.to_string(), Value::from(reason));
        let mut line = serde_json::to_vec(&Value::Object(entry))
            .map_err(|e| SessionError::json(&self.path, e))?;
        line.push(b'\n');

        ensure_parent(&self.path).map_err(|e| SessionError::io(&self.path, e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SessionError::io(&self.path, e))?;
        file.write_all(&line)
            .and_then(|_| file.flush())
            .map_err(|e| SessionError::io(&self.path, e))
    }

    /// Put the lines of `older` in front of this log's own lines. Used to
    /// fold a downloaded remote copy in before re-uploading.
    pub fn prepend_from(&self, older: &Path) -> SessionResult<()> {
        let previous = fs::read(older).map_err(|e| SessionError::io(older, e))?;
        let current = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(SessionError::io(&self.path, err)),
        };
        let mut combined = previous;
        if !combined.is_empty() && !combined.ends_with(b"\n") {
            combined.push(b'\n');
        }
        combined.extend(current);
        write_atomic(&self.path, &combined).map_err(|e| SessionError::io(&self.path, e))
    }

    pub fn entries(&self) -> SessionResult<Vec<(String, String)>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(SessionError::io(&self.path, err)),
        };
        let mut out = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let map: Map<String, Value> =
                serde_json::from_str(line).map_err(|e| SessionError::json(&self.path, e))?;
            for (id, reason) in map {
                let reason = reason.as_str().map(str::to_string).unwrap_or_else(|| reason.to_string());
                out.push((id, reason));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_id_reason_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = ErrorLog::new(dir.path().join("error_logs").join("details_errors.jsonl"));
        log.record(&ItemId::Int(570), "appdetails: contenido filtrado")
            .unwrap();
        log.record(&ItemId::Text("x1".into()), "timeout").unwrap();

        let raw = fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw.lines().next().unwrap(), r#"{"570":"appdetails: contenido filtrado"}"#);
        assert_eq!(
            log.entries().unwrap(),
            vec![
                ("570".to_string(), "appdetails: contenido filtrado".to_string()),
                ("x1".to_string(), "timeout".to_string()),
            ]
        );
    }

    #[test]
    fn prepend_keeps_older_lines_first() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("remote_copy.jsonl");
        fs::write(&older, "{\"1\":\"a\"}").unwrap();
        let log = ErrorLog::new(dir.path().join("log.jsonl"));
        log.record(&ItemId::Int(2), "b").unwrap();
        log.prepend_from(&older).unwrap();
        let ids: Vec<_> = log.entries().unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }
}
