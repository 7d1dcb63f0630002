//! The consolidated dataset file and the record codec shared with work sources.
//!
//! Layouts are chosen by file name: `*.json[.gz]` holds `{"data": [...]}`
//! (a bare array is accepted on read), `*.jsonl[.gz]` holds one record per line.

use super::error::{SessionError, SessionResult};
use super::work::ItemId;
use crate::util::fs::{remove_if_exists, write_atomic_with};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use indexmap::map::Entry;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    Json { gzip: bool },
    Jsonl { gzip: bool },
}

impl DatasetFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        let (stem, gzip) = match name.strip_suffix(".gz") {
            Some(stem) => (stem.to_string(), true),
            None => (name, false),
        };
        if stem.ends_with(".jsonl") || stem.ends_with(".ndjson") {
            Some(DatasetFormat::Jsonl { gzip })
        } else if stem.ends_with(".json") {
            Some(DatasetFormat::Json { gzip })
        } else {
            None
        }
    }

    fn gzip(&self) -> bool {
        match self {
            DatasetFormat::Json { gzip } | DatasetFormat::Jsonl { gzip } => *gzip,
        }
    }
}

fn format_of(path: &Path) -> SessionResult<DatasetFormat> {
    DatasetFormat::from_path(path).ok_or_else(|| {
        SessionError::work_source(path, "unsupported extension (want .json/.jsonl, optionally .gz)")
    })
}

/// Every record stored in `path`, in file order.
pub fn read_values(path: &Path) -> SessionResult<Vec<Value>> {
    let format = format_of(path)?;
    let file = File::open(path).map_err(|e| SessionError::io(path, e))?;
    let reader: Box<dyn Read> = if format.gzip() {
        Box::new(MultiGzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(file)
    };
    let mut reader = BufReader::new(reader);

    match format {
        DatasetFormat::Json { .. } => {
            let doc: Value =
                serde_json::from_reader(reader).map_err(|e| SessionError::json(path, e))?;
            match doc {
                Value::Array(items) => Ok(items),
                Value::Object(mut map) => match map.remove("data") {
                    Some(Value::Array(items)) => Ok(items),
                    _ => Err(SessionError::work_source(
                        path,
                        "expected a `data` array or a top-level array",
                    )),
                },
                _ => Err(SessionError::work_source(
                    path,
                    "expected a `data` array or a top-level array",
                )),
            }
        }
        DatasetFormat::Jsonl { .. } => {
            let mut out = Vec::new();
            let mut line = String::new();
            loop {
                line.clear();
                let n = reader
                    .read_line(&mut line)
                    .map_err(|e| SessionError::io(path, e))?;
                if n == 0 {
                    break;
                }
                if line.trim().is_empty() {
                    continue;
                }
                out.push(serde_json::from_str(line.trim()).map_err(|e| SessionError::json(path, e))?);
            }
            Ok(out)
        }
    }
}

/// Write all records to `path` in one atomic replacement.
pub fn write_values(path: &Path, records: &[Value]) -> SessionResult<()> {
    let format = format_of(path)?;
    write_atomic_with(path, |w| {
        if format.gzip() {
            let mut gz = GzEncoder::new(w, Compression::default());
            encode(&mut gz, format, records)?;
            gz.finish()?;
            Ok(())
        } else {
            encode(w, format, records)
        }
    })
    .map_err(|e| SessionError::io(path, e))
}

fn encode(w: &mut dyn Write, format: DatasetFormat, records: &[Value]) -> io::Result<()> {
    match format {
        DatasetFormat::Json { .. } => {
            serde_json::to_writer(&mut *w, &json!({ "data": records }))?;
        }
        DatasetFormat::Jsonl { .. } => {
            for record in records {
                serde_json::to_writer(&mut *w, record)?;
                w.write_all(b"\n")?;
            }
        }
    }
    Ok(())
}

/// Counts of one merge, logged by the finalizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub existing: usize,
    pub added: usize,
    pub skipped_duplicates: usize,
    pub skipped_without_id: usize,
    pub total: usize,
}

/// `existing ∪ incoming` keyed by `id`: records already present (or repeated
/// inside `incoming`) are dropped, first occurrence wins, order is preserved.
pub fn merge_records(existing: Vec<Value>, incoming: Vec<Value>) -> (Vec<Value>, MergeReport) {
    let known: HashSet<ItemId> = existing.iter().filter_map(ItemId::of_record).collect();
    let mut report = MergeReport {
        existing: existing.len(),
        ..MergeReport::default()
    };

    let mut fresh: IndexMap<ItemId, Value> = IndexMap::new();
    for record in incoming {
        let Some(id) = ItemId::of_record(&record) else {
            report.skipped_without_id += 1;
            continue;
        };
        if known.contains(&id) {
            report.skipped_duplicates += 1;
            continue;
        }
        match fresh.entry(id) {
            Entry::Vacant(entry) => {
                entry.insert(record);
            }
            Entry::Occupied(_) => report.skipped_duplicates += 1,
        }
    }

    report.added = fresh.len();
    let mut merged = existing;
    merged.extend(fresh.into_values());
    report.total = merged.len();
    (merged, report)
}

/// Durable, id-deduplicated union of every merged run of a job.
#[derive(Debug, Clone)]
pub struct ConsolidatedDataset {
    path: PathBuf,
}

impl ConsolidatedDataset {
    pub fn new(path: impl Into<PathBuf>) -> SessionResult<Self> {
        let path = path.into();
        format_of(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Records on disk; an absent file is an empty dataset.
    pub fn load(&self) -> SessionResult<Vec<Value>> {
        if !self.exists() {
            return Ok(Vec::new());
        }
        read_values(&self.path)
    }

    /// Read-modify-write with dedup. On error the file on disk is unchanged.
    pub fn merge(&self, incoming: Vec<Value>) -> SessionResult<MergeReport> {
        let existing = self.load()?;
        let (merged, report) = merge_records(existing, incoming);
        if report.skipped_duplicates > 0 {
            warn!(
                target: "finalize",
                path = %self.path.display(),
                skipped = report.skipped_duplicates,
                "dropped records whose id is already in the dataset"
            );
        }
        if report.added == 0 && self.exists() {
            return Ok(report);
        }
        write_values(&self.path, &merged)?;
        info!(
            target: "finalize",
            path = %self.path.display(),
            added = report.added,
            total = report.total,
            "dataset written"
        );
        Ok(report)
    }

    pub fn erase(&self) -> SessionResult<bool> {
        remove_if_exists(&self.path).map_err(|e| SessionError::io(&self.path, e))
    }
}
