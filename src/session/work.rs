use super::dataset::read_values;
use super::error::{SessionError, SessionResult};
use super::partition::Partition;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Dedup key of every record. Steam app ids arrive as integers, video ids as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemId {
    Int(i64),
    Text(String),
}

impl ItemId {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(ItemId::Int),
            Value::String(s) if !s.trim().is_empty() => Some(ItemId::Text(s.clone())),
            _ => None,
        }
    }

    /// The `id` field of a record.
    pub fn of_record(record: &Value) -> Option<Self> {
        record.get("id").and_then(Self::from_value)
    }

    pub fn to_value(&self) -> Value {
        match self {
            ItemId::Int(n) => Value::from(*n),
            ItemId::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Int(n) => write!(f, "{n}"),
            ItemId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ItemId {
    fn from(n: i64) -> Self {
        ItemId::Int(n)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        ItemId::Text(s.to_string())
    }
}

/// One unit of work: an id plus whatever the upstream artifact carried.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: ItemId,
    pub payload: Option<Map<String, Value>>,
}

impl WorkItem {
    pub fn new(id: impl Into<ItemId>) -> Self {
        Self {
            id: id.into(),
            payload: None,
        }
    }

    /// Bare ids (`570`, `"dQw4w9WgXcQ"`) or records with an `id` (or `appid`) field.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => {
                let id = map
                    .get("id")
                    .or_else(|| map.get("appid"))
                    .and_then(ItemId::from_value)?;
                Some(Self {
                    id,
                    payload: Some(map),
                })
            }
            other => ItemId::from_value(&other).map(|id| Self { id, payload: None }),
        }
    }

    /// Starting point of the output record: the carried payload with `id` set.
    pub fn seed_record(&self) -> Map<String, Value> {
        let mut record = self.payload.clone().unwrap_or_default();
        record.insert("id".to_string(), self.id.to_value());
        record
    }
}

/// Ordered, id-unique snapshot of the work list.
#[derive(Debug, Clone, Default)]
pub struct WorkSource {
    items: Vec<WorkItem>,
}

impl WorkSource {
    pub fn from_items(items: Vec<WorkItem>) -> SessionResult<Self> {
        Self::validated(items, Path::new("<memory>"))
    }

    /// Concatenate the records of every file, in order.
    pub fn load(paths: &[PathBuf]) -> SessionResult<Self> {
        let mut items = Vec::new();
        for path in paths {
            let values = read_values(path)?;
            let before = items.len();
            for (pos, value) in values.into_iter().enumerate() {
                let item = WorkItem::from_value(value).ok_or_else(|| {
                    SessionError::work_source(path, format!("entry {pos} has no usable id"))
                })?;
                items.push(item);
            }
            info!(target: "session", path = %path.display(), count = items.len() - before, "work source loaded");
        }
        let label = paths.first().map(PathBuf::as_path).unwrap_or(Path::new("<none>"));
        Self::validated(items, label)
    }

    fn validated(items: Vec<WorkItem>, label: &Path) -> SessionResult<Self> {
        let mut seen = HashSet::with_capacity(items.len());
        for item in &items {
            if !seen.insert(&item.id) {
                return Err(SessionError::work_source(
                    label,
                    format!("duplicate id {}", item.id),
                ));
            }
        }
        Ok(Self { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    /// Items with global index in `[from, partition.end]`.
    pub fn pending(&self, from: i64, partition: Partition) -> &[WorkItem] {
        let last = partition.end.min(self.items.len() as i64 - 1);
        if from > last || from < 0 {
            return &[];
        }
        &self.items[from as usize..=last as usize]
    }
}
