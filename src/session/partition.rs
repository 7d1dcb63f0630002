//! Splits a work list into contiguous per-worker index ranges.
//!
//! Worker `w` of `W` receives `block = L / W` items starting at `(w-1)*block`;
//! the last worker absorbs the remainder, so the ranges of `w = 1..=W` tile
//! `[0, L-1]` exactly once.

use super::error::PartitionError;
use serde::{Deserialize, Serialize};

/// Worker count used when the environment does not say otherwise.
pub const DEFAULT_WORKERS: u32 = 6;

/// Inclusive index range `[start, end]`; empty when `end < start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub start: i64,
    pub end: i64,
}

impl Partition {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        (self.end - self.start + 1).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, idx: i64) -> bool {
        idx >= self.start && idx <= self.end
    }
}

/// Parse an externally supplied worker identifier (env var or CLI flag).
pub fn parse_worker_id(raw: &str, workers: u32) -> Result<u32, PartitionError> {
    let invalid = || PartitionError::InvalidIdentifier {
        value: raw.to_string(),
        workers,
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let id: u32 = trimmed.parse().map_err(|_| invalid())?;
    if id == 0 || id > workers {
        return Err(invalid());
    }
    Ok(id)
}

/// Range of a work list of `len` items assigned to `worker` out of `workers`.
/// No worker means the whole list.
pub fn plan(len: usize, worker: Option<u32>, workers: u32) -> Result<Partition, PartitionError> {
    let last = len as i64 - 1;
    let Some(w) = worker else {
        return Ok(Partition::new(0, last));
    };
    if w == 0 || w > workers {
        return Err(PartitionError::InvalidIdentifier {
            value: w.to_string(),
            workers,
        });
    }

    let block = (len / workers as usize) as i64;
    let w = w as i64;
    let start = (w - 1) * block;
    let end = if w == workers as i64 { last } else { w * block - 1 };
    Ok(Partition::new(start, end))
}

/// Operator-chosen range; must lie inside the work list.
pub fn manual(len: usize, start: i64, end: i64) -> Result<Partition, PartitionError> {
    if start < 0 || end < start || end >= len as i64 {
        return Err(PartitionError::InvalidRange { start, end, len });
    }
    Ok(Partition::new(start, end))
}
