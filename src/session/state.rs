use super::error::{SessionError, SessionResult};
use super::partition::Partition;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted checkpoint of one job: `start_idx <= curr_idx <= end_idx + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub start_idx: i64,
    pub curr_idx: i64,
    pub end_idx: i64,
}

impl SessionState {
    pub fn fresh(partition: Partition) -> Self {
        Self {
            start_idx: partition.start,
            curr_idx: partition.start,
            end_idx: partition.end,
        }
    }

    pub fn partition(&self) -> Partition {
        Partition::new(self.start_idx, self.end_idx)
    }

    pub fn is_exhausted(&self) -> bool {
        self.curr_idx > self.end_idx
    }

    /// Items of the partition not attempted yet.
    pub fn pending(&self) -> usize {
        (self.end_idx - self.curr_idx + 1).max(0) as usize
    }

    /// Items already attempted (`curr_idx - start_idx`).
    pub fn attempted(&self) -> usize {
        (self.curr_idx - self.start_idx).max(0) as usize
    }

    pub fn phase(&self) -> SessionPhase {
        if self.is_exhausted() {
            SessionPhase::Exhausted
        } else {
            SessionPhase::InProgress
        }
    }

    pub fn validate(&self, job: &str) -> SessionResult<()> {
        if self.start_idx < 0 {
            return Err(SessionError::invalid_state(
                job,
                format!("start_idx {} is negative", self.start_idx),
            ));
        }
        if self.curr_idx < self.start_idx || self.curr_idx > self.end_idx + 1 {
            return Err(SessionError::invalid_state(
                job,
                format!(
                    "curr_idx {} outside [{}, {}]",
                    self.curr_idx,
                    self.start_idx,
                    self.end_idx + 1
                ),
            ));
        }
        Ok(())
    }

    /// New state after `attempted` more items; never moves past `end_idx + 1`.
    pub fn advanced(&self, job: &str, attempted: usize) -> SessionResult<Self> {
        let next = self.curr_idx + attempted as i64;
        if attempted > self.pending() {
            return Err(SessionError::invalid_state(
                job,
                format!(
                    "cannot advance {} items from {} past end {}",
                    attempted, self.curr_idx, self.end_idx
                ),
            ));
        }
        Ok(Self {
            curr_idx: next,
            ..*self
        })
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}] at {}",
            self.start_idx, self.end_idx, self.curr_idx
        )
    }
}

/// Lifecycle of a job's partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    New,
    InProgress,
    Exhausted,
}

impl SessionPhase {
    pub fn of(state: Option<&SessionState>) -> Self {
        state.map(SessionState::phase).unwrap_or(SessionPhase::New)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::New => "new",
            SessionPhase::InProgress => "pending",
            SessionPhase::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_starts_at_partition_start() {
        let s = SessionState::fresh(Partition::new(5, 9));
        assert_eq!(s.curr_idx, 5);
        assert_eq!(s.pending(), 5);
        assert_eq!(s.phase(), SessionPhase::InProgress);
    }

    #[test]
    fn advancing_to_end_plus_one_exhausts() {
        let s = SessionState::fresh(Partition::new(0, 9));
        let s = s.advanced("job", 5).unwrap();
        assert_eq!(s.curr_idx, 5);
        assert!(!s.is_exhausted());
        let s = s.advanced("job", 5).unwrap();
        assert_eq!(s.curr_idx, 10);
        assert!(s.is_exhausted());
        assert_eq!(s.pending(), 0);
        assert_eq!(s.attempted(), 10);
    }

    #[test]
    fn cannot_advance_past_end() {
        let s = SessionState::fresh(Partition::new(0, 2));
        assert!(s.advanced("job", 4).is_err());
    }

    #[test]
    fn validate_catches_broken_documents() {
        let ok = SessionState {
            start_idx: 3,
            curr_idx: 8,
            end_idx: 7,
        };
        assert!(ok.validate("job").is_ok());
        let behind = SessionState {
            start_idx: 3,
            curr_idx: 2,
            end_idx: 7,
        };
        assert!(behind.validate("job").is_err());
        let ahead = SessionState {
            start_idx: 3,
            curr_idx: 9,
            end_idx: 7,
        };
        assert!(ahead.validate("job").is_err());
    }

    #[test]
    fn empty_partition_is_exhausted_immediately() {
        let s = SessionState::fresh(Partition::new(0, -1));
        assert!(s.validate("job").is_ok());
        assert_eq!(s.phase(), SessionPhase::Exhausted);
        assert_eq!(SessionPhase::of(None), SessionPhase::New);
    }
}
