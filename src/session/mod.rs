//! Resumable extraction sessions: partition planning, the persisted
//! checkpoint, the per-item loop, staging and the merge into the dataset.

pub mod dataset;
pub mod error;
pub mod error_log;
pub mod finalize;
pub mod job;
pub mod partition;
pub mod staging;
pub mod state;
pub mod store;
pub mod tracker;
pub mod work;

pub use dataset::{ConsolidatedDataset, DatasetFormat, MergeReport};
pub use error::{ExtractError, PartitionError, SessionError, SessionResult};
pub use error_log::ErrorLog;
pub use finalize::{FinalizeOutcome, Finalizer};
pub use job::{JobConfig, ResumePolicy, RunStatus, RunSummary, SessionRunner};
pub use partition::{Partition, DEFAULT_WORKERS};
pub use staging::StagingSink;
pub use state::{SessionPhase, SessionState};
pub use store::SessionStore;
pub use tracker::{LoopExit, ProgressTracker, RatePolicy, StopSignal, TrackerReport};
pub use work::{ItemId, WorkItem, WorkSource};
