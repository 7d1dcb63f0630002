//! Resumable, shardable extraction sessions for the game data pipeline.
//!
//! A job walks an ordered work list one item at a time, stages every record
//! it produces, and merges the staging file into a deduplicated dataset when
//! the run ends, however it ends. Progress is checkpointed per job so an
//! interrupted run picks up where it stopped.

pub mod catalog;
pub mod config;
pub mod env_boot;
pub mod extract;
pub mod logging;
pub mod remote;
pub mod session;

pub mod util {
    pub mod env;
    pub mod fs;
}

pub use session::{
    ExtractError, JobConfig, RunStatus, RunSummary, SessionError, SessionRunner, StopSignal,
};
