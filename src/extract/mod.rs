//! Per-item extraction seam. The session core only calls `Extractor::extract`;
//! how a record is fetched is up to the implementation.

pub mod http;

use crate::session::error::ExtractError;
use crate::session::work::WorkItem;
use async_trait::async_trait;
use serde_json::Value;

pub use http::HttpJsonExtractor;

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Produce the output record for one item. The returned record should
    /// carry the item's `id`; the tracker stamps it when missing.
    async fn extract(&self, item: &WorkItem) -> Result<Value, ExtractError>;
}

