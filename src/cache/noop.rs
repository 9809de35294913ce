// src/cache/noop.rs
// Tag index that records nothing. Lets a deployment switch invalidation off
// without touching call sites.

use async_trait::async_trait;
use tracing::debug;

use super::errors::TagIndexResult;
use super::tag::{CacheTag, QueryId};
use super::TagIndex;

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTagIndex;

impl NoopTagIndex {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TagIndex for NoopTagIndex {
    fn name(&self) -> &'static str {
        "NoopTagIndex"
    }

    async fn store(&self, query_id: &QueryId, tags: &[CacheTag]) -> TagIndexResult<()> {
        debug!(query_id = %query_id, tags = ?tags, "store called on noop tag index");
        Ok(())
    }

    async fn resolve(&self, tags: &[CacheTag]) -> TagIndexResult<Vec<QueryId>> {
        debug!(tags = ?tags, "resolve called on noop tag index");
        Ok(Vec::new())
    }

    async fn delete_tags(&self, tags: &[CacheTag]) -> TagIndexResult<u64> {
        debug!(tags = ?tags, "delete_tags called on noop tag index");
        Ok(0)
    }

    async fn delete_queries(&self, query_ids: &[QueryId]) -> TagIndexResult<u64> {
        debug!(query_ids = ?query_ids, "delete_queries called on noop tag index");
        Ok(0)
    }

    async fn truncate(&self) -> TagIndexResult<u64> {
        debug!("truncate called on noop tag index");
        Ok(0)
    }
}
