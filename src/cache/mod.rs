// src/cache/mod.rs
// Tag index contract and its backends
// Uses async-trait to properly handle async functions in traits

pub mod error_handling;
pub mod errors;
pub mod noop;
pub mod redis_tags;
pub mod tag;

pub use error_handling::{ErrorContext, ErrorHandlingConfig, ErrorHandlingTagIndex, ErrorObserver};
pub use errors::{ErrorKind, TagIndexError, TagIndexResult};
pub use noop::NoopTagIndex;
pub use redis_tags::{IndexShape, RedisTagIndex};
pub use tag::{derive_query_id, parse_tag_header, CacheTag, QueryId, CACHE_TAGS_HEADER};

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Which delete path is cheap for a backend once stale queries are known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    /// Remove the resolved query ids (needs a per-query index)
    ByQuery,
    /// Remove the invalidated tags outright
    ByTag,
}

/// Bidirectional index between query ids and the cache tags they depend on.
///
/// Every method with an empty input returns its empty result without
/// touching the backend. Counts returned by the delete methods are
/// informational and mean different things per backend (keys, rows).
#[async_trait]
pub trait TagIndex: Send + Sync {
    /// Stable backend name used in diagnostics
    fn name(&self) -> &'static str;

    fn cleanup(&self) -> Cleanup {
        Cleanup::ByTag
    }

    /// Record that `query_id` depends on every tag in `tags`. Idempotent.
    async fn store(&self, query_id: &QueryId, tags: &[CacheTag]) -> TagIndexResult<()>;

    /// Query ids associated with *any* of `tags`, without duplicates.
    async fn resolve(&self, tags: &[CacheTag]) -> TagIndexResult<Vec<QueryId>>;

    /// Remove `tags` and every association they have.
    async fn delete_tags(&self, tags: &[CacheTag]) -> TagIndexResult<u64>;

    /// Remove every association of `query_ids`.
    async fn delete_queries(&self, query_ids: &[QueryId]) -> TagIndexResult<u64>;

    /// Remove everything the index knows about. Maintenance and tests only.
    async fn truncate(&self) -> TagIndexResult<u64>;
}

#[async_trait]
impl<T: TagIndex + ?Sized> TagIndex for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn cleanup(&self) -> Cleanup {
        (**self).cleanup()
    }

    async fn store(&self, query_id: &QueryId, tags: &[CacheTag]) -> TagIndexResult<()> {
        (**self).store(query_id, tags).await
    }

    async fn resolve(&self, tags: &[CacheTag]) -> TagIndexResult<Vec<QueryId>> {
        (**self).resolve(tags).await
    }

    async fn delete_tags(&self, tags: &[CacheTag]) -> TagIndexResult<u64> {
        (**self).delete_tags(tags).await
    }

    async fn delete_queries(&self, query_ids: &[QueryId]) -> TagIndexResult<u64> {
        (**self).delete_queries(query_ids).await
    }

    async fn truncate(&self) -> TagIndexResult<u64> {
        (**self).truncate().await
    }
}

/// Sorted, de-duplicated borrowed view of a list of tags or ids.
pub(crate) fn distinct<T: Ord>(items: &[T]) -> Vec<&T> {
    items.iter().collect::<BTreeSet<_>>().into_iter().collect()
}
