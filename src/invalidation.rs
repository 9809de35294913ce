// src/invalidation.rs
// Turning an invalidation webhook into the set of stale queries

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::{CacheTag, Cleanup, QueryId, TagIndex, TagIndexError, TagIndexResult};

/// Entity kind carried by cache-tag invalidation events
pub const CACHE_TAGS_ENTITY: &str = "cda_cache_tags";
pub const INVALIDATE_EVENT: &str = "invalidate";

/// Webhook payload sent when upstream content changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTagsInvalidateWebhook {
    pub entity_type: String,
    pub event_type: String,
    pub entity: WebhookEntity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEntity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: WebhookAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookAttributes {
    pub tags: Vec<CacheTag>,
}

impl CacheTagsInvalidateWebhook {
    /// Parse and check that the payload is a cache-tag invalidation
    pub fn from_json(body: &[u8]) -> TagIndexResult<Self> {
        let webhook: Self = serde_json::from_slice(body)
            .map_err(|e| TagIndexError::InvalidPayload(e.to_string()))?;

        if webhook.entity_type != CACHE_TAGS_ENTITY || webhook.entity.kind != CACHE_TAGS_ENTITY {
            return Err(TagIndexError::InvalidPayload(format!(
                "expected entity type {}, got {}",
                CACHE_TAGS_ENTITY, webhook.entity_type
            )));
        }
        if webhook.entity.id != CACHE_TAGS_ENTITY {
            return Err(TagIndexError::InvalidPayload(format!(
                "expected entity id {}, got {}",
                CACHE_TAGS_ENTITY, webhook.entity.id
            )));
        }
        if webhook.event_type != INVALIDATE_EVENT {
            return Err(TagIndexError::InvalidPayload(format!(
                "expected event type {}, got {}",
                INVALIDATE_EVENT, webhook.event_type
            )));
        }

        Ok(webhook)
    }

    pub fn tags(&self) -> &[CacheTag] {
        &self.entity.attributes.tags
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationOutcome {
    /// Queries whose cached results are now stale
    pub stale_queries: Vec<QueryId>,
    /// Informational count reported by the cleanup path
    pub removed: u64,
}

/// Resolve `tags` to stale queries, then drop the matching associations.
///
/// Backends with a per-query index forget the stale queries entirely; the
/// rest delete the invalidated tags. The caller evicts the cached results.
///
/// Nothing is deleted when no stale query comes back. An empty resolve may be
/// a failure suppressed by [`ErrorHandlingTagIndex`](crate::ErrorHandlingTagIndex),
/// and the associations must survive for a retried webhook.
pub async fn invalidate<I>(index: &I, tags: &[CacheTag]) -> TagIndexResult<InvalidationOutcome>
where
    I: TagIndex + ?Sized,
{
    let stale_queries = index.resolve(tags).await?;
    if stale_queries.is_empty() {
        debug!(backend = index.name(), tags = tags.len(), "No stale queries, skipping cleanup");
        return Ok(InvalidationOutcome {
            stale_queries,
            removed: 0,
        });
    }

    let removed = match index.cleanup() {
        Cleanup::ByQuery => index.delete_queries(&stale_queries).await?,
        Cleanup::ByTag => index.delete_tags(tags).await?,
    };

    info!(
        backend = index.name(),
        tags = tags.len(),
        stale = stale_queries.len(),
        removed,
        "Processed cache tag invalidation"
    );

    Ok(InvalidationOutcome {
        stale_queries,
        removed,
    })
}
