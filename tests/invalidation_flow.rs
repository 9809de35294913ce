use async_trait::async_trait;
use cache_tags::{
    derive_query_id, invalidate, parse_tag_header, CacheTag, CacheTagsInvalidateWebhook, Cleanup,
    ErrorHandlingConfig, ErrorHandlingTagIndex, NoopTagIndex, QueryId, SqliteTagIndex, TagIndex,
    TagIndexError, TagIndexResult,
};
use serde_json::json;
use std::collections::BTreeSet;

const WEBHOOK: &str = r#"{
    "entity_type": "cda_cache_tags",
    "event_type": "invalidate",
    "entity": {
        "id": "cda_cache_tags",
        "type": "cda_cache_tags",
        "attributes": { "tags": ["post-1", "author-7"] }
    }
}"#;

async fn sqlite() -> SqliteTagIndex {
    let index = SqliteTagIndex::open_in_memory("query_cache_tags").unwrap();
    index.ensure_schema().await.unwrap();
    index
}

/// SQLite index that asks for query-driven cleanup
struct QueryCleanup(SqliteTagIndex);

#[async_trait]
impl TagIndex for QueryCleanup {
    fn name(&self) -> &'static str {
        "QueryCleanup"
    }

    fn cleanup(&self) -> Cleanup {
        Cleanup::ByQuery
    }

    async fn store(&self, query_id: &QueryId, tags: &[CacheTag]) -> TagIndexResult<()> {
        self.0.store(query_id, tags).await
    }

    async fn resolve(&self, tags: &[CacheTag]) -> TagIndexResult<Vec<QueryId>> {
        self.0.resolve(tags).await
    }

    async fn delete_tags(&self, tags: &[CacheTag]) -> TagIndexResult<u64> {
        self.0.delete_tags(tags).await
    }

    async fn delete_queries(&self, query_ids: &[QueryId]) -> TagIndexResult<u64> {
        self.0.delete_queries(query_ids).await
    }

    async fn truncate(&self) -> TagIndexResult<u64> {
        self.0.truncate().await
    }
}

/// SQLite index whose lookups fail, as during an outage of the read path
struct FailingResolve(SqliteTagIndex);

#[async_trait]
impl TagIndex for FailingResolve {
    fn name(&self) -> &'static str {
        "FailingResolve"
    }

    async fn store(&self, query_id: &QueryId, tags: &[CacheTag]) -> TagIndexResult<()> {
        self.0.store(query_id, tags).await
    }

    async fn resolve(&self, _tags: &[CacheTag]) -> TagIndexResult<Vec<QueryId>> {
        Err(TagIndexError::Join("lookup unavailable".to_string()))
    }

    async fn delete_tags(&self, tags: &[CacheTag]) -> TagIndexResult<u64> {
        self.0.delete_tags(tags).await
    }

    async fn delete_queries(&self, query_ids: &[QueryId]) -> TagIndexResult<u64> {
        self.0.delete_queries(query_ids).await
    }

    async fn truncate(&self) -> TagIndexResult<u64> {
        self.0.truncate().await
    }
}

/// Store three queries the way an API client would after each response
async fn populate(index: &dyn TagIndex) -> (QueryId, QueryId, QueryId) {
    let post = derive_query_id("{ post(id: 1) { title } }", None, None).unwrap();
    let author = derive_query_id(
        "query Author($id: ItemId) { author(id: $id) { name } }",
        Some(&json!({ "id": "7" })),
        None,
    )
    .unwrap();
    let home = derive_query_id("{ allPosts { title } }", None, None).unwrap();

    index
        .store(&post, &parse_tag_header(Some("post-1 site")))
        .await
        .unwrap();
    index
        .store(&author, &parse_tag_header(Some("author-7 site")))
        .await
        .unwrap();
    index
        .store(&home, &parse_tag_header(Some("post-2 site")))
        .await
        .unwrap();

    (post, author, home)
}

fn ids(ids: &[QueryId]) -> BTreeSet<QueryId> {
    ids.iter().cloned().collect()
}

#[tokio::test]
async fn webhook_invalidates_by_tag() {
    let index = sqlite().await;
    let (post, author, home) = populate(&index).await;

    let webhook = CacheTagsInvalidateWebhook::from_json(WEBHOOK.as_bytes()).unwrap();
    let outcome = invalidate(&index, webhook.tags()).await.unwrap();

    assert_eq!(ids(&outcome.stale_queries), ids(&[post.clone(), author.clone()]));
    assert_eq!(outcome.removed, 2);

    // The invalidated tags are gone; the rest of the index is untouched
    assert!(index.resolve(webhook.tags()).await.unwrap().is_empty());
    let site = index.resolve(&[CacheTag::new("site").unwrap()]).await.unwrap();
    assert_eq!(ids(&site), ids(&[post, author, home]));
}

#[tokio::test]
async fn webhook_invalidates_by_query() {
    let index = QueryCleanup(sqlite().await);
    let (_, _, home) = populate(&index).await;

    let webhook = CacheTagsInvalidateWebhook::from_json(WEBHOOK.as_bytes()).unwrap();
    let outcome = invalidate(&index, webhook.tags()).await.unwrap();

    assert_eq!(outcome.stale_queries.len(), 2);
    assert_eq!(outcome.removed, 4);

    // Stale queries lose every tag, including the ones not in the webhook
    let site = index.resolve(&[CacheTag::new("site").unwrap()]).await.unwrap();
    assert_eq!(site, vec![home]);
}

#[tokio::test]
async fn webhook_for_unknown_tags_is_harmless() {
    let index = sqlite().await;
    populate(&index).await;

    let tags = vec![CacheTag::new("never-stored").unwrap()];
    let outcome = invalidate(&index, &tags).await.unwrap();
    assert!(outcome.stale_queries.is_empty());
    assert_eq!(outcome.removed, 0);
}

#[tokio::test]
async fn noop_index_never_reports_stale_queries() {
    let index = NoopTagIndex::new();
    populate(&index).await;

    let webhook = CacheTagsInvalidateWebhook::from_json(WEBHOOK.as_bytes()).unwrap();
    let outcome = invalidate(&index, webhook.tags()).await.unwrap();
    assert!(outcome.stale_queries.is_empty());
}

#[tokio::test]
async fn suppressed_resolve_failure_keeps_associations() {
    let sqlite = sqlite().await;
    let index = ErrorHandlingTagIndex::new(
        FailingResolve(sqlite.clone()),
        ErrorHandlingConfig::default().suppress_errors(),
    );
    let (post, author, _) = populate(&index).await;

    let webhook = CacheTagsInvalidateWebhook::from_json(WEBHOOK.as_bytes()).unwrap();
    let outcome = invalidate(&index, webhook.tags()).await.unwrap();
    assert!(outcome.stale_queries.is_empty());
    assert_eq!(outcome.removed, 0);

    // Once lookups work again a retried webhook still finds the stale queries
    let outcome = invalidate(&sqlite, webhook.tags()).await.unwrap();
    assert_eq!(ids(&outcome.stale_queries), ids(&[post, author]));
}
