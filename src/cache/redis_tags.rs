// src/cache/redis_tags.rs - Redis-backed tag index
//
// Key layout (all keys carry the optional prefix):
//   {prefix}cache-tag:{tag}      SET of query ids     (both shapes)
//   {prefix}query:{query_id}     SET of tags          (dual shape only)
//
// Pipelines are not transactions: a failed batch may have partially applied.
// Every raw reply is checked so a rejected command surfaces as a partial
// batch, and `store` is safe to retry.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Pipeline, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use super::errors::{TagIndexError, TagIndexResult};
use super::tag::{CacheTag, QueryId};
use super::{distinct, Cleanup, TagIndex};

const TAG_NAMESPACE: &str = "cache-tag:";
const QUERY_NAMESPACE: &str = "query:";

/// Page size hint for SCAN
const SCAN_COUNT: usize = 1000;

/// Which indexes are maintained in Redis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexShape {
    /// tag -> query ids only. Evicting a single query needs a full scan.
    ForwardOnly,
    /// tag -> query ids plus query id -> tags. Twice the writes, cheap eviction.
    Dual,
}

/// Tag index stored as Redis sets
#[derive(Clone)]
pub struct RedisTagIndex {
    conn: ConnectionManager,
    key_prefix: String,
    shape: IndexShape,
}

impl RedisTagIndex {
    /// Connect to Redis and build an index with the given shape
    pub async fn connect(
        redis_url: &str,
        key_prefix: impl Into<String>,
        shape: IndexShape,
    ) -> TagIndexResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        let index = Self::with_connection(conn, key_prefix, shape);
        info!(
            prefix = %index.key_prefix,
            shape = ?shape,
            "Redis tag index connected"
        );
        Ok(index)
    }

    /// Build an index over a connection the caller already owns
    pub fn with_connection(
        conn: ConnectionManager,
        key_prefix: impl Into<String>,
        shape: IndexShape,
    ) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
            shape,
        }
    }

    pub fn shape(&self) -> IndexShape {
        self.shape
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn tag_key(&self, tag: &str) -> String {
        namespaced_key(&self.key_prefix, TAG_NAMESPACE, tag)
    }

    fn query_key(&self, query_id: &str) -> String {
        namespaced_key(&self.key_prefix, QUERY_NAMESPACE, query_id)
    }

    /// Run a pipeline and fail if any command in it was rejected
    async fn exec_batch(&self, pipe: &Pipeline, operation: &'static str) -> TagIndexResult<Vec<Value>> {
        let mut conn = self.conn.clone();
        // Raw replies: `query_async` would stop at the first server error
        let replies = conn.send_packed_commands(pipe, 0, pipe.len()).await?;
        check_replies(operation, replies)
    }

    /// Walk the keyspace with SCAN, deleting each page of matches as it arrives
    async fn scan_and_delete(&self, pattern: &str) -> TagIndexResult<u64> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let removed: u64 = conn.del(&keys).await?;
                deleted += removed;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(deleted)
    }

    /// Collect every key matching `pattern` with SCAN
    async fn scan_keys(&self, pattern: &str) -> TagIndexResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut found = BTreeSet::new();

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;

            // SCAN may return a key more than once
            found.extend(keys);

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(found.into_iter().collect())
    }

    /// Read one SET per key in a single round trip
    async fn members_of(&self, keys: &[String], operation: &'static str) -> TagIndexResult<Vec<Vec<String>>> {
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.smembers(key);
        }

        let replies = self.exec_batch(&pipe, operation).await?;
        replies
            .iter()
            .map(|reply| redis::from_redis_value::<Vec<String>>(reply).map_err(TagIndexError::from))
            .collect()
    }

    async fn delete_queries_dual(&self, query_ids: &[&QueryId]) -> TagIndexResult<u64> {
        let query_keys: Vec<String> = query_ids.iter().map(|id| self.query_key(id.as_str())).collect();
        let tag_sets = self.members_of(&query_keys, "delete_queries").await?;

        let mut pipe = redis::pipe();
        for ((query_id, query_key), tags) in query_ids.iter().zip(&query_keys).zip(&tag_sets) {
            for tag in tags {
                pipe.srem(self.tag_key(tag), query_id.as_str());
            }
            pipe.del(query_key);
        }

        // SREM member counts plus deleted reverse keys
        let replies = self.exec_batch(&pipe, "delete_queries").await?;
        let removed = sum_counts(&replies)?;

        debug!(
            queries = query_ids.len(),
            tags_touched = tag_sets.iter().map(Vec::len).sum::<usize>(),
            "Removed queries from dual tag index"
        );
        Ok(removed)
    }

    async fn delete_queries_forward(&self, query_ids: &[&QueryId]) -> TagIndexResult<u64> {
        warn!(
            queries = query_ids.len(),
            "Forward-only tag index has no per-query index, scanning every tag key"
        );

        let tag_keys = self.scan_keys(&format!("{}{}*", escape_glob(&self.key_prefix), TAG_NAMESPACE)).await?;
        if tag_keys.is_empty() {
            return Ok(0);
        }

        let ids: Vec<&str> = query_ids.iter().map(|id| id.as_str()).collect();
        let mut pipe = redis::pipe();
        for key in &tag_keys {
            pipe.srem(key, &ids);
        }

        let replies = self.exec_batch(&pipe, "delete_queries").await?;
        sum_counts(&replies)
    }
}

fn namespaced_key(prefix: &str, namespace: &str, id: &str) -> String {
    format!("{}{}{}", prefix, namespace, id)
}

/// Turn per-command replies into a partial-batch error if any command failed
fn check_replies(operation: &'static str, replies: Vec<Value>) -> TagIndexResult<Vec<Value>> {
    let errors: Vec<String> = replies
        .iter()
        .filter_map(|reply| match reply {
            Value::ServerError(err) => Some(redis::RedisError::from(err.clone()).to_string()),
            _ => None,
        })
        .collect();

    if !errors.is_empty() {
        return Err(TagIndexError::PartialBatch {
            operation,
            failed: errors.len(),
            total: replies.len(),
            detail: errors.join("; "),
        });
    }

    Ok(replies)
}

/// Sum integer replies (SREM / DEL counts)
fn sum_counts(replies: &[Value]) -> TagIndexResult<u64> {
    replies.iter().try_fold(0u64, |sum, reply| {
        Ok(sum + redis::from_redis_value::<u64>(reply)?)
    })
}

/// Group `(tag, members of tag)` pairs into query id -> tags to drop from its reverse set
fn reverse_removals<'a>(
    tags: &[&'a CacheTag],
    members: &'a [Vec<String>],
) -> BTreeMap<&'a str, Vec<&'a str>> {
    let mut by_query: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (tag, query_ids) in tags.iter().zip(members) {
        for query_id in query_ids {
            by_query.entry(query_id.as_str()).or_default().push(tag.as_str());
        }
    }
    by_query
}

/// Escape glob metacharacters so a prefix only matches itself in SCAN MATCH
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl TagIndex for RedisTagIndex {
    fn name(&self) -> &'static str {
        "RedisTagIndex"
    }

    fn cleanup(&self) -> Cleanup {
        match self.shape {
            IndexShape::Dual => Cleanup::ByQuery,
            IndexShape::ForwardOnly => Cleanup::ByTag,
        }
    }

    async fn store(&self, query_id: &QueryId, tags: &[CacheTag]) -> TagIndexResult<()> {
        if tags.is_empty() {
            return Ok(());
        }

        let tags = distinct(tags);
        let mut pipe = redis::pipe();
        for tag in &tags {
            pipe.sadd(self.tag_key(tag.as_str()), query_id.as_str());
        }

        if self.shape == IndexShape::Dual {
            let members: Vec<&str> = tags.iter().map(|tag| tag.as_str()).collect();
            pipe.sadd(self.query_key(query_id.as_str()), members);
        }

        self.exec_batch(&pipe, "store").await?;
        debug!(query_id = %query_id, tags = tags.len(), "Stored query cache tags");
        Ok(())
    }

    async fn resolve(&self, tags: &[CacheTag]) -> TagIndexResult<Vec<QueryId>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = distinct(tags)
            .into_iter()
            .map(|tag| self.tag_key(tag.as_str()))
            .collect();

        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.sunion(keys).await?;

        // Anything empty in a tag set was not written by this index
        Ok(members.into_iter().filter_map(|id| QueryId::new(id).ok()).collect())
    }

    async fn delete_tags(&self, tags: &[CacheTag]) -> TagIndexResult<u64> {
        if tags.is_empty() {
            return Ok(0);
        }

        let tags = distinct(tags);
        let tag_keys: Vec<String> = tags.iter().map(|tag| self.tag_key(tag.as_str())).collect();

        let mut pipe = redis::pipe();
        if self.shape == IndexShape::Dual {
            // Drop the tag from each referencing query's reverse set first
            let members = self.members_of(&tag_keys, "delete_tags").await?;
            for (query_id, query_tags) in reverse_removals(&tags, &members) {
                pipe.srem(self.query_key(query_id), query_tags);
            }
        }
        pipe.del(&tag_keys);

        let replies = self.exec_batch(&pipe, "delete_tags").await?;
        let deleted = match replies.last() {
            Some(reply) => redis::from_redis_value::<u64>(reply)?,
            None => 0,
        };

        debug!(tags = tags.len(), deleted, "Deleted cache tags");
        Ok(deleted)
    }

    async fn delete_queries(&self, query_ids: &[QueryId]) -> TagIndexResult<u64> {
        if query_ids.is_empty() {
            return Ok(0);
        }

        let query_ids = distinct(query_ids);
        match self.shape {
            IndexShape::Dual => self.delete_queries_dual(&query_ids).await,
            IndexShape::ForwardOnly => self.delete_queries_forward(&query_ids).await,
        }
    }

    async fn truncate(&self) -> TagIndexResult<u64> {
        let mut deleted = self
            .scan_and_delete(&format!("{}{}*", escape_glob(&self.key_prefix), TAG_NAMESPACE))
            .await?;

        if self.shape == IndexShape::Dual {
            deleted += self
                .scan_and_delete(&format!("{}{}*", escape_glob(&self.key_prefix), QUERY_NAMESPACE))
                .await?;
        }

        info!(prefix = %self.key_prefix, deleted, "Truncated Redis tag index");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::errors::ErrorKind;

    /// Decode a RESP array into its replies
    fn replies(resp: &[u8]) -> Vec<Value> {
        match redis::parse_redis_value(resp).unwrap() {
            Value::Array(items) => items,
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("app:"), "app:");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(namespaced_key("app:", TAG_NAMESPACE, "t1"), "app:cache-tag:t1");
        assert_eq!(namespaced_key("app:", QUERY_NAMESPACE, "q1"), "app:query:q1");
        assert_eq!(namespaced_key("", TAG_NAMESPACE, "t1"), "cache-tag:t1");
    }

    #[test]
    fn test_rejected_command_is_partial_batch() {
        let batch = replies(b"*3\r\n:1\r\n-WRONGTYPE Operation against a key holding the wrong kind of value\r\n:0\r\n");

        let err = check_replies("store", batch).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PartialBatch);
        match err {
            TagIndexError::PartialBatch {
                operation,
                failed,
                total,
                detail,
            } => {
                assert_eq!(operation, "store");
                assert_eq!(failed, 1);
                assert_eq!(total, 3);
                assert!(detail.contains("WRONGTYPE"), "detail: {}", detail);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_clean_batch_passes_through() {
        let batch = replies(b"*2\r\n:1\r\n:1\r\n");
        assert_eq!(check_replies("store", batch).unwrap().len(), 2);
    }

    #[test]
    fn test_sum_counts() {
        assert_eq!(sum_counts(&replies(b"*3\r\n:2\r\n:0\r\n:1\r\n")).unwrap(), 3);
        assert_eq!(sum_counts(&[]).unwrap(), 0);
        // A non-integer reply is a decode error, not a zero
        assert!(sum_counts(&replies(b"*1\r\n+OK\r\n")).is_err());
    }

    #[test]
    fn test_reverse_removals_group_by_query() {
        let x = CacheTag::new("x").unwrap();
        let y = CacheTag::new("y").unwrap();
        let members = vec![
            vec!["A".to_string(), "B".to_string()],
            vec!["B".to_string()],
        ];

        let plan = reverse_removals(&[&x, &y], &members);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan["A"], vec!["x"]);
        assert_eq!(plan["B"], vec!["x", "y"]);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_connection() {
        let index = RedisTagIndex::connect("redis://127.0.0.1:6379/", "unit-test:", IndexShape::Dual)
            .await
            .unwrap();
        assert_eq!(index.shape(), IndexShape::Dual);
        assert_eq!(index.cleanup(), Cleanup::ByQuery);
    }
}
