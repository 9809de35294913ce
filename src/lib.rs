pub mod cache;
pub mod config;
pub mod db;
pub mod invalidation;
pub mod monitoring;

pub use cache::{
    derive_query_id, parse_tag_header, CacheTag, Cleanup, ErrorHandlingConfig,
    ErrorHandlingTagIndex, IndexShape, NoopTagIndex, QueryId, RedisTagIndex, TagIndex,
    TagIndexError, TagIndexResult,
};
pub use config::{open_tag_index, TagIndexConfig};
pub use db::SqliteTagIndex;
pub use invalidation::{invalidate, CacheTagsInvalidateWebhook, InvalidationOutcome};
