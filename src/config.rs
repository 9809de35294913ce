// src/config.rs
//
// Loads from environment variables (a .env file is honoured):
// - CACHE_TAGS_BACKEND: redis | redis-dual | sqlite | noop (default: sqlite)
// - REDIS_URL: Redis connection URL (default: redis://127.0.0.1:6379/)
// - REDIS_KEY_PREFIX: namespace for every Redis key (default: empty)
// - CACHE_TAGS_DB_PATH: SQLite database file, or :memory: (default: cache_tags.db)
// - CACHE_TAGS_TABLE: SQLite table, optionally schema-qualified (default: query_cache_tags)
// - CACHE_TAGS_THROW_ON_ERROR: true | false (default: true)

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::cache::{
    ErrorHandlingConfig, ErrorHandlingTagIndex, ErrorObserver, IndexShape, NoopTagIndex,
    RedisTagIndex, TagIndex, TagIndexError, TagIndexResult,
};
use crate::db::{SqliteTagIndex, DEFAULT_TABLE};

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/";
const DEFAULT_DB_PATH: &str = "cache_tags.db";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Redis {
        url: String,
        key_prefix: String,
        shape: IndexShape,
    },
    Sqlite {
        path: PathBuf,
        table: String,
    },
    Noop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagIndexConfig {
    pub backend: BackendConfig,
    pub throw_on_error: bool,
}

impl Default for TagIndexConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::Sqlite {
                path: PathBuf::from(DEFAULT_DB_PATH),
                table: DEFAULT_TABLE.to_string(),
            },
            throw_on_error: true,
        }
    }
}

impl TagIndexConfig {
    pub fn from_env() -> TagIndexResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key lookup (the environment, a map in tests)
    pub fn from_lookup<F>(lookup: F) -> TagIndexResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let backend_name = get("CACHE_TAGS_BACKEND", "sqlite");
        let backend = match backend_name.to_lowercase().as_str() {
            "redis" | "redis-dual" => BackendConfig::Redis {
                url: get("REDIS_URL", DEFAULT_REDIS_URL),
                key_prefix: get("REDIS_KEY_PREFIX", ""),
                shape: if backend_name.eq_ignore_ascii_case("redis") {
                    IndexShape::ForwardOnly
                } else {
                    IndexShape::Dual
                },
            },
            "sqlite" => BackendConfig::Sqlite {
                path: PathBuf::from(get("CACHE_TAGS_DB_PATH", DEFAULT_DB_PATH)),
                table: get("CACHE_TAGS_TABLE", DEFAULT_TABLE),
            },
            "noop" => BackendConfig::Noop,
            _ => {
                return Err(TagIndexError::InvalidConfigValue {
                    key: "CACHE_TAGS_BACKEND".to_string(),
                    value: backend_name,
                })
            }
        };

        let throw_on_error = match lookup("CACHE_TAGS_THROW_ON_ERROR") {
            None => true,
            Some(value) => match value.to_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(TagIndexError::InvalidConfigValue {
                        key: "CACHE_TAGS_THROW_ON_ERROR".to_string(),
                        value,
                    })
                }
            },
        };

        Ok(Self {
            backend,
            throw_on_error,
        })
    }

    pub fn error_handling(&self, observer: Option<ErrorObserver>) -> ErrorHandlingConfig {
        ErrorHandlingConfig {
            throw_on_error: self.throw_on_error,
            on_error: observer,
        }
    }
}

/// Connect the configured backend and wrap it in the error policy.
///
/// The SQLite table is created on first use.
pub async fn open_tag_index(
    config: &TagIndexConfig,
    observer: Option<ErrorObserver>,
) -> TagIndexResult<Arc<dyn TagIndex>> {
    let policy = config.error_handling(observer);

    let index: Arc<dyn TagIndex> = match &config.backend {
        BackendConfig::Redis {
            url,
            key_prefix,
            shape,
        } => {
            let redis = RedisTagIndex::connect(url, key_prefix.clone(), *shape).await?;
            Arc::new(ErrorHandlingTagIndex::new(redis, policy))
        }
        BackendConfig::Sqlite { path, table } => {
            let sqlite = SqliteTagIndex::open(path, table)?;
            sqlite.ensure_schema().await?;
            Arc::new(ErrorHandlingTagIndex::new(sqlite, policy))
        }
        BackendConfig::Noop => Arc::new(NoopTagIndex::new()),
    };

    info!(
        backend = index.name(),
        throw_on_error = config.throw_on_error,
        "Tag index ready"
    );
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = TagIndexConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, TagIndexConfig::default());
    }

    #[test]
    fn test_redis_dual() {
        let config = TagIndexConfig::from_lookup(lookup(&[
            ("CACHE_TAGS_BACKEND", "redis-dual"),
            ("REDIS_URL", "redis://cache:6379/2"),
            ("REDIS_KEY_PREFIX", "site:"),
            ("CACHE_TAGS_THROW_ON_ERROR", "false"),
        ]))
        .unwrap();

        assert_eq!(
            config.backend,
            BackendConfig::Redis {
                url: "redis://cache:6379/2".to_string(),
                key_prefix: "site:".to_string(),
                shape: IndexShape::Dual,
            }
        );
        assert!(!config.throw_on_error);
    }

    #[test]
    fn test_redis_forward_only() {
        let config =
            TagIndexConfig::from_lookup(lookup(&[("CACHE_TAGS_BACKEND", "Redis")])).unwrap();
        assert!(matches!(
            config.backend,
            BackendConfig::Redis {
                shape: IndexShape::ForwardOnly,
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_unknown_values() {
        let err = TagIndexConfig::from_lookup(lookup(&[("CACHE_TAGS_BACKEND", "memcached")]))
            .unwrap_err();
        assert!(matches!(err, TagIndexError::InvalidConfigValue { .. }));

        let err =
            TagIndexConfig::from_lookup(lookup(&[("CACHE_TAGS_THROW_ON_ERROR", "maybe")]))
                .unwrap_err();
        assert!(matches!(err, TagIndexError::InvalidConfigValue { .. }));
    }

    #[tokio::test]
    async fn test_open_sqlite_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let config = TagIndexConfig {
            backend: BackendConfig::Sqlite {
                path: dir.path().join("tags.db"),
                table: "tags".to_string(),
            },
            throw_on_error: true,
        };

        let index = open_tag_index(&config, None).await.unwrap();
        assert_eq!(index.name(), "SqliteTagIndex");
        assert_eq!(index.truncate().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_sqlite_rejects_bad_table() {
        let config = TagIndexConfig {
            backend: BackendConfig::Sqlite {
                path: PathBuf::from(":memory:"),
                table: "tags; --".to_string(),
            },
            throw_on_error: true,
        };

        let err = open_tag_index(&config, None).await.err().unwrap();
        assert!(matches!(err, TagIndexError::InvalidTableName(_)));
    }
}
