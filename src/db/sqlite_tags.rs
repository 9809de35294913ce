//! SQLite-backed tag index.
//!
//! All associations live in one table:
//!
//! ```sql
//! CREATE TABLE query_cache_tags (
//!   query_id TEXT NOT NULL,
//!   cache_tag TEXT NOT NULL,
//!   PRIMARY KEY (query_id, cache_tag)
//! );
//! ```
//!
//! Each operation runs inside a single transaction, so unlike the Redis
//! pipelines it either applies completely or not at all. Values are always
//! bound parameters; the only text spliced into SQL is the table name, which
//! is validated and quoted once at construction.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params_from_iter, Connection};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::cache::errors::{TagIndexError, TagIndexResult};
use crate::cache::tag::{CacheTag, QueryId};
use crate::cache::{distinct, TagIndex};

pub const DEFAULT_TABLE: &str = "query_cache_tags";

/// Bound parameters per statement; stays under SQLite's historical limit of 999
const MAX_PARAMS: usize = 900;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z_$][a-zA-Z0-9_$]*(\.[a-zA-Z_$][a-zA-Z0-9_$]*)?$")
        .expect("identifier pattern is valid")
});

/// Validate a (optionally schema-qualified) table name and double-quote each part
pub fn quote_identifier(identifier: &str) -> TagIndexResult<String> {
    if !IDENTIFIER.is_match(identifier) {
        return Err(TagIndexError::InvalidTableName(identifier.to_string()));
    }

    Ok(identifier
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join("."))
}

/// Precomputed statements for one table
#[derive(Debug)]
struct Statements {
    create_table: String,
    create_index: String,
    table: String,
}

impl Statements {
    fn for_table(table: &str) -> TagIndexResult<Self> {
        let quoted = quote_identifier(table)?;

        // SQLite puts the index in the table's schema and wants the ON target unqualified
        let (schema, bare) = match table.split_once('.') {
            Some((schema, bare)) => (Some(schema), bare),
            None => (None, table),
        };
        let index_name = match schema {
            Some(schema) => format!("{}.{}", quote_identifier(schema)?, quote_identifier(&format!("{}_cache_tag_idx", bare))?),
            None => quote_identifier(&format!("{}_cache_tag_idx", bare))?,
        };

        Ok(Self {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    query_id TEXT NOT NULL,
                    cache_tag TEXT NOT NULL,
                    PRIMARY KEY (query_id, cache_tag)
                )",
                quoted
            ),
            create_index: format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (cache_tag)",
                index_name,
                quote_identifier(bare)?
            ),
            table: quoted,
        })
    }

    fn insert(&self, pairs: usize) -> String {
        let values = (0..pairs)
            .map(|i| format!("(?{}, ?{})", 2 * i + 1, 2 * i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} (query_id, cache_tag) VALUES {} ON CONFLICT DO NOTHING",
            self.table, values
        )
    }

    fn select_by_tags(&self, count: usize) -> String {
        format!(
            "SELECT DISTINCT query_id FROM {} WHERE cache_tag IN ({})",
            self.table,
            placeholders(count)
        )
    }

    fn delete_where_in(&self, column: &str, count: usize) -> String {
        format!(
            "DELETE FROM {} WHERE {} IN ({})",
            self.table,
            column,
            placeholders(count)
        )
    }

    fn truncate(&self) -> String {
        format!("DELETE FROM {}", self.table)
    }
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Tag index stored in a single SQLite table
#[derive(Clone)]
pub struct SqliteTagIndex {
    conn: Arc<Mutex<Connection>>,
    statements: Arc<Statements>,
}

impl SqliteTagIndex {
    /// Open (or create) a database file. `:memory:` gives a private in-memory database.
    pub fn open(path: impl AsRef<Path>, table: &str) -> TagIndexResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!(path = %path.display(), table, "SQLite tag index opened");
        Self::with_connection(conn, table)
    }

    pub fn open_in_memory(table: &str) -> TagIndexResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, table)
    }

    /// Build an index over a connection the caller already owns.
    /// Fails if `table` is not a valid identifier.
    pub fn with_connection(conn: Connection, table: &str) -> TagIndexResult<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            statements: Arc::new(Statements::for_table(table)?),
        })
    }

    /// Create the table and its tag index if missing
    pub async fn ensure_schema(&self) -> TagIndexResult<()> {
        self.run(|conn, statements| {
            conn.execute_batch(&format!(
                "{};\n{};",
                statements.create_table, statements.create_index
            ))?;
            Ok(())
        })
        .await?;
        info!(table = %self.statements.table, "SQLite tag index schema ready");
        Ok(())
    }

    /// Run `f` on the blocking pool with the connection locked
    async fn run<R, F>(&self, f: F) -> TagIndexResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Connection, &Statements) -> TagIndexResult<R> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let statements = Arc::clone(&self.statements);

        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| TagIndexError::Join(format!("connection lock poisoned: {}", e)))?;
            f(&mut guard, &statements)
        })
        .await
        .map_err(|e| TagIndexError::Join(e.to_string()))?
    }

    fn owned<T: AsRef<str>>(items: &[&T]) -> Vec<String> {
        items.iter().map(|item| item.as_ref().to_string()).collect()
    }
}

#[async_trait]
impl TagIndex for SqliteTagIndex {
    fn name(&self) -> &'static str {
        "SqliteTagIndex"
    }

    async fn store(&self, query_id: &QueryId, tags: &[CacheTag]) -> TagIndexResult<()> {
        if tags.is_empty() {
            return Ok(());
        }

        let query_id = query_id.as_str().to_string();
        let tags = Self::owned(&distinct(tags));
        let count = tags.len();

        self.run(move |conn, statements| {
            let tx = conn.transaction()?;
            for chunk in tags.chunks(MAX_PARAMS / 2) {
                let params = chunk.iter().flat_map(|tag| [query_id.as_str(), tag.as_str()]);
                tx.execute(&statements.insert(chunk.len()), params_from_iter(params))?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        debug!(tags = count, "Stored query cache tags");
        Ok(())
    }

    async fn resolve(&self, tags: &[CacheTag]) -> TagIndexResult<Vec<QueryId>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }

        let tags = Self::owned(&distinct(tags));

        let ids = self
            .run(move |conn, statements| {
                // Chunks can overlap in query ids, so de-duplicate across them
                let mut ids = BTreeSet::new();
                let tx = conn.transaction()?;
                for chunk in tags.chunks(MAX_PARAMS) {
                    let mut stmt = tx.prepare(&statements.select_by_tags(chunk.len()))?;
                    let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get::<_, String>(0))?;
                    for row in rows {
                        ids.insert(row?);
                    }
                }
                tx.commit()?;
                Ok(ids)
            })
            .await?;

        Ok(ids.into_iter().filter_map(|id| QueryId::new(id).ok()).collect())
    }

    async fn delete_tags(&self, tags: &[CacheTag]) -> TagIndexResult<u64> {
        if tags.is_empty() {
            return Ok(0);
        }

        let tags = Self::owned(&distinct(tags));
        self.run(move |conn, statements| delete_in(conn, statements, "cache_tag", &tags))
            .await
    }

    async fn delete_queries(&self, query_ids: &[QueryId]) -> TagIndexResult<u64> {
        if query_ids.is_empty() {
            return Ok(0);
        }

        let query_ids = Self::owned(&distinct(query_ids));
        self.run(move |conn, statements| delete_in(conn, statements, "query_id", &query_ids))
            .await
    }

    async fn truncate(&self) -> TagIndexResult<u64> {
        let deleted = self
            .run(|conn, statements| Ok(conn.execute(&statements.truncate(), [])? as u64))
            .await?;
        info!(table = %self.statements.table, deleted, "Truncated SQLite tag index");
        Ok(deleted)
    }
}

fn delete_in(
    conn: &mut Connection,
    statements: &Statements,
    column: &str,
    values: &[String],
) -> TagIndexResult<u64> {
    let tx = conn.transaction()?;
    let mut deleted = 0u64;
    for chunk in values.chunks(MAX_PARAMS) {
        deleted += tx.execute(
            &statements.delete_where_in(column, chunk.len()),
            params_from_iter(chunk.iter()),
        )? as u64;
    }
    tx.commit()?;
    debug!(column, values = values.len(), deleted, "Deleted tag associations");
    Ok(deleted)
}
