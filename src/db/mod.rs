// src/db/mod.rs
// Relational tag index storage

pub mod sqlite_tags;

pub use sqlite_tags::{quote_identifier, SqliteTagIndex, DEFAULT_TABLE};
