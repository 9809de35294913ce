//! Error policy for any tag index.
//!
//! [`ErrorHandlingTagIndex`] wraps a backend and routes every failure through
//! one path: notify the observer, then either re-raise (the default) or log
//! and hand back the operation's fallback value. A suppressed `resolve`
//! failure looks like an empty result to the caller, so the observer is the
//! only place the two can be told apart.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::errors::{TagIndexError, TagIndexResult};
use super::tag::{CacheTag, QueryId};
use super::{Cleanup, TagIndex};

/// Callback invoked with every failure before the policy is applied
pub type ErrorObserver = Arc<dyn Fn(&TagIndexError, &ErrorContext) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Store,
    Resolve,
    DeleteTags,
    DeleteQueries,
    Truncate,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Store => "store",
            Operation::Resolve => "resolve",
            Operation::DeleteTags => "delete_tags",
            Operation::DeleteQueries => "delete_queries",
            Operation::Truncate => "truncate",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of the failed call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationArgs {
    Store { query_id: QueryId, tags: Vec<CacheTag> },
    Resolve { tags: Vec<CacheTag> },
    DeleteTags { tags: Vec<CacheTag> },
    DeleteQueries { query_ids: Vec<QueryId> },
    Truncate,
}

impl OperationArgs {
    pub fn operation(&self) -> Operation {
        match self {
            OperationArgs::Store { .. } => Operation::Store,
            OperationArgs::Resolve { .. } => Operation::Resolve,
            OperationArgs::DeleteTags { .. } => Operation::DeleteTags,
            OperationArgs::DeleteQueries { .. } => Operation::DeleteQueries,
            OperationArgs::Truncate => Operation::Truncate,
        }
    }
}

/// Where a failure happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub backend: &'static str,
    pub args: OperationArgs,
}

impl ErrorContext {
    pub fn operation(&self) -> Operation {
        self.args.operation()
    }
}

#[derive(Clone)]
pub struct ErrorHandlingConfig {
    /// Re-raise errors after notifying the observer
    pub throw_on_error: bool,
    pub on_error: Option<ErrorObserver>,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            throw_on_error: true,
            on_error: None,
        }
    }
}

impl fmt::Debug for ErrorHandlingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandlingConfig")
            .field("throw_on_error", &self.throw_on_error)
            .field("on_error", &self.on_error.as_ref().map(|_| "<observer>"))
            .finish()
    }
}

impl ErrorHandlingConfig {
    pub fn suppress_errors(mut self) -> Self {
        self.throw_on_error = false;
        self
    }

    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&TagIndexError, &ErrorContext) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(observer));
        self
    }
}

/// Applies an [`ErrorHandlingConfig`] to every call on the wrapped index
#[derive(Debug, Clone)]
pub struct ErrorHandlingTagIndex<T> {
    inner: T,
    config: ErrorHandlingConfig,
}

impl<T: TagIndex> ErrorHandlingTagIndex<T> {
    pub fn new(inner: T, config: ErrorHandlingConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn config(&self) -> &ErrorHandlingConfig {
        &self.config
    }

    async fn wrap<R, F>(
        &self,
        args: impl FnOnce() -> OperationArgs,
        call: F,
        fallback: impl FnOnce() -> R,
    ) -> TagIndexResult<R>
    where
        F: Future<Output = TagIndexResult<R>>,
    {
        let error = match call.await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let context = ErrorContext {
            backend: self.inner.name(),
            args: args(),
        };

        if let Some(observer) = &self.config.on_error {
            observer(&error, &context);
        }

        if self.config.throw_on_error {
            return Err(error);
        }

        debug!(
            backend = context.backend,
            operation = %context.operation(),
            args = ?context.args,
            error = %error,
            "Error occurred in tag index, returning fallback"
        );
        Ok(fallback())
    }
}

#[async_trait]
impl<T: TagIndex> TagIndex for ErrorHandlingTagIndex<T> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn cleanup(&self) -> Cleanup {
        self.inner.cleanup()
    }

    async fn store(&self, query_id: &QueryId, tags: &[CacheTag]) -> TagIndexResult<()> {
        self.wrap(
            || OperationArgs::Store {
                query_id: query_id.clone(),
                tags: tags.to_vec(),
            },
            self.inner.store(query_id, tags),
            || (),
        )
        .await
    }

    async fn resolve(&self, tags: &[CacheTag]) -> TagIndexResult<Vec<QueryId>> {
        self.wrap(
            || OperationArgs::Resolve { tags: tags.to_vec() },
            self.inner.resolve(tags),
            Vec::new,
        )
        .await
    }

    async fn delete_tags(&self, tags: &[CacheTag]) -> TagIndexResult<u64> {
        self.wrap(
            || OperationArgs::DeleteTags { tags: tags.to_vec() },
            self.inner.delete_tags(tags),
            || 0,
        )
        .await
    }

    async fn delete_queries(&self, query_ids: &[QueryId]) -> TagIndexResult<u64> {
        self.wrap(
            || OperationArgs::DeleteQueries {
                query_ids: query_ids.to_vec(),
            },
            self.inner.delete_queries(query_ids),
            || 0,
        )
        .await
    }

    async fn truncate(&self) -> TagIndexResult<u64> {
        self.wrap(|| OperationArgs::Truncate, self.inner.truncate(), || 0)
            .await
    }
}
