// src/main.rs - cache-tags maintenance CLI
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use cache_tags::cache::{ErrorContext, ErrorObserver};
use cache_tags::monitoring::{init_tracing, MonitoringConfig};
use cache_tags::{
    derive_query_id, invalidate, open_tag_index, parse_tag_header, CacheTag,
    CacheTagsInvalidateWebhook, QueryId, TagIndexConfig, TagIndexError, TagIndexResult,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, Parser)]
#[command(name = "cache-tags", version, about = "Inspect and maintain the cache tag index")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the id a query would be stored under
    QueryId {
        /// File holding the query text
        #[arg(long)]
        query: PathBuf,
        /// Variables as a JSON object
        #[arg(long)]
        variables: Option<String>,
        /// Request headers as a JSON object
        #[arg(long)]
        headers: Option<String>,
    },
    #[command(flatten)]
    Index(IndexCommand),
}

#[derive(Debug, Subcommand)]
enum IndexCommand {
    /// Record the tags a query depends on
    Store {
        query_id: String,
        /// Raw X-Cache-Tags header value
        header: String,
    },
    /// List queries referencing any of the tags
    Resolve { tags: Vec<String> },
    /// Process an invalidation webhook body (file, or stdin when omitted)
    Invalidate { payload: Option<PathBuf> },
    /// Delete tags and all their associations
    DeleteTags { tags: Vec<String> },
    /// Delete every association of the queries
    DeleteQueries { query_ids: Vec<String> },
    /// Remove everything from the index
    Truncate {
        /// Required; this cannot be undone
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let _guard = match init_tracing(&MonitoringConfig::from_env()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            None
        }
    };

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(output) => {
            println!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, kind = ?e.kind(), "cache-tags command failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> TagIndexResult<Value> {
    match command {
        Command::QueryId {
            query,
            variables,
            headers,
        } => {
            let text = std::fs::read_to_string(&query).map_err(|e| {
                TagIndexError::InvalidPayload(format!("cannot read {}: {}", query.display(), e))
            })?;
            let variables = variables
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()?;
            let headers = headers
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()?;
            let id = derive_query_id(&text, variables.as_ref(), headers.as_ref())?;
            Ok(json!({ "query_id": id }))
        }
        Command::Index(command) => run_on_index(command).await,
    }
}

async fn run_on_index(command: IndexCommand) -> TagIndexResult<Value> {
    let config = TagIndexConfig::from_env()?;
    let observer: ErrorObserver = Arc::new(|error: &TagIndexError, context: &ErrorContext| {
        warn!(
            backend = context.backend,
            operation = %context.operation(),
            error = %error,
            "Tag index operation failed"
        );
    });
    let index = open_tag_index(&config, Some(observer)).await?;

    let output = match command {
        IndexCommand::Store { query_id, header } => {
            let query_id = QueryId::new(query_id)?;
            let tags = parse_tag_header(Some(&header));
            index.store(&query_id, &tags).await?;
            json!({ "query_id": query_id, "tags": tags })
        }
        IndexCommand::Resolve { tags } => {
            let tags = parse_tags(tags)?;
            json!({ "query_ids": index.resolve(&tags).await? })
        }
        IndexCommand::Invalidate { payload } => {
            let body = read_payload(payload)?;
            let webhook = CacheTagsInvalidateWebhook::from_json(&body)?;
            serde_json::to_value(invalidate(index.as_ref(), webhook.tags()).await?)?
        }
        IndexCommand::DeleteTags { tags } => {
            let tags = parse_tags(tags)?;
            json!({ "deleted": index.delete_tags(&tags).await? })
        }
        IndexCommand::DeleteQueries { query_ids } => {
            let query_ids = query_ids
                .into_iter()
                .map(QueryId::new)
                .collect::<TagIndexResult<Vec<_>>>()?;
            json!({ "deleted": index.delete_queries(&query_ids).await? })
        }
        IndexCommand::Truncate { yes } => {
            if !yes {
                return Err(TagIndexError::InvalidPayload(
                    "truncate removes every association; pass --yes to confirm".to_string(),
                ));
            }
            json!({ "deleted": index.truncate().await? })
        }
    };

    Ok(output)
}

fn parse_tags(tags: Vec<String>) -> TagIndexResult<Vec<CacheTag>> {
    tags.into_iter().map(CacheTag::new).collect()
}

fn read_payload(path: Option<PathBuf>) -> TagIndexResult<Vec<u8>> {
    let result = match &path {
        Some(path) => std::fs::read(path),
        None => {
            let mut body = Vec::new();
            std::io::stdin().read_to_end(&mut body).map(|_| body)
        }
    };
    result.map_err(|e| TagIndexError::InvalidPayload(format!("cannot read payload: {}", e)))
}
