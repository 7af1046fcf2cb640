#![forbid(unsafe_code)]

//! Embeddable command surface for the activity trace store.
//!
//! Host binaries should embed through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`execute`] for direct command execution returning the JSON document a
//!   command produces (what the binary prints).

use std::path::{Path, PathBuf};

use activity_trace_core::{
    codec, now_utc, ActorKind, Cursor, EventRecord, ExecutionContext, TraceRow,
};
use activity_trace_store_sqlite::SqliteTraceStore;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "trace")]
#[command(about = "Activity trace store CLI")]
pub struct Cli {
    #[arg(long, default_value = "./activity_trace.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply the trace schema (idempotent).
    Migrate,
    /// Append one activity event.
    Record(Box<RecordArgs>),
    /// Read one page of history, newest first.
    List(ListArgs),
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    /// Dedup key for the emitting system; generated when omitted.
    #[arg(long)]
    event_id: Option<Ulid>,

    #[arg(long)]
    action: String,

    #[arg(long)]
    resource: String,

    #[arg(long)]
    resource_id: Option<String>,

    /// Inline JSON payload.
    #[arg(long)]
    payload: Option<String>,

    #[arg(long, value_enum, default_value_t = ActorArg::System)]
    actor: ActorArg,

    #[arg(long)]
    actor_id: Option<i64>,

    /// RFC3339 instant; defaults to now. Stored normalized to UTC.
    #[arg(long)]
    occurred_at: Option<String>,

    #[arg(long)]
    correlation_id: Option<String>,

    #[arg(long)]
    request_id: Option<String>,

    #[arg(long)]
    route_name: Option<String>,

    #[arg(long)]
    ip_address: Option<String>,

    #[arg(long)]
    user_agent: Option<String>,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// Continuation token: the `next_cursor` of the previous page.
    #[arg(long)]
    cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ActorArg {
    Admin,
    System,
    Anonymous,
}

impl From<ActorArg> for ActorKind {
    fn from(value: ActorArg) -> Self {
        match value {
            ActorArg::Admin => Self::Admin,
            ActorArg::System => Self::System,
            ActorArg::Anonymous => Self::Anonymous,
        }
    }
}

/// Runs a parsed CLI and prints the resulting JSON document.
///
/// # Errors
/// Returns an error when the underlying command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let output = execute(cli)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Executes one command and returns the JSON document it produces.
///
/// # Errors
/// Returns an error when the store cannot be opened or the command fails.
pub fn execute(cli: Cli) -> Result<Value> {
    let store = open_store(&cli.db)?;
    match cli.command {
        Command::Migrate => Ok(json!({"migrated": true})),
        Command::Record(args) => run_record(&store, *args),
        Command::List(args) => run_list(&store, &args),
    }
}

fn open_store(path: &Path) -> Result<SqliteTraceStore> {
    let store = SqliteTraceStore::open(path)
        .with_context(|| format!("failed to open trace store at {}", path.display()))?;
    store.migrate().context("failed to apply trace schema")?;
    Ok(store)
}

fn run_record(store: &SqliteTraceStore, args: RecordArgs) -> Result<Value> {
    let occurred_at = match args.occurred_at.as_deref() {
        Some(raw) => OffsetDateTime::parse(raw, &Rfc3339)
            .with_context(|| format!("invalid RFC3339 --occurred-at value: {raw}"))?,
        None => now_utc(),
    };

    let payload = args
        .payload
        .as_deref()
        .map(|raw| {
            serde_json::from_str::<Value>(raw)
                .with_context(|| format!("invalid JSON --payload value: {raw}"))
        })
        .transpose()?;

    let record = EventRecord {
        event_id: args.event_id.unwrap_or_else(Ulid::new),
        action: args.action,
        resource: args.resource,
        resource_id: args.resource_id,
        payload,
        context: ExecutionContext {
            actor: args.actor.into(),
            actor_id: args.actor_id,
            occurred_at,
            correlation_id: args.correlation_id,
            request_id: args.request_id,
            route_name: args.route_name,
            ip_address: args.ip_address,
            user_agent: args.user_agent,
        },
    };

    let id = store
        .write(&record)
        .context("failed to record activity event")?;

    Ok(json!({
        "id": id,
        "event_id": record.event_id.to_string(),
        "occurred_at": codec::encode_timestamp(record.context.occurred_at)?,
    }))
}

fn run_list(store: &SqliteTraceStore, args: &ListArgs) -> Result<Value> {
    let cursor = args
        .cursor
        .as_deref()
        .map(|raw| {
            serde_json::from_str::<Cursor>(raw)
                .with_context(|| format!("invalid cursor token: {raw}"))
        })
        .transpose()?;

    let page: Vec<TraceRow> = store
        .read(cursor.as_ref(), args.limit)
        .context("failed to read activity trace")?
        .collect();
    let next_cursor = page.last().and_then(TraceRow::cursor);

    Ok(json!({
        "rows": page,
        "next_cursor": next_cursor,
    }))
}
