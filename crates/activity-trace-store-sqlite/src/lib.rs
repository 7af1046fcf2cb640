#![forbid(unsafe_code)]

//! SQLite-backed activity trace store: append-only writes, keyset-paginated
//! reverse-chronological reads, fail-safe row hydration.

use std::path::Path;
use std::str::FromStr;

use activity_trace_core::{
    codec, CorruptRecord, Cursor, EventRecord, ExecutionContext, TraceError, TraceRow, TraceView,
};
use rusqlite::{params, Connection};
use ulid::Ulid;

const TRACE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS activity_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  actor_type TEXT NOT NULL,
  actor_id INTEGER,
  action TEXT NOT NULL,
  resource TEXT NOT NULL,
  resource_id TEXT,
  payload TEXT,
  correlation_id TEXT,
  request_id TEXT,
  route_name TEXT,
  ip_address TEXT,
  user_agent TEXT
);

CREATE INDEX IF NOT EXISTS idx_activity_events_occurred_id
  ON activity_events(occurred_at DESC, id DESC);

CREATE TRIGGER IF NOT EXISTS trg_activity_events_no_update
BEFORE UPDATE ON activity_events
BEGIN
  SELECT RAISE(FAIL, 'activity_events is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_activity_events_no_delete
BEFORE DELETE ON activity_events
BEGIN
  SELECT RAISE(FAIL, 'activity_events is append-only');
END;
";

const EVENT_COLUMNS: &str = "id, event_id, occurred_at, actor_type, actor_id,
                action, resource, resource_id, payload,
                correlation_id, request_id, route_name, ip_address, user_agent";

pub struct SqliteTraceStore {
    conn: Connection,
}

impl SqliteTraceStore {
    /// Open or create a `SQLite` trace database and configure local pragmas.
    ///
    /// # Errors
    /// Returns [`TraceError::Storage`] if opening the database or applying
    /// pragmas fails.
    pub fn open(path: &Path) -> Result<Self, TraceError> {
        let conn = Connection::open(path).map_err(|err| {
            TraceError::storage(
                format!("failed to open sqlite database at {}", path.display()),
                err,
            )
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|err| TraceError::storage("failed to configure sqlite pragmas", err))?;

        Ok(Self { conn })
    }

    /// Applies the trace schema. Idempotent; records the schema version in
    /// `schema_migrations`.
    ///
    /// # Errors
    /// Returns [`TraceError::Storage`] if the schema batch cannot be applied.
    pub fn migrate(&self) -> Result<(), TraceError> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .map_err(|err| TraceError::storage("failed to apply trace schema", err))?;

        let now = codec::encode_timestamp(activity_trace_core::now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![TRACE_SCHEMA_VERSION, now],
            )
            .map_err(|err| TraceError::storage("failed to record trace migration", err))?;

        Ok(())
    }

    /// Appends exactly one row and returns its storage-assigned id.
    ///
    /// Encoding happens before the insert, so an unserializable payload
    /// aborts the write with nothing persisted. The insert is a single
    /// statement; SQLite makes it all-or-nothing. No retries are attempted
    /// here; callers own that decision.
    ///
    /// # Errors
    /// [`TraceError::Validation`] for blank `action`/`resource`,
    /// [`TraceError::Encoding`] for an unserializable payload,
    /// [`TraceError::Storage`] when the insert itself is rejected (the
    /// rusqlite cause stays reachable through `source()`).
    pub fn write(&self, record: &EventRecord) -> Result<i64, TraceError> {
        record.validate()?;

        let payload = record
            .payload
            .as_ref()
            .map(codec::encode_payload)
            .transpose()?;
        let occurred_at = codec::encode_timestamp(record.context.occurred_at)?;

        self.conn
            .execute(
                "INSERT INTO activity_events(
                    event_id, occurred_at, actor_type, actor_id,
                    action, resource, resource_id, payload,
                    correlation_id, request_id, route_name, ip_address, user_agent
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.event_id.to_string(),
                    occurred_at,
                    record.context.actor.as_str(),
                    record.context.actor_id,
                    record.action,
                    record.resource,
                    record.resource_id,
                    payload,
                    record.context.correlation_id,
                    record.context.request_id,
                    record.context.route_name,
                    record.context.ip_address,
                    record.context.user_agent,
                ],
            )
            .map_err(|err| TraceError::storage("failed to append activity event", err))?;

        let id = self.conn.last_insert_rowid();
        tracing::debug!(id, action = %record.action, "appended activity event");
        Ok(id)
    }

    /// Reads one page of history, newest first.
    ///
    /// `cursor = None` starts from the most recent record; `Some(cursor)`
    /// continues strictly after `(last_occurred_at, last_id)`. The composite
    /// predicate is the keyset-pagination contract: a cursor on
    /// `occurred_at` alone would skip or duplicate rows whenever many events
    /// share a timestamp.
    ///
    /// The returned [`TracePage`] is finite (bounded by `limit`) and
    /// non-restartable; rows are fetched here but decoded lazily as the page
    /// is consumed, with corrupt rows degrading to sentinels instead of
    /// failing the page.
    ///
    /// # Errors
    /// Returns [`TraceError::Storage`] only when the query itself cannot
    /// execute.
    pub fn read(&self, cursor: Option<&Cursor>, limit: usize) -> Result<TracePage, TraceError> {
        let limit = i64::try_from(limit)
            .map_err(|_| TraceError::Validation("limit too large for storage layer".to_string()))?;

        let raw_rows = match cursor {
            None => {
                let mut stmt = self
                    .conn
                    .prepare(&format!(
                        "SELECT {EVENT_COLUMNS}
                         FROM activity_events
                         ORDER BY occurred_at DESC, id DESC
                         LIMIT ?1"
                    ))
                    .map_err(|err| TraceError::storage("failed to prepare trace query", err))?;
                let rows = stmt
                    .query_map(params![limit], read_raw_row)
                    .map_err(|err| TraceError::storage("failed to execute trace query", err))?;
                collect_rows(rows)?
            }
            Some(position) => {
                let anchor = codec::encode_timestamp(position.last_occurred_at)?;
                let mut stmt = self
                    .conn
                    .prepare(&format!(
                        "SELECT {EVENT_COLUMNS}
                         FROM activity_events
                         WHERE occurred_at < ?1 OR (occurred_at = ?1 AND id < ?2)
                         ORDER BY occurred_at DESC, id DESC
                         LIMIT ?3"
                    ))
                    .map_err(|err| TraceError::storage("failed to prepare trace query", err))?;
                let rows = stmt
                    .query_map(params![anchor, position.last_id, limit], read_raw_row)
                    .map_err(|err| TraceError::storage("failed to execute trace query", err))?;
                collect_rows(rows)?
            }
        };

        Ok(TracePage {
            rows: raw_rows.into_iter(),
        })
    }
}

/// One page of trace history. Finite, bounded by the `limit` passed to
/// [`SqliteTraceStore::read`], and not restartable; continuing requires a
/// fresh `read` with the cursor of the last yielded row.
pub struct TracePage {
    rows: std::vec::IntoIter<RawRow>,
}

impl Iterator for TracePage {
    type Item = TraceRow;

    fn next(&mut self) -> Option<TraceRow> {
        self.rows.next().map(hydrate_row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for TracePage {}

/// Column values exactly as stored, before any decoding.
struct RawRow {
    id: i64,
    event_id: String,
    occurred_at: String,
    actor_type: String,
    actor_id: Option<i64>,
    action: String,
    resource: String,
    resource_id: Option<String>,
    payload: Option<String>,
    correlation_id: Option<String>,
    request_id: Option<String>,
    route_name: Option<String>,
    ip_address: Option<String>,
    user_agent: Option<String>,
}

fn read_raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        event_id: row.get(1)?,
        occurred_at: row.get(2)?,
        actor_type: row.get(3)?,
        actor_id: row.get(4)?,
        action: row.get(5)?,
        resource: row.get(6)?,
        resource_id: row.get(7)?,
        payload: row.get(8)?,
        correlation_id: row.get(9)?,
        request_id: row.get(10)?,
        route_name: row.get(11)?,
        ip_address: row.get(12)?,
        user_agent: row.get(13)?,
    })
}

/// Fail-safe hydration: a row that will not decode becomes a sentinel
/// carrying the raw id (and the stored timestamp when that much parsed),
/// never an error for the page.
fn hydrate_row(raw: RawRow) -> TraceRow {
    match decode_view(&raw) {
        Ok(view) => TraceRow::Event(Box::new(view)),
        Err(err) => {
            let reason = err.to_string();
            tracing::warn!(id = raw.id, reason = %reason, "corrupt activity event row");
            TraceRow::Corrupt(CorruptRecord {
                id: raw.id,
                occurred_at: codec::decode_timestamp(&raw.occurred_at).ok(),
                reason,
            })
        }
    }
}

fn decode_view(raw: &RawRow) -> Result<TraceView, TraceError> {
    let occurred_at = codec::decode_timestamp(&raw.occurred_at)?;
    let event_id = Ulid::from_str(&raw.event_id)
        .map_err(|err| TraceError::Decode(format!("invalid event_id ULID: {err}")))?;
    let payload = raw
        .payload
        .as_deref()
        .map(codec::decode_payload)
        .transpose()
        .map_err(|err| TraceError::Decode(format!("invalid payload JSON: {err}")))?;

    Ok(TraceView {
        id: raw.id,
        event_id,
        action: raw.action.clone(),
        resource: raw.resource.clone(),
        resource_id: raw.resource_id.clone(),
        payload,
        context: ExecutionContext {
            actor: codec::decode_actor(&raw.actor_type),
            actor_id: raw.actor_id,
            occurred_at,
            correlation_id: raw.correlation_id.clone(),
            request_id: raw.request_id.clone(),
            route_name: raw.route_name.clone(),
            ip_address: raw.ip_address.clone(),
            user_agent: raw.user_agent.clone(),
        },
    })
}

fn collect_rows(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<RawRow>>,
) -> Result<Vec<RawRow>, TraceError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(|err| TraceError::storage("failed to fetch trace row", err))?);
    }
    Ok(values)
}
