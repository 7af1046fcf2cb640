#![forbid(unsafe_code)]

//! Domain types and row codec for the activity trace store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod codec;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("payload encoding failed")]
    Encoding(#[source] serde_json::Error),
    #[error("timestamp error: {0}")]
    Timestamp(String),
    #[error("record failed to decode: {0}")]
    Decode(String),
    #[error("storage error: {context}")]
    Storage {
        context: String,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl TraceError {
    #[must_use]
    pub fn storage(
        context: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            context: context.into(),
            cause: Box::new(cause),
        }
    }
}

/// Who performed a traced action. Closed vocabulary; stored tags outside it
/// decode as [`ActorKind::Anonymous`] so old readers survive new writers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Admin,
    System,
    Anonymous,
}

impl ActorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::System => "system",
            Self::Anonymous => "anonymous",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "system" => Some(Self::System),
            "anonymous" => Some(Self::Anonymous),
            _ => None,
        }
    }
}

/// Circumstances under which an event occurred: the actor and the request
/// attributes that tie one logical operation together across components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionContext {
    pub actor: ActorKind,
    pub actor_id: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    pub correlation_id: Option<String>,
    pub request_id: Option<String>,
    pub route_name: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ExecutionContext {
    /// A minimal system context for callers that have no request attached.
    #[must_use]
    pub fn system(occurred_at: OffsetDateTime) -> Self {
        Self {
            actor: ActorKind::System,
            actor_id: None,
            occurred_at,
            correlation_id: None,
            request_id: None,
            route_name: None,
            ip_address: None,
            user_agent: None,
        }
    }
}

/// A fact to be recorded. `event_id` is the emitting system's dedup key and
/// is not enforced unique by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub event_id: Ulid,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub payload: Option<Value>,
    pub context: ExecutionContext,
}

impl EventRecord {
    /// Checks write preconditions.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] when `action` or `resource` is
    /// blank.
    pub fn validate(&self) -> Result<(), TraceError> {
        if self.action.trim().is_empty() {
            return Err(TraceError::Validation(
                "action MUST be provided for every event".to_string(),
            ));
        }

        if self.resource.trim().is_empty() {
            return Err(TraceError::Validation(
                "resource MUST be provided for every event".to_string(),
            ));
        }

        Ok(())
    }
}

/// A hydrated stored row. `id` is the storage-assigned sequence number used
/// as the pagination tie-break.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceView {
    pub id: i64,
    pub event_id: Ulid,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub payload: Option<Value>,
    pub context: ExecutionContext,
}

impl TraceView {
    /// The continuation token for the page that ends at this row.
    #[must_use]
    pub fn cursor(&self) -> Cursor {
        Cursor {
            last_occurred_at: self.context.occurred_at,
            last_id: self.id,
        }
    }
}

/// Keyset-pagination position: "continue strictly after this row" in
/// `(occurred_at, id)` descending order. Serde round-trippable so outer
/// surfaces can hand it around as an opaque token.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cursor {
    #[serde(with = "time::serde::rfc3339")]
    pub last_occurred_at: OffsetDateTime,
    pub last_id: i64,
}

/// Marker yielded in place of a row that failed to decode. Carries the
/// stored timestamp when that much was still parseable, so pagination can
/// continue past the damage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorruptRecord {
    pub id: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub occurred_at: Option<OffsetDateTime>,
    pub reason: String,
}

/// One element of a read page: either a decoded view or a corrupt-row
/// sentinel. A single damaged historical row must never make the rest of
/// the trail inaccessible.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TraceRow {
    Event(Box<TraceView>),
    Corrupt(CorruptRecord),
}

impl TraceRow {
    /// Continuation token for this row, when one can be derived.
    #[must_use]
    pub fn cursor(&self) -> Option<Cursor> {
        match self {
            Self::Event(view) => Some(view.cursor()),
            Self::Corrupt(record) => record.occurred_at.map(|occurred_at| Cursor {
                last_occurred_at: occurred_at,
                last_id: record.id,
            }),
        }
    }
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
