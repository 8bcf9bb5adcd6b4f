//! Physical row layout of a session partition.
//!
//! Every row shares the session id as partition key and is told apart by its
//! sort key:
//!
//! | sort key            | row                                   |
//! |---------------------|---------------------------------------|
//! | `session`           | metadata, plus a facilitator fallback |
//! | `facilitator`       | facilitator user                      |
//! | `user:<conn>`       | participant user                      |
//! | `watcher:<conn>`    | interest placeholder                  |
//!
//! Decoding yields a [`SessionRow`]; [`fold_rows`] reduces a partition into
//! the aggregate without touching the store.

use chrono::{DateTime, Utc};
use tracing::warn;

use super::model::{SessionAggregate, User, UserRole};
use crate::context::CallContext;
use crate::kv::{KvStore, Record, RecordKey, StoreError};

pub const METADATA_KEY: &str = "session";
pub const FACILITATOR_KEY: &str = "facilitator";
pub const PARTICIPANT_PREFIX: &str = "user:";
pub const WATCHER_PREFIX: &str = "watcher:";

const VOTES_SHOWN: &str = "VotesShown";
const FACILITATOR_SESSION_KEY: &str = "FacilitatorSessionKey";
const FACILITATOR_POINTS: &str = "FacilitatorPoints";
const FACILITATOR_NAME: &str = "FacilitatorName";
const FACILITATOR_HANDLE: &str = "FacilitatorHandle";
const FACILITATOR_USER_ID: &str = "FacilitatorUserID";

const USER_ID: &str = "UserID";
const NAME: &str = "Name";
const HANDLE: &str = "Handle";
const CURRENT_VOTE: &str = "CurrentVote";

pub fn participant_key(connection_id: &str) -> String {
    format!("{}{}", PARTICIPANT_PREFIX, connection_id)
}

pub fn watcher_key(connection_id: &str) -> String {
    format!("{}{}", WATCHER_PREFIX, connection_id)
}

/// Sort key of the row a user with `role` is stored under.
pub fn user_key(role: UserRole, connection_id: &str) -> String {
    match role {
        UserRole::Facilitator => FACILITATOR_KEY.to_string(),
        UserRole::Participant => participant_key(connection_id),
    }
}

/// Session-level fields held on the metadata row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    pub votes_shown: bool,
    pub facilitator_session_key: String,
    pub facilitator_points: bool,
    /// Copy of the facilitator used when the facilitator row is missing.
    pub facilitator: User,
}

/// One decoded row of a session partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRow {
    Metadata(SessionMetadata),
    Facilitator(User),
    Participant(User),
    Watcher { connection_id: String },
    Unknown { sort_key: String },
}

impl SessionRow {
    /// Decode a stored record. Fails only when a known row kind is missing a
    /// required attribute.
    pub fn decode(table: &str, record: &Record) -> Result<Self, StoreError> {
        let sort_key = record.key.sort_key.as_deref().unwrap_or("");
        let row = if sort_key == METADATA_KEY {
            let facilitator = User {
                user_id: record.str_field(FACILITATOR_USER_ID).unwrap_or("").to_string(),
                name: record.str_field(FACILITATOR_NAME).unwrap_or("").to_string(),
                handle: record.str_field(FACILITATOR_HANDLE).map(str::to_string),
                current_vote: None,
                connection_id: String::new(),
            };
            Self::Metadata(SessionMetadata {
                votes_shown: record.bool_field(VOTES_SHOWN).unwrap_or(false),
                facilitator_session_key: record
                    .require_str(table, FACILITATOR_SESSION_KEY)?
                    .to_string(),
                facilitator_points: record.bool_field(FACILITATOR_POINTS).unwrap_or(false),
                facilitator,
            })
        } else if sort_key == FACILITATOR_KEY {
            Self::Facilitator(decode_user(table, record)?)
        } else if sort_key.starts_with(PARTICIPANT_PREFIX) {
            Self::Participant(decode_user(table, record)?)
        } else if let Some(conn) = sort_key.strip_prefix(WATCHER_PREFIX) {
            Self::Watcher {
                connection_id: record.connection_id.clone().unwrap_or_else(|| conn.to_string()),
            }
        } else {
            Self::Unknown {
                sort_key: sort_key.to_string(),
            }
        };
        Ok(row)
    }
}

fn decode_user(table: &str, record: &Record) -> Result<User, StoreError> {
    Ok(User {
        user_id: record.require_str(table, USER_ID)?.to_string(),
        name: record.str_field(NAME).unwrap_or("").to_string(),
        handle: record.str_field(HANDLE).map(str::to_string),
        current_vote: record.str_field(CURRENT_VOTE).map(str::to_string),
        connection_id: record.connection_id.clone().unwrap_or_default(),
    })
}

fn user_record(key: RecordKey, user: &User, expires_at: DateTime<Utc>) -> Record {
    let mut record = Record::new(key)
        .with_expiry(expires_at)
        .with_field(USER_ID, user.user_id.as_str())
        .with_field(NAME, user.name.as_str());
    if let Some(handle) = &user.handle {
        record = record.with_field(HANDLE, handle.as_str());
    }
    if let Some(vote) = &user.current_vote {
        record = record.with_field(CURRENT_VOTE, vote.as_str());
    }
    if !user.connection_id.is_empty() {
        record = record.with_connection(user.connection_id.as_str());
    }
    record
}

/// Record for a single user row.
pub fn encode_user(
    session_id: &str,
    user: &User,
    role: UserRole,
    expires_at: DateTime<Utc>,
) -> Record {
    let key = RecordKey::sorted(session_id, user_key(role, &user.connection_id));
    user_record(key, user, expires_at)
}

pub fn encode_watcher(session_id: &str, connection_id: &str, expires_at: DateTime<Utc>) -> Record {
    Record::new(RecordKey::sorted(session_id, watcher_key(connection_id)))
        .with_connection(connection_id)
        .with_expiry(expires_at)
}

/// Metadata, facilitator and participant records for a full save.
pub fn encode_aggregate(aggregate: &SessionAggregate, expires_at: DateTime<Utc>) -> Vec<Record> {
    let sid = aggregate.session_id.as_str();
    let facilitator = &aggregate.facilitator;

    let mut metadata = Record::new(RecordKey::sorted(sid, METADATA_KEY))
        .with_expiry(expires_at)
        .with_field(VOTES_SHOWN, aggregate.votes_shown)
        .with_field(FACILITATOR_SESSION_KEY, aggregate.facilitator_session_key.as_str())
        .with_field(FACILITATOR_POINTS, aggregate.facilitator_points)
        .with_field(FACILITATOR_USER_ID, facilitator.user_id.as_str())
        .with_field(FACILITATOR_NAME, facilitator.name.as_str());
    if let Some(handle) = &facilitator.handle {
        metadata = metadata.with_field(FACILITATOR_HANDLE, handle.as_str());
    }

    let mut records = Vec::with_capacity(aggregate.participants.len() + 2);
    records.push(metadata);
    records.push(encode_user(sid, facilitator, UserRole::Facilitator, expires_at));
    records.extend(
        aggregate
            .participants
            .iter()
            .map(|p| encode_user(sid, p, UserRole::Participant, expires_at)),
    );
    records
}

/// Reduce decoded rows into an aggregate. `None` when no metadata row exists.
///
/// Rows must arrive in sort-key order; participant order follows it.
pub fn fold_rows(session_id: &str, rows: impl IntoIterator<Item = SessionRow>) -> Option<SessionAggregate> {
    let mut metadata: Option<SessionMetadata> = None;
    let mut facilitator: Option<User> = None;
    let mut participants = Vec::new();

    for row in rows {
        match row {
            SessionRow::Metadata(m) => metadata = Some(m),
            SessionRow::Facilitator(u) => facilitator = Some(u),
            SessionRow::Participant(u) => participants.push(u),
            SessionRow::Watcher { .. } => {}
            SessionRow::Unknown { sort_key } => {
                warn!(session_id, sort_key = %sort_key, "skipping unknown session row");
            }
        }
    }

    let metadata = metadata?;
    Some(SessionAggregate {
        session_id: session_id.to_string(),
        votes_shown: metadata.votes_shown,
        facilitator_session_key: metadata.facilitator_session_key,
        facilitator: facilitator.unwrap_or(metadata.facilitator),
        facilitator_points: metadata.facilitator_points,
        participants,
    })
}

/// Read and reduce a session partition.
pub async fn load_aggregate(
    kv: &dyn KvStore,
    ctx: &CallContext,
    table: &str,
    session_id: &str,
) -> Result<Option<SessionAggregate>, StoreError> {
    let records = kv.query_partition(ctx, table, session_id).await?;
    let rows = records
        .iter()
        .map(|r| SessionRow::decode(table, r))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(fold_rows(session_id, rows))
}
