//! Usage statistics.
//!
//! Counters live on the caller's profile row and are bumped inside the same
//! transaction as the write they describe, so a count never drifts from what
//! actually committed. Anonymous callers are not counted.

use serde::{Deserialize, Serialize};

use crate::kv::{RecordKey, WriteOp};

const SESSION_START_COUNT: &str = "SessionStartCount";
const SESSION_WATCH_COUNT: &str = "SessionWatchCount";
const SESSION_JOIN_COUNT: &str = "SessionJoinCount";
const VOTE_COUNT: &str = "VoteCount";

/// Authenticated identity of a caller, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: String,
}

impl Principal {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_empty()
    }
}

/// Builds counter increments against the profile table.
#[derive(Debug, Clone)]
pub struct StatsUpdateFactory {
    table: String,
}

impl StatsUpdateFactory {
    pub fn new(profile_table: impl Into<String>) -> Self {
        Self {
            table: profile_table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn session_start(&self, principal: &Principal) -> Option<WriteOp> {
        self.increment(principal, SESSION_START_COUNT)
    }

    pub fn session_watch(&self, principal: &Principal) -> Option<WriteOp> {
        self.increment(principal, SESSION_WATCH_COUNT)
    }

    pub fn session_join(&self, principal: &Principal) -> Option<WriteOp> {
        self.increment(principal, SESSION_JOIN_COUNT)
    }

    pub fn vote(&self, principal: &Principal) -> Option<WriteOp> {
        self.increment(principal, VOTE_COUNT)
    }

    fn increment(&self, principal: &Principal, field: &str) -> Option<WriteOp> {
        if principal.is_anonymous() {
            return None;
        }
        Some(WriteOp::Increment {
            table: self.table.clone(),
            key: RecordKey::partition(principal.user_id.as_str()),
            field: field.to_string(),
            amount: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_targets_profile_row() {
        let stats = StatsUpdateFactory::new("profiles");
        match stats.vote(&Principal::new("u1")) {
            Some(WriteOp::Increment {
                table,
                key,
                field,
                amount,
            }) => {
                assert_eq!(table, "profiles");
                assert_eq!(key, RecordKey::partition("u1"));
                assert_eq!(field, "VoteCount");
                assert_eq!(amount, 1);
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_anonymous_is_not_counted() {
        let stats = StatsUpdateFactory::new("profiles");
        assert!(stats.session_start(&Principal::anonymous()).is_none());
        assert!(stats.session_join(&Principal::anonymous()).is_none());
    }
}
