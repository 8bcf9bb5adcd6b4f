//! Session aggregate and per-viewer views.
//!
//! The canonical aggregate always carries every vote. Redaction happens only
//! when a view is derived for a particular connection.

use serde::{Deserialize, Serialize};

// ============================================================================
// Users
// ============================================================================

/// A facilitator or participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Overrides `name` for display when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_vote: Option<String>,
    /// Live push address. Changes across reconnects; not part of identity.
    #[serde(skip)]
    pub connection_id: String,
}

impl User {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = connection_id.into();
        self
    }

    pub fn with_vote(mut self, vote: impl Into<String>) -> Self {
        self.current_vote = Some(vote.into());
        self
    }

    /// Handle if set and non-empty.
    pub fn display_handle(&self) -> Option<&str> {
        self.handle.as_deref().filter(|h| !h.is_empty())
    }

    /// True when this user's row belongs to the given live connection.
    pub fn is_connection(&self, connection_id: &str) -> bool {
        !connection_id.is_empty() && self.connection_id == connection_id
    }
}

/// Which row a user record is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    Facilitator,
    Participant,
}

// ============================================================================
// Aggregate
// ============================================================================

/// The complete, unredacted session. Sent only to the facilitator's connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAggregate {
    pub session_id: String,
    pub votes_shown: bool,
    /// Capability granting facilitator rights; compared by the caller, never here.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub facilitator_session_key: String,
    pub facilitator: User,
    pub facilitator_points: bool,
    pub participants: Vec<User>,
}

impl SessionAggregate {
    /// The user row owned by `connection_id`, facilitator first.
    pub fn user_for_connection_mut(&mut self, connection_id: &str) -> Option<(UserRole, &mut User)> {
        if self.facilitator.is_connection(connection_id) {
            return Some((UserRole::Facilitator, &mut self.facilitator));
        }
        self.participants
            .iter_mut()
            .find(|u| u.is_connection(connection_id))
            .map(|u| (UserRole::Participant, u))
    }

    pub fn participant_for_connection(&self, connection_id: &str) -> Option<&User> {
        self.participants.iter().find(|u| u.is_connection(connection_id))
    }

    /// Drop every vote, facilitator included.
    pub fn clear_votes(&mut self) {
        self.facilitator.current_vote = None;
        for participant in &mut self.participants {
            participant.current_vote = None;
        }
    }

    pub fn is_facilitator_connection(&self, connection_id: &str) -> bool {
        self.facilitator.is_connection(connection_id)
    }

    /// Redacted view for `connection_id`.
    pub fn participant_view(&self, connection_id: &str) -> ParticipantView {
        ParticipantView {
            session_id: self.session_id.clone(),
            votes_shown: self.votes_shown,
            facilitator: self.user_view(&self.facilitator, connection_id),
            facilitator_points: self.facilitator_points,
            participants: self
                .participants
                .iter()
                .map(|u| self.user_view(u, connection_id))
                .collect(),
        }
    }

    /// Whatever `connection_id` is entitled to see.
    pub fn view_for(&self, connection_id: &str) -> SessionView {
        if self.is_facilitator_connection(connection_id) {
            SessionView::Complete(self.clone())
        } else {
            SessionView::Participant(self.participant_view(connection_id))
        }
    }

    fn user_view(&self, user: &User, connection_id: &str) -> UserView {
        let handle = user.display_handle().map(str::to_string);
        UserView {
            user_id: user.user_id.clone(),
            name: handle.is_none().then(|| user.name.clone()),
            handle,
            current_vote: if self.votes_shown || user.is_connection(connection_id) {
                user.current_vote.clone()
            } else {
                None
            },
        }
    }
}

// ============================================================================
// Views
// ============================================================================

/// A user as seen by somebody other than the facilitator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_vote: Option<String>,
}

/// Session as seen by a participant or watcher. Never carries the capability key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub session_id: String,
    pub votes_shown: bool,
    pub facilitator: UserView,
    pub facilitator_points: bool,
    pub participants: Vec<UserView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SessionView {
    Complete(SessionAggregate),
    Participant(ParticipantView),
}

// ============================================================================
// Requests
// ============================================================================

/// Input to [`crate::session::SessionStore::start`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub facilitator: User,
    pub facilitator_points: bool,
    /// Facilitator's live connection, if already open.
    #[serde(default)]
    pub connection_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(votes_shown: bool) -> SessionAggregate {
        SessionAggregate {
            session_id: "abcdefg".to_string(),
            votes_shown,
            facilitator_session_key: "bobsuruncle".to_string(),
            facilitator: User::new("f", "Bob")
                .with_handle("TheTester")
                .with_connection("facilitator"),
            facilitator_points: true,
            participants: vec![
                User::new("a", "A").with_vote("1").with_connection("aaaa"),
                User::new("b", "B")
                    .with_handle("BBB")
                    .with_vote("2")
                    .with_connection("bbbb"),
            ],
        }
    }

    #[test]
    fn test_hidden_votes_show_only_own_vote() {
        let view = session(false).participant_view("aaaa");

        assert_eq!(view.participants[0].current_vote.as_deref(), Some("1"));
        assert_eq!(view.participants[1].current_vote, None);
    }

    #[test]
    fn test_revealed_votes_visible_to_all() {
        let view = session(true).participant_view("somebody-else");

        assert_eq!(view.participants[0].current_vote.as_deref(), Some("1"));
        assert_eq!(view.participants[1].current_vote.as_deref(), Some("2"));
    }

    #[test]
    fn test_handle_replaces_name() {
        let view = session(true).participant_view("aaaa");

        assert_eq!(
            view.facilitator,
            UserView {
                user_id: "f".to_string(),
                name: None,
                handle: Some("TheTester".to_string()),
                current_vote: None,
            }
        );
        assert_eq!(view.participants[0].name.as_deref(), Some("A"));
        assert_eq!(view.participants[0].handle, None);
        assert_eq!(view.participants[1].name, None);
    }

    #[test]
    fn test_empty_handle_falls_back_to_name() {
        let mut s = session(true);
        s.participants[0].handle = Some(String::new());
        let view = s.participant_view("x");
        assert_eq!(view.participants[0].name.as_deref(), Some("A"));
        assert_eq!(view.participants[0].handle, None);
    }

    #[test]
    fn test_facilitator_connection_gets_complete_view() {
        let s = session(false);
        match s.view_for("facilitator") {
            SessionView::Complete(full) => {
                assert_eq!(full.facilitator_session_key, "bobsuruncle");
                assert_eq!(full.participants[1].current_vote.as_deref(), Some("2"));
            }
            other => panic!("expected complete view, got {:?}", other),
        }
        assert!(matches!(s.view_for("aaaa"), SessionView::Participant(_)));
    }

    #[test]
    fn test_empty_connection_matches_nobody() {
        let mut s = session(false);
        s.facilitator.connection_id.clear();
        assert!(matches!(s.view_for(""), SessionView::Participant(_)));
        assert!(s.user_for_connection_mut("").is_none());
    }

    #[test]
    fn test_participant_view_never_serializes_key() {
        let json = serde_json::to_value(session(true).view_for("aaaa")).unwrap();
        assert!(json.get("facilitatorSessionKey").is_none());
        assert_eq!(json["participants"][1]["handle"], "BBB");
    }

    #[test]
    fn test_clear_votes() {
        let mut s = session(true);
        s.facilitator.current_vote = Some("3".to_string());
        s.clear_votes();
        assert!(s.facilitator.current_vote.is_none());
        assert!(s.participants.iter().all(|u| u.current_vote.is_none()));
    }
}
