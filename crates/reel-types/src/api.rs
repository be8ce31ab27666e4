use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageRow, Profile, SignalIntent, SignalRow, SignalTag};

// -- Messages --

/// One entry of the caller's conversation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// The counterpart of the conversation
    pub user_id: Uuid,
    pub profile: Option<Profile>,
    pub last_message: MessageRow,
    /// Messages from the counterpart to the caller not yet read
    pub unread_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationsResponse {
    pub conversations: Vec<Conversation>,
}

impl ConversationsResponse {
    /// Total unread across every conversation, the number behind the badge.
    pub fn total_unread(&self) -> u32 {
        total_unread(&self.conversations)
    }
}

pub fn total_unread(conversations: &[Conversation]) -> u32 {
    conversations
        .iter()
        .fold(0u32, |sum, c| sum.saturating_add(c.unread_count))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageWithSender {
    #[serde(flatten)]
    pub message: MessageRow,
    pub sender: Option<Profile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub receiver_id: Uuid,
    pub content: String,
}

// -- Signals --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalWithProfile {
    #[serde(flatten)]
    pub signal: SignalRow,
    pub profile: Option<Profile>,
}

/// Listing parameters for the signal lobby. Unset fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalFilter {
    pub movie_id: Option<i64>,
    pub tag: Option<SignalTag>,
    pub location: Option<String>,
    pub intent: Option<SignalIntent>,
}

impl SignalFilter {
    pub fn matches(&self, signal: &SignalRow) -> bool {
        if !signal.is_active {
            return false;
        }
        if self.movie_id.is_some_and(|id| id != signal.movie_id) {
            return false;
        }
        if self.tag.is_some_and(|tag| tag != signal.tag) {
            return false;
        }
        if let Some(location) = &self.location {
            if signal.location.as_deref() != Some(location.as_str()) {
                return false;
            }
        }
        if self.intent.is_some() && self.intent != signal.intent {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSignalRequest {
    pub movie_id: i64,
    pub movie_title: String,
    pub movie_poster: Option<String>,
    pub tag: SignalTag,
    pub theater_name: Option<String>,
    pub showtime: Option<String>,
    pub note: Option<String>,
    pub location: Option<String>,
    pub intent: Option<SignalIntent>,
    pub gender_age_label: Option<String>,
}

impl CreateSignalRequest {
    pub fn new(movie_id: i64, movie_title: impl Into<String>, tag: SignalTag) -> Self {
        Self {
            movie_id,
            movie_title: movie_title.into(),
            movie_poster: None,
            tag,
            theater_name: None,
            showtime: None,
            note: None,
            location: None,
            intent: None,
            gender_age_label: None,
        }
    }
}
