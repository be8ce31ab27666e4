use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Public profile attached to an anonymous identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row of the `messages` table, exactly as the change-feed delivers it.
/// Messages self-destruct 24 hours after `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// One row of the `signals` table: an intent to watch a movie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub movie_id: i64,
    pub movie_title: String,
    pub movie_poster: Option<String>,
    pub theater_name: Option<String>,
    pub showtime: Option<String>,
    pub tag: SignalTag,
    pub note: Option<String>,
    pub location: Option<String>,
    pub intent: Option<SignalIntent>,
    pub gender_age_label: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalTag {
    /// Holds a discounted or two-for-one ticket and wants to split it
    HasTicket,
    /// Wants company for a horror film
    SeekCompanion,
    /// Just filling seats, no chatting
    PureWatch,
    /// Wants to talk the film over afterwards
    WantDiscuss,
}

impl SignalTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HasTicket => "has_ticket",
            Self::SeekCompanion => "seek_companion",
            Self::PureWatch => "pure_watch",
            Self::WantDiscuss => "want_discuss",
        }
    }
}

impl fmt::Display for SignalTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "has_ticket" => Ok(Self::HasTicket),
            "seek_companion" => Ok(Self::SeekCompanion),
            "pure_watch" => Ok(Self::PureWatch),
            "want_discuss" => Ok(Self::WantDiscuss),
            other => Err(format!("unknown signal tag: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalIntent {
    AaSplit,
    ITreat,
    JustWatch,
}

impl SignalIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AaSplit => "aa_split",
            Self::ITreat => "i_treat",
            Self::JustWatch => "just_watch",
        }
    }
}

impl fmt::Display for SignalIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalIntent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aa_split" => Ok(Self::AaSplit),
            "i_treat" => Ok(Self::ITreat),
            "just_watch" => Ok(Self::JustWatch),
            other => Err(format!("unknown signal intent: {other}")),
        }
    }
}
