//! SQLite row types. Kept apart from the reel-types models so the storage
//! layout can change without touching the wire shapes.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use reel_types::models::{MessageRow, Profile, SignalIntent, SignalRow, SignalTag};
use uuid::Uuid;

pub struct ProfileRecord {
    pub id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub created_at: String,
}

#[derive(Clone)]
pub struct MessageRecord {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub is_read: bool,
    pub created_at: String,
}

pub struct SignalRecord {
    pub id: String,
    pub user_id: String,
    pub movie_id: i64,
    pub movie_title: String,
    pub movie_poster: Option<String>,
    pub theater_name: Option<String>,
    pub showtime: Option<String>,
    pub tag: String,
    pub note: Option<String>,
    pub location: Option<String>,
    pub intent: Option<String>,
    pub gender_age_label: Option<String>,
    pub is_active: bool,
    pub created_at: String,
}

/// One counterpart of the caller, newest message first.
pub struct ConversationRecord {
    pub counterpart_id: String,
    pub profile: Option<ProfileRecord>,
    pub last_message: MessageRecord,
    pub unread_count: u32,
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
pub fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp: {raw}"))?
        .with_timezone(&Utc))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("bad id: {raw}"))
}

impl TryFrom<ProfileRecord> for Profile {
    type Error = anyhow::Error;

    fn try_from(r: ProfileRecord) -> Result<Self> {
        Ok(Profile {
            id: parse_id(&r.id)?,
            display_name: r.display_name,
            avatar_url: r.avatar_url,
            created_at: parse_time(&r.created_at)?,
        })
    }
}

impl From<&Profile> for ProfileRecord {
    fn from(p: &Profile) -> Self {
        ProfileRecord {
            id: p.id.to_string(),
            display_name: p.display_name.clone(),
            avatar_url: p.avatar_url.clone(),
            created_at: format_time(p.created_at),
        }
    }
}

impl TryFrom<MessageRecord> for MessageRow {
    type Error = anyhow::Error;

    fn try_from(r: MessageRecord) -> Result<Self> {
        Ok(MessageRow {
            id: parse_id(&r.id)?,
            sender_id: parse_id(&r.sender_id)?,
            receiver_id: parse_id(&r.receiver_id)?,
            content: r.content,
            is_read: r.is_read,
            created_at: parse_time(&r.created_at)?,
        })
    }
}

impl From<&MessageRow> for MessageRecord {
    fn from(m: &MessageRow) -> Self {
        MessageRecord {
            id: m.id.to_string(),
            sender_id: m.sender_id.to_string(),
            receiver_id: m.receiver_id.to_string(),
            content: m.content.clone(),
            is_read: m.is_read,
            created_at: format_time(m.created_at),
        }
    }
}

impl TryFrom<SignalRecord> for SignalRow {
    type Error = anyhow::Error;

    fn try_from(r: SignalRecord) -> Result<Self> {
        Ok(SignalRow {
            id: parse_id(&r.id)?,
            user_id: parse_id(&r.user_id)?,
            movie_id: r.movie_id,
            movie_title: r.movie_title,
            movie_poster: r.movie_poster,
            theater_name: r.theater_name,
            showtime: r.showtime,
            tag: r.tag.parse::<SignalTag>().map_err(anyhow::Error::msg)?,
            note: r.note,
            location: r.location,
            intent: r.intent.as_deref().map(str::parse::<SignalIntent>).transpose().map_err(anyhow::Error::msg)?,
            gender_age_label: r.gender_age_label,
            is_active: r.is_active,
            created_at: parse_time(&r.created_at)?,
        })
    }
}

impl From<&SignalRow> for SignalRecord {
    fn from(s: &SignalRow) -> Self {
        SignalRecord {
            id: s.id.to_string(),
            user_id: s.user_id.to_string(),
            movie_id: s.movie_id,
            movie_title: s.movie_title.clone(),
            movie_poster: s.movie_poster.clone(),
            theater_name: s.theater_name.clone(),
            showtime: s.showtime.clone(),
            tag: s.tag.as_str().to_string(),
            note: s.note.clone(),
            location: s.location.clone(),
            intent: s.intent.map(|i| i.as_str().to_string()),
            gender_age_label: s.gender_age_label.clone(),
            is_active: s.is_active,
            created_at: format_time(s.created_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn timestamps_sort_as_text() {
        let early = Utc::now();
        let late = early + Duration::milliseconds(1500);
        assert!(format_time(early) < format_time(late));
        assert_eq!(parse_time(&format_time(early)).unwrap().timestamp_micros(), early.timestamp_micros());
    }

    #[test]
    fn rejects_unknown_tag() {
        let record = SignalRecord {
            id: Uuid::new_v4().to_string(),
            user_id: Uuid::new_v4().to_string(),
            movie_id: 1,
            movie_title: "x".into(),
            movie_poster: None,
            theater_name: None,
            showtime: None,
            tag: "bring_snacks".into(),
            note: None,
            location: None,
            intent: None,
            gender_age_label: None,
            is_active: true,
            created_at: format_time(Utc::now()),
        };
        assert!(SignalRow::try_from(record).is_err());
    }
}
