use std::collections::HashMap;

use crate::Database;
use crate::models::{ConversationRecord, MessageRecord, ProfileRecord, SignalRecord};
use anyhow::Result;
use reel_types::api::SignalFilter;
use rusqlite::types::ToSql;
use rusqlite::{Connection, Row, params};

const MESSAGE_COLUMNS: &str = "m.id, m.sender_id, m.receiver_id, m.content, m.is_read, m.created_at";

const SIGNAL_COLUMNS: &str = "s.id, s.user_id, s.movie_id, s.movie_title, s.movie_poster, s.theater_name,
     s.showtime, s.tag, s.note, s.location, s.intent, s.gender_age_label, s.is_active, s.created_at";

const PROFILE_COLUMNS: &str = "p.id, p.display_name, p.avatar_url, p.created_at";

impl Database {
    // -- Profiles --

    pub fn insert_profile(&self, profile: &ProfileRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO profiles (id, display_name, avatar_url, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![profile.id, profile.display_name, profile.avatar_url, profile.created_at],
            )?;
            Ok(())
        })
    }

    pub fn get_profile(&self, id: &str) -> Result<Option<ProfileRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {PROFILE_COLUMNS} FROM profiles p WHERE p.id = ?1"),
                [id],
                |row| profile_from_row(row, 0),
            )
            .optional()
        })
    }

    // -- Messages --

    pub fn insert_message(&self, message: &MessageRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, sender_id, receiver_id, content, is_read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id,
                    message.sender_id,
                    message.receiver_id,
                    message.content,
                    message.is_read,
                    message.created_at
                ],
            )?;
            Ok(())
        })
    }

    /// Both directions between two identities, oldest first, with the
    /// sender's profile.
    pub fn messages_between(&self, a: &str, b: &str) -> Result<Vec<(MessageRecord, Option<ProfileRecord>)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS}, {PROFILE_COLUMNS}
                 FROM messages m
                 LEFT JOIN profiles p ON p.id = m.sender_id
                 WHERE (m.sender_id = ?1 AND m.receiver_id = ?2)
                    OR (m.sender_id = ?2 AND m.receiver_id = ?1)
                 ORDER BY m.created_at ASC"
            ))?;

            let rows = stmt
                .query_map(params![a, b], |row| Ok((message_from_row(row, 0)?, optional_profile(row, 6)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Every counterpart of `caller`, most recent conversation first, with
    /// the number of unread messages the counterpart sent.
    pub fn conversations_for(&self, caller: &str) -> Result<Vec<ConversationRecord>> {
        self.with_conn(|conn| query_conversations(conn, caller))
    }

    /// Flag everything `other` sent to `caller` as read. Returns the rows as
    /// they were before the update.
    pub fn mark_read(&self, caller: &str, other: &str) -> Result<Vec<MessageRecord>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let before = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages m
                     WHERE m.sender_id = ?1 AND m.receiver_id = ?2 AND m.is_read = 0"
                ))?;
                let rows = stmt.query_map(params![other, caller], |row| message_from_row(row, 0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };
            tx.execute(
                "UPDATE messages SET is_read = 1 WHERE sender_id = ?1 AND receiver_id = ?2 AND is_read = 0",
                params![other, caller],
            )?;
            tx.commit()?;
            Ok(before)
        })
    }

    /// Remove messages created before `cutoff`, returning what was removed.
    pub fn delete_messages_before(&self, cutoff: &str) -> Result<Vec<MessageRecord>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let expired = {
                let mut stmt =
                    tx.prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.created_at < ?1"))?;
                let rows = stmt.query_map([cutoff], |row| message_from_row(row, 0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };
            tx.execute("DELETE FROM messages WHERE created_at < ?1", [cutoff])?;
            tx.commit()?;
            Ok(expired)
        })
    }

    // -- Signals --

    pub fn insert_signal(&self, signal: &SignalRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO signals (id, user_id, movie_id, movie_title, movie_poster, theater_name,
                     showtime, tag, note, location, intent, gender_age_label, is_active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    signal.id,
                    signal.user_id,
                    signal.movie_id,
                    signal.movie_title,
                    signal.movie_poster,
                    signal.theater_name,
                    signal.showtime,
                    signal.tag,
                    signal.note,
                    signal.location,
                    signal.intent,
                    signal.gender_age_label,
                    signal.is_active,
                    signal.created_at
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_signal(&self, id: &str) -> Result<Option<SignalRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {SIGNAL_COLUMNS} FROM signals s WHERE s.id = ?1"),
                [id],
                |row| signal_from_row(row, 0),
            )
            .optional()
        })
    }

    /// Delete one signal, returning it if it existed.
    pub fn delete_signal(&self, id: &str) -> Result<Option<SignalRecord>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let existing = tx
                .query_row(
                    &format!("SELECT {SIGNAL_COLUMNS} FROM signals s WHERE s.id = ?1"),
                    [id],
                    |row| signal_from_row(row, 0),
                )
                .optional()?;
            if existing.is_some() {
                tx.execute("DELETE FROM signals WHERE id = ?1", [id])?;
            }
            tx.commit()?;
            Ok(existing)
        })
    }

    /// Active signals matching `filter`, newest first, with the poster's
    /// profile.
    pub fn list_signals(&self, filter: &SignalFilter) -> Result<Vec<(SignalRecord, Option<ProfileRecord>)>> {
        let mut conditions = vec!["s.is_active = 1".to_string()];
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(movie_id) = filter.movie_id {
            args.push(Box::new(movie_id));
            conditions.push(format!("s.movie_id = ?{}", args.len()));
        }
        if let Some(tag) = filter.tag {
            args.push(Box::new(tag.as_str()));
            conditions.push(format!("s.tag = ?{}", args.len()));
        }
        if let Some(location) = &filter.location {
            args.push(Box::new(location.clone()));
            conditions.push(format!("s.location = ?{}", args.len()));
        }
        if let Some(intent) = filter.intent {
            args.push(Box::new(intent.as_str()));
            conditions.push(format!("s.intent = ?{}", args.len()));
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {SIGNAL_COLUMNS}, {PROFILE_COLUMNS}
                 FROM signals s
                 LEFT JOIN profiles p ON p.id = s.user_id
                 WHERE {}
                 ORDER BY s.created_at DESC",
                conditions.join(" AND ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| Ok((signal_from_row(row, 0)?, optional_profile(row, 14)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn delete_signals_before(&self, cutoff: &str) -> Result<Vec<SignalRecord>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let expired = {
                let mut stmt =
                    tx.prepare(&format!("SELECT {SIGNAL_COLUMNS} FROM signals s WHERE s.created_at < ?1"))?;
                let rows = stmt.query_map([cutoff], |row| signal_from_row(row, 0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };
            tx.execute("DELETE FROM signals WHERE created_at < ?1", [cutoff])?;
            tx.commit()?;
            Ok(expired)
        })
    }
}

fn query_conversations(conn: &Connection, caller: &str) -> Result<Vec<ConversationRecord>> {
    // One pass over the caller's messages, newest first; the first row seen
    // per counterpart is that conversation's last message.
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS}, {PROFILE_COLUMNS}
         FROM messages m
         LEFT JOIN profiles p
             ON p.id = CASE WHEN m.sender_id = ?1 THEN m.receiver_id ELSE m.sender_id END
         WHERE m.sender_id = ?1 OR m.receiver_id = ?1
         ORDER BY m.created_at DESC"
    ))?;

    let rows = stmt
        .query_map([caller], |row| Ok((message_from_row(row, 0)?, optional_profile(row, 6)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut conversations: Vec<ConversationRecord> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (message, profile) in rows {
        let counterpart = if message.sender_id == caller {
            message.receiver_id.clone()
        } else {
            message.sender_id.clone()
        };
        let unread = message.receiver_id == caller && !message.is_read;

        match index.get(&counterpart) {
            Some(&i) => {
                if unread {
                    conversations[i].unread_count += 1;
                }
            }
            None => {
                index.insert(counterpart.clone(), conversations.len());
                conversations.push(ConversationRecord {
                    counterpart_id: counterpart,
                    profile,
                    last_message: message,
                    unread_count: u32::from(unread),
                });
            }
        }
    }

    Ok(conversations)
}

fn message_from_row(row: &Row<'_>, at: usize) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(at)?,
        sender_id: row.get(at + 1)?,
        receiver_id: row.get(at + 2)?,
        content: row.get(at + 3)?,
        is_read: row.get(at + 4)?,
        created_at: row.get(at + 5)?,
    })
}

fn profile_from_row(row: &Row<'_>, at: usize) -> rusqlite::Result<ProfileRecord> {
    Ok(ProfileRecord {
        id: row.get(at)?,
        display_name: row.get(at + 1)?,
        avatar_url: row.get(at + 2)?,
        created_at: row.get(at + 3)?,
    })
}

/// A LEFT JOINed profile: absent when the id column is NULL.
fn optional_profile(row: &Row<'_>, at: usize) -> rusqlite::Result<Option<ProfileRecord>> {
    match row.get::<_, Option<String>>(at)? {
        Some(_) => profile_from_row(row, at).map(Some),
        None => Ok(None),
    }
}

fn signal_from_row(row: &Row<'_>, at: usize) -> rusqlite::Result<SignalRecord> {
    Ok(SignalRecord {
        id: row.get(at)?,
        user_id: row.get(at + 1)?,
        movie_id: row.get(at + 2)?,
        movie_title: row.get(at + 3)?,
        movie_poster: row.get(at + 4)?,
        theater_name: row.get(at + 5)?,
        showtime: row.get(at + 6)?,
        tag: row.get(at + 7)?,
        note: row.get(at + 8)?,
        location: row.get(at + 9)?,
        intent: row.get(at + 10)?,
        gender_age_label: row.get(at + 11)?,
        is_active: row.get(at + 12)?,
        created_at: row.get(at + 13)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
