use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use reel_realtime::{Datastore, StoreError};
use reel_types::api::{Conversation, CreateSignalRequest, MessageWithSender, SignalFilter, SignalWithProfile};
use reel_types::events::ChangeEvent;
use reel_types::models::{MessageRow, Profile, SignalRow};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::Database;
use crate::dispatcher::Dispatcher;
use crate::models::{MessageRecord, ProfileRecord, SignalRecord, format_time};

/// Messages and signals older than this are swept.
pub const DEFAULT_TTL_HOURS: i64 = 24;

/// Local stand-in for the hosted backend: caller-scoped queries over SQLite,
/// with every committed write published on the dispatcher.
pub struct LocalBackend {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    ttl: Duration,
}

impl LocalBackend {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            dispatcher: Dispatcher::new("public", &["messages", "signals"]),
            ttl: Duration::hours(DEFAULT_TTL_HOURS),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// The change feed fed by this backend's writes.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Run a DB closure off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StoreError::Backend(e.to_string())
            })?
            .map_err(|e| {
                warn!(error = %e, "datastore query failed");
                StoreError::Backend(e.to_string())
            })
    }

    /// Create a fresh anonymous identity with its profile.
    pub async fn sign_in_anonymously(&self, display_name: Option<String>) -> Result<Profile, StoreError> {
        let id = Uuid::new_v4();
        let display_name = match display_name.map(|n| n.trim().to_string()) {
            Some(name) if !name.is_empty() => name,
            _ => format!("guest-{}", &id.simple().to_string()[..6]),
        };
        let profile = Profile {
            id,
            display_name,
            avatar_url: None,
            created_at: Utc::now(),
        };

        let record = ProfileRecord::from(&profile);
        self.blocking(move |db| db.insert_profile(&record)).await?;

        info!(user = %profile.id, "anonymous sign-in");
        Ok(profile)
    }

    pub async fn create_signal(&self, caller: Uuid, req: CreateSignalRequest) -> Result<SignalWithProfile, StoreError> {
        if req.movie_title.trim().is_empty() {
            return Err(StoreError::Invalid("movie title is required".into()));
        }

        let signal = SignalRow {
            id: Uuid::new_v4(),
            user_id: caller,
            movie_id: req.movie_id,
            movie_title: req.movie_title,
            movie_poster: req.movie_poster,
            theater_name: req.theater_name,
            showtime: req.showtime,
            tag: req.tag,
            note: req.note,
            location: req.location,
            intent: req.intent,
            gender_age_label: req.gender_age_label,
            is_active: true,
            created_at: Utc::now(),
        };

        let record = SignalRecord::from(&signal);
        let owner = caller.to_string();
        let profile = self
            .blocking(move |db| {
                let Some(profile) = db.get_profile(&owner)? else {
                    return Ok(None);
                };
                db.insert_signal(&record)?;
                Ok(Some(Profile::try_from(profile)?))
            })
            .await?
            .ok_or(StoreError::NotFound)?;

        debug!(signal = %signal.id, movie_id = signal.movie_id, tag = %signal.tag, "signal posted");
        self.dispatcher.publish_row(ChangeEvent::Insert(signal.clone()));

        Ok(SignalWithProfile {
            signal,
            profile: Some(profile),
        })
    }

    /// Remove one of the caller's own signals.
    pub async fn delete_signal(&self, caller: Uuid, id: Uuid) -> Result<(), StoreError> {
        let key = id.to_string();
        let existing = self
            .blocking(move |db| db.get_signal(&key)?.map(SignalRow::try_from).transpose())
            .await?
            .ok_or(StoreError::NotFound)?;

        if existing.user_id != caller {
            return Err(StoreError::Unauthorized);
        }

        let key = id.to_string();
        let removed = self
            .blocking(move |db| db.delete_signal(&key)?.map(SignalRow::try_from).transpose())
            .await?;

        if let Some(signal) = removed {
            debug!(signal = %signal.id, "signal withdrawn");
            self.dispatcher.publish_row(ChangeEvent::Delete(signal));
        }
        Ok(())
    }

    /// Delete messages and signals created before `now - ttl`, publishing a
    /// delete for each. Returns how many rows were removed.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = format_time(now - self.ttl);
        let (messages, signals) = self
            .blocking(move |db| {
                let messages = db.delete_messages_before(&cutoff)?;
                let signals = db.delete_signals_before(&cutoff)?;
                Ok((messages, signals))
            })
            .await?;

        let count = messages.len() + signals.len();

        for record in messages {
            match MessageRow::try_from(record) {
                Ok(row) => {
                    self.dispatcher.publish_row(ChangeEvent::Delete(row));
                }
                Err(e) => warn!(error = %e, "expired message not published"),
            }
        }
        for record in signals {
            match SignalRow::try_from(record) {
                Ok(row) => {
                    self.dispatcher.publish_row(ChangeEvent::Delete(row));
                }
                Err(e) => warn!(error = %e, "expired signal not published"),
            }
        }

        Ok(count)
    }
}

impl Datastore for LocalBackend {
    async fn conversations(&self, caller: Uuid) -> Result<Vec<Conversation>, StoreError> {
        let caller = caller.to_string();
        self.blocking(move |db| {
            db.conversations_for(&caller)?
                .into_iter()
                .map(|record| -> anyhow::Result<Conversation> {
                    Ok(Conversation {
                        user_id: record.counterpart_id.parse()?,
                        profile: record.profile.map(Profile::try_from).transpose()?,
                        last_message: MessageRow::try_from(record.last_message)?,
                        unread_count: record.unread_count,
                    })
                })
                .collect()
        })
        .await
    }

    async fn messages_with(&self, caller: Uuid, other: Uuid) -> Result<Vec<MessageWithSender>, StoreError> {
        let (caller, other) = (caller.to_string(), other.to_string());
        self.blocking(move |db| {
            db.messages_between(&caller, &other)?
                .into_iter()
                .map(|(message, sender)| -> anyhow::Result<MessageWithSender> {
                    Ok(MessageWithSender {
                        message: MessageRow::try_from(message)?,
                        sender: sender.map(Profile::try_from).transpose()?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn send_message(&self, caller: Uuid, receiver: Uuid, content: String) -> Result<MessageWithSender, StoreError> {
        if content.trim().is_empty() {
            return Err(StoreError::Invalid("message content is empty".into()));
        }
        if receiver == caller {
            return Err(StoreError::Invalid("cannot message yourself".into()));
        }

        let message = MessageRow {
            id: Uuid::new_v4(),
            sender_id: caller,
            receiver_id: receiver,
            content,
            is_read: false,
            created_at: Utc::now(),
        };

        let record = MessageRecord::from(&message);
        let sender = self
            .blocking(move |db| {
                let Some(sender) = db.get_profile(&record.sender_id)? else {
                    return Ok(None);
                };
                if db.get_profile(&record.receiver_id)?.is_none() {
                    return Ok(None);
                }
                db.insert_message(&record)?;
                Ok(Some(Profile::try_from(sender)?))
            })
            .await?
            .ok_or(StoreError::NotFound)?;

        debug!(message = %message.id, "message stored");
        self.dispatcher.publish_row(ChangeEvent::Insert(message.clone()));

        Ok(MessageWithSender {
            message,
            sender: Some(sender),
        })
    }

    async fn mark_read(&self, caller: Uuid, other: Uuid) -> Result<usize, StoreError> {
        let (me, them) = (caller.to_string(), other.to_string());
        let before = self
            .blocking(move |db| {
                db.mark_read(&me, &them)?
                    .into_iter()
                    .map(MessageRow::try_from)
                    .collect::<anyhow::Result<Vec<_>>>()
            })
            .await?;

        let count = before.len();
        for row in before {
            let after = MessageRow {
                is_read: true,
                ..row.clone()
            };
            self.dispatcher.publish_row(ChangeEvent::Update { before: row, after });
        }

        if count > 0 {
            debug!(count, "messages marked read");
        }
        Ok(count)
    }

    async fn signals(&self, filter: SignalFilter) -> Result<Vec<SignalWithProfile>, StoreError> {
        self.blocking(move |db| {
            db.list_signals(&filter)?
                .into_iter()
                .map(|(signal, profile)| -> anyhow::Result<SignalWithProfile> {
                    Ok(SignalWithProfile {
                        signal: SignalRow::try_from(signal)?,
                        profile: profile.map(Profile::try_from).transpose()?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn profile(&self, id: Uuid) -> Result<Option<Profile>, StoreError> {
        let id = id.to_string();
        self.blocking(move |db| db.get_profile(&id)?.map(Profile::try_from).transpose())
            .await
    }
}

#[cfg(test)]
mod tests {
    use reel_realtime::{ChangeFeed, ChannelSpec, FeedStatus, RowFilter};
    use reel_types::events::EventKind;
    use reel_types::models::SignalTag;

    use super::*;

    fn backend() -> LocalBackend {
        LocalBackend::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn inbox(me: Uuid) -> ChannelSpec {
        ChannelSpec {
            name: format!("global-messages-{me}"),
            table: "messages".into(),
            event: EventKind::Any,
            schema: "public".into(),
            filter: Some(RowFilter::eq("receiver_id", me)),
        }
    }

    #[tokio::test]
    async fn send_publishes_to_the_receiver_only() {
        let backend = backend();
        let alice = backend.sign_in_anonymously(Some("alice".into())).await.unwrap();
        let bob = backend.sign_in_anonymously(None).await.unwrap();
        assert!(bob.display_name.starts_with("guest-"));

        let mut bob_inbox = backend.dispatcher().open::<MessageRow>(&inbox(bob.id)).unwrap();
        let mut alice_inbox = backend.dispatcher().open::<MessageRow>(&inbox(alice.id)).unwrap();
        assert_eq!(bob_inbox.status.recv().await, Some(FeedStatus::Subscribed));

        let sent = backend.send_message(alice.id, bob.id, "see you at 7".into()).await.unwrap();
        assert_eq!(sent.sender.as_ref().map(|p| p.display_name.as_str()), Some("alice"));

        match bob_inbox.events.try_recv().unwrap() {
            ChangeEvent::Insert(row) => assert_eq!(row.id, sent.message.id),
            other => panic!("unexpected {other:?}"),
        }
        assert!(alice_inbox.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_validates() {
        let backend = backend();
        let alice = backend.sign_in_anonymously(None).await.unwrap();

        assert!(matches!(
            backend.send_message(alice.id, Uuid::new_v4(), "  ".into()).await,
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            backend.send_message(alice.id, alice.id, "hi".into()).await,
            Err(StoreError::Invalid(_))
        ));
        assert_eq!(
            backend.send_message(alice.id, Uuid::new_v4(), "hi".into()).await.unwrap_err(),
            StoreError::NotFound
        );
    }

    #[tokio::test]
    async fn mark_read_emits_updates_and_clears_unread() {
        let backend = backend();
        let alice = backend.sign_in_anonymously(None).await.unwrap();
        let bob = backend.sign_in_anonymously(None).await.unwrap();
        backend.send_message(alice.id, bob.id, "one".into()).await.unwrap();
        backend.send_message(alice.id, bob.id, "two".into()).await.unwrap();
        backend.send_message(bob.id, alice.id, "back".into()).await.unwrap();

        let conversations = backend.conversations(bob.id).await.unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].user_id, alice.id);
        assert_eq!(conversations[0].unread_count, 2);

        let mut bob_inbox = backend.dispatcher().open::<MessageRow>(&inbox(bob.id)).unwrap();
        assert_eq!(backend.mark_read(bob.id, alice.id).await.unwrap(), 2);

        let mut updates = 0;
        while let Ok(event) = bob_inbox.events.try_recv() {
            assert!(matches!(event, ChangeEvent::Update { ref before, ref after } if !before.is_read && after.is_read));
            updates += 1;
        }
        assert_eq!(updates, 2);
        assert_eq!(backend.conversations(bob.id).await.unwrap()[0].unread_count, 0);
        assert_eq!(backend.mark_read(bob.id, alice.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn only_owner_deletes_signal() {
        let backend = backend();
        let alice = backend.sign_in_anonymously(None).await.unwrap();
        let bob = backend.sign_in_anonymously(None).await.unwrap();

        let posted = backend
            .create_signal(alice.id, CreateSignalRequest::new(603, "The Matrix", SignalTag::WantDiscuss))
            .await
            .unwrap();
        assert_eq!(backend.signals(SignalFilter::default()).await.unwrap().len(), 1);

        assert_eq!(
            backend.delete_signal(bob.id, posted.signal.id).await,
            Err(StoreError::Unauthorized)
        );
        backend.delete_signal(alice.id, posted.signal.id).await.unwrap();
        assert!(backend.signals(SignalFilter::default()).await.unwrap().is_empty());
        assert_eq!(
            backend.delete_signal(alice.id, posted.signal.id).await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn cleanup_sweeps_old_rows() {
        let backend = backend();
        let alice = backend.sign_in_anonymously(None).await.unwrap();
        let bob = backend.sign_in_anonymously(None).await.unwrap();
        backend.send_message(alice.id, bob.id, "old".into()).await.unwrap();
        backend
            .create_signal(alice.id, CreateSignalRequest::new(1, "Alien", SignalTag::SeekCompanion))
            .await
            .unwrap();

        assert_eq!(backend.cleanup_expired(Utc::now()).await.unwrap(), 0);

        let mut lobby = backend
            .dispatcher()
            .open::<SignalRow>(&ChannelSpec {
                name: "signals-lobby-global".into(),
                table: "signals".into(),
                event: EventKind::Delete,
                schema: "public".into(),
                filter: None,
            })
            .unwrap();

        let later = Utc::now() + Duration::hours(DEFAULT_TTL_HOURS) + Duration::minutes(1);
        assert_eq!(backend.cleanup_expired(later).await.unwrap(), 2);
        assert!(matches!(lobby.events.try_recv(), Ok(ChangeEvent::Delete(_))));
        assert!(backend.messages_with(alice.id, bob.id).await.unwrap().is_empty());
    }
}
