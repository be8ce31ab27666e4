//! Scripted collaborators for driving the realtime state machines under a
//! paused Tokio clock.

use std::any::Any;
use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use reel_types::api::{Conversation, MessageWithSender, SignalFilter, SignalWithProfile};
use reel_types::events::{ChangeEvent, FeedRow};
use reel_types::models::{MessageRow, Profile, SignalRow, SignalTag};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::datastore::Datastore;
use crate::error::{FeedError, StoreError};
use crate::feed::{ChangeFeed, ChannelSpec, FeedChannel, FeedSender, FeedStatus, channel_pair};

/// Minimal row type for exercising subscriptions without a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick(pub u64);

impl FeedRow for Tick {
    const TABLE: &'static str = "ticks";
}

/// Let every runnable task make progress without moving the clock.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

pub fn message(sender: Uuid, receiver: Uuid, content: &str) -> MessageRow {
    MessageRow {
        id: Uuid::new_v4(),
        sender_id: sender,
        receiver_id: receiver,
        content: content.to_string(),
        is_read: false,
        created_at: Utc::now(),
    }
}

pub fn profile(id: Uuid, name: &str) -> Profile {
    Profile {
        id,
        display_name: name.to_string(),
        avatar_url: None,
        created_at: Utc::now(),
    }
}

pub fn signal(movie_id: i64, tag: SignalTag) -> SignalWithProfile {
    SignalWithProfile {
        signal: SignalRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            movie_id,
            movie_title: format!("movie {movie_id}"),
            movie_poster: None,
            theater_name: None,
            showtime: None,
            tag,
            note: None,
            location: None,
            intent: None,
            gender_age_label: None,
            is_active: true,
            created_at: Utc::now(),
        },
        profile: None,
    }
}

// -- Feed --

struct ScriptedChannel {
    id: Uuid,
    spec: ChannelSpec,
    status: mpsc::UnboundedSender<FeedStatus>,
    // FeedSender<R> for the row type the channel was opened with
    events: Box<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct FeedState {
    channels: HashMap<String, ScriptedChannel>,
    opens: HashMap<String, usize>,
    removals: HashMap<String, usize>,
    fail_opens: usize,
    auto_ack: bool,
}

/// A change feed whose acknowledgements and events are pushed by the test.
#[derive(Default)]
pub struct ScriptedFeed {
    state: Mutex<FeedState>,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledge every channel as subscribed the moment it opens.
    pub fn acking() -> Self {
        let feed = Self::default();
        feed.state.lock().auto_ack = true;
        feed
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.state.lock().fail_opens = count;
    }

    /// Successful opens of `name` so far.
    pub fn opens(&self, name: &str) -> usize {
        self.state.lock().opens.get(name).copied().unwrap_or(0)
    }

    pub fn removals(&self, name: &str) -> usize {
        self.state.lock().removals.get(name).copied().unwrap_or(0)
    }

    /// Channels currently open, across all names.
    pub fn live(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.state.lock().channels.contains_key(name)
    }

    pub fn spec(&self, name: &str) -> Option<ChannelSpec> {
        self.state.lock().channels.get(name).map(|c| c.spec.clone())
    }

    pub fn ack(&self, name: &str) -> bool {
        self.report(name, FeedStatus::Subscribed)
    }

    pub fn fail(&self, name: &str) -> bool {
        self.report(name, FeedStatus::ChannelError("scripted failure".into()))
    }

    pub fn time_out(&self, name: &str) -> bool {
        self.report(name, FeedStatus::TimedOut)
    }

    pub fn close(&self, name: &str) -> bool {
        self.report(name, FeedStatus::Closed)
    }

    fn report(&self, name: &str, status: FeedStatus) -> bool {
        let state = self.state.lock();
        match state.channels.get(name) {
            Some(channel) => channel.status.send(status).is_ok(),
            None => false,
        }
    }

    /// Deliver an event on an open channel. False when the channel is gone
    /// or was opened for a different row type.
    pub fn push<R: FeedRow>(&self, name: &str, event: ChangeEvent<R>) -> bool {
        let state = self.state.lock();
        state
            .channels
            .get(name)
            .and_then(|c| c.events.downcast_ref::<FeedSender<R>>())
            .is_some_and(|sender| sender.deliver(event))
    }
}

impl ChangeFeed for ScriptedFeed {
    fn open<R: FeedRow>(&self, spec: &ChannelSpec) -> Result<FeedChannel<R>, FeedError> {
        let mut state = self.state.lock();
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(FeedError::Unavailable("scripted open failure".into()));
        }

        let (sender, channel) = channel_pair::<R>(spec.name.clone());
        if state.auto_ack {
            sender.report(FeedStatus::Subscribed);
        }
        state.channels.insert(
            spec.name.clone(),
            ScriptedChannel {
                id: sender.id,
                spec: spec.clone(),
                status: sender.status.clone(),
                events: Box::new(sender),
            },
        );
        *state.opens.entry(spec.name.clone()).or_default() += 1;
        Ok(channel)
    }

    fn remove(&self, name: &str, id: Uuid) {
        let mut state = self.state.lock();
        if state.channels.get(name).is_some_and(|c| c.id == id) {
            state.channels.remove(name);
            *state.removals.entry(name.to_string()).or_default() += 1;
        }
    }
}

// -- Datastore --

#[derive(Default)]
struct StoreState {
    conversations: Vec<Conversation>,
    messages: Vec<MessageWithSender>,
    signals: Vec<SignalWithProfile>,
    profiles: HashMap<Uuid, Profile>,
    failing: bool,
    latency: Option<Duration>,
    conversation_fetches: usize,
    signal_fetches: usize,
    mark_reads: usize,
    last_filter: Option<SignalFilter>,
    sent: Vec<(Uuid, Uuid, String)>,
}

/// An in-memory datastore with canned answers and call counters.
#[derive(Default)]
pub struct ScriptedStore {
    state: Mutex<StoreState>,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the conversation list with a single entry carrying `unread`.
    pub fn set_unread(&self, unread: u32) {
        let other = Uuid::new_v4();
        let conversation = Conversation {
            user_id: other,
            profile: None,
            last_message: message(other, Uuid::nil(), "hi"),
            unread_count: unread,
        };
        self.state.lock().conversations = vec![conversation];
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.state.lock().conversations = conversations;
    }

    pub fn set_messages(&self, messages: Vec<MessageWithSender>) {
        self.state.lock().messages = messages;
    }

    pub fn set_signals(&self, signals: Vec<SignalWithProfile>) {
        self.state.lock().signals = signals;
    }

    pub fn add_profile(&self, profile: Profile) {
        self.state.lock().profiles.insert(profile.id, profile);
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    /// Make every call wait on the (paused) clock before answering.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    pub fn conversation_fetches(&self) -> usize {
        self.state.lock().conversation_fetches
    }

    pub fn signal_fetches(&self) -> usize {
        self.state.lock().signal_fetches
    }

    pub fn mark_reads(&self) -> usize {
        self.state.lock().mark_reads
    }

    pub fn last_filter(&self) -> Option<SignalFilter> {
        self.state.lock().last_filter.clone()
    }

    pub fn sent(&self) -> Vec<(Uuid, Uuid, String)> {
        self.state.lock().sent.clone()
    }

    async fn delay(&self) -> Result<(), StoreError> {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.state.lock().failing {
            return Err(StoreError::Backend("scripted failure".into()));
        }
        Ok(())
    }
}

impl Datastore for ScriptedStore {
    async fn conversations(&self, _caller: Uuid) -> Result<Vec<Conversation>, StoreError> {
        // Answer with the data as it stood when the call was made.
        let snapshot = {
            let mut state = self.state.lock();
            state.conversation_fetches += 1;
            state.conversations.clone()
        };
        self.delay().await?;
        Ok(snapshot)
    }

    async fn messages_with(&self, caller: Uuid, other: Uuid) -> Result<Vec<MessageWithSender>, StoreError> {
        self.delay().await?;
        let state = self.state.lock();
        Ok(state
            .messages
            .iter()
            .filter(|m| {
                let (from, to) = (m.message.sender_id, m.message.receiver_id);
                (from == caller && to == other) || (from == other && to == caller)
            })
            .cloned()
            .collect())
    }

    async fn send_message(
        &self,
        caller: Uuid,
        receiver: Uuid,
        content: String,
    ) -> Result<MessageWithSender, StoreError> {
        self.delay().await?;
        let mut state = self.state.lock();
        let sent = MessageWithSender {
            message: message(caller, receiver, &content),
            sender: state.profiles.get(&caller).cloned(),
        };
        state.sent.push((caller, receiver, content));
        state.messages.push(sent.clone());
        Ok(sent)
    }

    async fn mark_read(&self, _caller: Uuid, _other: Uuid) -> Result<usize, StoreError> {
        self.state.lock().mark_reads += 1;
        self.delay().await?;
        Ok(0)
    }

    async fn signals(&self, filter: SignalFilter) -> Result<Vec<SignalWithProfile>, StoreError> {
        {
            let mut state = self.state.lock();
            state.signal_fetches += 1;
            state.last_filter = Some(filter.clone());
        }
        self.delay().await?;
        let state = self.state.lock();
        Ok(state
            .signals
            .iter()
            .filter(|s| filter.matches(&s.signal))
            .cloned()
            .collect())
    }

    async fn profile(&self, id: Uuid) -> Result<Option<Profile>, StoreError> {
        self.delay().await?;
        Ok(self.state.lock().profiles.get(&id).cloned())
    }
}
