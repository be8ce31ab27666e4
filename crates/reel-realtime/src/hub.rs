//! The single owner of the messages subscription.
//!
//! The hub follows the signed-in identity, keeps one filtered messages
//! channel open for it, and derives the unread count and the latest incoming
//! message from the feed. While the channel is degraded it falls back to
//! polling the conversation list.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use reel_types::api::total_unread;
use reel_types::events::ChangeEvent;
use reel_types::models::MessageRow;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::RealtimeConfig;
use crate::connectivity::ConnectivityWatcher;
use crate::datastore::Datastore;
use crate::error::RealtimeError;
use crate::feed::{ChangeFeed, RowFilter};
use crate::status::ConnectionStatus;
use crate::subscription::{Subscription, SubscriptionHandle, SubscriptionOptions};

/// The most recent qualifying inbound message.
///
/// `seq` increases with every delivery, so consumers can react to a new
/// arrival even when the same row is delivered twice.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub seq: u64,
    pub message: MessageRow,
}

#[derive(Debug, Default)]
struct Session {
    identity: Option<Uuid>,
    // Bumped on every identity change; fetches started under an older
    // generation are discarded.
    generation: u64,
    // Ticket of the refetch whose total the counter currently shows.
    applied: u64,
}

// Background refetches run one at a time; requests arriving meanwhile
// collapse into a single trailing run.
#[derive(Debug, Default)]
struct RefetchQueue {
    running: bool,
    again: bool,
}

struct HubState<D> {
    store: Arc<D>,
    session: Mutex<Session>,
    unread: watch::Sender<u32>,
    latest: watch::Sender<Option<IncomingMessage>>,
    polling: watch::Sender<bool>,
    next_seq: AtomicU64,
    next_ticket: AtomicU64,
    queue: Mutex<RefetchQueue>,
    cancel: CancellationToken,
}

struct HubOwner {
    subscription: Subscription<MessageRow>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for HubOwner {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Process-wide fan-out point for message activity. Cheap to clone; the
/// channel and background tasks stop when the last clone is dropped.
pub struct MessageHub<D> {
    state: Arc<HubState<D>>,
    owner: Arc<HubOwner>,
}

impl<D> Clone for MessageHub<D> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            owner: self.owner.clone(),
        }
    }
}

impl<D: Datastore> MessageHub<D> {
    /// Open the messages subscription for whatever `identity` holds and
    /// follow it from then on.
    pub fn start<F: ChangeFeed>(
        feed: Arc<F>,
        store: Arc<D>,
        connectivity: ConnectivityWatcher,
        config: &RealtimeConfig,
        mut identity: watch::Receiver<Option<Uuid>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let current = *identity.borrow_and_update();

        let state = Arc::new(HubState {
            store,
            session: Mutex::new(Session::default()),
            unread: watch::channel(0).0,
            latest: watch::channel(None).0,
            polling: watch::channel(false).0,
            next_seq: AtomicU64::new(0),
            next_ticket: AtomicU64::new(0),
            queue: Mutex::new(RefetchQueue::default()),
            cancel: cancel.clone(),
        });

        let subscription = {
            let state = state.clone();
            Subscription::spawn(
                feed,
                connectivity,
                config.retry,
                channel_options(config, current),
                move |event| state.on_event(event),
            )
        };

        if state.switch_identity(current) {
            state.spawn_refetch();
        }

        let poller = tokio::spawn(poll_while_degraded(
            state.clone(),
            subscription.watch_status(),
            identity.clone(),
            config.poll_interval,
        ));
        let follower = tokio::spawn(follow_identity(
            state.clone(),
            subscription.handle(),
            config.clone(),
            identity,
        ));

        Self {
            state,
            owner: Arc::new(HubOwner {
                subscription,
                cancel,
                tasks: vec![poller, follower],
            }),
        }
    }

    pub fn identity(&self) -> Option<Uuid> {
        self.state.session.lock().identity
    }

    pub fn unread_count(&self) -> u32 {
        *self.state.unread.borrow()
    }

    pub fn watch_unread(&self) -> watch::Receiver<u32> {
        self.state.unread.subscribe()
    }

    pub fn latest_incoming(&self) -> Option<IncomingMessage> {
        self.state.latest.borrow().clone()
    }

    pub fn watch_latest(&self) -> watch::Receiver<Option<IncomingMessage>> {
        self.state.latest.subscribe()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.owner.subscription.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.owner.subscription.watch_status()
    }

    pub fn is_polling(&self) -> bool {
        *self.state.polling.borrow()
    }

    pub fn watch_polling(&self) -> watch::Receiver<bool> {
        self.state.polling.subscribe()
    }

    /// Replace the counter with the server-computed total. On failure the
    /// previous count is kept.
    pub async fn refetch_unread_count(&self) -> Result<u32, RealtimeError> {
        self.state.refetch().await
    }

    /// Zero the counter locally. Server read flags are untouched.
    pub fn reset_unread_count(&self) {
        debug!("unread count reset locally");
        self.state.set_unread(0);
    }

    pub fn reconnect(&self) {
        self.owner.subscription.reconnect();
    }

    pub fn store(&self) -> &Arc<D> {
        &self.state.store
    }
}

impl<D: Datastore> HubState<D> {
    fn on_event(self: &Arc<Self>, event: ChangeEvent<MessageRow>) {
        let Some(identity) = self.session.lock().identity else {
            return;
        };

        match event {
            ChangeEvent::Insert(message) if message.receiver_id == identity => {
                self.unread.send_modify(|count| *count = count.saturating_add(1));
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(message_id = %message.id, from = %message.sender_id, seq, "incoming message");
                self.latest.send_replace(Some(IncomingMessage { seq, message }));
            }
            // Read flags changed; only the server knows the new total.
            ChangeEvent::Update { after, .. } if after.receiver_id == identity => {
                trace!(message_id = %after.id, "message updated, refetching unread count");
                self.spawn_refetch();
            }
            other => trace!(kind = %other.kind(), "ignoring message change"),
        }
    }

    /// Adopt a new identity. Returns whether one is now signed in and
    /// anything changed.
    fn switch_identity(&self, identity: Option<Uuid>) -> bool {
        {
            let mut session = self.session.lock();
            if session.identity == identity && session.generation > 0 {
                return false;
            }
            session.identity = identity;
            session.generation += 1;
        }

        self.set_unread(0);
        self.latest.send_replace(None);
        match identity {
            Some(id) => info!(identity = %id, "hub following identity"),
            None => info!("hub signed out, channel disabled"),
        }
        identity.is_some()
    }

    fn spawn_refetch(self: &Arc<Self>) {
        {
            let mut queue = self.queue.lock();
            if queue.running {
                queue.again = true;
                trace!("refetch already running, queued one more");
                return;
            }
            queue.running = true;
        }

        let state = self.clone();
        tokio::spawn(async move {
            loop {
                let _ = state.refetch().await;
                let mut queue = state.queue.lock();
                if !queue.again || state.cancel.is_cancelled() {
                    queue.running = false;
                    queue.again = false;
                    break;
                }
                queue.again = false;
            }
        });
    }

    async fn refetch(&self) -> Result<u32, RealtimeError> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        let (identity, generation) = {
            let session = self.session.lock();
            (session.identity, session.generation)
        };
        let identity = identity.ok_or(RealtimeError::SignedOut)?;

        let conversations = match self.store.conversations(identity).await {
            Ok(conversations) => conversations,
            Err(e) => {
                warn!(%identity, error = %e, "unread refetch failed, keeping previous count");
                return Err(e.into());
            }
        };

        let mut session = self.session.lock();
        if self.cancel.is_cancelled() || session.generation != generation {
            debug!(%identity, "identity changed during refetch, discarding result");
            return Ok(*self.unread.borrow());
        }
        if ticket < session.applied {
            trace!(%identity, ticket, applied = session.applied, "newer refetch already landed, discarding result");
            return Ok(*self.unread.borrow());
        }

        let total = total_unread(&conversations);
        debug!(%identity, total, conversations = conversations.len(), "unread count reconciled");
        session.applied = ticket;
        self.set_unread(total);
        Ok(total)
    }

    fn set_unread(&self, value: u32) {
        self.unread.send_if_modified(|count| {
            if *count == value {
                false
            } else {
                *count = value;
                true
            }
        });
    }
}

fn channel_options(config: &RealtimeConfig, identity: Option<Uuid>) -> SubscriptionOptions {
    match identity {
        Some(id) => SubscriptionOptions::new(config.messages_channel(id), config.messages_table.clone())
            .schema(config.schema.clone())
            .filter(RowFilter::eq("receiver_id", id)),
        None => SubscriptionOptions::new("global-messages-idle", config.messages_table.clone())
            .schema(config.schema.clone())
            .enabled(false),
    }
}

async fn follow_identity<D: Datastore>(
    state: Arc<HubState<D>>,
    subscription: SubscriptionHandle,
    config: RealtimeConfig,
    mut identity: watch::Receiver<Option<Uuid>>,
) {
    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => break,
            changed = identity.changed() => {
                if changed.is_err() {
                    debug!("session source dropped, identity frozen");
                    break;
                }
                let current = *identity.borrow_and_update();
                let signed_in = state.switch_identity(current);
                subscription.configure(channel_options(&config, current));
                if signed_in {
                    state.spawn_refetch();
                }
            }
        }
    }
}

/// Poll the unread count every `every` while the channel is in error or
/// closed and someone is signed in. The first poll runs immediately.
async fn poll_while_degraded<D: Datastore>(
    state: Arc<HubState<D>>,
    mut status: watch::Receiver<ConnectionStatus>,
    mut identity: watch::Receiver<Option<Uuid>>,
    every: Duration,
) {
    let mut ticker: Option<Interval> = None;
    let mut identity_open = true;

    loop {
        let current = *status.borrow_and_update();
        let degraded = current.is_poll_eligible() && identity.borrow_and_update().is_some();

        match (degraded, ticker.is_some()) {
            (true, false) => {
                info!(status = %current, every_ms = every.as_millis() as u64, "live channel degraded, polling unread count");
                let mut interval = tokio::time::interval(every);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker = Some(interval);
                state.polling.send_replace(true);
            }
            (false, true) => {
                info!(status = %current, "polling stopped");
                ticker = None;
                state.polling.send_replace(false);
            }
            _ => {}
        }

        tokio::select! {
            _ = state.cancel.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = identity.changed(), if identity_open => {
                if changed.is_err() {
                    identity_open = false;
                }
            }
            _ = tick(&mut ticker), if ticker.is_some() => {
                trace!("poll tick");
                state.spawn_refetch();
            }
        }
    }

    state.polling.send_replace(false);
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedFeed, ScriptedStore, message, settle};

    struct Fixture {
        feed: Arc<ScriptedFeed>,
        store: Arc<ScriptedStore>,
        session: watch::Sender<Option<Uuid>>,
        hub: MessageHub<ScriptedStore>,
        me: Uuid,
    }

    fn fixture(feed: ScriptedFeed, config: RealtimeConfig) -> Fixture {
        let me = Uuid::new_v4();
        let feed = Arc::new(feed);
        let store = Arc::new(ScriptedStore::new());
        let (session, identity) = watch::channel(Some(me));
        let hub = MessageHub::start(feed.clone(), store.clone(), ConnectivityWatcher::new(), &config, identity);
        Fixture { feed, store, session, hub, me }
    }

    fn channel(id: Uuid) -> String {
        RealtimeConfig::default().messages_channel(id)
    }

    #[tokio::test(start_paused = true)]
    async fn optimistic_increments_then_reconcile() {
        let f = fixture(ScriptedFeed::acking(), RealtimeConfig::default());
        settle().await;
        assert_eq!(f.hub.unread_count(), 0);

        let peer = Uuid::new_v4();
        for i in 0..3 {
            assert!(f.feed.push(&channel(f.me), ChangeEvent::Insert(message(peer, f.me, &format!("m{i}")))));
        }
        settle().await;
        assert_eq!(f.hub.unread_count(), 3);
        assert_eq!(f.hub.latest_incoming().map(|m| m.message.content), Some("m2".to_string()));

        f.store.set_unread(2);
        assert_eq!(f.hub.refetch_unread_count().await.unwrap(), 2);
        assert_eq!(f.hub.unread_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn only_messages_for_me_reach_consumers() {
        let f = fixture(ScriptedFeed::acking(), RealtimeConfig::default());
        settle().await;

        let spec = f.feed.spec(&channel(f.me)).unwrap();
        assert_eq!(spec.filter, Some(RowFilter::eq("receiver_id", f.me)));
        assert_eq!(spec.table, "messages");

        let peer = Uuid::new_v4();
        f.feed.push(&channel(f.me), ChangeEvent::Insert(message(peer, f.me, "for me")));
        settle().await;
        let first = f.hub.latest_incoming().unwrap();

        f.feed.push(&channel(f.me), ChangeEvent::Insert(message(peer, Uuid::new_v4(), "not mine")));
        settle().await;
        assert_eq!(f.hub.latest_incoming(), Some(first));
        assert_eq!(f.hub.unread_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_follows_degraded_status() {
        let config = RealtimeConfig {
            retry: crate::config::RetryPolicy { max_retries: 1, ..Default::default() },
            ..Default::default()
        };
        let f = fixture(ScriptedFeed::new(), config);
        settle().await;
        let name = channel(f.me);
        let initial = f.store.conversation_fetches();

        assert_eq!(f.hub.connection_status(), ConnectionStatus::Connecting);
        assert!(!f.hub.is_polling());

        f.feed.ack(&name);
        settle().await;
        assert_eq!(f.hub.connection_status(), ConnectionStatus::Subscribed);
        assert!(!f.hub.is_polling());

        f.feed.fail(&name);
        settle().await;
        assert_eq!(f.hub.connection_status(), ConnectionStatus::Error);
        assert!(f.hub.is_polling());
        assert_eq!(f.store.conversation_fetches(), initial + 1, "first poll is immediate");

        // Second failure before the retry fires exhausts the budget.
        f.feed.fail(&name);
        settle().await;
        assert_eq!(f.hub.connection_status(), ConnectionStatus::Closed);
        assert!(f.hub.is_polling());

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(f.store.conversation_fetches(), initial + 2);
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(f.store.conversation_fetches(), initial + 3);

        f.feed.ack(&name);
        settle().await;
        assert_eq!(f.hub.connection_status(), ConnectionStatus::Subscribed);
        assert!(!f.hub.is_polling());

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(f.store.conversation_fetches(), initial + 3);
    }

    #[tokio::test(start_paused = true)]
    async fn identity_switch_moves_channel() {
        let f = fixture(ScriptedFeed::acking(), RealtimeConfig::default());
        settle().await;
        assert!(f.feed.is_open(&channel(f.me)));

        let peer = Uuid::new_v4();
        f.feed.push(&channel(f.me), ChangeEvent::Insert(message(peer, f.me, "hello")));
        settle().await;
        assert_eq!(f.hub.unread_count(), 1);

        let other = Uuid::new_v4();
        f.session.send_replace(Some(other));
        settle().await;
        assert!(!f.feed.is_open(&channel(f.me)));
        assert!(f.feed.is_open(&channel(other)));
        assert_eq!(f.feed.live(), 1);
        assert_eq!(f.hub.identity(), Some(other));
        assert_eq!(f.hub.unread_count(), 0);
        assert!(f.hub.latest_incoming().is_none());

        f.session.send_replace(None);
        settle().await;
        assert_eq!(f.feed.live(), 0);
        assert_eq!(f.hub.connection_status(), ConnectionStatus::Idle);
        assert!(matches!(f.hub.refetch_unread_count().await, Err(RealtimeError::SignedOut)));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_refetch_is_discarded() {
        let f = fixture(ScriptedFeed::acking(), RealtimeConfig::default());
        settle().await;

        // A slow fetch for the first identity is still in flight...
        f.store.set_unread(7);
        f.store.set_latency(Duration::from_secs(5));
        let hub = f.hub.clone();
        let inflight = tokio::spawn(async move { hub.refetch_unread_count().await });
        settle().await;

        // ...when the session moves on and the new identity's fetch lands first.
        f.store.set_unread(0);
        f.store.set_latency(Duration::ZERO);
        f.session.send_replace(Some(Uuid::new_v4()));
        settle().await;
        assert_eq!(f.hub.unread_count(), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(inflight.await.unwrap().unwrap(), 0);
        assert_eq!(f.hub.unread_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_refetch_cannot_overwrite_newer_total() {
        let f = fixture(ScriptedFeed::acking(), RealtimeConfig::default());
        settle().await;

        f.store.set_unread(7);
        f.store.set_latency(Duration::from_secs(5));
        let hub = f.hub.clone();
        let slow = tokio::spawn(async move { hub.refetch_unread_count().await });
        settle().await;

        // Everything gets read; a later refetch sees the new total first.
        f.store.set_unread(0);
        f.store.set_latency(Duration::ZERO);
        assert_eq!(f.hub.refetch_unread_count().await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(slow.await.unwrap().unwrap(), 0);
        assert_eq!(f.hub.unread_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn update_bursts_coalesce_into_one_trailing_refetch() {
        let f = fixture(ScriptedFeed::acking(), RealtimeConfig::default());
        settle().await;
        let initial = f.store.conversation_fetches();
        let peer = Uuid::new_v4();

        f.store.set_unread(0);
        f.store.set_latency(Duration::from_secs(1));
        for i in 0..4 {
            let before = message(peer, f.me, &format!("m{i}"));
            let after = MessageRow { is_read: true, ..before.clone() };
            f.feed.push(&channel(f.me), ChangeEvent::Update { before, after });
        }
        settle().await;
        assert_eq!(f.store.conversation_fetches(), initial + 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(f.store.conversation_fetches(), initial + 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(f.store.conversation_fetches(), initial + 2);
        assert_eq!(f.hub.unread_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn update_triggers_refetch_and_failures_keep_count() {
        let f = fixture(ScriptedFeed::acking(), RealtimeConfig::default());
        settle().await;
        let peer = Uuid::new_v4();

        f.store.set_unread(4);
        let before = message(peer, f.me, "x");
        let after = MessageRow { is_read: true, ..before.clone() };
        f.feed.push(&channel(f.me), ChangeEvent::Update { before, after });
        settle().await;
        assert_eq!(f.hub.unread_count(), 4);

        f.store.set_failing(true);
        assert!(f.hub.refetch_unread_count().await.is_err());
        assert_eq!(f.hub.unread_count(), 4);

        f.hub.reset_unread_count();
        assert_eq!(f.hub.unread_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn signed_out_hub_stays_idle() {
        let feed = Arc::new(ScriptedFeed::acking());
        let store = Arc::new(ScriptedStore::new());
        let (_session, identity) = watch::channel(None);
        let hub = MessageHub::start(feed.clone(), store.clone(), ConnectivityWatcher::new(), &RealtimeConfig::default(), identity);
        settle().await;

        assert_eq!(hub.connection_status(), ConnectionStatus::Idle);
        assert_eq!(feed.live(), 0);
        assert_eq!(store.conversation_fetches(), 0);
        assert!(!hub.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_last_clone_tears_down() {
        let f = fixture(ScriptedFeed::acking(), RealtimeConfig::default());
        settle().await;
        assert_eq!(f.feed.live(), 1);

        let feed = f.feed.clone();
        drop(f);
        settle().await;
        assert_eq!(feed.live(), 0);
    }
}
