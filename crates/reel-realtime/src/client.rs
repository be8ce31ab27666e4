use std::sync::{Arc, OnceLock};

use reel_types::api::SignalFilter;
use reel_types::events::{ChangeEvent, FeedRow};
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::RealtimeConfig;
use crate::connectivity::ConnectivityWatcher;
use crate::consumers::{ChatWindowSync, ConversationListSync, UnreadBadge};
use crate::datastore::Datastore;
use crate::error::RealtimeError;
use crate::feed::ChangeFeed;
use crate::hub::MessageHub;
use crate::signals::SignalFeedWatcher;
use crate::subscription::{Subscription, SubscriptionOptions};

/// Composition root for realtime delivery.
///
/// Holds the one feed connection manager of the process and hands out the
/// hub and the signal watcher, each created on first use and shared after.
/// Must be used from within a Tokio runtime.
pub struct RealtimeClient<F, D> {
    feed: Arc<F>,
    store: Arc<D>,
    connectivity: ConnectivityWatcher,
    config: RealtimeConfig,
    session: watch::Receiver<Option<Uuid>>,
    hub: OnceLock<MessageHub<D>>,
    signals: OnceLock<SignalFeedWatcher<D>>,
}

impl<F: ChangeFeed, D: Datastore> RealtimeClient<F, D> {
    pub fn new(
        feed: Arc<F>,
        store: Arc<D>,
        config: RealtimeConfig,
        session: watch::Receiver<Option<Uuid>>,
    ) -> Self {
        Self {
            feed,
            store,
            connectivity: ConnectivityWatcher::new(),
            config,
            session,
            hub: OnceLock::new(),
            signals: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    /// Feed foreground and network transitions in here.
    pub fn connectivity(&self) -> &ConnectivityWatcher {
        &self.connectivity
    }

    pub fn store(&self) -> &Arc<D> {
        &self.store
    }

    pub fn identity(&self) -> Option<Uuid> {
        *self.session.borrow()
    }

    pub fn hub(&self) -> &MessageHub<D> {
        self.hub.get_or_init(|| {
            MessageHub::start(
                self.feed.clone(),
                self.store.clone(),
                self.connectivity.clone(),
                &self.config,
                self.session.clone(),
            )
        })
    }

    pub fn signal_watcher(&self) -> &SignalFeedWatcher<D> {
        self.signals.get_or_init(|| {
            SignalFeedWatcher::start(
                self.feed.clone(),
                self.store.clone(),
                self.connectivity.clone(),
                &self.config,
                SignalFilter::default(),
            )
        })
    }

    /// Open an additional subscription on the shared feed. The messages
    /// table belongs to the hub and is refused here.
    pub fn subscribe<R, H>(&self, options: SubscriptionOptions, handler: H) -> Result<Subscription<R>, RealtimeError>
    where
        R: FeedRow,
        H: Fn(ChangeEvent<R>) + Send + Sync + 'static,
    {
        if options.table == self.config.messages_table {
            return Err(RealtimeError::Config(format!(
                "table {} is owned by the message hub",
                options.table
            )));
        }

        Ok(Subscription::spawn(
            self.feed.clone(),
            self.connectivity.clone(),
            self.config.retry,
            options,
            handler,
        ))
    }

    pub fn chat(&self, peer: Uuid) -> Result<ChatWindowSync<D>, RealtimeError> {
        ChatWindowSync::open(self.hub().clone(), peer)
    }

    pub fn conversation_list(&self) -> ConversationListSync<D> {
        ConversationListSync::open(self.hub().clone())
    }

    pub fn unread_badge(&self) -> UnreadBadge {
        UnreadBadge::new(self.hub())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedFeed, ScriptedStore, Tick, settle};

    #[tokio::test(start_paused = true)]
    async fn hub_is_created_once() {
        let me = Uuid::new_v4();
        let feed = Arc::new(ScriptedFeed::acking());
        let (_session, identity) = watch::channel(Some(me));
        let client = RealtimeClient::new(feed.clone(), Arc::new(ScriptedStore::new()), RealtimeConfig::default(), identity);

        let _badge = client.unread_badge();
        let _list = client.conversation_list();
        let _chat = client.chat(Uuid::new_v4()).unwrap();
        settle().await;

        assert_eq!(feed.opens(&client.config().messages_channel(me)), 1);
        assert_eq!(feed.live(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_table_is_reserved() {
        let feed = Arc::new(ScriptedFeed::acking());
        let (_session, identity) = watch::channel(None);
        let client = RealtimeClient::new(feed.clone(), Arc::new(ScriptedStore::new()), RealtimeConfig::default(), identity);

        let refused = client.subscribe(SubscriptionOptions::new("sneaky", "messages"), |_: ChangeEvent<Tick>| {});
        assert!(matches!(refused, Err(RealtimeError::Config(_))));

        let ticks = client
            .subscribe(SubscriptionOptions::new("ticks", "ticks"), |_: ChangeEvent<Tick>| {})
            .unwrap();
        settle().await;
        assert!(feed.is_open("ticks"));

        client.connectivity().set_online(false);
        client.connectivity().set_online(true);
        settle().await;
        assert_eq!(feed.opens("ticks"), 2);
        drop(ticks);
    }
}
