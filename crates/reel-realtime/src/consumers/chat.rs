use std::sync::Arc;

use reel_types::api::MessageWithSender;
use reel_types::models::{MessageRow, Profile};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::datastore::Datastore;
use crate::error::{RealtimeError, StoreError};
use crate::hub::{IncomingMessage, MessageHub};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatView {
    pub peer: Option<Profile>,
    /// Oldest first, unique by message id
    pub messages: Vec<MessageWithSender>,
    pub loading: bool,
    pub error: Option<String>,
}

impl ChatView {
    /// Append unless a message with the same id is already shown.
    fn push_unique(&mut self, message: MessageWithSender) -> bool {
        if self.messages.iter().any(|m| m.message.id == message.message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }
}

/// An open conversation with one peer.
///
/// Loads the history, then appends every incoming message from the peer
/// that the hub announces, marking it read and reconciling the unread
/// count. Dropping the window stops following the hub.
pub struct ChatWindowSync<D: Datastore> {
    hub: MessageHub<D>,
    me: Uuid,
    peer: Uuid,
    view: Arc<watch::Sender<ChatView>>,
    task: JoinHandle<()>,
}

impl<D: Datastore> ChatWindowSync<D> {
    pub fn open(hub: MessageHub<D>, peer: Uuid) -> Result<Self, RealtimeError> {
        let me = hub.identity().ok_or(RealtimeError::SignedOut)?;
        let view = Arc::new(watch::channel(ChatView {
            loading: true,
            ..Default::default()
        }).0);

        // Subscribe before loading so nothing that lands mid-load is missed.
        let latest = hub.watch_latest();
        let task = tokio::spawn(follow(hub.clone(), me, peer, view.clone(), latest));
        info!(%peer, "chat window opened");

        Ok(Self {
            hub,
            me,
            peer,
            view,
            task,
        })
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer
    }

    pub fn view(&self) -> ChatView {
        self.view.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<ChatView> {
        self.view.subscribe()
    }

    pub async fn send(&self, content: impl Into<String>) -> Result<MessageWithSender, RealtimeError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(StoreError::Invalid("message content is empty".into()).into());
        }

        let sent = self.hub.store().send_message(self.me, self.peer, content).await?;
        debug!(message_id = %sent.message.id, peer = %self.peer, "message sent");
        self.view.send_if_modified(|view| view.push_unique(sent.clone()));
        Ok(sent)
    }
}

impl<D: Datastore> Drop for ChatWindowSync<D> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn follow<D: Datastore>(
    hub: MessageHub<D>,
    me: Uuid,
    peer: Uuid,
    view: Arc<watch::Sender<ChatView>>,
    mut latest: watch::Receiver<Option<IncomingMessage>>,
) {
    load(&hub, me, peer, &view).await;

    while latest.changed().await.is_ok() {
        let incoming = latest.borrow_and_update().clone();
        let Some(IncomingMessage { message, .. }) = incoming else {
            continue;
        };
        if !is_from_peer(&message, me, peer) {
            continue;
        }

        let added = view.send_if_modified(|view| {
            let sender = view.peer.clone();
            view.push_unique(MessageWithSender { message, sender })
        });
        if added {
            mark_read(&hub, me, peer).await;
        }
    }
}

fn is_from_peer(message: &MessageRow, me: Uuid, peer: Uuid) -> bool {
    message.sender_id == peer && message.receiver_id == me
}

async fn load<D: Datastore>(hub: &MessageHub<D>, me: Uuid, peer: Uuid, view: &watch::Sender<ChatView>) {
    let store = hub.store();

    let profile = match store.profile(peer).await {
        Ok(profile) => profile,
        Err(e) => {
            warn!(%peer, error = %e, "failed to load peer profile");
            None
        }
    };

    match store.messages_with(me, peer).await {
        Ok(history) => {
            let unread = history.iter().any(|m| !m.message.is_read && is_from_peer(&m.message, me, peer));
            debug!(%peer, count = history.len(), "chat history loaded");
            view.send_modify(|view| {
                view.peer = profile;
                // Keep anything that arrived while the history was loading.
                let arrived = std::mem::replace(&mut view.messages, history);
                for message in arrived {
                    view.push_unique(message);
                }
                view.loading = false;
                view.error = None;
            });
            if unread {
                mark_read(hub, me, peer).await;
            }
        }
        Err(e) => {
            warn!(%peer, error = %e, "failed to load chat history");
            view.send_modify(|view| {
                view.peer = profile;
                view.loading = false;
                view.error = Some(e.to_string());
            });
        }
    }
}

/// Mark the peer's messages read server-side, then reconcile the badge.
async fn mark_read<D: Datastore>(hub: &MessageHub<D>, me: Uuid, peer: Uuid) {
    match hub.store().mark_read(me, peer).await {
        Ok(updated) => debug!(%peer, updated, "messages marked read"),
        Err(e) => warn!(%peer, error = %e, "failed to mark messages read"),
    }
    let _ = hub.refetch_unread_count().await;
}

#[cfg(test)]
mod tests {
    use reel_types::events::ChangeEvent;

    use super::*;
    use crate::config::RealtimeConfig;
    use crate::connectivity::ConnectivityWatcher;
    use crate::testing::{ScriptedFeed, ScriptedStore, message, profile, settle};

    struct Fixture {
        feed: Arc<ScriptedFeed>,
        store: Arc<ScriptedStore>,
        hub: MessageHub<ScriptedStore>,
        session: watch::Sender<Option<Uuid>>,
        me: Uuid,
        peer: Uuid,
    }

    impl Fixture {
        fn channel(&self) -> String {
            RealtimeConfig::default().messages_channel(self.me)
        }
    }

    async fn fixture() -> Fixture {
        let (me, peer) = (Uuid::new_v4(), Uuid::new_v4());
        let feed = Arc::new(ScriptedFeed::acking());
        let store = Arc::new(ScriptedStore::new());
        store.add_profile(profile(peer, "Popcorn"));
        let (session, identity) = watch::channel(Some(me));
        let hub = MessageHub::start(
            feed.clone(),
            store.clone(),
            ConnectivityWatcher::new(),
            &RealtimeConfig::default(),
            identity,
        );
        settle().await;
        Fixture {
            feed,
            store,
            hub,
            session,
            me,
            peer,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loads_history_and_marks_read() {
        let f = fixture().await;
        f.store.set_messages(vec![
            MessageWithSender { message: message(f.peer, f.me, "first"), sender: None },
            MessageWithSender { message: message(f.me, f.peer, "reply"), sender: None },
        ]);

        let chat = ChatWindowSync::open(f.hub.clone(), f.peer).unwrap();
        settle().await;

        let view = chat.view();
        assert!(!view.loading);
        assert_eq!(view.messages.len(), 2);
        assert_eq!(view.peer.map(|p| p.display_name), Some("Popcorn".to_string()));
        assert_eq!(f.store.mark_reads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn appends_peer_messages_once() {
        let f = fixture().await;
        let chat = ChatWindowSync::open(f.hub.clone(), f.peer).unwrap();
        settle().await;
        let fetches = f.store.conversation_fetches();

        let incoming = message(f.peer, f.me, "ping");
        f.feed.push(&f.channel(), ChangeEvent::Insert(incoming.clone()));
        settle().await;
        // Duplicate delivery of the same row.
        f.feed.push(&f.channel(), ChangeEvent::Insert(incoming));
        settle().await;

        assert_eq!(chat.view().messages.len(), 1);
        assert_eq!(f.store.mark_reads(), 1);
        assert!(f.store.conversation_fetches() > fetches);
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_other_conversations() {
        let f = fixture().await;
        let chat = ChatWindowSync::open(f.hub.clone(), f.peer).unwrap();
        settle().await;

        f.feed.push(&f.channel(), ChangeEvent::Insert(message(Uuid::new_v4(), f.me, "elsewhere")));
        settle().await;

        assert!(chat.view().messages.is_empty());
        assert_eq!(f.hub.unread_count(), 1);
        assert_eq!(f.store.mark_reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_appends_and_rejects_blank() {
        let f = fixture().await;
        let chat = ChatWindowSync::open(f.hub.clone(), f.peer).unwrap();
        settle().await;

        let sent = chat.send("see you at 8").await.unwrap();
        assert_eq!(sent.message.receiver_id, f.peer);
        assert_eq!(chat.view().messages.len(), 1);
        assert_eq!(f.store.sent(), vec![(f.me, f.peer, "see you at 8".to_string())]);

        assert!(matches!(
            chat.send("   ").await,
            Err(RealtimeError::Store(StoreError::Invalid(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_history_surfaces_error() {
        let f = fixture().await;
        f.store.set_failing(true);
        let chat = ChatWindowSync::open(f.hub.clone(), f.peer).unwrap();
        settle().await;

        let view = chat.view();
        assert!(!view.loading);
        assert!(view.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn requires_identity() {
        let f = fixture().await;
        f.session.send_replace(None);
        settle().await;
        assert!(matches!(
            ChatWindowSync::open(f.hub.clone(), f.peer),
            Err(RealtimeError::SignedOut)
        ));
    }
}
