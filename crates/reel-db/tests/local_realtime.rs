//! Integration test: drive the realtime layer against the local backend.
//!
//! Writes go through `LocalBackend`, which publishes them on its dispatcher;
//! the hub, consumers and signal watcher observe them through real channels
//! on a real clock.

use std::sync::Arc;
use std::time::Duration;

use reel_db::{Database, LocalBackend};
use reel_realtime::{ConnectionStatus, Datastore, RealtimeClient, RealtimeConfig, RetryPolicy};
use reel_types::api::CreateSignalRequest;
use reel_types::models::{Profile, SignalTag};
use tokio::sync::watch;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    backend: Arc<LocalBackend>,
    alice: Profile,
    bob: Profile,
    _session: watch::Sender<Option<Uuid>>,
    client: RealtimeClient<reel_db::Dispatcher, LocalBackend>,
}

/// Bob's device, with Alice as the other party.
async fn fixture(config: RealtimeConfig) -> Fixture {
    let backend = Arc::new(LocalBackend::new(Arc::new(Database::open_in_memory().unwrap())));
    let alice = backend.sign_in_anonymously(Some("alice".into())).await.unwrap();
    let bob = backend.sign_in_anonymously(Some("bob".into())).await.unwrap();

    let (session, identity) = watch::channel(Some(bob.id));
    let client = RealtimeClient::new(
        Arc::new(backend.dispatcher().clone()),
        backend.clone(),
        config,
        identity,
    );

    Fixture {
        backend,
        alice,
        bob,
        _session: session,
        client,
    }
}

async fn wait_for<T>(rx: &mut watch::Receiver<T>, what: &str, f: impl FnMut(&T) -> bool) {
    tokio::time::timeout(WAIT, rx.wait_for(f))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap();
}

#[tokio::test]
async fn unread_count_follows_sends_and_reads() {
    let fx = fixture(RealtimeConfig::default()).await;
    let hub = fx.client.hub();

    let mut status = hub.watch_status();
    wait_for(&mut status, "subscribed", |s| *s == ConnectionStatus::Subscribed).await;

    fx.backend.send_message(fx.alice.id, fx.bob.id, "tickets?".into()).await.unwrap();
    let last = fx.backend.send_message(fx.alice.id, fx.bob.id, "7pm show".into()).await.unwrap();

    // Bob's own outgoing message is not his to count.
    fx.backend.send_message(fx.bob.id, fx.alice.id, "sure".into()).await.unwrap();

    let mut unread = hub.watch_unread();
    wait_for(&mut unread, "two unread", |n| *n == 2).await;
    assert_eq!(hub.latest_incoming().map(|m| m.message.id), Some(last.message.id));
    assert_eq!(fx.client.unread_badge().label().as_deref(), Some("2"));

    // Opening the chat marks the conversation read; the update events
    // reconcile the count.
    let chat = fx.client.chat(fx.alice.id).unwrap();
    wait_for(&mut unread, "zero unread", |n| *n == 0).await;

    let mut view = chat.watch_view();
    wait_for(&mut view, "history", |v| !v.loading && v.messages.len() == 3).await;
    assert_eq!(view.borrow().peer.as_ref().map(|p| p.display_name.as_str()), Some("alice"));
}

#[tokio::test]
async fn open_chat_appends_and_stays_read() {
    let fx = fixture(RealtimeConfig::default()).await;
    let hub = fx.client.hub();
    let mut status = hub.watch_status();
    wait_for(&mut status, "subscribed", |s| *s == ConnectionStatus::Subscribed).await;

    let chat = fx.client.chat(fx.alice.id).unwrap();
    let mut view = chat.watch_view();
    wait_for(&mut view, "empty history", |v| !v.loading).await;

    fx.backend.send_message(fx.alice.id, fx.bob.id, "popcorn?".into()).await.unwrap();
    wait_for(&mut view, "live message", |v| v.messages.len() == 1).await;

    chat.send("yes please").await.unwrap();
    assert_eq!(chat.view().messages.len(), 2);

    let mut unread = hub.watch_unread();
    wait_for(&mut unread, "zero unread", |n| *n == 0).await;
}

#[tokio::test]
async fn conversation_list_reorders_on_arrival() {
    let fx = fixture(RealtimeConfig::default()).await;
    let carol = fx.backend.sign_in_anonymously(Some("carol".into())).await.unwrap();
    fx.backend.send_message(fx.alice.id, fx.bob.id, "first".into()).await.unwrap();

    let list = fx.client.conversation_list();
    let mut view = list.watch_view();
    wait_for(&mut view, "initial list", |v| v.conversations.len() == 1).await;

    let mut status = fx.client.hub().watch_status();
    wait_for(&mut status, "subscribed", |s| *s == ConnectionStatus::Subscribed).await;

    fx.backend.send_message(carol.id, fx.bob.id, "second".into()).await.unwrap();
    wait_for(&mut view, "carol on top", |v| {
        v.conversations.first().map(|c| c.user_id) == Some(carol.id)
    })
    .await;
    assert_eq!(view.borrow().conversations.len(), 2);
}

#[tokio::test]
async fn signal_lobby_tracks_posts_and_withdrawals() {
    let fx = fixture(RealtimeConfig::default()).await;
    let watcher = fx.client.signal_watcher();
    let mut listing = watcher.watch_listing();
    wait_for(&mut listing, "initial load", |l| !l.loading).await;
    tokio::time::timeout(WAIT, async {
        while watcher.connection_status() != ConnectionStatus::Subscribed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let posted = fx
        .backend
        .create_signal(fx.alice.id, CreateSignalRequest::new(496243, "Parasite", SignalTag::HasTicket))
        .await
        .unwrap();
    wait_for(&mut listing, "new signal", |l| l.signals.len() == 1).await;
    assert_eq!(
        listing.borrow().signals[0].profile.as_ref().map(|p| p.display_name.as_str()),
        Some("alice")
    );

    fx.backend.delete_signal(fx.alice.id, posted.signal.id).await.unwrap();
    wait_for(&mut listing, "withdrawn", |l| l.signals.is_empty()).await;
}

#[tokio::test]
async fn injected_failure_recovers_through_retry() {
    let config = RealtimeConfig {
        retry: RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(50),
        },
        ..RealtimeConfig::default()
    };
    let fx = fixture(config).await;
    let hub = fx.client.hub();
    let mut status = hub.watch_status();
    wait_for(&mut status, "subscribed", |s| *s == ConnectionStatus::Subscribed).await;

    assert_eq!(fx.backend.dispatcher().inject_failure("messages", "socket reset"), 1);
    wait_for(&mut status, "error", |s| *s == ConnectionStatus::Error).await;
    wait_for(&mut status, "resubscribed", |s| *s == ConnectionStatus::Subscribed).await;

    // Still exactly one live channel for the inbox.
    assert!(fx.backend.dispatcher().is_open(&format!("global-messages-{}", fx.bob.id)));
    fx.backend.send_message(fx.alice.id, fx.bob.id, "back online".into()).await.unwrap();
    let mut unread = hub.watch_unread();
    wait_for(&mut unread, "one unread", |n| *n == 1).await;
}
