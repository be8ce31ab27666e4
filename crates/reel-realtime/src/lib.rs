//! Realtime delivery for the Reel client.
//!
//! One [`Subscription`] per logical change-feed channel, each with its own
//! bounded-backoff retry state machine. The [`MessageHub`] owns the only
//! messages subscription for the signed-in identity and fans derived state
//! (unread count, latest incoming message, polling flag) out to consumers;
//! the [`SignalFeedWatcher`] keeps the lobby listing fresh. Everything is
//! wired once through a [`RealtimeClient`].

pub mod client;
pub mod config;
pub mod connectivity;
pub mod consumers;
pub mod datastore;
pub mod error;
pub mod feed;
pub mod hub;
pub mod signals;
pub mod status;
pub mod subscription;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::RealtimeClient;
pub use config::{RealtimeConfig, RetryPolicy};
pub use connectivity::{ConnectivityWatcher, ReconnectReason, Visibility};
pub use consumers::{
    ChatView, ChatWindowSync, ConversationListSync, ConversationListView, UnreadBadge, badge_label,
};
pub use datastore::Datastore;
pub use error::{FeedError, RealtimeError, StoreError};
pub use feed::{ChangeFeed, ChannelSpec, FeedChannel, FeedSender, FeedStatus, RowFilter};
pub use hub::{IncomingMessage, MessageHub};
pub use signals::{SignalFeedWatcher, SignalListing};
pub use status::{ConnectionStatus, status_advisory};
pub use subscription::{Subscription, SubscriptionHandle, SubscriptionOptions};
