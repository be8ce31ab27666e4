use tokio::sync::watch;

use crate::datastore::Datastore;
use crate::hub::MessageHub;

/// Badges cap their text at this many unread messages.
pub const BADGE_CAP: u32 = 99;

/// Badge text for an unread count, `None` when the badge is hidden.
pub fn badge_label(count: u32) -> Option<String> {
    match count {
        0 => None,
        n if n > BADGE_CAP => Some(format!("{BADGE_CAP}+")),
        n => Some(n.to_string()),
    }
}

/// Follows the hub's unread counter for a navigation badge.
pub struct UnreadBadge {
    count: watch::Receiver<u32>,
}

impl UnreadBadge {
    pub fn new<D: Datastore>(hub: &MessageHub<D>) -> Self {
        Self {
            count: hub.watch_unread(),
        }
    }

    pub fn count(&self) -> u32 {
        *self.count.borrow()
    }

    pub fn label(&self) -> Option<String> {
        badge_label(self.count())
    }

    /// Wait for the count to change. Returns the new label, or `Err` once
    /// the hub is gone.
    pub async fn changed(&mut self) -> Result<Option<String>, watch::error::RecvError> {
        self.count.changed().await?;
        Ok(badge_label(*self.count.borrow_and_update()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reel_types::events::ChangeEvent;
    use uuid::Uuid;

    use super::*;
    use crate::config::RealtimeConfig;
    use crate::connectivity::ConnectivityWatcher;
    use crate::testing::{ScriptedFeed, ScriptedStore, message, settle};

    #[test]
    fn labels_cap_at_ninety_nine() {
        assert_eq!(badge_label(0), None);
        assert_eq!(badge_label(1).as_deref(), Some("1"));
        assert_eq!(badge_label(99).as_deref(), Some("99"));
        assert_eq!(badge_label(100).as_deref(), Some("99+"));
        assert_eq!(badge_label(u32::MAX).as_deref(), Some("99+"));
    }

    #[tokio::test(start_paused = true)]
    async fn badge_follows_hub() {
        let me = Uuid::new_v4();
        let feed = Arc::new(ScriptedFeed::acking());
        let store = Arc::new(ScriptedStore::new());
        let config = RealtimeConfig::default();
        let (_session, identity) = watch::channel(Some(me));
        let hub = MessageHub::start(feed.clone(), store, ConnectivityWatcher::new(), &config, identity);
        settle().await;

        let mut badge = UnreadBadge::new(&hub);
        assert_eq!(badge.label(), None);

        feed.push(
            &config.messages_channel(me),
            ChangeEvent::Insert(message(Uuid::new_v4(), me, "hey")),
        );
        assert_eq!(badge.changed().await.unwrap().as_deref(), Some("1"));

        hub.reset_unread_count();
        assert_eq!(badge.changed().await.unwrap(), None);
    }
}
