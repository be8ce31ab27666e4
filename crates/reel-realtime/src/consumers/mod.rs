//! UI-facing views derived from the hub. Consumers only ever observe the
//! hub's derived values, never the raw feed.

pub mod chat;
pub mod conversations;
pub mod unread;

pub use chat::{ChatView, ChatWindowSync};
pub use conversations::{ConversationListSync, ConversationListView};
pub use unread::{UnreadBadge, badge_label};
