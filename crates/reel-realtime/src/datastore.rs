use std::future::Future;

use reel_types::api::{Conversation, MessageWithSender, SignalFilter, SignalWithProfile};
use reel_types::models::Profile;
use uuid::Uuid;

use crate::error::StoreError;

/// Row-level operations of the datastore collaborator. Every call is made on
/// behalf of `caller`; the store only ever returns rows that caller may read.
pub trait Datastore: Send + Sync + 'static {
    /// Conversations involving `caller`, newest first, each with its
    /// per-conversation unread count.
    fn conversations(
        &self,
        caller: Uuid,
    ) -> impl Future<Output = Result<Vec<Conversation>, StoreError>> + Send;

    /// Full history between `caller` and `other`, oldest first.
    fn messages_with(
        &self,
        caller: Uuid,
        other: Uuid,
    ) -> impl Future<Output = Result<Vec<MessageWithSender>, StoreError>> + Send;

    fn send_message(
        &self,
        caller: Uuid,
        receiver: Uuid,
        content: String,
    ) -> impl Future<Output = Result<MessageWithSender, StoreError>> + Send;

    /// Mark every message from `other` to `caller` read. Returns how many
    /// rows changed.
    fn mark_read(
        &self,
        caller: Uuid,
        other: Uuid,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// Active signals matching `filter`, newest first.
    fn signals(
        &self,
        filter: SignalFilter,
    ) -> impl Future<Output = Result<Vec<SignalWithProfile>, StoreError>> + Send;

    fn profile(&self, id: Uuid) -> impl Future<Output = Result<Option<Profile>, StoreError>> + Send;
}
