use std::sync::Arc;

use reel_types::api::Conversation;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::datastore::Datastore;
use crate::error::RealtimeError;
use crate::hub::MessageHub;
use crate::status::{ConnectionStatus, status_advisory};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationListView {
    pub conversations: Vec<Conversation>,
    pub loading: bool,
    pub error: Option<String>,
    /// Banner text while the live channel is degraded
    pub advisory: Option<&'static str>,
}

/// The inbox: refetched whenever the hub announces a new message.
pub struct ConversationListSync<D: Datastore> {
    hub: MessageHub<D>,
    view: Arc<watch::Sender<ConversationListView>>,
    task: JoinHandle<()>,
}

impl<D: Datastore> ConversationListSync<D> {
    pub fn open(hub: MessageHub<D>) -> Self {
        let view = Arc::new(
            watch::channel(ConversationListView {
                loading: true,
                advisory: status_advisory(hub.connection_status()),
                ..Default::default()
            })
            .0,
        );
        let task = tokio::spawn(follow(hub.clone(), view.clone()));
        Self { hub, view, task }
    }

    pub fn view(&self) -> ConversationListView {
        self.view.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<ConversationListView> {
        self.view.subscribe()
    }

    pub async fn refresh(&self) -> Result<usize, RealtimeError> {
        refetch(&self.hub, &self.view).await
    }
}

impl<D: Datastore> Drop for ConversationListSync<D> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn follow<D: Datastore>(hub: MessageHub<D>, view: Arc<watch::Sender<ConversationListView>>) {
    let mut latest = hub.watch_latest();
    let mut status = hub.watch_status();

    let _ = refetch(&hub, &view).await;

    loop {
        tokio::select! {
            changed = latest.changed() => {
                if changed.is_err() {
                    break;
                }
                // The value itself is irrelevant here; any arrival reorders the list.
                latest.borrow_and_update();
                let _ = refetch(&hub, &view).await;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current: ConnectionStatus = *status.borrow_and_update();
                let advisory = status_advisory(current);
                view.send_if_modified(|view| {
                    let changed = view.advisory != advisory;
                    view.advisory = advisory;
                    changed
                });
            }
        }
    }
}

async fn refetch<D: Datastore>(
    hub: &MessageHub<D>,
    view: &watch::Sender<ConversationListView>,
) -> Result<usize, RealtimeError> {
    let identity = hub.identity().ok_or(RealtimeError::SignedOut)?;

    match hub.store().conversations(identity).await {
        Ok(conversations) => {
            let count = conversations.len();
            debug!(count, "conversation list refreshed");
            view.send_modify(|view| {
                view.conversations = conversations;
                view.loading = false;
                view.error = None;
            });
            Ok(count)
        }
        Err(e) => {
            warn!(error = %e, "conversation list refresh failed, keeping previous list");
            view.send_modify(|view| {
                view.loading = false;
                view.error = Some(e.to_string());
            });
            Err(e.into())
        }
    }
}
