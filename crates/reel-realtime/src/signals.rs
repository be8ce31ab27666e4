//! Keeps the signal lobby listing fresh from the shared signals channel.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reel_types::api::{SignalFilter, SignalWithProfile};
use reel_types::events::ChangeEvent;
use reel_types::models::SignalRow;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::RealtimeConfig;
use crate::connectivity::ConnectivityWatcher;
use crate::datastore::Datastore;
use crate::error::RealtimeError;
use crate::feed::ChangeFeed;
use crate::status::ConnectionStatus;
use crate::subscription::{Subscription, SubscriptionOptions};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalListing {
    pub signals: Vec<SignalWithProfile>,
    /// Only set by fetches the user asked for; feed-driven refreshes are silent
    pub loading: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fetch {
    Loud,
    Silent,
}

#[derive(Debug, Default)]
struct FetchLedger {
    started: u64,
    // Ticket of the result the listing currently shows.
    applied: u64,
    // Ticket of the newest loud fetch still in flight, 0 when none.
    loud: u64,
}

struct WatcherState<D> {
    store: Arc<D>,
    filter: watch::Sender<SignalFilter>,
    listing: watch::Sender<SignalListing>,
    ledger: Mutex<FetchLedger>,
}

struct WatcherOwner {
    subscription: Subscription<SignalRow>,
    refresher: Option<JoinHandle<()>>,
}

impl Drop for WatcherOwner {
    fn drop(&mut self) {
        if let Some(task) = &self.refresher {
            task.abort();
        }
    }
}

/// Shared, identity-independent watcher over the signals table.
pub struct SignalFeedWatcher<D> {
    state: Arc<WatcherState<D>>,
    owner: Arc<WatcherOwner>,
}

impl<D> Clone for SignalFeedWatcher<D> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            owner: self.owner.clone(),
        }
    }
}

impl<D: Datastore> SignalFeedWatcher<D> {
    pub fn start<F: ChangeFeed>(
        feed: Arc<F>,
        store: Arc<D>,
        connectivity: ConnectivityWatcher,
        config: &RealtimeConfig,
        filter: SignalFilter,
    ) -> Self {
        let state = Arc::new(WatcherState {
            store,
            filter: watch::channel(filter).0,
            listing: watch::channel(SignalListing::default()).0,
            ledger: Mutex::new(FetchLedger::default()),
        });

        let options = SubscriptionOptions::new(config.signals_channel.clone(), config.signals_table.clone())
            .schema(config.schema.clone());
        let subscription = {
            let state = state.clone();
            Subscription::spawn(feed, connectivity, config.retry, options, move |event| {
                state.on_event(event)
            })
        };

        let initial = state.clone();
        tokio::spawn(async move {
            let _ = initial.fetch(Fetch::Loud).await;
        });

        let refresher = config
            .signals_refresh
            .map(|every| tokio::spawn(refresh_periodically(state.clone(), every)));

        Self {
            state,
            owner: Arc::new(WatcherOwner { subscription, refresher }),
        }
    }

    pub fn listing(&self) -> SignalListing {
        self.state.listing.borrow().clone()
    }

    pub fn watch_listing(&self) -> watch::Receiver<SignalListing> {
        self.state.listing.subscribe()
    }

    pub fn filter(&self) -> SignalFilter {
        self.state.filter.borrow().clone()
    }

    /// Switch the listing parameters and fetch with a loading indicator.
    /// Later feed-driven refreshes use these parameters.
    pub async fn set_filter(&self, filter: SignalFilter) -> Result<usize, RealtimeError> {
        debug!(?filter, "signal filter changed");
        self.state.filter.send_replace(filter);
        self.state.fetch(Fetch::Loud).await
    }

    pub async fn refresh(&self) -> Result<usize, RealtimeError> {
        self.state.fetch(Fetch::Loud).await
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.owner.subscription.status()
    }

    pub fn reconnect(&self) {
        self.owner.subscription.reconnect();
    }
}

impl<D: Datastore> WatcherState<D> {
    fn on_event(self: &Arc<Self>, event: ChangeEvent<SignalRow>) {
        match event {
            ChangeEvent::Insert(_) | ChangeEvent::Delete(_) => {
                trace!(kind = %event.kind(), signal_id = %event.row().id, "signal changed, refreshing listing");
                let state = self.clone();
                tokio::spawn(async move {
                    let _ = state.fetch(Fetch::Silent).await;
                });
            }
            ChangeEvent::Update { .. } => trace!("ignoring signal update"),
        }
    }

    async fn fetch(&self, mode: Fetch) -> Result<usize, RealtimeError> {
        // Read at trigger time so refreshes never use a stale filter.
        let filter = self.filter.borrow().clone();
        let ticket = {
            let mut ledger = self.ledger.lock();
            ledger.started += 1;
            if mode == Fetch::Loud {
                ledger.loud = ledger.started;
                self.listing.send_modify(|listing| {
                    listing.loading = true;
                    listing.error = None;
                });
            }
            ledger.started
        };

        let result = self.store.signals(filter.clone()).await;

        let mut ledger = self.ledger.lock();
        let newest_loud = ledger.loud == ticket;
        if newest_loud {
            ledger.loud = 0;
        }
        // Another loud fetch started after this one keeps the spinner up.
        let loading = ledger.loud != 0;

        match result {
            Ok(signals) => {
                let count = signals.len();
                if ticket > ledger.applied && filter == *self.filter.borrow() {
                    debug!(count, ?mode, "signal listing refreshed");
                    ledger.applied = ticket;
                    self.listing.send_replace(SignalListing {
                        signals,
                        loading,
                        error: None,
                    });
                } else {
                    trace!(?mode, ticket, applied = ledger.applied, "newer signal listing already shown, dropping result");
                    if mode == Fetch::Loud {
                        self.listing.send_if_modified(|listing| {
                            let changed = listing.loading != loading;
                            listing.loading = loading;
                            changed
                        });
                    }
                }
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, ?mode, "signal listing fetch failed, keeping previous listing");
                if mode == Fetch::Loud {
                    self.listing.send_modify(|listing| {
                        listing.loading = loading;
                        if newest_loud {
                            listing.error = Some(e.to_string());
                        }
                    });
                }
                Err(e.into())
            }
        }
    }
}

/// Re-run the loud fetch every `every`, starting one period after launch.
async fn refresh_periodically<D: Datastore>(state: Arc<WatcherState<D>>, every: Duration) {
    info!(every_ms = every.as_millis() as u64, "signal listing auto-refresh on");
    let mut interval = tokio::time::interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        trace!("signal listing auto-refresh");
        let _ = state.fetch(Fetch::Loud).await;
    }
}
