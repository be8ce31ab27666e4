//! One logical change-feed subscription and its retry state machine.
//!
//! ```text
//! idle --enabled--> connecting --ack--> subscribed
//!                       |                   |
//!                       +--error/timeout----+--> error --attempt < max--> (backoff) connecting
//!                                                  \--attempt >= max--> closed
//! any --reconnect / foreground / online--> connecting (attempt = 0)
//! any --disabled--> idle
//! ```
//!
//! Each subscription runs a single driver task. Every resubscribe removes
//! the previous transport channel before opening the next one, so at most
//! one channel is live per subscription.

use std::sync::Arc;

use parking_lot::RwLock;
use reel_types::events::{ChangeEvent, EventKind, FeedRow};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::RetryPolicy;
use crate::connectivity::{ConnectivityWatcher, ReconnectReason};
use crate::feed::{ChangeFeed, ChannelSpec, FeedChannel, FeedStatus, RowFilter};
use crate::status::ConnectionStatus;

pub type EventHandler<R> = Arc<dyn Fn(ChangeEvent<R>) + Send + Sync>;

type HandlerSlot<R> = Arc<RwLock<Option<EventHandler<R>>>>;

/// The dependencies of a subscription. Changing any of them tears the
/// channel down and opens a fresh one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub channel_name: String,
    pub table: String,
    pub event: EventKind,
    pub schema: String,
    pub filter: Option<RowFilter>,
    pub enabled: bool,
}

impl SubscriptionOptions {
    pub fn new(channel_name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            table: table.into(),
            event: EventKind::Any,
            schema: "public".into(),
            filter: None,
            enabled: true,
        }
    }

    pub fn event(mut self, event: EventKind) -> Self {
        self.event = event;
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn spec(&self) -> ChannelSpec {
        ChannelSpec {
            name: self.channel_name.clone(),
            table: self.table.clone(),
            event: self.event,
            schema: self.schema.clone(),
            filter: self.filter.clone(),
        }
    }
}

#[derive(Debug)]
enum Command {
    Reconnect(ReconnectReason),
    Configure(SubscriptionOptions),
}

/// Cloneable control surface of a [`Subscription`]. Holding one does not
/// keep the subscription alive.
#[derive(Clone)]
pub struct SubscriptionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl SubscriptionHandle {
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Reset the retry counter and reopen the channel, whatever the status.
    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect(ReconnectReason::Manual));
    }

    /// Replace the dependencies. A no-op when nothing changed.
    pub fn configure(&self, options: SubscriptionOptions) {
        let _ = self.commands.send(Command::Configure(options));
    }
}

/// Owner of one live subscription. Dropping it tears the channel down.
pub struct Subscription<R: FeedRow> {
    handle: SubscriptionHandle,
    handler: HandlerSlot<R>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<R: FeedRow> Subscription<R> {
    /// Start the driver task. Must be called within a Tokio runtime.
    pub fn spawn<F, H>(
        feed: Arc<F>,
        connectivity: ConnectivityWatcher,
        retry: RetryPolicy,
        options: SubscriptionOptions,
        handler: H,
    ) -> Self
    where
        F: ChangeFeed,
        H: Fn(ChangeEvent<R>) + Send + Sync + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Idle);
        let handler: HandlerSlot<R> = Arc::new(RwLock::new(Some(Arc::new(handler))));
        let cancel = CancellationToken::new();

        let driver = Driver {
            feed,
            restores: connectivity.subscribe(),
            _connectivity: connectivity,
            retry,
            options,
            status: status_tx,
            commands: commands_rx,
            handler: handler.clone(),
            cancel: cancel.clone(),
            attempt: 0,
        };
        let task = tokio::spawn(driver.run());

        Self {
            handle: SubscriptionHandle {
                commands: commands_tx,
                status: status_rx,
            },
            handler,
            cancel,
            task: Some(task),
        }
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.handle.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.handle.watch_status()
    }

    pub fn reconnect(&self) {
        self.handle.reconnect();
    }

    pub fn configure(&self, options: SubscriptionOptions) {
        self.handle.configure(options);
    }

    /// Swap the event callback. Events are always delivered through the
    /// latest handler, so it may capture fresh state without resubscribing.
    pub fn set_handler<H>(&self, handler: H)
    where
        H: Fn(ChangeEvent<R>) + Send + Sync + 'static,
    {
        *self.handler.write() = Some(Arc::new(handler));
    }

    /// Tear down and wait for the driver to remove its channel.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn stop(&self) {
        self.handler.write().take();
        self.cancel.cancel();
    }
}

impl<R: FeedRow> Drop for Subscription<R> {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Next {
    Resubscribe,
    Shutdown,
}

struct Driver<F, R> {
    feed: Arc<F>,
    restores: broadcast::Receiver<ReconnectReason>,
    // Holds the restore sender open for as long as the driver runs.
    _connectivity: ConnectivityWatcher,
    retry: RetryPolicy,
    options: SubscriptionOptions,
    status: watch::Sender<ConnectionStatus>,
    commands: mpsc::UnboundedReceiver<Command>,
    handler: HandlerSlot<R>,
    cancel: CancellationToken,
    attempt: u32,
}

impl<F: ChangeFeed, R: FeedRow> Driver<F, R> {
    async fn run(mut self) {
        loop {
            let next = if self.options.enabled {
                self.run_channel().await
            } else {
                self.idle().await
            };

            if let Next::Shutdown = next {
                break;
            }
        }

        self.set_status(ConnectionStatus::Idle);
        debug!(channel = %self.options.channel_name, "subscription stopped");
    }

    async fn idle(&mut self) -> Next {
        self.set_status(ConnectionStatus::Idle);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Next::Shutdown,
                command = self.commands.recv() => match command {
                    None => return Next::Shutdown,
                    Some(Command::Configure(options)) => {
                        self.apply(options);
                        if self.options.enabled {
                            return Next::Resubscribe;
                        }
                    }
                    Some(Command::Reconnect(reason)) => {
                        debug!(channel = %self.options.channel_name, %reason, "not enabled, ignoring reconnect");
                    }
                },
                // Restores only matter while enabled; drain them.
                _ = self.restores.recv() => {}
            }
        }
    }

    /// One channel lifetime: open, drive statuses and events, tear down.
    async fn run_channel(&mut self) -> Next {
        let spec = self.options.spec();
        self.set_status(ConnectionStatus::Connecting);
        info!(
            channel = %spec.name,
            table = %spec.table,
            event = %spec.event,
            filter = ?spec.filter.as_ref().map(ToString::to_string),
            attempt = self.attempt,
            "opening channel"
        );

        let (channel_id, mut status_rx, mut events_rx) = match self.feed.open::<R>(&spec) {
            Ok(FeedChannel { id, status, events, .. }) => (Some(id), Some(status), Some(events)),
            Err(e) => {
                warn!(channel = %spec.name, error = %e, "failed to open channel");
                (None, None, None)
            }
        };
        let mut retry_at = if channel_id.is_none() {
            self.on_failure(&spec.name)
        } else {
            None
        };

        let next = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Next::Shutdown,
                command = self.commands.recv() => match command {
                    None => break Next::Shutdown,
                    Some(Command::Reconnect(reason)) => {
                        info!(channel = %spec.name, %reason, "reconnect requested");
                        self.attempt = 0;
                        break Next::Resubscribe;
                    }
                    Some(Command::Configure(options)) => {
                        if options == self.options {
                            continue;
                        }
                        self.apply(options);
                        break Next::Resubscribe;
                    }
                },
                restored = self.restores.recv() => {
                    let reason = match restored {
                        Ok(reason) => reason,
                        // Missed signals still mean at least one restore happened.
                        Err(broadcast::error::RecvError::Lagged(_)) => ReconnectReason::Foreground,
                        Err(broadcast::error::RecvError::Closed) => break Next::Shutdown,
                    };
                    info!(channel = %spec.name, %reason, status = %self.current(), "environment restored, resubscribing");
                    self.attempt = 0;
                    break Next::Resubscribe;
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    debug!(channel = %spec.name, attempt = self.attempt, "retry timer fired");
                    break Next::Resubscribe;
                }
                status = recv_next(&mut status_rx), if status_rx.is_some() => match status {
                    Some(FeedStatus::Subscribed) => {
                        info!(channel = %spec.name, "subscribed");
                        self.attempt = 0;
                        retry_at = None;
                        self.set_status(ConnectionStatus::Subscribed);
                    }
                    Some(FeedStatus::ChannelError(reason)) => {
                        warn!(channel = %spec.name, %reason, "channel error");
                        retry_at = self.on_failure(&spec.name);
                    }
                    Some(FeedStatus::TimedOut) => {
                        warn!(channel = %spec.name, "channel timed out");
                        retry_at = self.on_failure(&spec.name);
                    }
                    Some(FeedStatus::Closed) | None => {
                        status_rx = None;
                        if retry_at.is_some() {
                            debug!(channel = %spec.name, "transport closed during backoff");
                        } else {
                            warn!(channel = %spec.name, "transport closed the channel");
                            self.set_status(ConnectionStatus::Closed);
                        }
                    }
                },
                event = recv_next(&mut events_rx), if events_rx.is_some() => match event {
                    Some(event) => self.dispatch(event),
                    None => events_rx = None,
                },
            }
        };

        if let Some(id) = channel_id {
            self.feed.remove(&spec.name, id);
            debug!(channel = %spec.name, "channel removed");
        }

        next
    }

    /// Record a transport failure and schedule the next attempt, or give up.
    fn on_failure(&mut self, channel: &str) -> Option<Instant> {
        self.set_status(ConnectionStatus::Error);

        if self.attempt < self.retry.max_retries {
            let delay = self.retry.delay_for(self.attempt);
            self.attempt += 1;
            warn!(
                channel,
                attempt = self.attempt,
                max = self.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                "scheduling resubscribe"
            );
            Some(Instant::now() + delay)
        } else {
            error!(channel, max = self.retry.max_retries, "retries exhausted, channel closed");
            self.set_status(ConnectionStatus::Closed);
            None
        }
    }

    fn dispatch(&self, event: ChangeEvent<R>) {
        if self.cancel.is_cancelled() {
            return;
        }

        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler(event),
            None => trace!(channel = %self.options.channel_name, "no handler, dropping event"),
        }
    }

    fn apply(&mut self, options: SubscriptionOptions) {
        info!(
            from = %self.options.channel_name,
            to = %options.channel_name,
            enabled = options.enabled,
            "subscription reconfigured"
        );
        self.options = options;
        self.attempt = 0;
    }

    fn current(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn recv_next<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
