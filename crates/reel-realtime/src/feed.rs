//! Contract with the change-feed collaborator.
//!
//! A transport opens one channel per [`ChannelSpec`], acknowledges it with a
//! stream of [`FeedStatus`] values and pushes the matching row changes, in
//! order, at least once. The row predicate is evaluated by the transport,
//! never by the subscriber.

use std::fmt;
use std::str::FromStr;

use reel_types::events::{ChangeEvent, EventKind, FeedRow};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::FeedError;

/// Acknowledgements a transport reports for an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

/// Server-side row predicate in `column=eq.value` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl fmt::Display) -> Self {
        Self {
            column: column.into(),
            value: value.to_string(),
        }
    }

    /// Evaluate against a JSON-encoded row. Missing columns never match.
    pub fn matches(&self, row: &Value) -> bool {
        match row.get(&self.column) {
            Some(Value::String(s)) => *s == self.value,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

impl FromStr for RowFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (column, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("missing '=' in filter: {s}"))?;
        let value = rest
            .strip_prefix("eq.")
            .ok_or_else(|| format!("only eq filters are supported: {s}"))?;
        if column.is_empty() {
            return Err(format!("empty column in filter: {s}"));
        }
        Ok(Self::eq(column, value))
    }
}

/// Everything the transport needs to open one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Globally unique per logical concern
    pub name: String,
    pub table: String,
    pub event: EventKind,
    pub schema: String,
    pub filter: Option<RowFilter>,
}

/// Subscriber side of one open channel.
#[derive(Debug)]
pub struct FeedChannel<R> {
    pub id: Uuid,
    pub name: String,
    pub status: mpsc::UnboundedReceiver<FeedStatus>,
    pub events: mpsc::UnboundedReceiver<ChangeEvent<R>>,
}

/// Transport side of one open channel.
#[derive(Debug)]
pub struct FeedSender<R> {
    pub id: Uuid,
    pub status: mpsc::UnboundedSender<FeedStatus>,
    pub events: mpsc::UnboundedSender<ChangeEvent<R>>,
}

impl<R> Clone for FeedSender<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            status: self.status.clone(),
            events: self.events.clone(),
        }
    }
}

impl<R> FeedSender<R> {
    /// Report a status. Returns false once the subscriber has gone away.
    pub fn report(&self, status: FeedStatus) -> bool {
        self.status.send(status).is_ok()
    }

    pub fn deliver(&self, event: ChangeEvent<R>) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// Create a connected transport/subscriber pair for a new channel.
pub fn channel_pair<R>(name: impl Into<String>) -> (FeedSender<R>, FeedChannel<R>) {
    let id = Uuid::new_v4();
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    (
        FeedSender {
            id,
            status: status_tx,
            events: events_tx,
        },
        FeedChannel {
            id,
            name: name.into(),
            status: status_rx,
            events: events_rx,
        },
    )
}

/// The subscribe/remove primitives of the feed collaborator. One instance
/// multiplexes every logical channel of the process.
pub trait ChangeFeed: Send + Sync + 'static {
    /// Open a channel. An `Err` is handled exactly like a channel error.
    fn open<R: FeedRow>(&self, spec: &ChannelSpec) -> Result<FeedChannel<R>, FeedError>;

    /// Remove a channel, but only if `id` still identifies it.
    fn remove(&self, name: &str, id: Uuid);
}
