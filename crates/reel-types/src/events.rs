use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::models::{MessageRow, SignalRow};

/// Which row changes a feed channel listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    Any,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Any => "*",
        }
    }

    /// Whether a channel listening for `self` should see a change of kind `other`.
    pub fn accepts(&self, other: EventKind) -> bool {
        *self == EventKind::Any || *self == other
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "*" | "any" => Ok(Self::Any),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// A row change pushed by the change-feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChangeEvent<R> {
    Insert(R),
    Update { before: R, after: R },
    Delete(R),
}

impl<R> ChangeEvent<R> {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Insert(_) => EventKind::Insert,
            Self::Update { .. } => EventKind::Update,
            Self::Delete(_) => EventKind::Delete,
        }
    }

    /// The row as it stands after the change (the removed row for deletes).
    pub fn row(&self) -> &R {
        match self {
            Self::Insert(row) | Self::Delete(row) => row,
            Self::Update { after, .. } => after,
        }
    }

    pub fn try_map<T, E>(self, mut f: impl FnMut(R) -> Result<T, E>) -> Result<ChangeEvent<T>, E> {
        Ok(match self {
            Self::Insert(row) => ChangeEvent::Insert(f(row)?),
            Self::Update { before, after } => ChangeEvent::Update {
                before: f(before)?,
                after: f(after)?,
            },
            Self::Delete(row) => ChangeEvent::Delete(f(row)?),
        })
    }
}

/// A row type that lives in a feed-enabled table.
pub trait FeedRow: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const TABLE: &'static str;
}

impl FeedRow for MessageRow {
    const TABLE: &'static str = "messages";
}

impl FeedRow for SignalRow {
    const TABLE: &'static str = "signals";
}
