use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use reel_realtime::feed::channel_pair;
use reel_realtime::{ChangeFeed, ChannelSpec, FeedChannel, FeedError, FeedStatus, RowFilter};
use reel_types::events::{ChangeEvent, EventKind, FeedRow};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Deliver = Box<dyn Fn(&ChangeEvent<Value>) -> bool + Send + Sync>;

/// One open channel: where its statuses and matching changes go.
struct Route {
    id: Uuid,
    table: String,
    event: EventKind,
    filter: Option<RowFilter>,
    status: mpsc::UnboundedSender<FeedStatus>,
    deliver: Deliver,
}

impl Route {
    fn wants(&self, table: &str, change: &ChangeEvent<Value>) -> bool {
        self.table == table
            && self.event.accepts(change.kind())
            && self.filter.as_ref().is_none_or(|f| f.matches(change.row()))
    }
}

/// In-process change feed over the local tables.
///
/// Every channel of the process is multiplexed here; writes are published
/// after they commit and routed to channels whose table, event kind and
/// row filter match.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    schema: String,
    tables: HashSet<String>,
    /// channel name -> route
    routes: RwLock<HashMap<String, Route>>,
}

impl Dispatcher {
    pub fn new(schema: impl Into<String>, tables: &[&str]) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                schema: schema.into(),
                tables: tables.iter().map(|t| t.to_string()).collect(),
                routes: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Publish a committed change. Returns how many channels received it.
    pub fn publish(&self, table: &str, change: &ChangeEvent<Value>) -> usize {
        let routes = self.inner.routes.read();
        let delivered = routes
            .values()
            .filter(|route| route.wants(table, change))
            .filter(|route| (route.deliver)(change))
            .count();

        debug!(table, kind = %change.kind(), delivered, "change published");
        delivered
    }

    pub fn publish_row<R: FeedRow>(&self, change: ChangeEvent<R>) -> usize {
        match change.try_map(serde_json::to_value) {
            Ok(change) => self.publish(R::TABLE, &change),
            Err(e) => {
                warn!(table = R::TABLE, error = %e, "failed to encode change");
                0
            }
        }
    }

    /// Report a channel error on every channel of `table`, as a transport
    /// failure would.
    pub fn inject_failure(&self, table: &str, reason: &str) -> usize {
        let routes = self.inner.routes.read();
        let failed = routes
            .values()
            .filter(|route| route.table == table)
            .filter(|route| route.status.send(FeedStatus::ChannelError(reason.to_string())).is_ok())
            .count();

        warn!(table, reason, failed, "injected channel failure");
        failed
    }

    /// Number of open channels.
    pub fn channel_count(&self) -> usize {
        self.inner.routes.read().len()
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.inner.routes.read().contains_key(name)
    }
}

impl ChangeFeed for Dispatcher {
    fn open<R: FeedRow>(&self, spec: &ChannelSpec) -> Result<FeedChannel<R>, FeedError> {
        if spec.schema != self.inner.schema || !self.inner.tables.contains(&spec.table) || spec.table != R::TABLE {
            return Err(FeedError::UnknownTable {
                schema: spec.schema.clone(),
                table: spec.table.clone(),
            });
        }

        let (sender, channel) = channel_pair::<R>(spec.name.clone());
        let status = sender.status.clone();
        let ack = sender.status.clone();
        let name = spec.name.clone();
        let deliver: Deliver = Box::new(move |change| match change.clone().try_map(serde_json::from_value::<R>) {
            Ok(change) => sender.deliver(change),
            Err(e) => {
                warn!(channel = %name, error = %e, "dropping undecodable change");
                false
            }
        });

        let route = Route {
            id: channel.id,
            table: spec.table.clone(),
            event: spec.event,
            filter: spec.filter.clone(),
            status,
            deliver,
        };

        let replaced = self.inner.routes.write().insert(spec.name.clone(), route);
        if replaced.is_some() {
            warn!(channel = %spec.name, "channel name reused, previous channel dropped");
        }

        info!(
            channel = %spec.name,
            table = %spec.table,
            event = %spec.event,
            filter = ?spec.filter.as_ref().map(ToString::to_string),
            "channel opened"
        );
        let _ = ack.send(FeedStatus::Subscribed);
        Ok(channel)
    }

    fn remove(&self, name: &str, id: Uuid) {
        let mut routes = self.inner.routes.write();
        if routes.get(name).is_some_and(|route| route.id == id) {
            routes.remove(name);
            info!(channel = %name, "channel removed");
        }
    }
}
