//! Environment signals that force live channels to resubscribe.
//!
//! Mobile engines can leave a socket reporting `subscribed` while nothing
//! flows after a background/lock transition. Status alone cannot detect
//! that, so returning to the foreground or regaining the network resets the
//! retry counter of every enabled subscription and reopens its channel.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Foreground,
    Background,
}

/// Why a subscription was forced back to `connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    Manual,
    Foreground,
    NetworkRestored,
}

impl fmt::Display for ReconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Manual => "manual",
            Self::Foreground => "foreground restored",
            Self::NetworkRestored => "network restored",
        })
    }
}

#[derive(Debug)]
struct Environment {
    visibility: Visibility,
    online: bool,
}

/// Process-wide sink for platform visibility and network transitions.
/// Cloning shares the same state.
#[derive(Clone)]
pub struct ConnectivityWatcher {
    inner: Arc<WatcherInner>,
}

struct WatcherInner {
    restore_tx: broadcast::Sender<ReconnectReason>,
    environment: Mutex<Environment>,
}

impl Default for ConnectivityWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityWatcher {
    /// Starts foregrounded and online.
    pub fn new() -> Self {
        let (restore_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(WatcherInner {
                restore_tx,
                environment: Mutex::new(Environment {
                    visibility: Visibility::Foreground,
                    online: true,
                }),
            }),
        }
    }

    /// Receive a [`ReconnectReason`] each time the app returns to the
    /// foreground or the network comes back.
    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectReason> {
        self.inner.restore_tx.subscribe()
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        let restored = {
            let mut env = self.inner.environment.lock();
            let restored = env.visibility == Visibility::Background && visibility == Visibility::Foreground;
            env.visibility = visibility;
            restored
        };

        if restored {
            info!("app returned to foreground, forcing resubscribe");
            self.emit(ReconnectReason::Foreground);
        } else {
            debug!(?visibility, "visibility unchanged or hidden");
        }
    }

    pub fn set_online(&self, online: bool) {
        let restored = {
            let mut env = self.inner.environment.lock();
            let restored = !env.online && online;
            env.online = online;
            restored
        };

        if restored {
            info!("network restored, forcing resubscribe");
            self.emit(ReconnectReason::NetworkRestored);
        } else if !online {
            debug!("network went offline");
        }
    }

    pub fn is_foreground(&self) -> bool {
        self.inner.environment.lock().visibility == Visibility::Foreground
    }

    pub fn is_online(&self) -> bool {
        self.inner.environment.lock().online
    }

    fn emit(&self, reason: ReconnectReason) {
        // No receivers simply means no subscription is enabled right now.
        let _ = self.inner.restore_tx.send(reason);
    }
}
