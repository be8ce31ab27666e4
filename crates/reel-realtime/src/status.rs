use std::fmt;

use serde::{Deserialize, Serialize};

/// Live state of one subscription. Exactly one value is current at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Not enabled (no identity, or torn down)
    #[default]
    Idle,
    Connecting,
    Subscribed,
    /// Transient failure, a retry is scheduled
    Error,
    /// Retries exhausted; stays here until a reconnect trigger
    Closed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }

    /// Whether polling should cover for the live channel. `Error` counts so
    /// the backoff window before `Closed` is not a delivery gap.
    pub fn is_poll_eligible(&self) -> bool {
        matches!(self, Self::Error | Self::Closed)
    }

    /// Short label for a connection status panel.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Subscribed => "connected",
            Self::Connecting => "connecting…",
            Self::Error => "reconnecting…",
            Self::Closed => "fallback polling",
            Self::Idle => "idle",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-blocking banner shown above list views while live updates are down.
pub fn status_advisory(status: ConnectionStatus) -> Option<&'static str> {
    match status {
        ConnectionStatus::Error | ConnectionStatus::Closed => {
            Some("Realtime updates interrupted, reconnecting…")
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_error_and_closed_poll() {
        let eligible: Vec<_> = [
            ConnectionStatus::Idle,
            ConnectionStatus::Connecting,
            ConnectionStatus::Subscribed,
            ConnectionStatus::Error,
            ConnectionStatus::Closed,
        ]
        .into_iter()
        .filter(ConnectionStatus::is_poll_eligible)
        .collect();
        assert_eq!(eligible, vec![ConnectionStatus::Error, ConnectionStatus::Closed]);
    }

    #[test]
    fn advisory_hidden_while_healthy() {
        assert!(status_advisory(ConnectionStatus::Subscribed).is_none());
        assert!(status_advisory(ConnectionStatus::Connecting).is_none());
        assert!(status_advisory(ConnectionStatus::Idle).is_none());
        assert!(status_advisory(ConnectionStatus::Closed).is_some());
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&ConnectionStatus::Subscribed).unwrap();
        assert_eq!(json, "\"subscribed\"");
    }
}
