use std::time::Duration;

use crate::error::RealtimeError;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_BASE_RETRY_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Bounded exponential backoff: `base_delay * 2^attempt` for attempts
/// `0..max_retries`, after which the channel is declared closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry numbered `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Sum of every scheduled delay before the channel gives up.
    pub fn total_window(&self) -> Duration {
        (0..self.max_retries).map(|a| self.delay_for(a)).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeConfig {
    pub retry: RetryPolicy,
    /// Unread re-fetch cadence while the live channel is degraded
    pub poll_interval: Duration,
    pub schema: String,
    pub messages_table: String,
    pub signals_table: String,
    /// Shared, identity-independent channel for the signal lobby
    pub signals_channel: String,
    /// Periodic loud refetch of the lobby listing; off when `None`
    pub signals_refresh: Option<Duration>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            schema: "public".into(),
            messages_table: "messages".into(),
            signals_table: "signals".into(),
            signals_channel: "signals-lobby-global".into(),
            signals_refresh: None,
        }
    }
}

impl RealtimeConfig {
    /// Defaults overridden by `REEL_MAX_RETRIES`, `REEL_RETRY_BASE_MS`,
    /// `REEL_POLL_INTERVAL_MS` and `REEL_SIGNALS_REFRESH_MS` (0 turns the
    /// lobby auto-refresh off).
    pub fn from_env() -> Result<Self, RealtimeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RealtimeError> {
        let env_number = |key: &str| parse_number(key, lookup(key));
        let mut config = Self::default();

        if let Some(max) = env_number("REEL_MAX_RETRIES")? {
            config.retry.max_retries = u32::try_from(max)
                .map_err(|_| RealtimeError::Config(format!("REEL_MAX_RETRIES={max}: out of range")))?;
        }
        if let Some(ms) = env_number("REEL_RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("REEL_POLL_INTERVAL_MS")? {
            if ms == 0 {
                return Err(RealtimeError::Config("REEL_POLL_INTERVAL_MS must be positive".into()));
            }
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("REEL_SIGNALS_REFRESH_MS")? {
            config.signals_refresh = (ms > 0).then(|| Duration::from_millis(ms));
        }

        Ok(config)
    }

    /// Channel name for the messages subscription of one identity.
    pub fn messages_channel(&self, identity: uuid::Uuid) -> String {
        format!("global-messages-{identity}")
    }
}

fn parse_number(key: &str, raw: Option<String>) -> Result<Option<u64>, RealtimeError> {
    match raw {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| RealtimeError::Config(format!("{key}={raw}: {e}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..5).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![3, 6, 12, 24, 48]);
    }

    #[test]
    fn retry_window_stays_under_100_seconds() {
        let window = RetryPolicy::default().total_window();
        assert_eq!(window, Duration::from_secs(93));
        assert!(window < Duration::from_secs(100));
    }

    #[test]
    fn huge_attempt_saturates() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(64), Duration::from_secs(3).saturating_mul(u32::MAX));
    }

    #[test]
    fn messages_channel_is_identity_scoped() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            RealtimeConfig::default().messages_channel(id),
            "global-messages-00000000-0000-0000-0000-000000000000"
        );
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: Vec<(String, String)> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let config = RealtimeConfig::from_lookup(lookup(&[
            ("REEL_MAX_RETRIES", "2"),
            ("REEL_RETRY_BASE_MS", " 250 "),
            ("REEL_SIGNALS_REFRESH_MS", "30000"),
        ]))
        .unwrap();
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.signals_refresh, Some(Duration::from_secs(30)));

        let off = RealtimeConfig::from_lookup(lookup(&[("REEL_SIGNALS_REFRESH_MS", "0")])).unwrap();
        assert_eq!(off.signals_refresh, None);
    }

    #[test]
    fn out_of_range_retry_budget_is_rejected() {
        let err = RealtimeConfig::from_lookup(lookup(&[("REEL_MAX_RETRIES", "4294967296")])).unwrap_err();
        assert!(matches!(err, RealtimeError::Config(_)));

        let max = RealtimeConfig::from_lookup(lookup(&[("REEL_MAX_RETRIES", "4294967295")])).unwrap();
        assert_eq!(max.retry.max_retries, u32::MAX);
    }

    #[test]
    fn bad_numbers_are_config_errors() {
        assert!(matches!(
            RealtimeConfig::from_lookup(lookup(&[("REEL_RETRY_BASE_MS", "soon")])),
            Err(RealtimeError::Config(_))
        ));
        assert!(matches!(
            RealtimeConfig::from_lookup(lookup(&[("REEL_POLL_INTERVAL_MS", "0")])),
            Err(RealtimeError::Config(_))
        ));
    }
}
