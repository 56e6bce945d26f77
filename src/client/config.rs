use std::env;
use std::time::Duration;

/// How long to wait before the next reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Fixed(Duration),
    /// Doubles per consecutive failure, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed(delay) => delay,
            ReconnectPolicy::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(16);
                std::cmp::min(initial.saturating_mul(1u32 << shift), max)
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(Duration::from_millis(3000))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub stream_url: String,
    pub backend_url: String,
    /// Raw `Cookie` header forwarded to the REST endpoints.
    pub session_cookie: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub settle_delay: Duration,
    pub chat_dedup_window: Duration,
    pub action_recheck_delay: Duration,
    pub http_timeout: Duration,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stream_url: "ws://localhost:8080/ws".to_string(),
            backend_url: "http://localhost:8080".to_string(),
            session_cookie: None,
            reconnect: ReconnectPolicy::default(),
            settle_delay: Duration::from_millis(100),
            chat_dedup_window: Duration::from_millis(3000),
            action_recheck_delay: Duration::from_millis(1500),
            http_timeout: Duration::from_millis(10_000),
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let reconnect_delay = millis("RECONNECT_DELAY_MS").unwrap_or(Duration::from_millis(3000));
        let reconnect = match millis("RECONNECT_MAX_DELAY_MS") {
            Some(max) if max > reconnect_delay => ReconnectPolicy::Exponential {
                initial: reconnect_delay,
                max,
            },
            _ => ReconnectPolicy::Fixed(reconnect_delay),
        };

        Self {
            stream_url: env::var("STREAM_URL").unwrap_or(defaults.stream_url),
            backend_url: env::var("BACKEND_URL").unwrap_or(defaults.backend_url),
            session_cookie: env::var("SESSION_COOKIE").ok().filter(|c| !c.trim().is_empty()),
            reconnect,
            settle_delay: millis("SETTLE_DELAY_MS").unwrap_or(defaults.settle_delay),
            chat_dedup_window: millis("CHAT_DEDUP_WINDOW_MS").unwrap_or(defaults.chat_dedup_window),
            action_recheck_delay: millis("ACTION_RECHECK_DELAY_MS").unwrap_or(defaults.action_recheck_delay),
            http_timeout: millis("HTTP_TIMEOUT_MS").unwrap_or(defaults.http_timeout),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }
}

fn millis(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policy_never_grows() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(3));
        assert_eq!(policy.delay(50), Duration::from_secs(3));
    }

    #[test]
    fn exponential_policy_doubles_up_to_cap() {
        let policy = ReconnectPolicy::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ClientConfig::default();
        assert_eq!(config.settle_delay, Duration::from_millis(100));
        assert_eq!(config.chat_dedup_window, Duration::from_millis(3000));
        assert_eq!(config.reconnect, ReconnectPolicy::Fixed(Duration::from_millis(3000)));
    }
}
