/// Sliding-window rate limiting, shared by the REST guards and the real-time
/// gateway.
///
/// Each `(action, identifier)` pair owns a bucket of request timestamps.
/// Entries older than the action's window are purged before every admission
/// decision; the whole table sits behind one mutex so a check-and-record is
/// atomic.
pub mod limiter;

pub use limiter::{Decision, RateLimiter};

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

/// Well-known action names.
pub mod actions {
    pub const LOGIN: &str = "login";
    pub const REGISTER: &str = "register";
    pub const MESSAGE: &str = "message";
    /// Catch-all used for any action without its own limit.
    pub const DEFAULT: &str = "default";
}

/// `max_requests` admitted per trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub max_requests: u32,
    pub window: Duration,
}

impl Limit {
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(window_secs),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid rate limit '{0}', expected <requests>/<window_secs>")]
pub struct ParseLimitError(pub String);

/// Parses the `requests/window_secs` form used in configuration, e.g. `5/60`.
impl FromStr for Limit {
    type Err = ParseLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseLimitError(s.to_string());
        let (requests, window) = s.split_once('/').ok_or_else(err)?;
        let max_requests = requests.trim().parse().map_err(|_| err())?;
        let window_secs: u64 = window.trim().parse().map_err(|_| err())?;
        if window_secs == 0 {
            return Err(err());
        }
        Ok(Self::new(max_requests, window_secs))
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub limits: HashMap<String, Limit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let limits = HashMap::from([
            (actions::LOGIN.to_string(), Limit::new(5, 60)),
            (actions::REGISTER.to_string(), Limit::new(3, 300)),
            (actions::MESSAGE.to_string(), Limit::new(30, 60)),
            (actions::DEFAULT.to_string(), Limit::new(100, 60)),
        ]);
        Self {
            enabled: true,
            limits,
        }
    }
}

impl RateLimitConfig {
    /// Override (or add) the limit for one action.
    pub fn with_limit(mut self, action: &str, limit: Limit) -> Self {
        self.limits.insert(action.to_string(), limit);
        self
    }
}

/// Identify a requester by network address.
///
/// Honors a forwarding header when present (first entry of the
/// comma-separated list), otherwise the socket's remote address.
pub fn client_identifier(forwarded_for: Option<&str>, remote: Option<IpAddr>) -> String {
    if let Some(first) = forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }

    remote
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_limit() {
        assert_eq!("5/60".parse::<Limit>(), Ok(Limit::new(5, 60)));
        assert_eq!(" 30 / 120 ".parse::<Limit>(), Ok(Limit::new(30, 120)));
        assert!("5".parse::<Limit>().is_err());
        assert!("x/60".parse::<Limit>().is_err());
        assert!("5/0".parse::<Limit>().is_err());
    }

    #[test]
    fn defaults_cover_every_action() {
        let config = RateLimitConfig::default();
        assert_eq!(config.limits[actions::LOGIN], Limit::new(5, 60));
        assert_eq!(config.limits[actions::REGISTER], Limit::new(3, 300));
        assert_eq!(config.limits[actions::MESSAGE], Limit::new(30, 60));
        assert_eq!(config.limits[actions::DEFAULT], Limit::new(100, 60));
    }

    #[test]
    fn identifier_prefers_forwarded_header() {
        let remote: Option<IpAddr> = Some("10.0.0.9".parse().unwrap());
        assert_eq!(
            client_identifier(Some("203.0.113.7, 10.0.0.1"), remote),
            "203.0.113.7"
        );
        assert_eq!(client_identifier(Some("  "), remote), "10.0.0.9");
        assert_eq!(client_identifier(None, remote), "10.0.0.9");
        assert_eq!(client_identifier(None, None), "127.0.0.1");
    }
}
