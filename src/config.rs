//! Configuration for the HomeSide client
//!
//! Covers the connection target, optional credentials, request timeouts,
//! reconnect backoff and the per-group polling cadence. All durations are
//! human-readable in serialized form ("10s", "5m").

use crate::error::{HomesideError, Result};
use crate::registry::PollGroup;
use serde::{Deserialize, Serialize};
use std::{env, time::Duration};
use url::Url;

/// Client configuration for one controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomesideConfig {
    /// Controller host, with optional port (e.g. "192.168.1.50" or "heating.local:80")
    pub host: String,

    /// Username for the authenticated session (read-only access without it)
    #[serde(default)]
    pub username: Option<String>,

    /// Password for the authenticated session
    #[serde(default)]
    pub password: Option<String>,

    /// Transport establishment timeout
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Bounded window for a single request/response round trip
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Reconnect backoff parameters
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Polling cadence per coordinator group
    #[serde(default)]
    pub poll_intervals: PollIntervals,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

impl HomesideConfig {
    /// Create a configuration for an unauthenticated (read-only) session
    pub fn new<S: Into<String>>(host: S) -> Self {
        Self {
            host: host.into(),
            username: None,
            password: None,
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            backoff: BackoffConfig::default(),
            poll_intervals: PollIntervals::default(),
        }
    }

    /// Attach credentials for an authenticated session
    pub fn with_credentials<S: Into<String>>(mut self, username: S, password: S) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Load from `HOMESIDE_HOST` / `HOMESIDE_USERNAME` / `HOMESIDE_PASSWORD`
    pub fn from_env() -> Result<Self> {
        let host = env::var("HOMESIDE_HOST")
            .map_err(|_| HomesideError::config("HOMESIDE_HOST environment variable not set"))?;
        let mut config = Self::new(host);
        config.username = env::var("HOMESIDE_USERNAME").ok().filter(|s| !s.is_empty());
        config.password = env::var("HOMESIDE_PASSWORD").ok().filter(|s| !s.is_empty());
        config.validate()?;
        Ok(config)
    }

    /// A session is authenticated when either credential field is present
    pub fn has_credentials(&self) -> bool {
        self.username.as_deref().is_some_and(|s| !s.is_empty())
            || self.password.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// WebSocket endpoint for the EXOsocket session
    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.host, crate::protocol::frame::WS_PATH)
    }

    /// Validate host and timeout settings
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(HomesideError::config("host must not be empty"));
        }
        Url::parse(&self.ws_url())
            .map_err(|e| HomesideError::config(format!("invalid host '{}': {e}", self.host)))?;
        if self.connect_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(HomesideError::config("timeouts must be non-zero"));
        }
        self.backoff.validate()
    }
}

/// Exponential backoff parameters for automatic reconnection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound for the reconnect delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Multiplier applied per consecutive failure
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay in force after `attempt` consecutive failures (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 {
            return Err(HomesideError::config("backoff multiplier must be >= 1.0"));
        }
        if self.initial_delay > self.max_delay {
            return Err(HomesideError::config(
                "backoff initial_delay must not exceed max_delay",
            ));
        }
        Ok(())
    }
}

/// Polling interval per coordinator group
///
/// Defaults follow the controller's characteristics: temperatures and
/// pressures move fast, configuration and version data barely ever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollIntervals {
    #[serde(with = "humantime_serde")]
    pub fast: Duration,
    #[serde(with = "humantime_serde")]
    pub normal: Duration,
    #[serde(with = "humantime_serde")]
    pub slow: Duration,
    #[serde(with = "humantime_serde")]
    pub very_slow: Duration,
    #[serde(with = "humantime_serde")]
    pub diagnostic: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            fast: Duration::from_secs(10),
            normal: Duration::from_secs(30),
            slow: Duration::from_secs(300),
            very_slow: Duration::from_secs(3600),
            diagnostic: Duration::from_secs(1800),
        }
    }
}

impl PollIntervals {
    pub fn for_group(&self, group: PollGroup) -> Duration {
        match group {
            PollGroup::Fast => self.fast,
            PollGroup::Normal => self.normal,
            PollGroup::Slow => self.slow,
            PollGroup::VerySlow => self.very_slow,
            PollGroup::Diagnostic => self.diagnostic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(8));
        assert_eq!(backoff.delay_for(10), Duration::from_secs(8));
    }

    #[test]
    fn validate_rejects_empty_host() {
        let config = HomesideConfig::new("");
        assert!(matches!(
            config.validate(),
            Err(HomesideError::Config(_))
        ));
    }

    #[test]
    fn credentials_detection() {
        let config = HomesideConfig::new("10.0.0.2");
        assert!(!config.has_credentials());
        let config = config.with_credentials("service", "secret");
        assert!(config.has_credentials());
    }

    #[test]
    fn ws_url_includes_exosocket_path() {
        let config = HomesideConfig::new("10.0.0.2:8080");
        assert_eq!(config.ws_url(), "ws://10.0.0.2:8080/_EXOsocket/");
    }

    #[test]
    fn poll_intervals_default_cadence() {
        let intervals = PollIntervals::default();
        assert_eq!(intervals.for_group(PollGroup::Fast), Duration::from_secs(10));
        assert_eq!(
            intervals.for_group(PollGroup::VerySlow),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn config_roundtrips_through_serde() {
        let config = HomesideConfig::new("heat.local").with_credentials("op", "pw");
        let json = serde_json::to_string(&config).unwrap();
        let back: HomesideConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.host, "heat.local");
        assert_eq!(back.username.as_deref(), Some("op"));
        assert_eq!(back.connect_timeout, config.connect_timeout);
    }
}
