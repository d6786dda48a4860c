use std::env;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use dotenvy::dotenv;

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Base URI every activity address is derived from.
    pub base_address: String,
    /// Messages each activity host runs at once.
    pub host_concurrency: usize,
    /// Buffer size of the in-process event bus.
    pub event_bus_capacity: usize,
    /// Time-to-live stamped on execute messages. `None` means they never expire.
    pub execute_time_to_live: Option<Duration>,
    /// Default wait for `execute_and_await`.
    pub await_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_address: "loopback://localhost".to_string(),
            host_concurrency: 64,
            event_bus_capacity: 10000,
            execute_time_to_live: None,
            await_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let execute_time_to_live = match lookup("COURIER_EXECUTE_TTL_MS") {
            Some(ms) => Some(Duration::from_millis(
                ms.parse()
                    .context("COURIER_EXECUTE_TTL_MS must be a valid number")?,
            )),
            None => None,
        };

        let event_bus_capacity: usize = lookup("COURIER_EVENT_BUS_CAPACITY")
            .unwrap_or_else(|| defaults.event_bus_capacity.to_string())
            .parse()
            .context("COURIER_EVENT_BUS_CAPACITY must be a valid number")?;
        ensure!(
            event_bus_capacity > 0,
            "COURIER_EVENT_BUS_CAPACITY must be at least 1"
        );

        Ok(Self {
            base_address: lookup("COURIER_BASE_ADDRESS").unwrap_or(defaults.base_address),
            host_concurrency: lookup("COURIER_HOST_CONCURRENCY")
                .unwrap_or_else(|| defaults.host_concurrency.to_string())
                .parse()
                .context("COURIER_HOST_CONCURRENCY must be a valid number")?,
            event_bus_capacity,
            execute_time_to_live,
            await_timeout: Duration::from_secs(
                lookup("COURIER_AWAIT_TIMEOUT_SECS")
                    .unwrap_or_else(|| defaults.await_timeout.as_secs().to_string())
                    .parse()
                    .context("COURIER_AWAIT_TIMEOUT_SECS must be a valid number")?,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = assert_ok!(Config::from_lookup(lookup(&[])));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_reads_overrides() {
        let config = assert_ok!(Config::from_lookup(lookup(&[
            ("COURIER_BASE_ADDRESS", "loopback://courier"),
            ("COURIER_HOST_CONCURRENCY", "4"),
            ("COURIER_EXECUTE_TTL_MS", "250"),
            ("COURIER_AWAIT_TIMEOUT_SECS", "5"),
        ])));

        assert_eq!(config.base_address, "loopback://courier");
        assert_eq!(config.host_concurrency, 4);
        assert_eq!(config.event_bus_capacity, 10000);
        assert_eq!(config.execute_time_to_live, Some(Duration::from_millis(250)));
        assert_eq!(config.await_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_invalid_ttl() {
        assert_err!(Config::from_lookup(lookup(&[("COURIER_EXECUTE_TTL_MS", "-1")])));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = assert_err!(Config::from_lookup(lookup(&[(
            "COURIER_EVENT_BUS_CAPACITY",
            "0"
        )])));
        assert!(err.to_string().contains("must be at least 1"));
    }

    #[test]
    fn test_rejects_invalid_number() {
        let err = assert_err!(Config::from_lookup(lookup(&[(
            "COURIER_HOST_CONCURRENCY",
            "many"
        )])));
        assert!(err
            .to_string()
            .contains("COURIER_HOST_CONCURRENCY must be a valid number"));
    }
}
