use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Deployment environment. Production redacts internal error details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" | "test" => Ok(Self::Development),
            other => Err(Error::Configuration(format!("unknown APP_ENV '{other}'"))),
        }
    }
}

/// Process configuration read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    /// `None` runs against the in-process memory store.
    pub redis_url: Option<String>,
    pub environment: Environment,
    /// `host:port` of the primary datastore for health probing.
    pub database_addr: Option<String>,
    pub store_timeout: Duration,
    pub telemetry_queue_capacity: usize,
    pub rate_limit_window: Duration,
    pub rate_limit_max: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".into(),
            redis_url: None,
            environment: Environment::Development,
            database_addr: None,
            store_timeout: Duration::from_millis(2_000),
            telemetry_queue_capacity: 10_000,
            rate_limit_window: Duration::from_millis(15 * 60 * 1000),
            rate_limit_max: 100,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            redis_url: get("REDIS_URL"),
            environment: match get("APP_ENV") {
                Some(v) => v.parse()?,
                None => defaults.environment,
            },
            database_addr: get("DATABASE_ADDR"),
            store_timeout: parse_var(&get, "STORE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.store_timeout),
            telemetry_queue_capacity: parse_var(&get, "TELEMETRY_QUEUE_CAPACITY")?
                .unwrap_or(defaults.telemetry_queue_capacity),
            rate_limit_window: parse_var(&get, "RATE_LIMIT_WINDOW_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.rate_limit_window),
            rate_limit_max: parse_var(&get, "RATE_LIMIT_MAX")?.unwrap_or(defaults.rate_limit_max),
        })
    }
}

fn parse_var<T, F>(get: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    get(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Configuration(format!("{name}={raw:?}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:3000");
        assert!(cfg.redis_url.is_none());
        assert_eq!(cfg.rate_limit_max, 100);
        assert_eq!(cfg.environment, Environment::Development);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config(&[
            ("REDIS_URL", "redis://cache:6379/"),
            ("APP_ENV", "production"),
            ("RATE_LIMIT_WINDOW_MS", "1000"),
            ("RATE_LIMIT_MAX", "3"),
            ("REDIS_URL_UNUSED", ""),
        ])
        .unwrap();
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://cache:6379/"));
        assert!(cfg.environment.is_production());
        assert_eq!(cfg.rate_limit_window, Duration::from_secs(1));
        assert_eq!(cfg.rate_limit_max, 3);
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        assert!(matches!(
            config(&[("RATE_LIMIT_MAX", "lots")]),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            config(&[("APP_ENV", "staging")]),
            Err(Error::Configuration(_))
        ));
    }
}
