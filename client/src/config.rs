//! Configuration management for the client.

use std::env;
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// How long an unused document stays loaded before it is released
    pub release_delay: Duration,
    /// Log provider misuse such as a connection handle changing identity
    pub dev_warnings: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            release_delay: Duration::ZERO,
            dev_warnings: true,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// - `SHARESTATE_RELEASE_DELAY_MS` (default `0`)
    /// - `SHARESTATE_DEV_WARNINGS` (default `true`)
    /// - `SHARESTATE_ENV` (`production` turns dev warnings off)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let release_delay = match lookup("SHARESTATE_RELEASE_DELAY_MS") {
            Some(raw) => Duration::from_millis(
                raw.trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidReleaseDelay(raw.clone()))?,
            ),
            None => Duration::ZERO,
        };

        let production = lookup("SHARESTATE_ENV").is_some_and(|env| env.trim() == "production");

        let dev_warnings = match lookup("SHARESTATE_DEV_WARNINGS") {
            Some(raw) => parse_bool(&raw).ok_or(ConfigError::InvalidDevWarnings(raw))?,
            None => !production,
        };

        Ok(Self {
            release_delay,
            dev_warnings: dev_warnings && !production,
        })
    }

    pub fn with_release_delay(mut self, delay: Duration) -> Self {
        self.release_delay = delay;
        self
    }

    pub fn with_dev_warnings(mut self, enabled: bool) -> Self {
        self.dev_warnings = enabled;
        self
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid SHARESTATE_RELEASE_DELAY_MS value: {0}")]
    InvalidReleaseDelay(String),

    #[error("Invalid SHARESTATE_DEV_WARNINGS value: {0}")]
    InvalidDevWarnings(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert!(config.release_delay.is_zero());
        assert!(config.dev_warnings);
    }

    #[test]
    fn reads_release_delay() {
        let config = load(&[("SHARESTATE_RELEASE_DELAY_MS", "250")]).unwrap();
        assert_eq!(config.release_delay, Duration::from_millis(250));

        let err = load(&[("SHARESTATE_RELEASE_DELAY_MS", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidReleaseDelay(_)));
    }

    #[test]
    fn production_disables_dev_warnings() {
        let config = load(&[("SHARESTATE_ENV", "production")]).unwrap();
        assert!(!config.dev_warnings);

        let config = load(&[
            ("SHARESTATE_ENV", "production"),
            ("SHARESTATE_DEV_WARNINGS", "true"),
        ])
        .unwrap();
        assert!(!config.dev_warnings);

        let config = load(&[("SHARESTATE_DEV_WARNINGS", "off")]).unwrap();
        assert!(!config.dev_warnings);
    }
}
