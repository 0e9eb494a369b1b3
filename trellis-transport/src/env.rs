//! Environment variable loading.

use crate::error::ConfigError;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Prefix of every environment variable the transport reads.
pub const ENV_PREFIX: &str = "TRELLIS";

/// Reads `PREFIX_KEY` style variables, either from the process environment
/// or from a fixed map.
#[derive(Debug, Clone)]
pub struct EnvLoader {
    prefix: String,
    source: Option<HashMap<String, String>>,
}

impl EnvLoader {
    /// Loader over the process environment.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            source: None,
        }
    }

    /// Loader over a fixed set of variables, keyed by their full names.
    pub fn from_map(prefix: impl Into<String>, vars: HashMap<String, String>) -> Self {
        Self {
            prefix: prefix.into(),
            source: Some(vars),
        }
    }

    /// Full variable name for `key`.
    pub fn key(&self, key: &str) -> String {
        format!("{}_{}", self.prefix, key.to_uppercase())
    }

    /// Raw value of `key`, if set and not blank.
    pub fn load_var(&self, key: &str) -> Option<String> {
        let full_key = self.key(key);
        let value = match &self.source {
            Some(vars) => vars.get(&full_key).cloned(),
            None => env::var(&full_key).ok(),
        };
        value.filter(|v| !v.trim().is_empty())
    }

    /// Parsed value of `key`.
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.load_var(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(key, &raw)),
            None => Ok(None),
        }
    }

    /// Boolean value of `key`. Accepts `true/false`, `1/0`, `yes/no`, `on/off`.
    pub fn flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.load_var(key) {
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Some(true)),
                "false" | "0" | "no" | "off" => Ok(Some(false)),
                _ => Err(self.invalid(key, &raw)),
            },
            None => Ok(None),
        }
    }

    /// Millisecond duration stored under `key`.
    pub fn millis(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }

    /// Second duration stored under `key`.
    pub fn secs(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }

    /// Comma separated list stored under `key`.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.load_var(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn invalid(&self, key: &str, value: &str) -> ConfigError {
        ConfigError::InvalidValue {
            key: self.key(key),
            value: value.to_string(),
        }
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(ENV_PREFIX)
    }
}
