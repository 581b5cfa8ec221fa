//! Loader configuration
//!
//! Controls how the entity loaders of a [`Loaders`](crate::Loaders) set
//! collect and memoize keys. Every loader set built from the same config
//! behaves the same way; the config itself carries no state.

use std::env;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::window::BatchWindow;

/// Longest timer window we accept. Every resolver waiting on a loader waits
/// at least this long, so anything larger is almost certainly a typo.
pub const MAX_WINDOW_MS: u64 = 10_000;

/// How a batch window closes. See [`BatchWindow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    Tick,
    Delay,
    Manual,
}

impl FromStr for WindowMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tick" => Ok(WindowMode::Tick),
            "delay" => Ok(WindowMode::Delay),
            "manual" => Ok(WindowMode::Manual),
            _ => Err(ConfigError::InvalidValue {
                field: "window".to_string(),
                value: value.to_string(),
                expected: "one of tick, delay, manual".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// How each batch window closes
    pub window: WindowMode,
    /// Window length in milliseconds, used by `delay`
    pub window_ms: u64,
    /// Maximum keys per batch; 0 means unbounded
    pub max_batch_size: usize,
    /// Memoize loads for the lifetime of the loader set
    pub cache: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            window: WindowMode::Tick,
            window_ms: 1,
            max_batch_size: 0,
            cache: true,
        }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window == WindowMode::Delay && self.window_ms == 0 {
            return Err(ConfigError::validation_failed(
                "A delay window must be at least 1ms",
            ));
        }

        if self.window == WindowMode::Delay && self.window_ms > MAX_WINDOW_MS {
            return Err(ConfigError::validation_failed(format!(
                "A delay window must not exceed {}ms",
                MAX_WINDOW_MS
            )));
        }

        Ok(())
    }

    /// Read the configuration from `LOADER_*` environment variables, falling
    /// back to the defaults for any that are unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            window: env_or(&var, "LOADER_WINDOW", defaults.window, "one of tick, delay, manual")?,
            window_ms: env_or(&var, "LOADER_WINDOW_MS", defaults.window_ms, "valid number of milliseconds")?,
            max_batch_size: env_or(&var, "LOADER_MAX_BATCH_SIZE", defaults.max_batch_size, "valid number of keys")?,
            cache: env_or(&var, "LOADER_CACHE", defaults.cache, "true or false")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// The batch window every entity loader is built with.
    pub fn batch_window(&self) -> BatchWindow {
        match self.window {
            WindowMode::Tick => BatchWindow::Tick,
            WindowMode::Delay => BatchWindow::Delay(Duration::from_millis(self.window_ms)),
            WindowMode::Manual => BatchWindow::Manual,
        }
    }

    pub fn max_keys(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.max_batch_size)
    }
}

fn env_or<T: FromStr>(
    var: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    expected: &str,
) -> Result<T, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            field: name.to_string(),
            value: raw.clone(),
            expected: expected.to_string(),
        }),
    }
}
