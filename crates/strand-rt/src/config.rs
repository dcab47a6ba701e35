// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.

use std::str::FromStr;

use crate::error::{Error, Result};

/// Knobs for a scheduler / reactor instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Diagnostic name. Worker threads are called `{name}-worker-{i}`.
    pub name: String,
    /// Total number of workers, counting the caller when `use_caller` is set.
    pub threads: usize,
    /// Whether the constructing thread participates as a worker.
    pub use_caller: bool,
    /// Stack size for fibers created by the runtime.
    pub stack_size: usize,
    /// Ceiling on a single `epoll_wait`, even with no timers pending.
    pub max_wait_ms: u64,
    /// Readiness events fetched per wait call.
    pub max_events: usize,
    /// Number of fd slots allocated up front.
    pub initial_fd_capacity: usize,
    /// Backward wall-clock jump that counts as a rollover.
    pub rollover_threshold_ms: u64,
}

pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;
pub const DEFAULT_MAX_WAIT_MS: u64 = 3000;
pub const DEFAULT_ROLLOVER_THRESHOLD_MS: u64 = 60 * 60 * 1000;

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "strand".to_string(),
            threads: 1,
            use_caller: true,
            stack_size: DEFAULT_STACK_SIZE,
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
            max_events: 64,
            initial_fd_capacity: 32,
            rollover_threshold_ms: DEFAULT_ROLLOVER_THRESHOLD_MS,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `STRAND_THREADS`, `STRAND_STACK_SIZE`,
    /// `STRAND_MAX_WAIT_MS` and `STRAND_MAX_EVENTS` when set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_override("STRAND_THREADS")? {
            config.threads = v;
        }
        if let Some(v) = env_override("STRAND_STACK_SIZE")? {
            config.stack_size = v;
        }
        if let Some(v) = env_override("STRAND_MAX_WAIT_MS")? {
            config.max_wait_ms = v;
        }
        if let Some(v) = env_override("STRAND_MAX_EVENTS")? {
            config.max_events = v;
        }
        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_use_caller(mut self, use_caller: bool) -> Self {
        self.use_caller = use_caller;
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_max_wait_ms(mut self, max_wait_ms: u64) -> Self {
        self.max_wait_ms = max_wait_ms;
        self
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events.max(1);
        self
    }

    pub fn with_initial_fd_capacity(mut self, capacity: usize) -> Self {
        self.initial_fd_capacity = capacity;
        self
    }

    pub fn with_rollover_threshold_ms(mut self, threshold: u64) -> Self {
        self.rollover_threshold_ms = threshold;
        self
    }
}

/// Size the fd table grows to when `fd` is out of range.
pub(crate) fn grown_capacity(fd: usize) -> usize {
    (fd * 3 / 2).max(fd + 1)
}

fn env_override<T: FromStr>(key: &'static str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config { key, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.threads, 1);
        assert!(config.use_caller);
        assert_eq!(config.max_wait_ms, 3000);
        assert_eq!(config.max_events, 64);
        assert_eq!(config.initial_fd_capacity, 32);
        assert_eq!(config.rollover_threshold_ms, 3_600_000);
    }

    #[test]
    fn builder_overrides() {
        let config = RuntimeConfig::new()
            .with_name("io")
            .with_threads(4)
            .with_use_caller(false)
            .with_stack_size(64 * 1024)
            .with_max_events(0);
        assert_eq!(config.name, "io");
        assert_eq!(config.threads, 4);
        assert!(!config.use_caller);
        assert_eq!(config.stack_size, 64 * 1024);
        // At least one event slot is always kept.
        assert_eq!(config.max_events, 1);
    }

    #[test]
    fn growth_is_one_and_a_half_times() {
        assert_eq!(grown_capacity(100), 150);
        assert_eq!(grown_capacity(0), 1);
        assert_eq!(grown_capacity(1), 2);
    }

    #[test]
    fn env_override_rejects_garbage() {
        std::env::set_var("STRAND_TEST_GARBAGE", "many");
        let err = env_override::<usize>("STRAND_TEST_GARBAGE").unwrap_err();
        assert!(matches!(err, Error::Config { key: "STRAND_TEST_GARBAGE", .. }));
        std::env::remove_var("STRAND_TEST_GARBAGE");
        assert_eq!(env_override::<usize>("STRAND_TEST_GARBAGE").unwrap(), None);
    }
}
