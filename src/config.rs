//! Runtime limits and timeouts
//!
//! Defaults can be overridden from the environment with `TETHER_*`
//! variables, read once by [`Config::from_env`].

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Lifetime of an ordinary completion token
    pub token_timeout: Duration,
    /// Lifetime of a generator or iterator token
    pub generator_timeout: Duration,
    /// Loop iteration cap, 0 for no cap
    pub max_iterations: usize,
    /// Parsed sequences kept in the parse cache, 0 disables caching
    pub parse_cache: usize,
    /// Longest a synchronous wait on a token may block
    pub wait_timeout: Duration,
    /// Settled-token results kept for late chain/wait requests
    pub settled_memo: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            token_timeout: Duration::from_millis(300_000),
            generator_timeout: Duration::from_millis(1_800_000),
            max_iterations: 100_000,
            parse_cache: 256,
            wait_timeout: Duration::from_millis(600_000),
            settled_memo: 1024,
        }
    }
}

fn env_number(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            token_timeout: env_number("TETHER_TOKEN_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.token_timeout),
            generator_timeout: env_number("TETHER_GENERATOR_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.generator_timeout),
            max_iterations: env_number("TETHER_MAX_ITERATIONS")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_iterations),
            parse_cache: env_number("TETHER_PARSE_CACHE")
                .map(|n| n as usize)
                .unwrap_or(defaults.parse_cache),
            wait_timeout: env_number("TETHER_WAIT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.wait_timeout),
            ..defaults
        }
    }

    pub fn with_token_timeout(mut self, timeout: Duration) -> Self {
        self.token_timeout = timeout;
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// True once `iteration` runs past the cap
    pub fn exceeds_iterations(&self, iteration: usize) -> bool {
        self.max_iterations != 0 && iteration > self.max_iterations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.token_timeout, Duration::from_secs(300));
        assert_eq!(config.generator_timeout, Duration::from_secs(1800));
        assert_eq!(config.max_iterations, 100_000);
    }

    #[test]
    fn test_iteration_cap() {
        let config = Config::default().with_max_iterations(3);
        assert!(!config.exceeds_iterations(3));
        assert!(config.exceeds_iterations(4));
        assert!(!Config::default().with_max_iterations(0).exceeds_iterations(usize::MAX));
    }
}
