//! Pool configuration: declared worker counts and environment knobs.
//!
//! The master only ever sees a `QueueCounts` mapping; where it comes from is
//! the loader's concern. The file loader reads a JSON document that is either
//! a flat map of queue group to count or a map keyed by environment name:
//!
//! ```json
//! { "mail,notifications": 2, "indexing": 1 }
//! { "production": { "mail": 4 }, "staging": { "mail": 1 } }
//! ```

use crate::backoff::{DEFAULT_DELAY_MAX, DEFAULT_DELAY_STEP};
use crate::error::PoolError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Declared target worker counts per queue group.
pub type QueueCounts = HashMap<String, usize>;

/// Default worker poll interval (`INTERVAL`).
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Default worker termination timeout in seconds (`RESQUE_TERM_TIMEOUT`).
pub const DEFAULT_TERM_TIMEOUT: f64 = 4.0;

/// Values accepted as "yes" in boolean environment variables.
const TRUTHY: &[&str] = &["yes", "y", "true", "t", "1", "okay", "sure", "please"];

/// Whether an environment variable value opts in to a boolean setting.
pub fn truthy(value: &str) -> bool {
    let value = value.to_lowercase();
    TRUTHY.iter().any(|t| *t == value)
}

/// Source of the declared worker counts. Must be safely re-callable so the
/// master can refresh on every loop iteration and on `HUP`.
pub trait ConfigLoader: Send {
    fn load(&mut self, environment: Option<&str>) -> Result<QueueCounts>;

    /// Invalidate any cached contents. Invoked before each reload.
    fn reset(&mut self) {}
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConfigDoc {
    ByEnv(HashMap<String, HashMap<String, usize>>),
    Flat(HashMap<String, usize>),
}

/// Parse a configuration document, selecting `environment` if it is keyed.
pub fn parse_config(content: &str, environment: Option<&str>) -> Result<QueueCounts> {
    let doc: ConfigDoc = serde_json::from_str(content).map_err(|err| {
        PoolError::Config(format!(
            "expected a map of queue group to count, optionally keyed by environment: {err}"
        ))
    })?;

    match doc {
        ConfigDoc::Flat(counts) => Ok(counts),
        ConfigDoc::ByEnv(by_env) => match environment {
            Some(env) => Ok(by_env.get(env).cloned().unwrap_or_default()),
            None => Err(PoolError::Config(
                "configuration is keyed by environment but no environment name was given".into(),
            )
            .into()),
        },
    }
}

/// File-backed configuration, re-read on every `reset` + `load` cycle.
pub struct FileConfigLoader {
    path: PathBuf,
    cached: Option<String>,
}

impl FileConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: None,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl ConfigLoader for FileConfigLoader {
    fn load(&mut self, environment: Option<&str>) -> Result<QueueCounts> {
        if self.cached.is_none() {
            let content = std::fs::read_to_string(&self.path)
                .with_context(|| format!("reading pool configuration {}", self.path.display()))?;
            self.cached = Some(content);
        }
        let content = self.cached.as_deref().unwrap_or_default();
        parse_config(content, environment)
    }

    fn reset(&mut self) {
        self.cached = None;
    }
}

/// In-memory configuration for embedders and tests. The shared handle can be
/// mutated at any time; the next load observes the new counts.
pub struct MemoryConfigLoader {
    counts: Arc<Mutex<QueueCounts>>,
}

impl MemoryConfigLoader {
    pub fn new(counts: QueueCounts) -> Self {
        Self {
            counts: Arc::new(Mutex::new(counts)),
        }
    }

    pub fn handle(&self) -> Arc<Mutex<QueueCounts>> {
        Arc::clone(&self.counts)
    }
}

impl ConfigLoader for MemoryConfigLoader {
    fn load(&mut self, _environment: Option<&str>) -> Result<QueueCounts> {
        Ok(self.counts.lock().unwrap().clone())
    }
}

/// How the master reacts to `TERM` (`TERM_BEHAVIOR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TermBehavior {
    /// Signal workers to finish and block until all are reaped.
    GracefulAndWait,
    /// Signal workers to finish, exit without waiting.
    Graceful,
    /// Send `TERM` to workers and block until all are reaped.
    TermAndWait,
    /// Shut everything down immediately.
    #[default]
    Immediate,
}

impl TermBehavior {
    pub fn parse(value: &str) -> Self {
        match value {
            "graceful_worker_shutdown_and_wait" => Self::GracefulAndWait,
            "graceful_worker_shutdown" => Self::Graceful,
            "term_and_wait" => Self::TermAndWait,
            _ => Self::Immediate,
        }
    }
}

/// Runtime options for the master, mostly sourced from the environment.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Backoff exponential base, and the threshold under which a reaped child
    /// counts as "died too young" (`DELAY_SPAWN_LIMIT`).
    pub delay_step: Duration,
    /// Clamp on the computed backoff delay (`DELAY_SPAWN_MAX`).
    pub delay_max: Duration,
    /// Workers quit gracefully on `TERM` instead of `QUIT` (`TERM_CHILD`).
    pub term_child: bool,
    /// Keep children in the master's process group (`RESQUE_SINGLE_PGRP`).
    pub single_pgrp: bool,
    /// Seconds a worker waits for its job on termination (`RESQUE_TERM_TIMEOUT`).
    pub term_timeout: f64,
    /// Worker poll interval (`INTERVAL`).
    pub interval: Duration,
    /// Passed through to workers that support it (`RUN_AT_EXIT_HOOKS`).
    pub run_at_exit_hooks: bool,
    /// Worker verbosity (`LOGGING`/`VERBOSE`).
    pub verbose: bool,
    /// Worker extra verbosity (`VVERBOSE`).
    pub very_verbose: bool,
    /// Environment name handed to the configuration loader
    /// (`RACK_ENV`, `RAILS_ENV`, `RESQUE_ENV`, in that priority order).
    pub environment: Option<String>,
    /// Whether `WINCH` empties the configuration and shrinks the pool to zero.
    pub handle_winch: bool,
    /// Reaction to `TERM` (`TERM_BEHAVIOR`).
    pub term_behavior: TermBehavior,
    /// Optional sleep after each spawn (`SPAWN_THROTTLE`, fractional seconds).
    pub spawn_throttle: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            delay_step: DEFAULT_DELAY_STEP,
            delay_max: DEFAULT_DELAY_MAX,
            term_child: false,
            single_pgrp: false,
            term_timeout: DEFAULT_TERM_TIMEOUT,
            interval: DEFAULT_INTERVAL,
            run_at_exit_hooks: false,
            verbose: false,
            very_verbose: false,
            environment: None,
            handle_winch: false,
            term_behavior: TermBehavior::Immediate,
            spawn_throttle: None,
        }
    }
}

impl PoolOptions {
    /// Build options from the process environment.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Some(secs) = env_u64("DELAY_SPAWN_LIMIT") {
            options.delay_step = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("DELAY_SPAWN_MAX") {
            options.delay_max = Duration::from_secs(secs);
        }
        options.term_child = std::env::var("TERM_CHILD").is_ok();
        options.single_pgrp = std::env::var("RESQUE_SINGLE_PGRP")
            .map(|v| truthy(&v))
            .unwrap_or(false);
        if let Some(secs) = env_f64("RESQUE_TERM_TIMEOUT") {
            options.term_timeout = secs;
        }
        if let Some(secs) = env_u64("INTERVAL") {
            options.interval = Duration::from_secs(secs);
        }
        options.run_at_exit_hooks = std::env::var("RUN_AT_EXIT_HOOKS")
            .map(|v| truthy(&v))
            .unwrap_or(false);
        options.verbose =
            std::env::var("VERBOSE").is_ok() || std::env::var("LOGGING").is_ok();
        options.very_verbose = std::env::var("VVERBOSE").is_ok();
        options.environment = environment_name();
        if let Ok(value) = std::env::var("TERM_BEHAVIOR") {
            options.term_behavior = TermBehavior::parse(&value);
        }
        if let Some(secs) = env_f64("SPAWN_THROTTLE") {
            if secs > 0.0 {
                options.spawn_throttle = Some(Duration::from_secs_f64(secs));
            }
        }

        options
    }
}

/// Environment name for the configuration loader, first match wins.
pub fn environment_name() -> Option<String> {
    for var in ["RACK_ENV", "RAILS_ENV", "RESQUE_ENV"] {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flat_config() {
        let counts = parse_config(r#"{"mail,notifications": 2, "indexing": 1}"#, None).unwrap();
        assert_eq!(counts.get("mail,notifications"), Some(&2));
        assert_eq!(counts.get("indexing"), Some(&1));
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn test_parse_env_keyed_config() {
        let content = r#"{"production": {"mail": 4, "low": 1}, "staging": {"mail": 1}}"#;

        let prod = parse_config(content, Some("production")).unwrap();
        assert_eq!(prod.get("mail"), Some(&4));
        assert_eq!(prod.len(), 2);

        let staging = parse_config(content, Some("staging")).unwrap();
        assert_eq!(staging.get("mail"), Some(&1));
        assert_eq!(staging.len(), 1);
    }

    #[test]
    fn test_env_keyed_config_with_unknown_environment_is_empty() {
        let content = r#"{"production": {"mail": 4}}"#;
        let counts = parse_config(content, Some("development")).unwrap();
        assert!(counts.is_empty());
    }

    #[test]
    fn test_env_keyed_config_without_environment_is_an_error() {
        let content = r#"{"production": {"mail": 4}}"#;
        assert!(parse_config(content, None).is_err());
    }

    #[test]
    fn test_flat_config_ignores_environment() {
        let counts = parse_config(r#"{"mail": 2}"#, Some("production")).unwrap();
        assert_eq!(counts.get("mail"), Some(&2));
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        assert!(parse_config("not json", None).is_err());
        assert!(parse_config(r#"{"mail": -1}"#, None).is_err());
        assert!(parse_config(r#"{"mail": "two"}"#, None).is_err());
    }

    #[test]
    fn test_truthy_values() {
        for value in ["yes", "YES", "y", "true", "T", "1", "okay", "sure", "Please"] {
            assert!(truthy(value), "{value} should be truthy");
        }
        for value in ["no", "0", "false", "", "nope"] {
            assert!(!truthy(value), "{value} should not be truthy");
        }
    }

    #[test]
    fn test_term_behavior_parse() {
        assert_eq!(
            TermBehavior::parse("graceful_worker_shutdown_and_wait"),
            TermBehavior::GracefulAndWait
        );
        assert_eq!(
            TermBehavior::parse("graceful_worker_shutdown"),
            TermBehavior::Graceful
        );
        assert_eq!(TermBehavior::parse("term_and_wait"), TermBehavior::TermAndWait);
        assert_eq!(TermBehavior::parse("anything else"), TermBehavior::Immediate);
        assert_eq!(TermBehavior::parse(""), TermBehavior::Immediate);
    }

    #[test]
    fn test_default_options() {
        let options = PoolOptions::default();
        assert_eq!(options.delay_step, Duration::from_secs(10));
        assert_eq!(options.delay_max, Duration::from_secs(600));
        assert_eq!(options.interval, Duration::from_secs(5));
        assert_eq!(options.term_timeout, 4.0);
        assert!(!options.term_child);
        assert!(!options.handle_winch);
        assert_eq!(options.term_behavior, TermBehavior::Immediate);
        assert!(options.spawn_throttle.is_none());
    }

    #[test]
    fn test_memory_loader_observes_mutation() {
        let mut loader = MemoryConfigLoader::new(QueueCounts::from([("q".to_string(), 3)]));
        let handle = loader.handle();

        assert_eq!(loader.load(None).unwrap().get("q"), Some(&3));

        handle.lock().unwrap().insert("q".to_string(), 1);
        loader.reset();
        assert_eq!(loader.load(None).unwrap().get("q"), Some(&1));
    }
}
