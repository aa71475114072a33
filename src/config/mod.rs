use std::env;
use std::time::Duration;

use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

use crate::errors::ListenerError;

/// Fully-resolved knobs for one listener.
///
/// Resolution precedence: explicit override > environment variable >
/// built-in default. The handler mode is not a config field; it is implied
/// by the registered handler variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub queue_url: String,
    /// Long-poll duration per receive, seconds (0..=20).
    pub wait_time_s: u64,
    /// Max messages per receive (1..=10).
    pub batch_size: i32,
    /// Initial visibility timeout on receive, seconds.
    pub visibility_s: u64,
    /// Hard cap on total visibility extension per message, seconds.
    pub max_extend_s: u64,
    /// Pollers per listener; also the handler concurrency ceiling in
    /// per-message mode.
    pub worker_threads: usize,
    /// Upper bound of the randomized sleep after an empty receive.
    pub idle_sleep_max_s: f64,
    /// Reset visibility to 0 on handler-reported failure so the message
    /// redelivers immediately. Off by default: the normal visibility
    /// timeout governs retry spacing.
    pub release_on_failure: bool,
}

impl ListenerConfig {
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_s)
    }

    pub fn visibility(&self) -> Duration {
        Duration::from_secs(self.visibility_s)
    }

    pub fn max_extend(&self) -> Duration {
        Duration::from_secs(self.max_extend_s)
    }

    pub fn idle_sleep_max(&self) -> Duration {
        Duration::from_secs_f64(self.idle_sleep_max_s.max(0.0))
    }
}

/// Explicit per-listener overrides; `None` falls through to env/default.
#[derive(Debug, Clone, Default)]
pub struct ListenerOverrides {
    pub queue_url: Option<String>,
    pub wait_time_s: Option<u64>,
    pub batch_size: Option<i32>,
    pub visibility_s: Option<u64>,
    pub max_extend_s: Option<u64>,
    pub worker_threads: Option<usize>,
    pub idle_sleep_max_s: Option<f64>,
    pub release_on_failure: Option<bool>,
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> T {
    lookup(name).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    match lookup(name) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

/// Resolve a listener config from overrides and the process environment.
pub fn resolve(overrides: ListenerOverrides) -> Result<ListenerConfig, ListenerError> {
    dotenv().ok();
    resolve_with(overrides, |name| env::var(name).ok())
}

/// Resolution against an arbitrary lookup; tests use a map instead of
/// mutating process-global state.
pub fn resolve_with(
    overrides: ListenerOverrides,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ListenerConfig, ListenerError> {
    let queue_url = overrides
        .queue_url
        .or_else(|| lookup("QUEUE_URL"))
        .ok_or_else(|| {
            ListenerError::Config("queue_url is required (or set QUEUE_URL)".to_string())
        })?;

    let cfg = ListenerConfig {
        queue_url,
        wait_time_s: overrides
            .wait_time_s
            .unwrap_or_else(|| parse_or(&lookup, "WAIT_TIME", 20)),
        batch_size: overrides
            .batch_size
            .unwrap_or_else(|| parse_or(&lookup, "BATCH_SIZE", 10)),
        visibility_s: overrides
            .visibility_s
            .unwrap_or_else(|| parse_or(&lookup, "VISIBILITY_SECS", 60)),
        max_extend_s: overrides
            .max_extend_s
            .unwrap_or_else(|| parse_or(&lookup, "MAX_EXTEND", 900)),
        worker_threads: overrides
            .worker_threads
            .unwrap_or_else(|| parse_or(&lookup, "WORKER_THREADS", 4)),
        idle_sleep_max_s: overrides
            .idle_sleep_max_s
            .unwrap_or_else(|| parse_or(&lookup, "IDLE_SLEEP_MAX", 2.0)),
        release_on_failure: overrides
            .release_on_failure
            .unwrap_or_else(|| parse_bool(&lookup, "RELEASE_ON_FAILURE", false)),
    };

    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &ListenerConfig) -> Result<(), ListenerError> {
    if !(1..=10).contains(&cfg.batch_size) {
        return Err(ListenerError::Config(format!(
            "batch_size must be in 1..=10, got {}",
            cfg.batch_size
        )));
    }
    if cfg.wait_time_s > 20 {
        return Err(ListenerError::Config(format!(
            "wait_time must be in 0..=20, got {}",
            cfg.wait_time_s
        )));
    }
    // Safety margin: the lease must outlive the long poll by enough to
    // schedule the first extension.
    if cfg.visibility_s < cfg.wait_time_s + 5 {
        return Err(ListenerError::Config(format!(
            "visibility ({}) must be at least wait_time + 5s ({})",
            cfg.visibility_s,
            cfg.wait_time_s + 5
        )));
    }
    if cfg.max_extend_s < cfg.visibility_s {
        return Err(ListenerError::Config(format!(
            "max_extend ({}) must be >= visibility ({})",
            cfg.max_extend_s, cfg.visibility_s
        )));
    }
    if cfg.worker_threads == 0 {
        return Err(ListenerError::Config(
            "worker_threads must be >= 1".to_string(),
        ));
    }
    if cfg.idle_sleep_max_s < 0.0 {
        return Err(ListenerError::Config(
            "idle_sleep_max must be >= 0".to_string(),
        ));
    }
    Ok(())
}
