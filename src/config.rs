//! Process configuration read from the environment.
//!
//! DESIGN
//! ======
//! `main` loads `.env` (if present) and then reads everything through
//! `Config::from_env`. Only `DATABASE_URL` is required; every tuning knob has
//! a default that matches the realtime protocol's expectations (3s keep-alive,
//! 10s write deadline, 256-message queues).

use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_HUB_INBOUND_CAPACITY: usize = 256;
const DEFAULT_SESSION_QUEUE_CAPACITY: usize = 256;
const DEFAULT_HUB_PING_INTERVAL_MS: u64 = 3_000;
const DEFAULT_HUB_WRITE_WAIT_MS: u64 = 10_000;
const DEFAULT_HUB_IDLE_GRACE_MS: u64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
}

/// Read and parse `key`, falling back to `default` when unset or unparsable.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Tuning for hubs and their sessions.
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Capacity of each hub's inbound message queue.
    pub inbound_capacity: usize,
    /// Capacity of each session's outbound queue. A full queue drops the session.
    pub session_queue_capacity: usize,
    /// Keep-alive ping cadence. Every tick also requests a snapshot flush.
    pub ping_interval: Duration,
    /// Deadline for any single websocket write.
    pub write_wait: Duration,
    /// How long a hub with no sessions lingers before it retires.
    pub idle_grace: Duration,
}

impl HubConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            inbound_capacity: env_parse("HUB_INBOUND_CAPACITY", DEFAULT_HUB_INBOUND_CAPACITY).max(1),
            session_queue_capacity: env_parse("SESSION_QUEUE_CAPACITY", DEFAULT_SESSION_QUEUE_CAPACITY).max(1),
            ping_interval: Duration::from_millis(env_parse("HUB_PING_INTERVAL_MS", DEFAULT_HUB_PING_INTERVAL_MS).max(1)),
            write_wait: Duration::from_millis(env_parse("HUB_WRITE_WAIT_MS", DEFAULT_HUB_WRITE_WAIT_MS)),
            idle_grace: Duration::from_millis(env_parse("HUB_IDLE_GRACE_MS", DEFAULT_HUB_IDLE_GRACE_MS)),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: DEFAULT_HUB_INBOUND_CAPACITY,
            session_queue_capacity: DEFAULT_SESSION_QUEUE_CAPACITY,
            ping_interval: Duration::from_millis(DEFAULT_HUB_PING_INTERVAL_MS),
            write_wait: Duration::from_millis(DEFAULT_HUB_WRITE_WAIT_MS),
            idle_grace: Duration::from_millis(DEFAULT_HUB_IDLE_GRACE_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub hub: HubConfig,
}

impl Config {
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when `DATABASE_URL` is unset or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;
        Ok(Self { database_url, port: env_parse("PORT", DEFAULT_PORT), hub: HubConfig::from_env() })
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
