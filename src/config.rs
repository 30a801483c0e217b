//! Runtime tunables for the hub and its clients.

use crate::error::ConfigError;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Configuration shared by the hub control loop and every client it serves.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Bounded size of each connection's outbound mailbox.
    pub mailbox_capacity: usize,
    /// Bounded size of the hub's command channel.
    pub command_capacity: usize,
    /// How often the outbound pump sends a keepalive ping.
    pub ping_interval: Duration,
    /// Maximum silence from the peer before the connection is considered dead.
    pub pong_wait: Duration,
    /// Deadline for a single socket write.
    pub write_wait: Duration,
    /// Announce `user_status` online/offline transitions to other users.
    pub broadcast_presence: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            command_capacity: 1024,
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            broadcast_presence: false,
        }
    }
}

impl HubConfig {
    /// Loads the configuration from `HUB_*` environment variables.
    ///
    /// Missing variables fall back to the defaults; unparsable ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            mailbox_capacity: env_or("HUB_MAILBOX_CAPACITY", defaults.mailbox_capacity)?,
            command_capacity: env_or("HUB_COMMAND_CAPACITY", defaults.command_capacity)?,
            ping_interval: Duration::from_secs(env_or(
                "HUB_PING_INTERVAL_SECS",
                defaults.ping_interval.as_secs(),
            )?),
            pong_wait: Duration::from_secs(env_or(
                "HUB_PONG_WAIT_SECS",
                defaults.pong_wait.as_secs(),
            )?),
            write_wait: Duration::from_secs(env_or(
                "HUB_WRITE_WAIT_SECS",
                defaults.write_wait.as_secs(),
            )?),
            broadcast_presence: env_or("HUB_BROADCAST_PRESENCE", defaults.broadcast_presence)?,
        };
        config.validate()?;
        debug!(?config, "Loaded hub configuration from environment");
        Ok(config)
    }

    /// Checks cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pong_wait <= self.ping_interval {
            return Err(ConfigError::KeepaliveWindow {
                ping_interval: self.ping_interval,
                pong_wait: self.pong_wait,
            });
        }
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "HUB_MAILBOX_CAPACITY",
                value: "0".to_string(),
            });
        }
        if self.command_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "HUB_COMMAND_CAPACITY",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    pub fn with_keepalive(mut self, ping_interval: Duration, pong_wait: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.pong_wait = pong_wait;
        self
    }

    pub fn with_write_wait(mut self, write_wait: Duration) -> Self {
        self.write_wait = write_wait;
        self
    }

    pub fn with_presence_broadcast(mut self, enabled: bool) -> Self {
        self.broadcast_presence = enabled;
        self
    }
}

fn env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(default),
    }
}
