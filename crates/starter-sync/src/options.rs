use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::error::Error;

pub const DEFAULT_WATCHDOG_TIMEOUT: u64 = 10_000;
pub const DEFAULT_WATCHDOG_INTERVAL: u64 = 1_000;
pub const DEFAULT_CHANGES_BUFFER: usize = 128;
pub const DEFAULT_GAME_ID: u32 = 1;

#[derive(Debug, clap::Args, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
#[command(next_help_heading = "Sync options")]
pub struct SyncOptions {
    /// Time in milliseconds an optimistic action may wait for its confirmation before it is
    /// reported as stale.
    #[arg(
        long = "sync.watchdog_timeout",
        value_name = "MILLISECONDS",
        default_value_t = DEFAULT_WATCHDOG_TIMEOUT,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Time in milliseconds an optimistic action may wait for its confirmation before \
                it is reported as stale."
    )]
    pub watchdog_timeout: u64,

    /// Interval in milliseconds between two checks for stale actions.
    #[arg(
        long = "sync.watchdog_interval",
        value_name = "MILLISECONDS",
        default_value_t = DEFAULT_WATCHDOG_INTERVAL,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub watchdog_interval: u64,

    /// Capacity of the store change notification channels.
    #[arg(long = "sync.changes_buffer", default_value_t = DEFAULT_CHANGES_BUFFER)]
    pub changes_buffer: usize,

    /// Id of the game whose lobby is tracked.
    #[arg(long = "sync.game_id", value_name = "ID", default_value_t = DEFAULT_GAME_ID)]
    pub game_id: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            changes_buffer: DEFAULT_CHANGES_BUFFER,
            game_id: DEFAULT_GAME_ID,
        }
    }
}

impl SyncOptions {
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval)
    }

    /// Checks values the CLI parser can't see, e.g. the ones read from a configuration file.
    pub fn validate(&self) -> Result<(), Error> {
        if self.watchdog_timeout == 0 {
            return Err(Error::InvalidOption("`sync.watchdog_timeout` must be positive".into()));
        }
        if self.watchdog_interval == 0 {
            return Err(Error::InvalidOption("`sync.watchdog_interval` must be positive".into()));
        }
        Ok(())
    }

    /// Fills every field still at its default value with the one from `other`.
    pub fn merge(&mut self, other: Option<&Self>) {
        if let Some(other) = other {
            let default_values = Self::default();

            if self.watchdog_timeout == default_values.watchdog_timeout {
                self.watchdog_timeout = other.watchdog_timeout;
            }
            if self.watchdog_interval == default_values.watchdog_interval {
                self.watchdog_interval = other.watchdog_interval;
            }
            if self.changes_buffer == default_values.changes_buffer {
                self.changes_buffer = other.changes_buffer;
            }
            if self.game_id == default_values.game_id {
                self.game_id = other.game_id;
            }
        }
    }
}
