use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use starter_sync::options::SyncOptions;
use starter_sync::types::{Direction, Felt};

pub const DEFAULT_PLAYER: &str =
    "0x127fd5f1fe78a71f8bcd1fec63e3fe2f0486b6ecd5c86a0466c3a21fa5cfcec";
pub const DEFAULT_MAX_PLAYERS: u32 = 4;

/// Dojo starter client, played against an in-process World.
#[derive(Parser, Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
#[command(name = "starter-client", author, version, about, long_about = None)]
#[command(next_help_heading = "Starter client options")]
pub struct StarterArgs {
    /// Address of the player account.
    #[arg(long, value_name = "ADDRESS", default_value = DEFAULT_PLAYER)]
    pub player: Felt,

    /// Directions to move the player in after spawning, in order.
    #[arg(long = "moves", value_name = "DIRECTION", value_delimiter = ',')]
    pub moves: Vec<Direction>,

    /// Maximum number of players of the game, if it has to be created.
    #[arg(long, value_name = "COUNT", default_value_t = DEFAULT_MAX_PLAYERS)]
    pub max_players: u32,

    /// JSON file of indexer entities to seed the World with.
    #[arg(long, value_name = "PATH")]
    pub seed: Option<PathBuf>,

    /// Print the player entity as indexer JSON once done.
    #[arg(long)]
    pub json: bool,

    /// Configuration file
    #[arg(long, help = "Configuration file to setup the starter client.")]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub sync: SyncOptions,
}

impl Default for StarterArgs {
    fn default() -> Self {
        Self {
            player: Felt::from_hex_unchecked(DEFAULT_PLAYER),
            moves: Vec::new(),
            max_players: DEFAULT_MAX_PLAYERS,
            seed: None,
            json: false,
            config: None,
            sync: SyncOptions::default(),
        }
    }
}

impl StarterArgs {
    pub fn with_config_file(mut self) -> Result<Self> {
        if let Some(path) = &self.config {
            let config: Self = toml::from_str(&std::fs::read_to_string(path)?)?;

            // the CLI (self) takes precedence over the config file.
            self.merge(&config);
        }

        self.sync.validate()?;
        Ok(self)
    }

    fn merge(&mut self, other: &Self) {
        let default_values = Self::default();

        if self.player == default_values.player {
            self.player = other.player;
        }
        if self.moves.is_empty() {
            self.moves = other.moves.clone();
        }
        if self.max_players == default_values.max_players {
            self.max_players = other.max_players;
        }
        if self.seed.is_none() {
            self.seed = other.seed.clone();
        }
        self.json |= other.json;
        self.sync.merge(Some(&other.sync));
    }
}
