//! Read-only views derived from the store. Nothing is cached, every call reads the current
//! merged state.

use crate::client::storage::EntityStore;
use crate::types::{
    ComponentName, Direction, EntityId, EntityRecord, Felt, GameState, GameStatus, Moves,
    Position,
};

pub fn player_entity(store: &EntityStore, player: Felt) -> Option<EntityRecord> {
    store.get(&EntityId::from_keys(&[player]))
}

pub fn player_moves(store: &EntityStore, player: Felt) -> Option<Moves> {
    store
        .get_component(&EntityId::from_keys(&[player]), ComponentName::Moves)
        .and_then(|c| c.as_moves().cloned())
}

pub fn player_position(store: &EntityStore, player: Felt) -> Option<Position> {
    store
        .get_component(&EntityId::from_keys(&[player]), ComponentName::Position)
        .and_then(|c| c.as_position().cloned())
}

/// Directions the player may take next, empty when unknown.
pub fn directions_available(store: &EntityStore, player: Felt) -> Vec<Direction> {
    store
        .get_component(&EntityId::from_keys(&[player]), ComponentName::DirectionsAvailable)
        .and_then(|c| c.as_directions_available().map(|d| d.directions.clone()))
        .unwrap_or_default()
}

/// Whether the player has moves left and is allowed to use them.
pub fn can_move(store: &EntityStore, player: Felt) -> bool {
    player_moves(store, player).is_some_and(|m| m.can_move && m.remaining > 0)
}

pub fn game_state(store: &EntityStore, game_id: u32) -> Option<GameState> {
    store
        .get_component(&EntityId::from_keys(&[Felt::from(game_id)]), ComponentName::GameState)
        .and_then(|c| c.as_game_state().cloned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyStatus {
    /// No game has been created yet.
    NoGame,
    Lobby { player_count: u32, max_players: u32 },
    Playing { player_count: u32, max_players: u32 },
    Finished,
}

impl LobbyStatus {
    /// Whether the lobby screen applies, that is the game is yet to be created or to start.
    pub fn shows_lobby(&self) -> bool {
        matches!(self, Self::NoGame | Self::Lobby { .. })
    }

    pub fn is_full(&self) -> bool {
        match self {
            Self::Lobby { player_count, max_players } => player_count >= max_players,
            _ => false,
        }
    }
}

pub fn lobby_status(store: &EntityStore, game_id: u32) -> LobbyStatus {
    match game_state(store, game_id) {
        None => LobbyStatus::NoGame,
        Some(GameState { status, player_count, max_players, .. }) => match status {
            GameStatus::Lobby => LobbyStatus::Lobby { player_count, max_players },
            GameStatus::Playing => LobbyStatus::Playing { player_count, max_players },
            GameStatus::Finished => LobbyStatus::Finished,
        },
    }
}
