//! The World systems of the starter game, issued as optimistic actions.

use std::sync::Arc;

use tracing::debug;

use crate::client::dispatcher::{ActionDispatcher, Dispatched};
use crate::client::error::Error;
use crate::provider::{Account, Submitter};
use crate::types::{
    Component, Direction, EntityId, EntityRecord, Felt, GameState, GameStatus, Moves, Position,
};

pub(crate) const LOG_TARGET: &str = "starter_sync::systems";

pub const SPAWN: &str = "spawn";
pub const MOVE: &str = "move";
pub const INIT_GAME: &str = "init_game";

/// Moves granted by a spawn.
pub const SPAWN_MOVES: u8 = 100;

/// Predicted `Moves` after a spawn.
pub fn predict_spawn(player: Felt, current: Option<&Moves>) -> Moves {
    let remaining = current.map_or(0, |m| m.remaining).saturating_add(SPAWN_MOVES);
    Moves { player, remaining, last_direction: Direction::None, can_move: true }
}

/// Predicted components after moving `player` in `direction`.
///
/// Only known components are predicted: without a `Moves` or a `Position` in `current`, the
/// corresponding prediction is skipped.
pub fn predict_move(current: &EntityRecord, direction: Direction) -> Vec<Component> {
    let mut patches = Vec::new();

    if let Some(moves) = current.moves() {
        patches.push(
            Moves {
                remaining: moves.remaining.saturating_sub(1),
                last_direction: direction,
                ..moves.clone()
            }
            .into(),
        );
    }

    if let Some(position) = current.position() {
        let mut vec = position.vec;
        match direction {
            Direction::Left => vec.x = vec.x.saturating_sub(1),
            Direction::Right => vec.x = vec.x.saturating_add(1),
            Direction::Up => vec.y = vec.y.saturating_sub(1),
            Direction::Down => vec.y = vec.y.saturating_add(1),
            Direction::None => {}
        }
        patches.push(Position { player: position.player, vec }.into());
    }

    patches
}

/// Issues the starter systems on behalf of one account.
#[derive(Clone)]
pub struct SystemCalls {
    dispatcher: Arc<ActionDispatcher>,
    submitter: Arc<dyn Submitter>,
    account: Account,
    game_id: u32,
}

impl std::fmt::Debug for SystemCalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemCalls")
            .field("account", &self.account)
            .field("game_id", &self.game_id)
            .finish_non_exhaustive()
    }
}

impl SystemCalls {
    pub fn new(
        dispatcher: Arc<ActionDispatcher>,
        submitter: Arc<dyn Submitter>,
        account: Account,
        game_id: u32,
    ) -> Self {
        Self { dispatcher, submitter, account, game_id }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    /// The entity holding the account's `Moves` and `Position`.
    pub fn player_entity(&self) -> EntityId {
        EntityId::from_keys(&[self.account.address])
    }

    /// The entity holding the `GameState` of the tracked game.
    pub fn game_entity(&self) -> EntityId {
        EntityId::from_keys(&[Felt::from(self.game_id)])
    }

    /// Spawns the player, granting it [`SPAWN_MOVES`] more moves.
    pub async fn spawn(&self) -> Result<Dispatched, Error> {
        let entity = self.player_entity();
        let current = self.dispatcher.store().get(&entity);
        let moves = predict_spawn(self.account.address, current.as_ref().and_then(|r| r.moves()));

        debug!(target: LOG_TARGET, %entity, remaining = moves.remaining, "Spawning.");
        self.submit(entity, vec![moves.into()], SPAWN, vec![]).await
    }

    pub async fn move_player(&self, direction: Direction) -> Result<Dispatched, Error> {
        let entity = self.player_entity();
        let patches = self
            .dispatcher
            .store()
            .get(&entity)
            .map(|record| predict_move(&record, direction))
            .unwrap_or_default();

        debug!(target: LOG_TARGET, %entity, %direction, "Moving.");
        self.submit(entity, patches, MOVE, vec![direction.into()]).await
    }

    /// Creates the tracked game, waiting in the lobby for up to `max_players` players.
    pub async fn init_game(&self, max_players: u32) -> Result<Dispatched, Error> {
        let entity = self.game_entity();
        let state = GameState {
            game_id: self.game_id,
            status: GameStatus::Lobby,
            player_count: 0,
            max_players,
        };

        debug!(target: LOG_TARGET, %entity, max_players, "Initializing game.");
        let calldata = vec![Felt::from(self.game_id), Felt::from(max_players)];
        self.submit(entity, vec![state.into()], INIT_GAME, calldata).await
    }

    async fn submit(
        &self,
        entity: EntityId,
        patches: Vec<Component>,
        operation: &str,
        calldata: Vec<Felt>,
    ) -> Result<Dispatched, Error> {
        let submitter = self.submitter.clone();
        let account = self.account;
        self.dispatcher
            .dispatch(entity, patches, move || async move {
                submitter.submit(&account, operation, calldata).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::client::storage::{EntityStore, UpdateSource};
    use crate::provider::local::LocalLedger;
    use crate::provider::SubmitError;
    use crate::types::Vec2;

    const PLAYER: Felt = Felt::from_hex_unchecked("0x7e1");

    fn record(remaining: u8, x: u32, y: u32) -> EntityRecord {
        EntityRecord::new(EntityId::from_keys(&[PLAYER]))
            .with(Moves {
                player: PLAYER,
                remaining,
                last_direction: Direction::None,
                can_move: true,
            })
            .with(Position { player: PLAYER, vec: Vec2 { x, y } })
    }

    fn setup() -> (Arc<EntityStore>, Arc<LocalLedger>, SystemCalls) {
        let store = Arc::new(EntityStore::new());
        let ledger = Arc::new(LocalLedger::new());
        let dispatcher = Arc::new(ActionDispatcher::new(store.clone()));
        let calls = SystemCalls::new(dispatcher, ledger.clone(), Account::new(PLAYER), 1);
        (store, ledger, calls)
    }

    #[test]
    fn spawn_adds_moves() {
        assert_eq!(predict_spawn(PLAYER, None).remaining, 100);

        let current = record(10, 0, 0);
        let predicted = predict_spawn(PLAYER, current.moves());
        assert_eq!(predicted.remaining, 110);
        assert!(predicted.can_move);

        let current = record(200, 0, 0);
        assert_eq!(predict_spawn(PLAYER, current.moves()).remaining, u8::MAX);
    }

    #[test]
    fn move_shifts_position_and_spends_a_move() {
        let current = record(10, 5, 5);

        let cases = [
            (Direction::Left, Vec2 { x: 4, y: 5 }),
            (Direction::Right, Vec2 { x: 6, y: 5 }),
            (Direction::Up, Vec2 { x: 5, y: 4 }),
            (Direction::Down, Vec2 { x: 5, y: 6 }),
        ];

        for (direction, expected) in cases {
            let predicted = EntityRecord::from_components(
                current.id,
                predict_move(&current, direction),
            );
            assert_eq!(predicted.position().map(|p| p.vec), Some(expected));
            assert_eq!(
                predicted.moves().map(|m| (m.remaining, m.last_direction)),
                Some((9, direction))
            );
        }
    }

    #[test]
    fn move_saturates_at_the_border() {
        let current = record(0, 0, 0);
        let predicted = EntityRecord::from_components(
            current.id,
            predict_move(&current, Direction::Left),
        );

        assert_eq!(predicted.position().map(|p| p.vec), Some(Vec2 { x: 0, y: 0 }));
        assert_eq!(predicted.moves().map(|m| m.remaining), Some(0));
    }

    #[test]
    fn move_predicts_only_known_components() {
        let current = EntityRecord::new(EntityId::from_keys(&[PLAYER]))
            .with(Position { player: PLAYER, vec: Vec2 { x: 1, y: 1 } });

        let predicted = predict_move(&current, Direction::Down);
        assert_eq!(predicted.len(), 1);
        assert!(predicted[0].as_position().is_some());
    }

    #[tokio::test]
    async fn spawn_is_visible_before_confirmation() {
        let (store, ledger, calls) = setup();
        ledger.hold_updates(true);

        let dispatched = calls.spawn().await.unwrap();
        let record = store.get(&calls.player_entity()).unwrap();
        assert_eq!(record.moves().map(|m| m.remaining), Some(100));
        assert_eq!(ledger.submissions(), vec![(PLAYER, SPAWN.to_string(), vec![])]);
        assert!(dispatched.receipt.transaction_hash != Felt::ZERO);
    }

    #[tokio::test]
    async fn rejected_move_restores_the_player() {
        let (store, ledger, calls) = setup();
        store.upsert(record(10, 5, 5), UpdateSource::Authoritative);
        ledger.fail_next_submit(SubmitError::TransactionExecution("no moves left".into()));

        let res = calls.move_player(Direction::Right).await;

        assert_matches!(res, Err(Error::RemoteRejected { .. }));
        assert_eq!(store.get(&calls.player_entity()), Some(record(10, 5, 5)));
    }

    #[tokio::test]
    async fn init_game_targets_the_game_entity() {
        let (store, ledger, calls) = setup();
        ledger.hold_updates(true);

        calls.init_game(4).await.unwrap();

        let state = store.get(&calls.game_entity()).and_then(|r| r.game_state().cloned());
        let expected =
            GameState { game_id: 1, status: GameStatus::Lobby, player_count: 0, max_players: 4 };
        assert_eq!(state, Some(expected));
        assert_eq!(
            ledger.submissions(),
            vec![(PLAYER, INIT_GAME.to_string(), vec![Felt::ONE, Felt::from(4_u32)])]
        );
    }
}
