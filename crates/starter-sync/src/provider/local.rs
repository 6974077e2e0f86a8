//! An in-process ledger running the starter World rules.
//!
//! Serves both sides of the remote interface from memory, which makes it usable to run the
//! client without a network, and to drive it deterministically in tests: updates produced by
//! submissions can be held back, and failures injected.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    Account, EntityUpdateStream, Provider, Receipt, SubmitError, Submitter, TransportError,
};
use crate::systems::{INIT_GAME, MOVE, SPAWN, SPAWN_MOVES};
use crate::types::filter::SubscriptionFilter;
use crate::types::{
    Direction, EntityId, EntityRecord, Felt, GameState, GameStatus, Moves, Position, Vec2,
};
use crate::utils::felt_to_u32;

pub(crate) const LOG_TARGET: &str = "starter_sync::provider::local";

/// Offset applied to both coordinates of a player on spawn.
const SPAWN_OFFSET: u32 = 10;

struct Subscriber {
    filter: SubscriptionFilter,
    sender: UnboundedSender<Result<EntityRecord, TransportError>>,
}

impl Subscriber {
    fn send(&self, record: &EntityRecord) -> bool {
        match self.filter.apply(record.clone()) {
            Some(record) => self.sender.unbounded_send(Ok(record)).is_ok(),
            None => !self.sender.is_closed(),
        }
    }
}

#[derive(Default)]
struct LedgerState {
    entities: BTreeMap<EntityId, EntityRecord>,
    subscribers: Vec<Subscriber>,
    hold_updates: bool,
    held: Vec<EntityRecord>,
    submissions: Vec<(Felt, String, Vec<Felt>)>,
    next_transaction: u64,
    fail_next_query: Option<TransportError>,
    fail_next_subscribe: Option<TransportError>,
    fail_next_submit: Option<SubmitError>,
}

impl LedgerState {
    fn write(&mut self, record: EntityRecord) {
        match self.entities.get_mut(&record.id) {
            Some(existing) => existing.extend(record.into_components()),
            None => {
                self.entities.insert(record.id, record);
            }
        }
    }

    fn publish(&mut self, record: EntityRecord) {
        self.subscribers.retain(|s| s.send(&record));
    }

    fn execute(
        &self,
        account: &Account,
        operation: &str,
        calldata: &[Felt],
    ) -> Result<Vec<EntityRecord>, SubmitError> {
        match operation {
            SPAWN => Ok(vec![self.spawn(account.address)]),
            MOVE => {
                let direction = calldata
                    .first()
                    .and_then(felt_to_u32)
                    .and_then(|d| u8::try_from(d).ok())
                    .and_then(Direction::from_repr)
                    .ok_or_else(|| {
                        SubmitError::TransactionValidation("invalid direction".to_string())
                    })?;
                self.move_player(account.address, direction)
            }
            INIT_GAME => {
                let [game_id, max_players] = calldata else {
                    return Err(SubmitError::TransactionValidation(format!(
                        "{INIT_GAME} expects 2 arguments, got {}",
                        calldata.len()
                    )));
                };
                let (Some(game_id), Some(max_players)) =
                    (felt_to_u32(game_id), felt_to_u32(max_players))
                else {
                    return Err(SubmitError::TransactionValidation("argument out of range".into()));
                };
                self.init_game(game_id, max_players)
            }
            _ => Err(SubmitError::TransactionValidation(format!(
                "unknown entrypoint `{operation}`"
            ))),
        }
    }

    fn spawn(&self, player: Felt) -> EntityRecord {
        let current = self.entities.get(&EntityId::from_keys(&[player]));
        let remaining = current.and_then(|r| r.moves()).map_or(0, |m| m.remaining);
        let vec = current.and_then(|r| r.position()).map_or(Vec2::default(), |p| p.vec);

        EntityRecord::new(EntityId::from_keys(&[player]))
            .with(Moves {
                player,
                remaining: remaining.saturating_add(SPAWN_MOVES),
                last_direction: Direction::None,
                can_move: true,
            })
            .with(Position {
                player,
                vec: Vec2 {
                    x: vec.x.saturating_add(SPAWN_OFFSET),
                    y: vec.y.saturating_add(SPAWN_OFFSET),
                },
            })
    }

    fn move_player(
        &self,
        player: Felt,
        direction: Direction,
    ) -> Result<Vec<EntityRecord>, SubmitError> {
        let id = EntityId::from_keys(&[player]);
        let current = self.entities.get(&id);

        let Some(moves) = current.and_then(|r| r.moves()) else {
            return Err(SubmitError::TransactionExecution("player not spawned".into()));
        };
        if !moves.can_move || moves.remaining == 0 {
            return Err(SubmitError::TransactionExecution("no moves left".into()));
        }

        let mut vec = current.and_then(|r| r.position()).map_or(Vec2::default(), |p| p.vec);
        match direction {
            Direction::Left => vec.x = vec.x.saturating_sub(1),
            Direction::Right => vec.x = vec.x.saturating_add(1),
            Direction::Up => vec.y = vec.y.saturating_sub(1),
            Direction::Down => vec.y = vec.y.saturating_add(1),
            Direction::None => {}
        }

        // the indexer reports each model write on its own
        Ok(vec![
            EntityRecord::new(id).with(Moves {
                player,
                remaining: moves.remaining - 1,
                last_direction: direction,
                can_move: moves.can_move,
            }),
            EntityRecord::new(id).with(Position { player, vec }),
        ])
    }

    fn init_game(&self, game_id: u32, max_players: u32) -> Result<Vec<EntityRecord>, SubmitError> {
        let id = EntityId::from_keys(&[Felt::from(game_id)]);

        let ongoing = self
            .entities
            .get(&id)
            .and_then(|r| r.game_state())
            .is_some_and(|g| g.status != GameStatus::Finished);
        if ongoing {
            return Err(SubmitError::TransactionExecution(format!("game {game_id} already exists")));
        }

        Ok(vec![EntityRecord::new(id).with(GameState {
            game_id,
            status: GameStatus::Lobby,
            player_count: 0,
            max_players,
        })])
    }
}

/// In-memory ledger implementing both [`Provider`] and [`Submitter`].
#[derive(Default)]
pub struct LocalLedger {
    state: Mutex<LedgerState>,
}

impl std::fmt::Debug for LocalLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LocalLedger")
            .field("entities", &state.entities.len())
            .field("subscribers", &state.subscribers.len())
            .field("held", &state.held.len())
            .finish()
    }
}

impl LocalLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `record` without notifying subscribers.
    pub fn set_entity(&self, record: EntityRecord) {
        self.state.lock().write(record);
    }

    /// Writes `record` and pushes it to the subscribers it matches.
    pub fn publish(&self, record: EntityRecord) {
        let mut state = self.state.lock();
        state.write(record.clone());
        state.publish(record);
    }

    pub fn entity(&self, id: &EntityId) -> Option<EntityRecord> {
        self.state.lock().entities.get(id).cloned()
    }

    /// While set, the updates resulting from submissions are applied to the ledger but only
    /// pushed to subscribers on [`LocalLedger::flush`].
    pub fn hold_updates(&self, hold: bool) {
        self.state.lock().hold_updates = hold;
    }

    /// Pushes the held updates to subscribers. Returns how many were pushed.
    pub fn flush(&self) -> usize {
        let mut state = self.state.lock();
        let held = std::mem::take(&mut state.held);
        let count = held.len();
        for record in held {
            state.publish(record);
        }
        count
    }

    pub fn fail_next_query(&self, error: TransportError) {
        self.state.lock().fail_next_query = Some(error);
    }

    pub fn fail_next_subscribe(&self, error: TransportError) {
        self.state.lock().fail_next_subscribe = Some(error);
    }

    pub fn fail_next_submit(&self, error: SubmitError) {
        self.state.lock().fail_next_submit = Some(error);
    }

    /// Fails every open subscription stream with `error`. Returns how many streams were still
    /// listening.
    pub fn break_subscriptions(&self, error: TransportError) -> usize {
        let mut failed = 0;
        for subscriber in std::mem::take(&mut self.state.lock().subscribers) {
            match subscriber.sender.unbounded_send(Err(error.clone())) {
                Ok(()) => failed += 1,
                Err(e) => {
                    trace!(target: LOG_TARGET, error = %e, "Subscriber gone before failure.")
                }
            }
        }
        failed
    }

    /// Ends every open subscription stream.
    pub fn end_subscriptions(&self) {
        self.state.lock().subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|s| !s.sender.is_closed());
        state.subscribers.len()
    }

    /// Every accepted submission, as `(account, operation, calldata)`.
    pub fn submissions(&self) -> Vec<(Felt, String, Vec<Felt>)> {
        self.state.lock().submissions.clone()
    }
}

#[async_trait]
impl Provider for LocalLedger {
    async fn retrieve_entities(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<EntityRecord>, TransportError> {
        let mut state = self.state.lock();
        if let Some(error) = state.fail_next_query.take() {
            return Err(error);
        }

        Ok(state.entities.values().cloned().filter_map(|r| filter.apply(r)).collect())
    }

    async fn subscribe_entities(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<EntityUpdateStream, TransportError> {
        let mut state = self.state.lock();
        if let Some(error) = state.fail_next_subscribe.take() {
            return Err(error);
        }

        let (sender, receiver) = unbounded();
        state.subscribers.push(Subscriber { filter: filter.clone(), sender });
        trace!(target: LOG_TARGET, subscribers = state.subscribers.len(), "New subscriber.");

        Ok(Box::pin(receiver))
    }
}

#[async_trait]
impl Submitter for LocalLedger {
    async fn submit(
        &self,
        account: &Account,
        operation: &str,
        calldata: Vec<Felt>,
    ) -> Result<Receipt, SubmitError> {
        let mut state = self.state.lock();
        if let Some(error) = state.fail_next_submit.take() {
            return Err(error);
        }

        let updates = state.execute(account, operation, &calldata)?;

        state.submissions.push((account.address, operation.to_string(), calldata));
        state.next_transaction += 1;
        let transaction_hash = Felt::from(state.next_transaction);

        debug!(target: LOG_TARGET, operation, updates = updates.len(), "Executed transaction.");

        for record in updates {
            state.write(record.clone());
            if state.hold_updates {
                state.held.push(record);
            } else {
                state.publish(record);
            }
        }

        Ok(Receipt { transaction_hash })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures_util::StreamExt;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::types::{ComponentName, NAMESPACE};

    const PLAYER: Felt = Felt::from_hex_unchecked("0xb0b");

    #[tokio::test]
    async fn spawn_then_move() {
        let ledger = LocalLedger::new();
        let account = Account::new(PLAYER);
        let id = EntityId::from_keys(&[PLAYER]);

        ledger.submit(&account, SPAWN, vec![]).await.unwrap();
        ledger.submit(&account, MOVE, vec![Direction::Up.into()]).await.unwrap();

        let record = ledger.entity(&id).unwrap();
        assert_eq!(
            record.moves().map(|m| (m.remaining, m.last_direction)),
            Some((99, Direction::Up))
        );
        assert_eq!(record.position().map(|p| p.vec), Some(Vec2 { x: 10, y: 9 }));
    }

    #[tokio::test]
    async fn rules_are_enforced() {
        let ledger = LocalLedger::new();
        let account = Account::new(PLAYER);

        let res = ledger.submit(&account, MOVE, vec![Direction::Left.into()]).await;
        assert_matches!(res, Err(SubmitError::TransactionExecution(_)));

        let res = ledger.submit(&account, MOVE, vec![Felt::from(9_u8)]).await;
        assert_matches!(res, Err(SubmitError::TransactionValidation(_)));

        let res = ledger.submit(&account, "attack", vec![]).await;
        assert_matches!(res, Err(SubmitError::TransactionValidation(_)));

        ledger.submit(&account, INIT_GAME, vec![Felt::ONE, Felt::from(4_u8)]).await.unwrap();
        let res = ledger.submit(&account, INIT_GAME, vec![Felt::ONE, Felt::from(4_u8)]).await;
        assert_matches!(res, Err(SubmitError::TransactionExecution(_)));

        assert_eq!(ledger.submissions().len(), 1);
    }

    #[tokio::test]
    async fn subscribers_receive_matching_updates() {
        let ledger = LocalLedger::new();
        let filter = SubscriptionFilter::new(NAMESPACE).model(ComponentName::Position);
        let mut stream = ledger.subscribe_entities(&filter).await.unwrap();

        ledger.submit(&Account::new(PLAYER), SPAWN, vec![]).await.unwrap();

        let update = stream.next().await.unwrap().unwrap();
        assert_eq!(update.names().collect::<Vec<_>>(), vec![ComponentName::Position]);
    }

    #[tokio::test]
    async fn held_updates_are_pushed_on_flush() {
        let ledger = LocalLedger::new();
        let filter = SubscriptionFilter::new(NAMESPACE);
        let mut stream = ledger.subscribe_entities(&filter).await.unwrap();
        ledger.hold_updates(true);

        ledger.submit(&Account::new(PLAYER), SPAWN, vec![]).await.unwrap();
        assert!(ledger.entity(&EntityId::from_keys(&[PLAYER])).is_some());

        assert_eq!(ledger.flush(), 1);
        ledger.end_subscriptions();

        let updates = stream.collect::<Vec<_>>().await;
        assert_eq!(updates.len(), 1);
    }

    #[tokio::test]
    async fn breaking_subscriptions_skips_dropped_streams() {
        let ledger = LocalLedger::new();
        let filter = SubscriptionFilter::new(NAMESPACE);
        let mut listening = ledger.subscribe_entities(&filter).await.unwrap();
        drop(ledger.subscribe_entities(&filter).await.unwrap());

        assert_eq!(ledger.break_subscriptions(TransportError::Closed), 1);
        assert_matches!(listening.next().await, Some(Err(TransportError::Closed)));
        assert!(listening.next().await.is_none());
        assert_eq!(ledger.subscriber_count(), 0);
    }
}
