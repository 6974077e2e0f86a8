use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::Error;
use super::storage::{EntityStore, UpdateSource};
use crate::provider::Provider;
use crate::types::filter::SubscriptionFilter;
use crate::types::EntityRecord;

pub(crate) const LOG_TARGET: &str = "starter_sync::client::query";

/// One-shot pull of entities into the store.
#[derive(Clone)]
pub struct QueryService {
    provider: Arc<dyn Provider>,
    store: Arc<EntityStore>,
}

impl std::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService").field("store", &self.store).finish_non_exhaustive()
    }
}

impl QueryService {
    pub fn new(provider: Arc<dyn Provider>, store: Arc<EntityStore>) -> Self {
        Self { provider, store }
    }

    /// Retrieves the entities selected by `filter` and writes them to the store as
    /// authoritative values.
    ///
    /// On failure the store is left untouched: the records are written in a single batch only
    /// once the whole response has been received.
    pub async fn fetch_entities(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<EntityRecord>, Error> {
        self.fetch_entities_with_cancel(filter, &CancellationToken::new()).await
    }

    /// Same as [`QueryService::fetch_entities`], except that once `token` is cancelled the
    /// response is discarded, even if it already arrived.
    pub async fn fetch_entities_with_cancel(
        &self,
        filter: &SubscriptionFilter,
        token: &CancellationToken,
    ) -> Result<Vec<EntityRecord>, Error> {
        filter.validate()?;

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            response = self.provider.retrieve_entities(filter) => response,
        };

        let records = response.map_err(|error| {
            warn!(target: LOG_TARGET, %error, "Retrieving entities.");
            error
        })?;

        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let records = records.into_iter().filter_map(|r| filter.apply(r)).collect::<Vec<_>>();
        debug!(target: LOG_TARGET, count = records.len(), "Retrieved entities.");

        self.store.upsert_batch(records.clone(), UpdateSource::Authoritative);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use similar_asserts::assert_eq;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::provider::local::LocalLedger;
    use crate::provider::{EntityUpdateStream, TransportError};
    use crate::types::{
        ComponentName, Direction, EntityId, Felt, Moves, Position, Vec2, NAMESPACE,
    };

    fn seeded_ledger(player: Felt) -> Arc<LocalLedger> {
        let ledger = Arc::new(LocalLedger::new());
        ledger.set_entity(
            EntityRecord::new(EntityId::from_keys(&[player]))
                .with(Moves {
                    player,
                    remaining: 10,
                    last_direction: Direction::None,
                    can_move: true,
                })
                .with(Position { player, vec: Vec2 { x: 10, y: 10 } }),
        );
        ledger
    }

    /// Holds every query response back until released.
    struct GatedProvider {
        ledger: Arc<LocalLedger>,
        requested: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Provider for GatedProvider {
        async fn retrieve_entities(
            &self,
            filter: &SubscriptionFilter,
        ) -> Result<Vec<EntityRecord>, TransportError> {
            self.requested.notify_one();
            self.release.notified().await;
            self.ledger.retrieve_entities(filter).await
        }

        async fn subscribe_entities(
            &self,
            filter: &SubscriptionFilter,
        ) -> Result<EntityUpdateStream, TransportError> {
            self.ledger.subscribe_entities(filter).await
        }
    }

    #[tokio::test]
    async fn fetched_records_are_readable_from_the_store() {
        let player = Felt::from(0x1_u64);
        let store = Arc::new(EntityStore::new());
        let query = QueryService::new(seeded_ledger(player), store.clone());

        let records = query.fetch_entities(&SubscriptionFilter::new(NAMESPACE)).await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(store.get(&records[0].id), Some(records[0].clone()));
    }

    #[tokio::test]
    async fn only_selected_components_are_written() {
        let player = Felt::from(0x1_u64);
        let store = Arc::new(EntityStore::new());
        let query = QueryService::new(seeded_ledger(player), store.clone());

        let filter = SubscriptionFilter::new(NAMESPACE).model(ComponentName::Position);
        query.fetch_entities(&filter).await.unwrap();

        let record = store.get(&EntityId::from_keys(&[player])).unwrap();
        assert!(record.position().is_some());
        assert!(record.moves().is_none());
    }

    #[tokio::test]
    async fn repeated_fetches_converge() {
        let player = Felt::from(0x1_u64);
        let store = Arc::new(EntityStore::new());
        let query = QueryService::new(seeded_ledger(player), store.clone());
        let filter = SubscriptionFilter::new(NAMESPACE);

        query.fetch_entities(&filter).await.unwrap();
        let first = store.get(&EntityId::from_keys(&[player]));
        query.fetch_entities(&filter).await.unwrap();

        assert_eq!(store.get(&EntityId::from_keys(&[player])), first);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn failure_leaves_store_unchanged() {
        let player = Felt::from(0x1_u64);
        let ledger = seeded_ledger(player);
        let store = Arc::new(EntityStore::new());
        let query = QueryService::new(ledger.clone(), store.clone());

        ledger.fail_next_query(TransportError::Request("connection reset".into()));
        let res = query.fetch_entities(&SubscriptionFilter::new(NAMESPACE)).await;

        assert_matches!(res, Err(Error::Transport(TransportError::Request(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn cancelled_fetch_does_not_write() {
        let player = Felt::from(0x1_u64);
        let store = Arc::new(EntityStore::new());
        let query = QueryService::new(seeded_ledger(player), store.clone());

        let token = CancellationToken::new();
        token.cancel();
        let filter = SubscriptionFilter::new(NAMESPACE);
        let res = query.fetch_entities_with_cancel(&filter, &token).await;

        assert_matches!(res, Err(Error::Cancelled));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn cancelling_an_in_flight_fetch_discards_the_response() {
        let player = Felt::from(0x1_u64);
        let store = Arc::new(EntityStore::new());
        let provider = Arc::new(GatedProvider {
            ledger: seeded_ledger(player),
            requested: Notify::new(),
            release: Notify::new(),
        });
        let query = QueryService::new(provider.clone(), store.clone());
        let token = CancellationToken::new();

        let fetch = {
            let query = query.clone();
            let token = token.clone();
            tokio::spawn(async move {
                query.fetch_entities_with_cancel(&SubscriptionFilter::new(NAMESPACE), &token).await
            })
        };

        provider.requested.notified().await;
        token.cancel();
        provider.release.notify_one();

        assert_matches!(fetch.await.unwrap(), Err(Error::Cancelled));
        assert!(store.is_empty());

        // a fetch that isn't cancelled does get the ledger's answer
        provider.release.notify_one();
        let records = query.fetch_entities(&SubscriptionFilter::new(NAMESPACE)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn foreign_namespace_is_rejected_before_fetching() {
        let player = Felt::from(0x1_u64);
        let ledger = seeded_ledger(player);
        let store = Arc::new(EntityStore::new());
        let query = QueryService::new(ledger.clone(), store.clone());
        ledger.fail_next_query(TransportError::Request("connection reset".into()));

        let filter = SubscriptionFilter::new("pac_royale").model(ComponentName::Moves);
        let res = query.fetch_entities(&filter).await;

        assert_matches!(res, Err(Error::InvalidFilter(_)));
        assert!(store.is_empty());

        // the injected failure is still armed: the ledger was never queried
        let res = query.fetch_entities(&SubscriptionFilter::new(NAMESPACE)).await;
        assert_matches!(res, Err(Error::Transport(_)));
    }
}
