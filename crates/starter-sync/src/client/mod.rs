pub mod dispatcher;
pub mod error;
pub mod query;
pub mod storage;
pub mod subscription;

use std::sync::Arc;

use futures::channel::mpsc::Receiver;

use self::dispatcher::ActionDispatcher;
use self::error::Error;
use self::query::QueryService;
use self::storage::EntityStore;
use self::subscription::{SubscriptionChannel, SubscriptionHandle, SubscriptionService};
use crate::options::SyncOptions;
use crate::provider::{Account, Provider, Submitter};
use crate::systems::SystemCalls;
use crate::types::filter::{ComparisonOperator, SubscriptionFilter};
use crate::types::{ComponentName, EntityRecord, Felt, NAMESPACE};

/// Entry point wiring the store, its feeds, and the dispatcher around one ledger.
pub struct Client {
    provider: Arc<dyn Provider>,
    submitter: Arc<dyn Submitter>,
    store: Arc<EntityStore>,
    dispatcher: Arc<ActionDispatcher>,
    options: SyncOptions,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("store", &self.store)
            .field("dispatcher", &self.dispatcher)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(
        provider: Arc<dyn Provider>,
        submitter: Arc<dyn Submitter>,
        options: SyncOptions,
    ) -> Self {
        let store = Arc::new(EntityStore::with_changes_buffer(options.changes_buffer));
        let dispatcher = Arc::new(ActionDispatcher::with_watchdog_timeout(
            store.clone(),
            options.watchdog_timeout(),
        ));

        Self { provider, submitter, store, dispatcher, options }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// The local view of the World entities.
    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<ActionDispatcher> {
        &self.dispatcher
    }

    pub fn query(&self) -> QueryService {
        QueryService::new(self.provider.clone(), self.store.clone())
    }

    /// Retrieves the entities matching `filter` and writes them to the store.
    pub async fn entities(&self, filter: &SubscriptionFilter) -> Result<Vec<EntityRecord>, Error> {
        self.query().fetch_entities(filter).await
    }

    /// A new, idle, subscription channel feeding the store.
    pub fn subscription(&self) -> SubscriptionChannel {
        SubscriptionChannel::new(self.provider.clone(), self.store.clone())
    }

    /// Subscribes to the updates of the entities matching `filter`. The returned service must be
    /// polled for the updates to reach the store.
    pub async fn on_entity_updated(
        &self,
        filter: SubscriptionFilter,
    ) -> Result<(SubscriptionHandle, SubscriptionService), Error> {
        self.subscription().open(filter).await
    }

    /// The starter systems, issued on behalf of `account`.
    pub fn system_calls(&self, account: Account) -> SystemCalls {
        SystemCalls::new(
            self.dispatcher.clone(),
            self.submitter.clone(),
            account,
            self.options.game_id,
        )
    }

    /// Stream of stale action reports, swept at the configured interval.
    pub fn watchdog(&self) -> Receiver<Error> {
        self.dispatcher.watchdog(self.options.watchdog_interval())
    }

    /// Selects the models keyed by `player`.
    pub fn player_filter(&self, player: Felt) -> SubscriptionFilter {
        [ComponentName::Moves, ComponentName::Position, ComponentName::DirectionsAvailable]
            .into_iter()
            .fold(SubscriptionFilter::new(NAMESPACE), |filter, model| {
                filter.member(model, "player", ComparisonOperator::Is, player)
            })
    }

    /// Selects the state of the tracked game.
    pub fn game_filter(&self) -> SubscriptionFilter {
        SubscriptionFilter::new(NAMESPACE).member(
            ComponentName::GameState,
            "game_id",
            ComparisonOperator::Is,
            u64::from(self.options.game_id),
        )
    }
}
