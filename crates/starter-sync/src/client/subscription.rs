use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::AtomicWaker;
use futures_util::StreamExt;
use metrics::counter;
use parking_lot::ReentrantMutex;
use tracing::{debug, trace, warn};

use super::error::Error;
use super::storage::{EntityStore, UpdateSource};
use crate::counters::{SUBSCRIPTION_EVENTS_APPLIED, SUBSCRIPTION_EVENTS_DROPPED};
use crate::provider::{EntityUpdateStream, Provider, TransportError};
use crate::types::filter::SubscriptionFilter;
use crate::types::EntityRecord;

pub(crate) const LOG_TARGET: &str = "starter_sync::client::subscription";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ChannelState {
    Idle,
    Opening,
    Streaming,
    Closed,
    Failed,
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

struct Shared {
    // Held while an update is written, so a concurrent close waits for the write to finish. It
    // is reentrant because store listeners, which run during the write, may close the channel.
    state: ReentrantMutex<Cell<ChannelState>>,
    waker: AtomicWaker,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: ReentrantMutex::new(Cell::new(ChannelState::Idle)),
            waker: AtomicWaker::new(),
        }
    }

    fn state(&self) -> ChannelState {
        self.state.lock().get()
    }

    fn transition(&self, from: &[ChannelState], to: ChannelState) -> bool {
        let state = self.state.lock();
        if from.contains(&state.get()) {
            state.set(to);
            true
        } else {
            false
        }
    }

    fn close(&self) {
        let previous = self.state.lock().replace(ChannelState::Closed);
        if previous != ChannelState::Closed {
            debug!(target: LOG_TARGET, %previous, "Closed subscription.");
        }
        self.waker.wake();
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared").field("state", &self.state()).finish()
    }
}

/// A long-lived feed of authoritative updates into the store.
///
/// A channel starts `Idle`, goes through `Opening` while the remote end acknowledges the
/// subscription, then stays `Streaming` until it is closed, the remote end ends the stream, or
/// the transport fails. There is no reconnection: once closed or failed, a new channel has to be
/// opened.
pub struct SubscriptionChannel {
    provider: Arc<dyn Provider>,
    store: Arc<EntityStore>,
    shared: Arc<Shared>,
}

impl fmt::Debug for SubscriptionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionChannel").field("state", &self.state()).finish_non_exhaustive()
    }
}

impl SubscriptionChannel {
    pub fn new(provider: Arc<dyn Provider>, store: Arc<EntityStore>) -> Self {
        Self { provider, store, shared: Arc::new(Shared::new()) }
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Returns a handle to the channel, which can close it before `open` completes.
    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle { shared: self.shared.clone() }
    }

    /// Subscribes to the updates selected by `filter`.
    ///
    /// Resolves once the remote end has acknowledged the subscription. The returned service
    /// writes the updates to the store and must be polled (usually spawned) to do so.
    ///
    /// Fails with [`Error::Cancelled`] if the channel was closed before the acknowledgment.
    pub async fn open(
        self,
        filter: SubscriptionFilter,
    ) -> Result<(SubscriptionHandle, SubscriptionService), Error> {
        filter.validate()?;

        if !self.shared.transition(&[ChannelState::Idle], ChannelState::Opening) {
            return Err(Error::Cancelled);
        }

        let stream = match self.provider.subscribe_entities(&filter).await {
            Ok(stream) => stream,
            Err(error) => {
                self.shared.transition(&[ChannelState::Opening], ChannelState::Failed);
                warn!(target: LOG_TARGET, %error, "Opening subscription.");
                return Err(error.into());
            }
        };

        if !self.shared.transition(&[ChannelState::Opening], ChannelState::Streaming) {
            return Err(Error::Cancelled);
        }

        debug!(target: LOG_TARGET, namespace = %filter.namespace, "Subscription streaming.");

        let service = SubscriptionService {
            stream,
            filter,
            store: self.store,
            shared: self.shared.clone(),
        };

        Ok((SubscriptionHandle { shared: self.shared }, service))
    }
}

/// Controls an opened [`SubscriptionChannel`].
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    shared: Arc<Shared>,
}

impl SubscriptionHandle {
    /// Closes the channel. Once this returns, no further update from the channel reaches the
    /// store. Closing an already closed channel does nothing.
    ///
    /// Safe to call from within a store listener.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }
}

/// Drains a subscription stream into the store.
///
/// Resolves with `Ok(())` when the channel is closed or the stream ends, and with
/// [`Error::Transport`] when the stream fails.
#[must_use = "SubscriptionService does nothing unless polled"]
pub struct SubscriptionService {
    stream: EntityUpdateStream,
    filter: SubscriptionFilter,
    store: Arc<EntityStore>,
    shared: Arc<Shared>,
}

impl fmt::Debug for SubscriptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionService")
            .field("filter", &self.filter)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl SubscriptionService {
    fn handle_update(&self, record: EntityRecord) {
        let state = self.shared.state.lock();

        if state.get() != ChannelState::Streaming {
            trace!(target: LOG_TARGET, entity = %record.id, "Dropping update of closed channel.");
            counter!(SUBSCRIPTION_EVENTS_DROPPED).increment(1);
            return;
        }

        let id = record.id;
        match self.filter.apply(record) {
            Some(record) => {
                trace!(target: LOG_TARGET, entity = %id, "Applying update.");
                self.store.upsert(record, UpdateSource::Authoritative);
                counter!(SUBSCRIPTION_EVENTS_APPLIED).increment(1);
            }
            None => {
                trace!(target: LOG_TARGET, entity = %id, "Update matches no selected model.");
                counter!(SUBSCRIPTION_EVENTS_DROPPED).increment(1);
            }
        }
    }

    fn handle_error(&self, error: TransportError) -> Result<(), Error> {
        let failed = self.shared.transition(
            &[ChannelState::Opening, ChannelState::Streaming],
            ChannelState::Failed,
        );

        if failed {
            warn!(target: LOG_TARGET, %error, "Subscription stream failed.");
            Err(error.into())
        } else {
            // closed in the meantime, the failure is irrelevant
            Ok(())
        }
    }
}

impl Future for SubscriptionService {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let pin = self.get_mut();
        pin.shared.waker.register(cx.waker());

        loop {
            if pin.shared.state().is_terminal() {
                return Poll::Ready(Ok(()));
            }

            match pin.stream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(record))) => pin.handle_update(record),
                Poll::Ready(Some(Err(error))) => return Poll::Ready(pin.handle_error(error)),
                Poll::Ready(None) => {
                    debug!(target: LOG_TARGET, "Subscription stream ended.");
                    pin.shared.transition(&[ChannelState::Streaming], ChannelState::Closed);
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::provider::local::LocalLedger;
    use crate::types::filter::ComparisonOperator;
    use crate::types::{
        ComponentName, Direction, EntityId, Felt, GameState, GameStatus, Moves, Position, Vec2,
        NAMESPACE,
    };

    fn moves(player: Felt, remaining: u8) -> EntityRecord {
        EntityRecord::new(EntityId::from_keys(&[player])).with(Moves {
            player,
            remaining,
            last_direction: Direction::None,
            can_move: true,
        })
    }

    async fn open(
        ledger: &Arc<LocalLedger>,
        store: &Arc<EntityStore>,
        filter: SubscriptionFilter,
    ) -> (SubscriptionHandle, SubscriptionService) {
        SubscriptionChannel::new(ledger.clone(), store.clone()).open(filter).await.unwrap()
    }

    #[tokio::test]
    async fn streams_updates_into_the_store() {
        let ledger = Arc::new(LocalLedger::new());
        let store = Arc::new(EntityStore::new());
        let player = Felt::from(0x42_u64);

        let (handle, service) = open(&ledger, &store, SubscriptionFilter::new(NAMESPACE)).await;
        assert_eq!(handle.state(), ChannelState::Streaming);

        ledger.publish(moves(player, 10));
        ledger.end_subscriptions();
        service.await.unwrap();

        let record = store.get(&EntityId::from_keys(&[player])).unwrap();
        assert_eq!(record.moves().map(|m| m.remaining), Some(10));
        assert_eq!(handle.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn updates_are_restricted_to_the_filter() {
        let ledger = Arc::new(LocalLedger::new());
        let store = Arc::new(EntityStore::new());
        let player = Felt::from(0x42_u64);
        let id = EntityId::from_keys(&[player]);

        let filter = SubscriptionFilter::new(NAMESPACE).member(
            ComponentName::Position,
            "player",
            ComparisonOperator::Is,
            player,
        );
        let (_handle, service) = open(&ledger, &store, filter).await;

        ledger.publish(
            moves(player, 10).with(Position { player, vec: Vec2 { x: 3, y: 4 } }),
        );
        ledger.publish(EntityRecord::new(EntityId::from_keys(&[Felt::ONE])).with(GameState {
            game_id: 1,
            status: GameStatus::Lobby,
            player_count: 0,
            max_players: 4,
        }));
        ledger.end_subscriptions();
        service.await.unwrap();

        let record = store.get(&id).unwrap();
        assert!(record.moves().is_none());
        assert_eq!(record.position().map(|p| p.vec), Some(Vec2 { x: 3, y: 4 }));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn closed_channel_drops_queued_updates() {
        let ledger = Arc::new(LocalLedger::new());
        let store = Arc::new(EntityStore::new());

        let (handle, service) = open(&ledger, &store, SubscriptionFilter::new(NAMESPACE)).await;

        ledger.publish(moves(Felt::ONE, 10));
        handle.close();
        handle.close();
        ledger.publish(moves(Felt::TWO, 10));

        service.await.unwrap();
        assert!(store.is_empty());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn can_be_closed_from_a_store_listener() {
        let ledger = Arc::new(LocalLedger::new());
        let store = Arc::new(EntityStore::new());

        let (handle, service) = open(&ledger, &store, SubscriptionFilter::new(NAMESPACE)).await;

        let closer = handle.clone();
        let _listener = store.subscribe_to_changes(move |_| closer.close());

        ledger.publish(moves(Felt::ONE, 10));
        ledger.publish(moves(Felt::TWO, 10));
        service.await.unwrap();

        assert!(store.get(&EntityId::from_keys(&[Felt::ONE])).is_some());
        assert!(store.get(&EntityId::from_keys(&[Felt::TWO])).is_none());
    }

    #[tokio::test]
    async fn close_wakes_an_idle_service() {
        let ledger = Arc::new(LocalLedger::new());
        let store = Arc::new(EntityStore::new());

        let (handle, service) = open(&ledger, &store, SubscriptionFilter::new(NAMESPACE)).await;
        let task = tokio::spawn(service);

        tokio::task::yield_now().await;
        handle.close();

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn transport_failure_fails_the_channel() {
        let ledger = Arc::new(LocalLedger::new());
        let store = Arc::new(EntityStore::new());

        let (handle, service) = open(&ledger, &store, SubscriptionFilter::new(NAMESPACE)).await;

        ledger.publish(moves(Felt::ONE, 10));
        ledger.break_subscriptions(TransportError::Stream("reset by peer".into()));

        let res = service.await;
        assert_matches!(res, Err(Error::Transport(TransportError::Stream(_))));
        assert_eq!(handle.state(), ChannelState::Failed);
        // what was received before the failure stays visible
        assert!(store.get(&EntityId::from_keys(&[Felt::ONE])).is_some());
    }

    #[tokio::test]
    async fn failed_open() {
        let ledger = Arc::new(LocalLedger::new());
        let store = Arc::new(EntityStore::new());
        ledger.fail_next_subscribe(TransportError::Closed);

        let channel = SubscriptionChannel::new(ledger.clone(), store);
        let handle = channel.handle();
        let res = channel.open(SubscriptionFilter::new(NAMESPACE)).await;

        assert_matches!(res, Err(Error::Transport(TransportError::Closed)));
        assert_eq!(handle.state(), ChannelState::Failed);
    }

    #[tokio::test]
    async fn closing_before_open_cancels_it() {
        let ledger = Arc::new(LocalLedger::new());
        let store = Arc::new(EntityStore::new());

        let channel = SubscriptionChannel::new(ledger.clone(), store);
        assert_eq!(channel.state(), ChannelState::Idle);
        channel.handle().close();

        let res = channel.open(SubscriptionFilter::new(NAMESPACE)).await;
        assert_matches!(res, Err(Error::Cancelled));
        assert_eq!(ledger.subscriber_count(), 0);
    }
}
