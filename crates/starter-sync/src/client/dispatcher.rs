use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc::{channel, Receiver, Sender};
use futures_util::SinkExt;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::error::Error;
use super::storage::{EntityStore, ListenerHandle, Reconciliation, UpdateSource};
use crate::counters::{
    ACTIONS_CONFIRMED, ACTIONS_CONFLICTING, ACTIONS_DISPATCHED, ACTIONS_REJECTED, ACTIONS_STALE,
    PREDICTIONS_DIVERGED,
};
use crate::options::DEFAULT_WATCHDOG_TIMEOUT;
use crate::provider::{Receipt, SubmitError};
use crate::types::{ActionId, Component, ComponentName, EntityId, EntityRecord};

pub(crate) const LOG_TARGET: &str = "starter_sync::client::dispatcher";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ActionState {
    /// Accepted locally, waiting for the authoritative values.
    Submitted,
    /// Every patched component has been replaced by an authoritative value.
    Confirmed,
    /// Refused by the ledger, or rolled back by the caller.
    Rejected,
    /// Still unconfirmed after the watchdog timeout. Its optimistic values remain visible.
    Stale,
}

impl ActionState {
    /// Whether the action still holds its components.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Submitted | Self::Stale)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_in_flight()
    }

    fn can_become(&self, next: ActionState) -> bool {
        match (self, next) {
            (Self::Submitted, Self::Confirmed | Self::Rejected | Self::Stale) => true,
            (Self::Stale, Self::Confirmed | Self::Rejected) => true,
            _ => false,
        }
    }
}

/// An optimistic action and its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAction {
    pub action_id: ActionId,
    pub entity_id: EntityId,
    pub patches: Vec<Component>,
    pub submitted_at: Instant,
    pub state: ActionState,
    /// Set once the ledger accepted the operation.
    pub receipt: Option<Receipt>,
    unreconciled: BTreeSet<ComponentName>,
}

impl PendingAction {
    pub fn components(&self) -> impl Iterator<Item = ComponentName> + '_ {
        self.patches.iter().map(|c| c.name())
    }
}

/// Outcome of a dispatch accepted by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatched {
    pub action: ActionId,
    pub receipt: Receipt,
}

#[derive(Debug, Default)]
struct PendingTable {
    actions: BTreeMap<ActionId, PendingAction>,
    in_flight: HashMap<(EntityId, ComponentName), ActionId>,
    next_id: u64,
}

impl PendingTable {
    fn conflict(
        &self,
        entity: EntityId,
        components: &[ComponentName],
    ) -> Option<(ComponentName, ActionId)> {
        components
            .iter()
            .find_map(|name| self.in_flight.get(&(entity, *name)).map(|action| (*name, *action)))
    }

    fn insert(&mut self, entity: EntityId, patches: Vec<Component>) -> ActionId {
        self.next_id += 1;
        let action_id = ActionId::new(self.next_id);

        let unreconciled = patches.iter().map(|c| c.name()).collect::<BTreeSet<_>>();
        for name in &unreconciled {
            self.in_flight.insert((entity, *name), action_id);
        }

        let action = PendingAction {
            action_id,
            entity_id: entity,
            patches,
            submitted_at: Instant::now(),
            state: ActionState::Submitted,
            receipt: None,
            unreconciled,
        };
        self.actions.insert(action_id, action);

        action_id
    }

    /// Moves `action` to `next` if the lifecycle allows it. Components of an action that is
    /// resolved are released.
    fn transition(&mut self, action: ActionId, next: ActionState) -> Option<&PendingAction> {
        let pending = self.actions.get_mut(&action)?;
        if !pending.state.can_become(next) {
            return None;
        }

        pending.state = next;
        if next.is_terminal() {
            for name in pending.patches.iter().map(|c| c.name()) {
                if self.in_flight.get(&(pending.entity_id, name)) == Some(&action) {
                    self.in_flight.remove(&(pending.entity_id, name));
                }
            }
        }

        Some(pending)
    }

    fn reconcile(&mut self, reconciled: &[Reconciliation]) -> Vec<ActionId> {
        let mut confirmed = Vec::new();

        for item in reconciled {
            let Some(pending) = self.actions.get_mut(&item.action) else { continue };
            pending.unreconciled.remove(&item.component);

            if item.diverged {
                counter!(PREDICTIONS_DIVERGED).increment(1);
                debug!(
                    target: LOG_TARGET,
                    action = %item.action,
                    entity = %item.entity,
                    component = %item.component,
                    "Authoritative value differs from prediction."
                );
            }

            if pending.unreconciled.is_empty()
                && self.transition(item.action, ActionState::Confirmed).is_some()
            {
                confirmed.push(item.action);
            }
        }

        confirmed
    }
}

/// Applies actions optimistically and tracks them until the ledger confirms or refuses them.
///
/// The dispatcher is the only writer of optimistic values to the store. Every component of an
/// entity is held by at most one in-flight action at a time.
pub struct ActionDispatcher {
    store: Arc<EntityStore>,
    pending: Arc<Mutex<PendingTable>>,
    resolved: Arc<Notify>,
    watchdog_timeout: Duration,
    _reconciler: ListenerHandle,
}

impl std::fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("pending", &self.pending.lock().actions.len())
            .field("watchdog_timeout", &self.watchdog_timeout)
            .finish_non_exhaustive()
    }
}

impl ActionDispatcher {
    pub fn new(store: Arc<EntityStore>) -> Self {
        Self::with_watchdog_timeout(store, Duration::from_millis(DEFAULT_WATCHDOG_TIMEOUT))
    }

    /// Creates a dispatcher reporting actions unconfirmed after `watchdog_timeout` as stale.
    pub fn with_watchdog_timeout(store: Arc<EntityStore>, watchdog_timeout: Duration) -> Self {
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let resolved = Arc::new(Notify::new());

        let reconciler = {
            let pending = pending.clone();
            let resolved = resolved.clone();
            store.on_reconciled(move |items| {
                let confirmed = pending.lock().reconcile(items);
                if !confirmed.is_empty() {
                    for action in &confirmed {
                        info!(target: LOG_TARGET, %action, "Action confirmed.");
                    }
                    counter!(ACTIONS_CONFIRMED).increment(confirmed.len() as u64);
                    resolved.notify_waiters();
                }
            })
        };

        Self { store, pending, resolved, watchdog_timeout, _reconciler: reconciler }
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn watchdog_timeout(&self) -> Duration {
        self.watchdog_timeout
    }

    /// Applies `patches` to `entity` optimistically, then runs `operation`, the remote call that
    /// makes the ledger apply the same change.
    ///
    /// Fails with [`Error::Conflict`], without writing anything or running `operation`, if one
    /// of the patched components is held by another in-flight action. If `operation` fails, the
    /// patches are withdrawn and [`Error::RemoteRejected`] is returned.
    ///
    /// A successful return only means the ledger accepted the operation. The action stays
    /// [`ActionState::Submitted`] until authoritative values arrive for all of its components.
    ///
    /// Authoritative values can reach the store while `operation` is still running. If they
    /// confirm the action before `operation` fails, the action stays [`ActionState::Confirmed`]
    /// and the store keeps the ledger's values: [`Error::RemoteRejected`] is still returned, but
    /// there is nothing left to withdraw. Check [`ActionDispatcher::pending`] to tell the cases
    /// apart.
    pub async fn dispatch<F, Fut>(
        &self,
        entity: EntityId,
        patches: Vec<Component>,
        operation: F,
    ) -> Result<Dispatched, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Receipt, SubmitError>>,
    {
        let record = EntityRecord::from_components(entity, patches);
        let components = record.names().collect::<Vec<_>>();

        let action = {
            let mut table = self.pending.lock();
            if let Some((component, action)) = table.conflict(entity, &components) {
                counter!(ACTIONS_CONFLICTING).increment(1);
                debug!(target: LOG_TARGET, %entity, %component, %action, "Component is busy.");
                return Err(Error::Conflict { entity, component, action });
            }
            table.insert(entity, record.components().cloned().collect())
        };

        counter!(ACTIONS_DISPATCHED).increment(1);
        trace!(target: LOG_TARGET, %action, %entity, ?components, "Dispatching action.");

        self.store.upsert(record, UpdateSource::Optimistic(action));

        match operation().await {
            Ok(receipt) => {
                let confirmed = {
                    let mut table = self.pending.lock();
                    let settled = match table.actions.get_mut(&action) {
                        Some(pending) => {
                            pending.receipt = Some(receipt);
                            // nothing to wait for
                            pending.unreconciled.is_empty()
                        }
                        None => false,
                    };
                    settled && table.transition(action, ActionState::Confirmed).is_some()
                };

                if confirmed {
                    counter!(ACTIONS_CONFIRMED).increment(1);
                    self.resolved.notify_waiters();
                }

                debug!(
                    target: LOG_TARGET,
                    %action,
                    transaction_hash = format!("{:#x}", receipt.transaction_hash),
                    "Action accepted."
                );
                Ok(Dispatched { action, receipt })
            }

            Err(source) => {
                warn!(target: LOG_TARGET, %action, %entity, error = %source, "Action rejected.");
                if !self.reject(action) {
                    debug!(target: LOG_TARGET, %action, "Action already resolved.");
                }
                Err(Error::RemoteRejected { action, source })
            }
        }
    }

    /// Gives up on an in-flight action: its optimistic values are withdrawn and it becomes
    /// [`ActionState::Rejected`].
    ///
    /// Returns `false` if the action was already resolved.
    pub fn rollback(&self, action: ActionId) -> Result<bool, Error> {
        if !self.pending.lock().actions.contains_key(&action) {
            return Err(Error::UnknownAction(action));
        }

        let rolled_back = self.reject(action);
        if rolled_back {
            info!(target: LOG_TARGET, %action, "Rolled back action.");
        }
        Ok(rolled_back)
    }

    fn reject(&self, action: ActionId) -> bool {
        let released = {
            let mut table = self.pending.lock();
            table
                .transition(action, ActionState::Rejected)
                .map(|p| (p.entity_id, p.components().collect::<Vec<_>>()))
        };

        let Some((entity, components)) = released else {
            return false;
        };

        self.store.discard_overlays(action, entity, &components);
        counter!(ACTIONS_REJECTED).increment(1);
        self.resolved.notify_waiters();
        true
    }

    pub fn pending(&self, action: ActionId) -> Option<PendingAction> {
        self.pending.lock().actions.get(&action).cloned()
    }

    /// Every tracked action, oldest first.
    pub fn pending_actions(&self) -> Vec<PendingAction> {
        self.pending.lock().actions.values().cloned().collect()
    }

    /// The in-flight action holding `component` of `entity`, if any.
    pub fn holder(&self, entity: EntityId, component: ComponentName) -> Option<ActionId> {
        self.pending.lock().in_flight.get(&(entity, component)).copied()
    }

    /// Forgets resolved actions. Returns how many were dropped.
    pub fn clear_resolved(&self) -> usize {
        let mut table = self.pending.lock();
        let before = table.actions.len();
        table.actions.retain(|_, action| action.state.is_in_flight());
        before - table.actions.len()
    }

    /// Marks every submitted action older than the watchdog timeout as stale and reports it.
    ///
    /// Stale actions keep their optimistic values and can still be confirmed, rejected, or rolled
    /// back.
    pub fn sweep_stale(&self) -> Vec<Error> {
        let now = Instant::now();
        let mut table = self.pending.lock();

        let expired = table
            .actions
            .values()
            .filter(|a| a.state == ActionState::Submitted)
            .filter(|a| now.duration_since(a.submitted_at) >= self.watchdog_timeout)
            .map(|a| (a.action_id, a.entity_id, now.duration_since(a.submitted_at)))
            .collect::<Vec<_>>();

        expired
            .into_iter()
            .filter_map(|(action, entity, elapsed)| {
                table.transition(action, ActionState::Stale)?;
                counter!(ACTIONS_STALE).increment(1);
                warn!(target: LOG_TARGET, %action, %entity, ?elapsed, "Action is stale.");
                Some(Error::Stale { action, entity, elapsed })
            })
            .collect()
    }

    /// Sweeps stale actions every `period`, sending the reports to `reports`. Returns once the
    /// receiving end is dropped, or right away, closing `reports`, if `period` is zero.
    pub async fn run_watchdog(&self, period: Duration, mut reports: Sender<Error>) {
        if period.is_zero() {
            error!(target: LOG_TARGET, "Watchdog period must be positive, not sweeping.");
            return;
        }

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if reports.is_closed() {
                return;
            }

            for report in self.sweep_stale() {
                if reports.send(report).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Spawns [`ActionDispatcher::run_watchdog`] and returns the stream of its reports. The task
    /// stops when the stream is dropped.
    pub fn watchdog(self: &Arc<Self>, period: Duration) -> Receiver<Error> {
        let (sender, receiver) = channel(16);
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.run_watchdog(period, sender).await });
        receiver
    }

    /// Waits until `action` is confirmed or rejected, and returns its final state.
    pub async fn wait_resolved(
        &self,
        action: ActionId,
        timeout: Duration,
    ) -> Result<ActionState, Error> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.resolved.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let pending = self.pending(action).ok_or(Error::UnknownAction(action))?;
            if pending.state.is_terminal() {
                return Ok(pending.state);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout(pending.entity_id));
            }
        }
    }
}
