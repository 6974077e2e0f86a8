use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::channel::mpsc::{channel, Receiver, Sender};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::error::Error;
use crate::options::DEFAULT_CHANGES_BUFFER;
use crate::types::{ActionId, Component, ComponentName, EntityId, EntityRecord};

pub(crate) const LOG_TARGET: &str = "starter_sync::client::storage";

/// Where a write to the store comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Confirmed by the ledger, through a query or a subscription.
    Authoritative,
    /// Predicted by a locally dispatched action, pending confirmation.
    Optimistic(ActionId),
}

/// Emitted after a write changed what readers of the store observe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreChange {
    /// Entities whose merged view changed, in the order they were written.
    pub entities: Vec<EntityId>,
}

/// An optimistic value replaced by an authoritative one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub action: ActionId,
    pub entity: EntityId,
    pub component: ComponentName,
    /// Whether the authoritative value differs from the predicted one.
    pub diverged: bool,
}

#[derive(Debug, Default)]
struct Slot {
    authoritative: Option<Component>,
    optimistic: Option<Overlay>,
}

#[derive(Debug)]
struct Overlay {
    action: ActionId,
    value: Component,
}

impl Slot {
    fn visible(&self) -> Option<&Component> {
        self.optimistic.as_ref().map(|o| &o.value).or(self.authoritative.as_ref())
    }

    fn is_empty(&self) -> bool {
        self.authoritative.is_none() && self.optimistic.is_none()
    }
}

type ChangeCallback = Arc<dyn Fn(&StoreChange) + Send + Sync>;
type ReconcileCallback = Arc<dyn Fn(&[Reconciliation]) + Send + Sync>;

#[derive(Clone)]
enum Listener {
    Change(ChangeCallback),
    Reconcile(ReconcileCallback),
}

/// An in-memory store of the entities known to the client.
///
/// Every component slot holds the last authoritative value and, on top of it, the optimistic
/// value of at most one in-flight action. Reads return the merged view. Writes to one or more
/// records are applied under a single write lock, so readers never see half of an upsert.
pub struct EntityStore {
    entities: RwLock<HashMap<EntityId, HashMap<ComponentName, Slot>>>,
    listeners: Mutex<HashMap<u64, Listener>>,
    senders: Mutex<Vec<Sender<StoreChange>>>,
    next_listener_id: AtomicU64,
    changes_buffer: usize,
}

impl fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("entities", &self.entities.read().len())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        Self::with_changes_buffer(DEFAULT_CHANGES_BUFFER)
    }

    /// Creates a store whose [`EntityStore::changes`] channels hold up to `changes_buffer`
    /// notifications.
    pub fn with_changes_buffer(changes_buffer: usize) -> Self {
        Self {
            entities: Default::default(),
            listeners: Default::default(),
            senders: Default::default(),
            next_listener_id: AtomicU64::new(0),
            changes_buffer,
        }
    }

    /// Merges `record` into the store.
    ///
    /// Components absent from `record` are left untouched, present ones replace the previous
    /// value. An authoritative value discards the optimistic overlay of the same component.
    ///
    /// Returns whether the merged view changed.
    pub fn upsert(&self, record: EntityRecord, source: UpdateSource) -> bool {
        self.upsert_batch(std::iter::once(record), source)
    }

    /// Merges several records at once. Listeners are notified at most once for the whole batch.
    pub fn upsert_batch(
        &self,
        records: impl IntoIterator<Item = EntityRecord>,
        source: UpdateSource,
    ) -> bool {
        let (change, reconciled) = {
            let mut entities = self.entities.write();
            let mut change = StoreChange::default();
            let mut reconciled = Vec::new();

            for record in records {
                if record.is_empty() {
                    continue;
                }

                let id = record.id;
                let slots = entities.entry(id).or_default();
                let mut touched = false;

                for component in record.into_components() {
                    let name = component.name();
                    let slot = slots.entry(name).or_default();
                    let before = slot.visible().cloned();

                    match source {
                        UpdateSource::Authoritative => {
                            if let Some(overlay) = slot.optimistic.take() {
                                reconciled.push(Reconciliation {
                                    action: overlay.action,
                                    entity: id,
                                    component: name,
                                    diverged: overlay.value != component,
                                });
                            }
                            slot.authoritative = Some(component);
                        }
                        UpdateSource::Optimistic(action) => {
                            slot.optimistic = Some(Overlay { action, value: component });
                        }
                    }

                    touched |= slot.visible() != before.as_ref();
                }

                if touched && !change.entities.contains(&id) {
                    change.entities.push(id);
                }
            }

            (change, reconciled)
        };

        trace!(
            target: LOG_TARGET,
            ?source,
            changed = change.entities.len(),
            reconciled = reconciled.len(),
            "Upserted entities."
        );

        self.notify(&change, &reconciled);
        !change.entities.is_empty()
    }

    /// Drops the optimistic values `action` placed on `components` of `entity`, which brings
    /// back the last authoritative values.
    pub(crate) fn discard_overlays(
        &self,
        action: ActionId,
        entity: EntityId,
        components: &[ComponentName],
    ) -> bool {
        let change = {
            let mut entities = self.entities.write();
            let Some(slots) = entities.get_mut(&entity) else {
                return false;
            };

            let mut touched = false;
            for name in components {
                let Some(slot) = slots.get_mut(name) else { continue };
                if slot.optimistic.as_ref().is_some_and(|o| o.action == action) {
                    let before = slot.visible().cloned();
                    slot.optimistic = None;
                    touched |= slot.visible() != before.as_ref();
                }
                if slot.is_empty() {
                    slots.remove(name);
                }
            }

            if slots.is_empty() {
                entities.remove(&entity);
            }

            StoreChange { entities: if touched { vec![entity] } else { vec![] } }
        };

        debug!(target: LOG_TARGET, %action, %entity, "Discarded optimistic values.");

        self.notify(&change, &[]);
        !change.entities.is_empty()
    }

    /// Returns the merged view of an entity.
    pub fn get(&self, id: &EntityId) -> Option<EntityRecord> {
        let entities = self.entities.read();
        let slots = entities.get(id)?;
        let components = slots.values().filter_map(|s| s.visible().cloned());
        Some(EntityRecord::from_components(*id, components))
    }

    /// Returns the merged value of a single component.
    pub fn get_component(&self, id: &EntityId, name: ComponentName) -> Option<Component> {
        self.entities.read().get(id)?.get(&name)?.visible().cloned()
    }

    /// Returns an entity as last confirmed by the ledger, ignoring optimistic values.
    pub fn authoritative(&self, id: &EntityId) -> Option<EntityRecord> {
        let entities = self.entities.read();
        let slots = entities.get(id)?;
        let record = EntityRecord::from_components(
            *id,
            slots.values().filter_map(|s| s.authoritative.clone()),
        );
        if record.is_empty() { None } else { Some(record) }
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    /// Calls `callback` after every write that changes the merged view.
    ///
    /// The callback runs once the write is fully applied and may read from the store. The
    /// subscription ends when the returned handle is unsubscribed or dropped.
    pub fn subscribe_to_changes<F>(self: &Arc<Self>, callback: F) -> ListenerHandle
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        self.add_listener(Listener::Change(Arc::new(callback)))
    }

    /// Calls `callback` whenever authoritative values replace optimistic ones, whether or not
    /// the merged view changed.
    pub(crate) fn on_reconciled<F>(self: &Arc<Self>, callback: F) -> ListenerHandle
    where
        F: Fn(&[Reconciliation]) + Send + Sync + 'static,
    {
        self.add_listener(Listener::Reconcile(Arc::new(callback)))
    }

    /// Channel flavour of [`EntityStore::subscribe_to_changes`]. Notifications are dropped while
    /// the channel is full, and the sender goes away with the receiver.
    pub fn changes(&self) -> Receiver<StoreChange> {
        let (sender, receiver) = channel(self.changes_buffer);
        self.senders.lock().push(sender);
        receiver
    }

    /// Waits until the merged view of `id` satisfies `predicate`.
    pub async fn wait_for<F>(
        &self,
        id: EntityId,
        predicate: F,
        timeout: Duration,
    ) -> Result<EntityRecord, Error>
    where
        F: Fn(&EntityRecord) -> bool,
    {
        // subscribe first so a write landing between the check and the wait isn't missed
        let mut changes = self.changes();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(record) = self.get(&id).filter(|r| predicate(r)) {
                return Ok(record);
            }

            match tokio::time::timeout_at(deadline, changes.next()).await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return Err(Error::Timeout(id)),
            }
        }
    }

    fn add_listener(self: &Arc<Self>, listener: Listener) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, listener);
        ListenerHandle { store: Arc::downgrade(self), id }
    }

    fn remove_listener(&self, id: u64) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    fn notify(&self, change: &StoreChange, reconciled: &[Reconciliation]) {
        if change.entities.is_empty() && reconciled.is_empty() {
            return;
        }

        // callbacks may subscribe or unsubscribe, don't hold the lock while calling them
        let mut listeners =
            self.listeners.lock().iter().map(|(id, l)| (*id, l.clone())).collect::<Vec<_>>();
        listeners.sort_by_key(|(id, _)| *id);

        if !reconciled.is_empty() {
            for (_, listener) in &listeners {
                if let Listener::Reconcile(callback) = listener {
                    callback(reconciled);
                }
            }
        }

        if change.entities.is_empty() {
            return;
        }

        for (_, listener) in &listeners {
            if let Listener::Change(callback) = listener {
                callback(change);
            }
        }

        self.senders.lock().retain_mut(|sender| match sender.try_send(change.clone()) {
            Ok(()) => true,
            Err(e) => !e.is_disconnected(),
        });
    }
}

/// Keeps a store listener registered. Dropping it unsubscribes.
#[must_use = "the listener is removed when the handle is dropped"]
#[derive(Debug)]
pub struct ListenerHandle {
    store: Weak<EntityStore>,
    id: u64,
}

impl ListenerHandle {
    /// Removes the listener. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(store) = self.store.upgrade() {
            store.remove_listener(self.id);
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
