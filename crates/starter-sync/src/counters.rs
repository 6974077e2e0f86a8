use metrics::describe_counter;

pub(crate) const ACTIONS_DISPATCHED: &str = "starter_sync.actions.dispatched";
pub(crate) const ACTIONS_CONFLICTING: &str = "starter_sync.actions.conflicting";
pub(crate) const ACTIONS_CONFIRMED: &str = "starter_sync.actions.confirmed";
pub(crate) const ACTIONS_REJECTED: &str = "starter_sync.actions.rejected";
pub(crate) const ACTIONS_STALE: &str = "starter_sync.actions.stale";
pub(crate) const PREDICTIONS_DIVERGED: &str = "starter_sync.predictions.diverged";
pub(crate) const SUBSCRIPTION_EVENTS_APPLIED: &str = "starter_sync.subscription.events_applied";
pub(crate) const SUBSCRIPTION_EVENTS_DROPPED: &str = "starter_sync.subscription.events_dropped";

/// Registers the descriptions of the counters recorded by this crate with the installed
/// recorder. Without a recorder this is a no-op.
pub fn describe_counters() {
    describe_counter!(ACTIONS_DISPATCHED, "Number of optimistic actions applied to the store");
    describe_counter!(
        ACTIONS_CONFLICTING,
        "Number of actions refused because another one was in flight for the same component"
    );
    describe_counter!(ACTIONS_CONFIRMED, "Number of actions confirmed by authoritative updates");
    describe_counter!(ACTIONS_REJECTED, "Number of actions rejected and rolled back");
    describe_counter!(ACTIONS_STALE, "Number of actions that outlived the watchdog timeout");
    describe_counter!(
        PREDICTIONS_DIVERGED,
        "Number of optimistic values that differed from the authoritative value replacing them"
    );
    describe_counter!(
        SUBSCRIPTION_EVENTS_APPLIED,
        "Number of subscription updates written to the store"
    );
    describe_counter!(
        SUBSCRIPTION_EVENTS_DROPPED,
        "Number of subscription updates discarded because the channel was closed or the update \
         matched nothing"
    );
}
