#![cfg_attr(not(test), warn(unused_crate_dependencies))]

//! Client-side entity synchronization for the dojo starter game.
//!
//! Mirrors the authoritative models indexed from the World into an in-memory [`EntityStore`],
//! feeding it from one-shot queries and long-lived subscriptions, while the
//! [`ActionDispatcher`] layers optimistic patches on top for actions that are still waiting for
//! the ledger to confirm them.
//!
//! [`EntityStore`]: client::storage::EntityStore
//! [`ActionDispatcher`]: client::dispatcher::ActionDispatcher

pub mod client;
pub mod counters;
pub mod options;
pub mod provider;
pub mod selectors;
pub mod systems;
pub mod types;
pub mod utils;

pub use client::error::Error;
pub use client::Client;
