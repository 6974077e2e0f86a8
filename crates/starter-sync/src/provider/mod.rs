use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::types::filter::SubscriptionFilter;
use crate::types::{EntityRecord, Felt};

pub mod local;

/// Stream of authoritative entity updates pushed by the indexer.
pub type EntityUpdateStream =
    Pin<Box<dyn Stream<Item = Result<EntityRecord, TransportError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Subscription stream failed: {0}")]
    Stream(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("Transaction execution error: {0}")]
    TransactionExecution(String),
    #[error("{0}")]
    TransactionValidation(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Acknowledgment that the ledger accepted an operation for processing.
///
/// Acceptance does not mean the operation has been applied yet, only the authoritative updates
/// that follow tell that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_hash: Felt,
}

/// The account on whose behalf operations are submitted. Signing is the submitter's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    pub address: Felt,
}

impl Account {
    pub fn new(address: Felt) -> Self {
        Self { address }
    }
}

/// Read side of the remote ledger: bulk queries and update subscriptions.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Retrieves the entities selected by `filter`.
    async fn retrieve_entities(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<EntityRecord>, TransportError>;

    /// Opens a stream of updates for the entities selected by `filter`.
    ///
    /// The returned future resolves once the remote end has acknowledged the subscription.
    async fn subscribe_entities(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<EntityUpdateStream, TransportError>;
}

/// Write side of the remote ledger.
#[async_trait]
pub trait Submitter: Send + Sync {
    /// Submits the World operation `operation` with `calldata` on behalf of `account`.
    async fn submit(
        &self,
        account: &Account,
        operation: &str,
        calldata: Vec<Felt>,
    ) -> Result<Receipt, SubmitError>;
}
