use std::time::Duration;

use starknet_types_core::felt::FromStrError;

use crate::provider::{SubmitError, TransportError};
use crate::types::{ActionId, ComponentName, EntityId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Action {action} rejected by the ledger: {source}")]
    RemoteRejected {
        action: ActionId,
        #[source]
        source: SubmitError,
    },
    #[error("Action {action} is still in flight for {component} of entity {entity}")]
    Conflict { entity: EntityId, component: ComponentName, action: ActionId },
    #[error("Action {action} on entity {entity} is unreconciled after {elapsed:?}")]
    Stale { action: ActionId, entity: EntityId, elapsed: Duration },
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Timed out waiting for entity {0}")]
    Timeout(EntityId),
    #[error("Unknown model: {0}")]
    UnknownModel(String),
    #[error("Unknown action: {0}")]
    UnknownAction(ActionId),
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
    #[error("Invalid option: {0}")]
    InvalidOption(String),
    #[error("Parsing error: {0}")]
    Parse(#[from] ParseError),
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    FeltFromStr(#[from] FromStrError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
