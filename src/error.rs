//! Domain errors for exchange negotiation
use crate::exchange::{ExchangeId, RecordId, UserId};

/// Failures surfaced by the exchange service and the local draft.
///
/// Service methods return `anyhow::Result`; these values travel inside the
/// `anyhow::Error` and are recovered with [`ExchangeError::from_anyhow`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("Exchange {0} does not exist")]
    NotFound(ExchangeId),
    #[error("{user} may not {action} exchange {exchange}")]
    Forbidden {
        exchange: ExchangeId,
        user: UserId,
        action: &'static str,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(
        "Exchange {exchange} was modified concurrently (expected version {expected}, found {found})"
    )]
    Conflict {
        exchange: ExchangeId,
        expected: u64,
        found: u64,
    },
    #[error("Invalid exchange request: {0}")]
    InvalidRequest(String),
    #[error("Request carries no authenticated identity")]
    Unauthenticated,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq, Clone)]
pub enum ValidationError {
    #[error("At least one record must remain offered")]
    EmptyOffer,
    #[error("All additional requests must be resolved before finalizing")]
    UnresolvedRequests,
    #[error("Cannot pass the turn without requesting an additional record")]
    NothingRequested,
    #[error("Record {0} does not exist")]
    UnknownRecord(RecordId),
    #[error("Record {0} is not available for exchange")]
    RecordUnavailable(RecordId),
    #[error("Record {0} does not belong to the initiator")]
    NotOwnedByInitiator(RecordId),
    #[error("Record {0} belongs to the acting user")]
    OwnRecord(RecordId),
    #[error("Record {0} appears more than once in the exchange")]
    DuplicateRecord(RecordId),
    #[error("Only the initiator may add offered record {0}")]
    ReceiverCannotOffer(RecordId),
    #[error("Only the receiver may request record {0}")]
    InitiatorCannotRequest(RecordId),
    #[error("Record {0} is not part of this exchange")]
    NotInExchange(RecordId),
    #[error("Only the {0} may perform this edit")]
    WrongParty(&'static str),
    #[error("Exchange has already been completed")]
    AlreadyCompleted,
    #[error("Submit or reset the staged changes before finalizing")]
    StagedChanges,
}

impl ExchangeError {
    /// Recover the domain error carried by an `anyhow::Error`, if any.
    pub fn from_anyhow(err: &anyhow::Error) -> Option<&ExchangeError> {
        err.downcast_ref::<ExchangeError>()
    }

    pub fn forbidden(exchange: &ExchangeId, user: &UserId, action: &'static str) -> Self {
        ExchangeError::Forbidden {
            exchange: exchange.clone(),
            user: user.clone(),
            action,
        }
    }
}
