//! Exchange negotiation state machine
//!
//! Transitions are pure functions over the aggregate: each one takes the latest
//! persisted [`Exchange`] plus the acting user and returns the aggregate to
//! write back, or the reason the transition is refused. Record eligibility is
//! checked against a [`RecordIndex`] the caller resolved from the catalog.
//!
//! ```text
//!  create ──▶ AwaitingReceiverReview ◀──review/switch──▶ AwaitingInitiatorReview
//!                   │
//!                   └──finalize──▶ Completed       cancel (either side) ──▶ Cancelled
//! ```
use crate::catalog::Record;
use crate::error::{ExchangeError, ValidationError};
use crate::exchange::{Exchange, ExchangeId, ExchangeState, Party, RecordId, TimeStamp, UserId};
use chrono::Utc;
use std::collections::{HashMap, HashSet};

/// Catalog records relevant to a transition, keyed by id.
pub type RecordIndex = HashMap<RecordId, Record>;

pub fn index_of(records: impl IntoIterator<Item = Record>) -> RecordIndex {
    records.into_iter().map(|r| (r.id.clone(), r)).collect()
}

/// The sets a turn-holder commits when submitting a review.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct ReviewSubmission {
    pub offered_records: Vec<RecordId>,
    // None keeps the pending requests, minus any the initiator accepted
    pub records_requested_by_receiver: Option<Vec<RecordId>>,
    pub expected_version: Option<u64>,
}

impl ReviewSubmission {
    /// Resubmit the persisted sets unchanged.
    pub fn unchanged(exchange: &Exchange) -> Self {
        Self {
            offered_records: exchange.offered_records.clone(),
            records_requested_by_receiver: Some(exchange.records_requested_by_receiver.clone()),
            expected_version: Some(exchange.version),
        }
    }
}

fn invalid(reason: impl Into<String>) -> ExchangeError {
    ExchangeError::InvalidRequest(reason.into())
}

/// Open a new exchange, awaiting the receiver's review.
pub fn open(
    id: ExchangeId,
    initiator: &UserId,
    requested_record: &RecordId,
    offered_records: &[RecordId],
    index: &RecordIndex,
    now: TimeStamp<Utc>,
) -> Result<Exchange, ExchangeError> {
    let Some(requested) = index.get(requested_record) else {
        return Err(invalid(format!(
            "requested record {requested_record} does not exist"
        )));
    };
    if requested.owner == *initiator {
        return Err(invalid("cannot request a record you own"));
    }
    if !requested.available_for_exchange {
        return Err(invalid(format!(
            "requested record {requested_record} is not available for exchange"
        )));
    }
    if offered_records.is_empty() {
        return Err(invalid("at least one record must be offered"));
    }

    let mut seen = HashSet::from([requested_record]);
    for id in offered_records {
        if !seen.insert(id) {
            return Err(invalid(format!("record {id} is listed more than once")));
        }
        let record = index
            .get(id)
            .ok_or_else(|| invalid(format!("offered record {id} does not exist")))?;
        if record.owner != *initiator {
            return Err(invalid(format!("offered record {id} is not yours")));
        }
        if !record.available_for_exchange {
            return Err(invalid(format!(
                "offered record {id} is not available for exchange"
            )));
        }
    }

    Ok(Exchange {
        id,
        initiator_user: initiator.clone(),
        receiver_user: requested.owner.clone(),
        requested_record: requested_record.clone(),
        offered_records: offered_records.to_vec(),
        records_requested_by_receiver: vec![],
        state: ExchangeState::AwaitingReceiverReview,
        version: 1,
        creation_datetime: now.clone(),
        last_modification_datetime: now,
    })
}

/// Commit the turn-holder's sets and hand the turn to the other party.
pub fn review(
    exchange: &Exchange,
    actor: &UserId,
    submission: &ReviewSubmission,
    index: &RecordIndex,
    now: TimeStamp<Utc>,
) -> Result<Exchange, ExchangeError> {
    if exchange.state.is_terminal() {
        return Err(ExchangeError::NotFound(exchange.id.clone()));
    }
    let party = authorize_turn(exchange, actor, "review")?;
    if let Some(expected) = submission.expected_version {
        check_version(exchange, expected)?;
    }

    let offered = submission.offered_records.clone();
    let requested = match &submission.records_requested_by_receiver {
        Some(requested) => requested.clone(),
        None => match party {
            Party::Receiver => exchange.records_requested_by_receiver.clone(),
            Party::Initiator => exchange
                .records_requested_by_receiver
                .iter()
                .filter(|r| !offered.contains(r))
                .cloned()
                .collect(),
        },
    };

    validate_review(exchange, party, &offered, &requested, index)?;

    let mut next = exchange.clone();
    next.offered_records = offered;
    next.records_requested_by_receiver = requested;
    Ok(advance(next, ExchangeState::awaiting(party.other()), now))
}

/// Pass the turn without touching the record sets.
pub fn switch_reviewer(
    exchange: &Exchange,
    actor: &UserId,
    now: TimeStamp<Utc>,
) -> Result<Exchange, ExchangeError> {
    if exchange.state.is_terminal() {
        return Err(ExchangeError::NotFound(exchange.id.clone()));
    }
    let party = authorize_turn(exchange, actor, "switch the reviewer of")?;

    match party {
        Party::Initiator if !exchange.records_requested_by_receiver.is_empty() => {
            return Err(ValidationError::UnresolvedRequests.into());
        }
        Party::Receiver if exchange.records_requested_by_receiver.is_empty() => {
            return Err(ValidationError::NothingRequested.into());
        }
        _ => {}
    }

    Ok(advance(
        exchange.clone(),
        ExchangeState::awaiting(party.other()),
        now,
    ))
}

/// Seal the exchange. Only the receiver, holding the turn, may finalize.
pub fn finalize(
    exchange: &Exchange,
    actor: &UserId,
    now: TimeStamp<Utc>,
) -> Result<Exchange, ExchangeError> {
    if exchange.is_completed() {
        return Err(ValidationError::AlreadyCompleted.into());
    }
    if exchange.state.is_terminal() {
        return Err(ExchangeError::NotFound(exchange.id.clone()));
    }
    if exchange.party_of(actor) != Some(Party::Receiver) {
        return Err(ExchangeError::forbidden(&exchange.id, actor, "finalize"));
    }
    authorize_turn(exchange, actor, "finalize")?;

    if !exchange.records_requested_by_receiver.is_empty() {
        return Err(ValidationError::UnresolvedRequests.into());
    }
    if exchange.offered_records.is_empty() {
        return Err(ValidationError::EmptyOffer.into());
    }

    let completed_at = now.clone();
    Ok(advance(
        exchange.clone(),
        ExchangeState::Completed { completed_at },
        now,
    ))
}

/// Either party may cancel an open exchange regardless of the turn.
pub fn cancel(
    exchange: &Exchange,
    actor: &UserId,
    now: TimeStamp<Utc>,
) -> Result<Exchange, ExchangeError> {
    if exchange.is_completed() {
        return Err(ValidationError::AlreadyCompleted.into());
    }
    if exchange.state.is_terminal() {
        return Err(ExchangeError::NotFound(exchange.id.clone()));
    }
    if exchange.party_of(actor).is_none() {
        return Err(ExchangeError::forbidden(&exchange.id, actor, "cancel"));
    }

    let cancelled_at = now.clone();
    Ok(advance(
        exchange.clone(),
        ExchangeState::Cancelled { cancelled_at },
        now,
    ))
}

/// Owner changes a completed exchange implies: the requested record goes to
/// the initiator, every offered record to the receiver.
pub fn ownership_transfers(exchange: &Exchange) -> Vec<(RecordId, UserId)> {
    std::iter::once((
        exchange.requested_record.clone(),
        exchange.initiator_user.clone(),
    ))
    .chain(
        exchange
            .offered_records
            .iter()
            .map(|r| (r.clone(), exchange.receiver_user.clone())),
    )
    .collect()
}

pub fn check_version(exchange: &Exchange, expected: u64) -> Result<(), ExchangeError> {
    if expected != exchange.version {
        return Err(ExchangeError::Conflict {
            exchange: exchange.id.clone(),
            expected,
            found: exchange.version,
        });
    }
    Ok(())
}

fn authorize_turn(
    exchange: &Exchange,
    actor: &UserId,
    action: &'static str,
) -> Result<Party, ExchangeError> {
    let party = exchange
        .party_of(actor)
        .ok_or_else(|| ExchangeError::forbidden(&exchange.id, actor, action))?;
    if exchange.turn() != Some(party) {
        return Err(ExchangeError::forbidden(&exchange.id, actor, action));
    }
    Ok(party)
}

fn advance(mut exchange: Exchange, state: ExchangeState, now: TimeStamp<Utc>) -> Exchange {
    exchange.state = state;
    exchange.version += 1;
    exchange.last_modification_datetime = now;
    exchange
}

fn validate_review(
    exchange: &Exchange,
    party: Party,
    offered: &[RecordId],
    requested: &[RecordId],
    index: &RecordIndex,
) -> Result<(), ValidationError> {
    if offered.is_empty() {
        return Err(ValidationError::EmptyOffer);
    }

    let mut seen = HashSet::from([&exchange.requested_record]);
    for id in offered.iter().chain(requested) {
        if !seen.insert(id) {
            return Err(ValidationError::DuplicateRecord(id.clone()));
        }
    }

    match party {
        // the receiver may drop offered records and ask for more, never offer
        Party::Receiver => {
            for id in offered {
                if !exchange.offered_records.contains(id) {
                    return Err(ValidationError::ReceiverCannotOffer(id.clone()));
                }
            }
            for id in requested {
                if !exchange.records_requested_by_receiver.contains(id) {
                    check_entering(exchange, party, id, index)?;
                }
            }
        }
        // the initiator may offer more and resolve requests, never add them
        Party::Initiator => {
            for id in requested {
                if !exchange.records_requested_by_receiver.contains(id) {
                    return Err(ValidationError::InitiatorCannotRequest(id.clone()));
                }
            }
            for id in offered {
                if !exchange.offered_records.contains(id) {
                    check_entering(exchange, party, id, index)?;
                }
            }
        }
    }
    Ok(())
}

fn check_entering(
    exchange: &Exchange,
    actor: Party,
    id: &RecordId,
    index: &RecordIndex,
) -> Result<(), ValidationError> {
    let record = index
        .get(id)
        .ok_or_else(|| ValidationError::UnknownRecord(id.clone()))?;
    check_eligible(exchange, actor, record)
}

/// Records entering either set must be owned by the initiator, open for
/// exchange, and never belong to the receiver asking for them.
pub(crate) fn check_eligible(
    exchange: &Exchange,
    actor: Party,
    record: &Record,
) -> Result<(), ValidationError> {
    if actor == Party::Receiver && record.owner == exchange.receiver_user {
        return Err(ValidationError::OwnRecord(record.id.clone()));
    }
    if record.owner != exchange.initiator_user {
        return Err(ValidationError::NotOwnedByInitiator(record.id.clone()));
    }
    if !record.available_for_exchange {
        return Err(ValidationError::RecordUnavailable(record.id.clone()));
    }
    Ok(())
}
