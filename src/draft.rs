//! Local draft of one exchange
//!
//! A draft stages a party's edits against the last fetched snapshot. Nothing
//! here touches the server: [`ExchangeDraft::submission`] is the only thing
//! that crosses the boundary, and the server re-validates everything it sends.
use crate::catalog::Record;
use crate::error::{ExchangeError, ValidationError};
use crate::exchange::{Exchange, ExchangeId, Party, RecordId, UserId};
use crate::machine::{self, ReviewSubmission};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDraft {
    base: Exchange,
    viewer: UserId,
    party: Party,
    offered_records: Vec<RecordId>,
    records_requested_by_receiver: Vec<RecordId>,
}

/// Staged changes relative to the snapshot a draft was started from.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DraftDiff {
    pub offered_added: Vec<RecordId>,
    pub offered_removed: Vec<RecordId>,
    pub requested_added: Vec<RecordId>,
    pub requested_removed: Vec<RecordId>,
}

impl DraftDiff {
    pub fn is_empty(&self) -> bool {
        self.offered_added.is_empty()
            && self.offered_removed.is_empty()
            && self.requested_added.is_empty()
            && self.requested_removed.is_empty()
    }
}

impl ExchangeDraft {
    /// Start a draft for `viewer`, who must be a party to the snapshot.
    pub fn from_snapshot(snapshot: &Exchange, viewer: &UserId) -> Result<Self, ExchangeError> {
        let party = snapshot
            .party_of(viewer)
            .ok_or_else(|| ExchangeError::forbidden(snapshot.id(), viewer, "edit"))?;
        Ok(Self {
            base: snapshot.clone(),
            viewer: viewer.clone(),
            party,
            offered_records: snapshot.offered_records().to_vec(),
            records_requested_by_receiver: snapshot.records_requested_by_receiver().to_vec(),
        })
    }

    pub fn exchange_id(&self) -> &ExchangeId {
        self.base.id()
    }
    pub fn base_version(&self) -> u64 {
        self.base.version()
    }
    pub fn party(&self) -> Party {
        self.party
    }
    pub fn offered_records(&self) -> &[RecordId] {
        &self.offered_records
    }
    pub fn records_requested_by_receiver(&self) -> &[RecordId] {
        &self.records_requested_by_receiver
    }

    // edits need an open exchange, the right side, and the turn
    fn guard(&self, required: Option<Party>) -> Result<(), ExchangeError> {
        if self.base.is_completed() {
            return Err(ValidationError::AlreadyCompleted.into());
        }
        if let Some(required) = required {
            if required != self.party {
                return Err(ValidationError::WrongParty(required.label()).into());
            }
        }
        if self.base.turn() != Some(self.party) {
            return Err(ExchangeError::forbidden(
                self.base.id(),
                &self.viewer,
                "edit",
            ));
        }
        Ok(())
    }

    fn ensure_unused(&self, id: &RecordId) -> Result<(), ValidationError> {
        let used = *id == *self.base.requested_record()
            || self.offered_records.contains(id)
            || self.records_requested_by_receiver.contains(id);
        if used {
            return Err(ValidationError::DuplicateRecord(id.clone()));
        }
        Ok(())
    }

    /// Initiator: put one more of their records on the table.
    pub fn add_offered(&mut self, record: &Record) -> Result<(), ExchangeError> {
        self.guard(Some(Party::Initiator))?;
        self.ensure_unused(&record.id)?;
        machine::check_eligible(&self.base, self.party, record)?;
        self.offered_records.push(record.id.clone());
        Ok(())
    }

    /// Either party may drop an offered record, but never the last one.
    pub fn remove_offered(&mut self, id: &RecordId) -> Result<(), ExchangeError> {
        if self.offered_records.len() == 1 && self.offered_records.contains(id) {
            return Err(ValidationError::EmptyOffer.into());
        }
        self.guard(None)?;
        let Some(position) = self.offered_records.iter().position(|r| r == id) else {
            return Err(ValidationError::NotInExchange(id.clone()).into());
        };
        self.offered_records.remove(position);
        Ok(())
    }

    /// Receiver: ask for another of the initiator's records.
    pub fn request_record(&mut self, record: &Record) -> Result<(), ExchangeError> {
        self.guard(Some(Party::Receiver))?;
        self.ensure_unused(&record.id)?;
        machine::check_eligible(&self.base, self.party, record)?;
        self.records_requested_by_receiver.push(record.id.clone());
        Ok(())
    }

    /// Receiver: take back a request before submitting.
    pub fn withdraw_request(&mut self, id: &RecordId) -> Result<(), ExchangeError> {
        self.guard(Some(Party::Receiver))?;
        self.take_request(id)?;
        Ok(())
    }

    /// Initiator: move a requested record into the offer.
    pub fn accept_request(&mut self, id: &RecordId) -> Result<(), ExchangeError> {
        self.guard(Some(Party::Initiator))?;
        let accepted = self.take_request(id)?;
        self.offered_records.push(accepted);
        Ok(())
    }

    /// Initiator: decline a requested record.
    pub fn reject_request(&mut self, id: &RecordId) -> Result<(), ExchangeError> {
        self.guard(Some(Party::Initiator))?;
        self.take_request(id)?;
        Ok(())
    }

    fn take_request(&mut self, id: &RecordId) -> Result<RecordId, ValidationError> {
        let position = self
            .records_requested_by_receiver
            .iter()
            .position(|r| r == id)
            .ok_or_else(|| ValidationError::NotInExchange(id.clone()))?;
        Ok(self.records_requested_by_receiver.remove(position))
    }

    pub fn diff(&self) -> DraftDiff {
        let (offered_added, offered_removed) =
            changes(self.base.offered_records(), &self.offered_records);
        let (requested_added, requested_removed) = changes(
            self.base.records_requested_by_receiver(),
            &self.records_requested_by_receiver,
        );
        DraftDiff {
            offered_added,
            offered_removed,
            requested_added,
            requested_removed,
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.diff().is_empty()
    }

    /// The review to send, pinned to the snapshot version the draft started from.
    pub fn submission(&self) -> ReviewSubmission {
        ReviewSubmission {
            offered_records: self.offered_records.clone(),
            records_requested_by_receiver: Some(self.records_requested_by_receiver.clone()),
            expected_version: Some(self.base.version()),
        }
    }
}

fn changes(before: &[RecordId], after: &[RecordId]) -> (Vec<RecordId>, Vec<RecordId>) {
    let added = after
        .iter()
        .filter(|r| !before.contains(r))
        .cloned()
        .collect();
    let removed = before
        .iter()
        .filter(|r| !after.contains(r))
        .cloned()
        .collect();
    (added, removed)
}
