//! Per-viewer review surface
//!
//! Holds the snapshots a viewer last fetched and at most one draft per
//! exchange on top of them. Failures never abort the session, they are kept
//! as a transient message and the draft stays as it was so the viewer can
//! correct and retry.
use crate::catalog::Record;
use crate::draft::{DraftDiff, ExchangeDraft};
use crate::error::{ExchangeError, ValidationError};
use crate::exchange::{Exchange, ExchangeId, RecordId, TimeStamp, UserId};
use crate::machine::{self, ReviewSubmission};
use crate::service::ExchangeService;
use std::collections::HashMap;

/// Calls the review surface makes to the exchange authority.
pub trait ExchangeApi {
    fn fetch(&self, viewer: &UserId) -> anyhow::Result<Vec<Exchange>>;
    fn submit(
        &self,
        viewer: &UserId,
        id: &ExchangeId,
        submission: &ReviewSubmission,
    ) -> anyhow::Result<Exchange>;
    fn finalize(&self, viewer: &UserId, id: &ExchangeId) -> anyhow::Result<Exchange>;
    fn cancel(&self, viewer: &UserId, id: &ExchangeId) -> anyhow::Result<Exchange>;
}

impl ExchangeApi for ExchangeService {
    fn fetch(&self, viewer: &UserId) -> anyhow::Result<Vec<Exchange>> {
        self.list_exchanges(viewer)
    }
    fn submit(
        &self,
        viewer: &UserId,
        id: &ExchangeId,
        submission: &ReviewSubmission,
    ) -> anyhow::Result<Exchange> {
        self.submit_review(id, viewer, submission)
    }
    fn finalize(&self, viewer: &UserId, id: &ExchangeId) -> anyhow::Result<Exchange> {
        self.finalize_exchange(id, viewer)
    }
    fn cancel(&self, viewer: &UserId, id: &ExchangeId) -> anyhow::Result<Exchange> {
        self.cancel_exchange(id, viewer)
    }
}

impl<T: ExchangeApi + ?Sized> ExchangeApi for &T {
    fn fetch(&self, viewer: &UserId) -> anyhow::Result<Vec<Exchange>> {
        (**self).fetch(viewer)
    }
    fn submit(
        &self,
        viewer: &UserId,
        id: &ExchangeId,
        submission: &ReviewSubmission,
    ) -> anyhow::Result<Exchange> {
        (**self).submit(viewer, id, submission)
    }
    fn finalize(&self, viewer: &UserId, id: &ExchangeId) -> anyhow::Result<Exchange> {
        (**self).finalize(viewer, id)
    }
    fn cancel(&self, viewer: &UserId, id: &ExchangeId) -> anyhow::Result<Exchange> {
        (**self).cancel(viewer, id)
    }
}

/// Binds a fetch to the refresh generation that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    generation: u64,
}

pub struct ReviewSurface<A> {
    api: A,
    viewer: UserId,
    snapshots: Vec<Exchange>,
    drafts: HashMap<ExchangeId, ExchangeDraft>,
    generation: u64,
    message: Option<String>,
}

impl<A: ExchangeApi> ReviewSurface<A> {
    pub fn new(api: A, viewer: UserId) -> Self {
        Self {
            api,
            viewer,
            snapshots: vec![],
            drafts: HashMap::new(),
            generation: 0,
            message: None,
        }
    }

    pub fn viewer(&self) -> &UserId {
        &self.viewer
    }

    /// Fetched exchanges in the order the server returned them.
    pub fn exchanges(&self) -> &[Exchange] {
        &self.snapshots
    }

    pub fn snapshot(&self, id: &ExchangeId) -> Option<&Exchange> {
        self.snapshots.iter().find(|e| e.id() == id)
    }

    pub fn draft(&self, id: &ExchangeId) -> Option<&ExchangeDraft> {
        self.drafts.get(id)
    }

    /// The last failure, until the next successful action.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn begin_refresh(&mut self) -> FetchTicket {
        self.generation += 1;
        FetchTicket {
            generation: self.generation,
        }
    }

    /// Supersede any fetch still in flight.
    pub fn invalidate(&mut self) {
        self.generation += 1;
    }

    /// Apply a fetch result. Returns false if `ticket` was superseded and the
    /// result dropped.
    pub fn apply_refresh(
        &mut self,
        ticket: FetchTicket,
        result: anyhow::Result<Vec<Exchange>>,
    ) -> bool {
        if ticket.generation != self.generation {
            tracing::debug!(
                ticket = ticket.generation,
                current = self.generation,
                "discarding superseded fetch"
            );
            return false;
        }

        match result {
            Ok(exchanges) => {
                // a draft only survives while its base version is still current
                self.drafts.retain(|id, draft| {
                    exchanges
                        .iter()
                        .any(|e| e.id() == id && e.version() == draft.base_version())
                });
                self.snapshots = exchanges;
            }
            Err(err) => self.fail(err),
        }
        true
    }

    pub fn refresh(&mut self) -> bool {
        let ticket = self.begin_refresh();
        let result = self.api.fetch(&self.viewer);
        self.apply_refresh(ticket, result)
    }

    fn fail(&mut self, err: impl std::fmt::Display) {
        let message = err.to_string();
        tracing::debug!(viewer = %self.viewer, %message, "review action failed");
        self.message = Some(message);
    }

    fn stage(
        &mut self,
        id: &ExchangeId,
        edit: impl FnOnce(&mut ExchangeDraft) -> Result<(), ExchangeError>,
    ) -> bool {
        let staged = match self.drafts.get(id) {
            Some(draft) => Ok(draft.clone()),
            None => match self.snapshots.iter().find(|e| e.id() == id) {
                Some(snapshot) => ExchangeDraft::from_snapshot(snapshot, &self.viewer),
                None => Err(ExchangeError::NotFound(id.clone())),
            },
        };

        // edit a copy so a rejected edit leaves the draft untouched
        let result = staged.and_then(|mut draft| edit(&mut draft).map(|_| draft));
        match result {
            Ok(draft) => {
                self.drafts.insert(id.clone(), draft);
                self.message = None;
                true
            }
            Err(err) => {
                self.fail(err);
                false
            }
        }
    }

    pub fn add_offered(&mut self, id: &ExchangeId, record: &Record) -> bool {
        self.stage(id, |draft| draft.add_offered(record))
    }
    pub fn remove_offered(&mut self, id: &ExchangeId, record: &RecordId) -> bool {
        self.stage(id, |draft| draft.remove_offered(record))
    }
    pub fn request_record(&mut self, id: &ExchangeId, record: &Record) -> bool {
        self.stage(id, |draft| draft.request_record(record))
    }
    pub fn withdraw_request(&mut self, id: &ExchangeId, record: &RecordId) -> bool {
        self.stage(id, |draft| draft.withdraw_request(record))
    }
    pub fn accept_request(&mut self, id: &ExchangeId, record: &RecordId) -> bool {
        self.stage(id, |draft| draft.accept_request(record))
    }
    pub fn reject_request(&mut self, id: &ExchangeId, record: &RecordId) -> bool {
        self.stage(id, |draft| draft.reject_request(record))
    }

    /// Discard staged edits. The server copy is not touched.
    pub fn reset(&mut self, id: &ExchangeId) -> bool {
        self.drafts.remove(id).is_some()
    }

    pub fn diff(&self, id: &ExchangeId) -> Option<DraftDiff> {
        self.drafts.get(id).map(ExchangeDraft::diff)
    }

    /// Send the draft, or the unchanged snapshot when nothing is staged.
    pub fn submit(&mut self, id: &ExchangeId) -> bool {
        let submission = match self.drafts.get(id) {
            Some(draft) => Some(draft.submission()),
            None => self.snapshot(id).map(ReviewSubmission::unchanged),
        };
        let Some(submission) = submission else {
            self.fail(ExchangeError::NotFound(id.clone()));
            return false;
        };

        let result = self.api.submit(&self.viewer, id, &submission);
        self.settle(id, result)
    }

    /// Finalize the fetched snapshot. Refused while a draft holds staged edits,
    /// since completing would discard them.
    pub fn finalize(&mut self, id: &ExchangeId) -> bool {
        if self.drafts.get(id).is_some_and(ExchangeDraft::is_dirty) {
            self.fail(ExchangeError::from(ValidationError::StagedChanges));
            return false;
        }

        // same checks the server runs, without the round trip
        let precheck = match self.snapshot(id) {
            Some(snapshot) => {
                machine::finalize(snapshot, &self.viewer, TimeStamp::new()).map(|_| ())
            }
            None => Err(ExchangeError::NotFound(id.clone())),
        };
        if let Err(err) = precheck {
            self.fail(err);
            return false;
        }

        let result = self.api.finalize(&self.viewer, id);
        self.settle(id, result)
    }

    pub fn cancel(&mut self, id: &ExchangeId) -> bool {
        let result = self.api.cancel(&self.viewer, id);
        self.settle(id, result)
    }

    fn settle(&mut self, id: &ExchangeId, result: anyhow::Result<Exchange>) -> bool {
        match result {
            Ok(_) => {
                self.drafts.remove(id);
                self.message = None;
                self.refresh();
                true
            }
            Err(err) => {
                self.fail(err);
                false
            }
        }
    }
}
