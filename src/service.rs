//! Service layer API for exchange negotiation
use crate::catalog::{Record, RecordCatalog};
use crate::error::ExchangeError;
use crate::exchange::{Exchange, ExchangeId, RecordId, TimeStamp, UserId};
use crate::machine::{self, RecordIndex, ReviewSubmission};
use crate::store::ExchangeStore;
use std::collections::HashSet;
use std::sync::Arc;

pub struct ExchangeService {
    instance: Arc<sled::Db>,
    store: ExchangeStore,
    catalog: Arc<dyn RecordCatalog>,
}

impl ExchangeService {
    pub fn new(instance: Arc<sled::Db>, catalog: Arc<dyn RecordCatalog>) -> anyhow::Result<Self> {
        let store = ExchangeStore::open(&instance)?;
        Ok(Self {
            instance,
            store,
            catalog,
        })
    }

    pub fn catalog(&self) -> &dyn RecordCatalog {
        self.catalog.as_ref()
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> anyhow::Result<()> {
        self.instance.flush()?;
        Ok(())
    }

    /// Look up every referenced record the catalog knows about
    fn resolve<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a RecordId>,
    ) -> anyhow::Result<RecordIndex> {
        let mut index = RecordIndex::new();
        for id in ids {
            if index.contains_key(id) {
                continue;
            }
            if let Some(record) = self.catalog.get_record(id)? {
                index.insert(id.clone(), record);
            }
        }
        Ok(index)
    }

    /// Load an exchange on behalf of one of its parties
    fn load_for(
        &self,
        id: &ExchangeId,
        user: &UserId,
        action: &'static str,
    ) -> anyhow::Result<Exchange> {
        let exchange = self.store.get(id)?;
        if exchange.party_of(user).is_none() {
            return Err(ExchangeError::forbidden(id, user, action).into());
        }
        Ok(exchange)
    }

    /// Open a new exchange against a record owned by someone else
    #[tracing::instrument(skip_all, fields(initiator = %initiator, requested = %requested_record))]
    pub fn create_exchange(
        &self,
        initiator: &UserId,
        requested_record: &RecordId,
        offered_records: &[RecordId],
    ) -> anyhow::Result<Exchange> {
        // Only one active negotiation per initiator and requested record
        let duplicate = self.store.list_for_user(initiator)?.into_iter().any(|e| {
            !e.is_completed()
                && e.initiator_user() == initiator
                && e.requested_record() == requested_record
        });
        if duplicate {
            tracing::debug!("duplicate exchange request rejected");
            return Err(ExchangeError::InvalidRequest(format!(
                "an active exchange for record {requested_record} already exists"
            ))
            .into());
        }

        let index = self.resolve(std::iter::once(requested_record).chain(offered_records))?;
        let exchange = machine::open(
            ExchangeId::generate()?,
            initiator,
            requested_record,
            offered_records,
            &index,
            TimeStamp::new(),
        )
        .inspect_err(|err| tracing::debug!(%err, "exchange request rejected"))?;

        self.store.insert(&exchange)?;
        tracing::info!(
            exchange = %exchange.id(),
            receiver = %exchange.receiver_user(),
            "exchange created"
        );

        Ok(exchange)
    }

    pub fn get_exchange(&self, id: &ExchangeId, user: &UserId) -> anyhow::Result<Exchange> {
        self.load_for(id, user, "view")
    }

    /// Active and completed exchanges the user takes part in, newest first
    pub fn list_exchanges(&self, user: &UserId) -> anyhow::Result<Vec<Exchange>> {
        self.store.list_for_user(user)
    }

    /// Completed exchanges only
    pub fn exchange_history(&self, user: &UserId) -> anyhow::Result<Vec<Exchange>> {
        Ok(self
            .store
            .list_for_user(user)?
            .into_iter()
            .filter(Exchange::is_completed)
            .collect())
    }

    /// Commit the turn-holder's record sets and pass the turn
    #[tracing::instrument(skip_all, fields(exchange = %id, actor = %actor))]
    pub fn submit_review(
        &self,
        id: &ExchangeId,
        actor: &UserId,
        submission: &ReviewSubmission,
    ) -> anyhow::Result<Exchange> {
        // Load latest persisted aggregate
        let current = self.store.get(id)?;

        let referenced = submission
            .offered_records
            .iter()
            .chain(submission.records_requested_by_receiver.iter().flatten());
        let index = self.resolve(referenced)?;

        let next = machine::review(&current, actor, submission, &index, TimeStamp::new())
            .inspect_err(|err| tracing::debug!(%err, "review rejected"))?;

        // Write back only if nobody else got there first
        self.store.replace(&current, &next)?;
        tracing::info!(
            version = next.version(),
            state = next.state().label(),
            "review submitted"
        );

        Ok(next)
    }

    /// Pass the turn without changing the record sets
    #[tracing::instrument(skip_all, fields(exchange = %id, actor = %actor))]
    pub fn switch_reviewer(&self, id: &ExchangeId, actor: &UserId) -> anyhow::Result<Exchange> {
        let current = self.store.get(id)?;

        let next = machine::switch_reviewer(&current, actor, TimeStamp::new())
            .inspect_err(|err| tracing::debug!(%err, "switch rejected"))?;

        self.store.replace(&current, &next)?;
        tracing::info!(
            version = next.version(),
            state = next.state().label(),
            "reviewer switched"
        );

        Ok(next)
    }

    /// Seal the exchange and swap record ownership.
    ///
    /// The completed state is written first, so of two racing finalizes only
    /// the winner reaches the catalog. If the catalog then refuses the
    /// transfers, the sealed snapshot is swapped back for the one it replaced
    /// and the exchange is open for another attempt.
    #[tracing::instrument(skip_all, fields(exchange = %id, actor = %actor))]
    pub fn finalize_exchange(&self, id: &ExchangeId, actor: &UserId) -> anyhow::Result<Exchange> {
        let current = self.store.get(id)?;

        let sealed = machine::finalize(&current, actor, TimeStamp::new())
            .inspect_err(|err| tracing::debug!(%err, "finalize rejected"))?;

        self.store.replace(&current, &sealed)?;

        let transfers = machine::ownership_transfers(&sealed);
        if let Err(err) = self.catalog.transfer_all(&transfers) {
            tracing::warn!(%err, "ownership transfer failed, reopening exchange");
            if let Err(restore_err) = self.store.restore(&sealed, &current) {
                tracing::error!(%restore_err, "sealed exchange could not be reopened");
            }
            return Err(err);
        }

        match self.purge_related(&sealed) {
            Ok(purged) => tracing::info!(purged, "exchange completed"),
            Err(err) => tracing::warn!(%err, "exchange completed, related exchanges not purged"),
        }

        Ok(sealed)
    }

    // Drop every other active exchange that involves a record which just changed hands
    fn purge_related(&self, sealed: &Exchange) -> anyhow::Result<usize> {
        let swapped: HashSet<&RecordId> = sealed.records().collect();
        let mut purged = 0;
        for other in self.store.list_all()? {
            if other.id() == sealed.id() || other.is_completed() {
                continue;
            }
            if other.records().any(|r| swapped.contains(r)) && self.store.purge(other.id())? {
                tracing::debug!(exchange = %other.id(), "removed exchange touching moved records");
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Withdraw from an open exchange. Either party may cancel at any time.
    #[tracing::instrument(skip_all, fields(exchange = %id, actor = %actor))]
    pub fn cancel_exchange(&self, id: &ExchangeId, actor: &UserId) -> anyhow::Result<Exchange> {
        let current = self.store.get(id)?;

        let cancelled = machine::cancel(&current, actor, TimeStamp::new())
            .inspect_err(|err| tracing::debug!(%err, "cancel rejected"))?;

        self.store.remove(&current)?;
        tracing::info!("exchange cancelled");

        Ok(cancelled)
    }

    /// Initiator records that could still enter the exchange, as offers or requests
    pub fn candidate_records(&self, id: &ExchangeId, user: &UserId) -> anyhow::Result<Vec<Record>> {
        let exchange = self.load_for(id, user, "view")?;
        Ok(self
            .catalog
            .records_by_owner(exchange.initiator_user())?
            .into_iter()
            .filter(|r| r.available_for_exchange && !exchange.involves_record(&r.id))
            .collect())
    }
}
