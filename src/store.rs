//! Persistence for exchange aggregates
//!
//! Every aggregate lives under its id in the `exchanges` sled tree as CBOR.
//! Writes are compare-and-swap against the exact bytes the caller loaded, so a
//! transition computed from a stale snapshot is rejected with
//! [`ExchangeError::Conflict`] instead of silently overwriting a newer one.
use crate::error::{ExchangeError, ValidationError};
use crate::exchange::{Exchange, ExchangeId, ExchangeState, UserId};
use sled::Tree;

pub const EXCHANGE_TREE: &str = "exchanges";

pub struct ExchangeStore {
    tree: Tree,
}

impl ExchangeStore {
    pub fn open(db: &sled::Db) -> anyhow::Result<Self> {
        Ok(Self {
            tree: db.open_tree(EXCHANGE_TREE)?,
        })
    }

    /// Persist a freshly opened exchange. Fails if the id is already taken.
    pub fn insert(&self, exchange: &Exchange) -> anyhow::Result<()> {
        ensure_persistable(exchange)?;
        let (_, cbor) = exchange.serialize_with_hash()?;

        self.tree
            .compare_and_swap(exchange.id().as_str(), None::<&[u8]>, Some(cbor))?
            .map_err(|_| anyhow::anyhow!("Exchange {} already exists", exchange.id()))?;
        Ok(())
    }

    pub fn load(&self, id: &ExchangeId) -> anyhow::Result<Option<Exchange>> {
        match self.tree.get(id.as_str())? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Like [`ExchangeStore::load`], with a missing aggregate as `NotFound`.
    pub fn get(&self, id: &ExchangeId) -> anyhow::Result<Exchange> {
        self.load(id)?
            .ok_or_else(|| ExchangeError::NotFound(id.clone()).into())
    }

    pub fn list_all(&self) -> anyhow::Result<Vec<Exchange>> {
        let mut exchanges = vec![];
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            exchanges.push(minicbor::decode(&bytes)?);
        }
        Ok(exchanges)
    }

    /// Exchanges `user` takes part in, most recently created first.
    pub fn list_for_user(&self, user: &UserId) -> anyhow::Result<Vec<Exchange>> {
        let mut exchanges: Vec<Exchange> = self
            .list_all()?
            .into_iter()
            .filter(|e| e.party_of(user).is_some())
            .collect();
        exchanges.sort_by_key(|e| std::cmp::Reverse(e.creation_datetime().to_datetime_utc()));
        Ok(exchanges)
    }

    /// Swap `prev` for `next`, provided nobody wrote since `prev` was loaded.
    pub fn replace(&self, prev: &Exchange, next: &Exchange) -> anyhow::Result<()> {
        if prev.id() != next.id() || next.version() != prev.version() + 1 {
            anyhow::bail!(
                "Exchange {} cannot move from version {} to {}",
                prev.id(),
                prev.version(),
                next.version()
            );
        }
        ensure_persistable(next)?;

        let (_, old) = prev.serialize_with_hash()?;
        let (_, new) = next.serialize_with_hash()?;
        if self
            .tree
            .compare_and_swap(prev.id().as_str(), Some(old), Some(new))?
            .is_err()
        {
            return Err(self.conflict(prev)?);
        }
        Ok(())
    }

    /// Delete `prev`, provided nobody wrote since it was loaded.
    pub fn remove(&self, prev: &Exchange) -> anyhow::Result<()> {
        let (_, old) = prev.serialize_with_hash()?;
        if self
            .tree
            .compare_and_swap(prev.id().as_str(), Some(old), None::<Vec<u8>>)?
            .is_err()
        {
            return Err(self.conflict(prev)?);
        }
        Ok(())
    }

    /// Put `original` back in place of `written`, the value a successful
    /// [`ExchangeStore::replace`] stored. Fails if anything was written since.
    pub fn restore(&self, written: &Exchange, original: &Exchange) -> anyhow::Result<()> {
        let (_, current) = written.serialize_with_hash()?;
        let (_, old) = original.serialize_with_hash()?;
        if self
            .tree
            .compare_and_swap(written.id().as_str(), Some(current), Some(old))?
            .is_err()
        {
            return Err(self.conflict(written)?);
        }
        Ok(())
    }

    /// Unconditional delete. Returns whether anything was removed.
    pub fn purge(&self, id: &ExchangeId) -> anyhow::Result<bool> {
        Ok(self.tree.remove(id.as_str())?.is_some())
    }

    // explain why a compare-and-swap against `prev` failed
    fn conflict(&self, prev: &Exchange) -> anyhow::Result<anyhow::Error> {
        let err = match self.load(prev.id())? {
            None => ExchangeError::NotFound(prev.id().clone()),
            Some(current) => ExchangeError::Conflict {
                exchange: prev.id().clone(),
                expected: prev.version(),
                found: current.version(),
            },
        };
        Ok(err.into())
    }
}

fn ensure_persistable(exchange: &Exchange) -> anyhow::Result<()> {
    if let ExchangeState::Cancelled { .. } = exchange.state() {
        anyhow::bail!("Cancelled exchange {} cannot be stored", exchange.id());
    }
    if exchange.offered_records().is_empty() {
        return Err(ExchangeError::from(ValidationError::EmptyOffer).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{RecordId, TimeStamp};
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    fn exchange(id: &str, initiator: &str, receiver: &str, created: TimeStamp<Utc>) -> Exchange {
        Exchange {
            id: ExchangeId::new(id),
            initiator_user: UserId::from(initiator),
            receiver_user: UserId::from(receiver),
            requested_record: RecordId::from("r"),
            offered_records: vec![RecordId::from("o1")],
            records_requested_by_receiver: vec![],
            state: ExchangeState::AwaitingReceiverReview,
            version: 1,
            creation_datetime: created.clone(),
            last_modification_datetime: created,
        }
    }

    fn bumped(prev: &Exchange) -> Exchange {
        let mut next = prev.clone();
        next.state = ExchangeState::AwaitingInitiatorReview;
        next.version += 1;
        next
    }

    #[test]
    fn insert_is_create_only() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db = sled::open(temp_dir.path().join("store.db"))?;
        let store = ExchangeStore::open(&db)?;

        let first = exchange("exchange_a", "alice", "bob", TimeStamp::new());
        store.insert(&first)?;
        assert!(store.insert(&first).is_err());
        assert_eq!(store.get(first.id())?, first);

        let missing = store.get(&ExchangeId::new("exchange_missing")).unwrap_err();
        assert!(matches!(
            ExchangeError::from_anyhow(&missing),
            Some(ExchangeError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn stale_replace_is_a_conflict() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db = sled::open(temp_dir.path().join("store.db"))?;
        let store = ExchangeStore::open(&db)?;

        let v1 = exchange("exchange_a", "alice", "bob", TimeStamp::new());
        store.insert(&v1)?;
        let v2 = bumped(&v1);
        store.replace(&v1, &v2)?;

        // a second writer still holding v1
        let err = store.replace(&v1, &bumped(&v1)).unwrap_err();
        assert_eq!(
            ExchangeError::from_anyhow(&err),
            Some(&ExchangeError::Conflict {
                exchange: v1.id().clone(),
                expected: 1,
                found: 2,
            })
        );
        assert_eq!(store.get(v1.id())?.version(), 2);

        // removal is guarded the same way
        assert!(store.remove(&v1).is_err());
        store.remove(&v2)?;
        assert!(store.load(v1.id())?.is_none());
        Ok(())
    }

    #[test]
    fn restore_undoes_a_replace() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db = sled::open(temp_dir.path().join("store.db"))?;
        let store = ExchangeStore::open(&db)?;

        let v1 = exchange("exchange_a", "alice", "bob", TimeStamp::new());
        store.insert(&v1)?;
        let v2 = bumped(&v1);
        store.replace(&v1, &v2)?;

        store.restore(&v2, &v1)?;
        assert_eq!(store.get(v1.id())?, v1);

        // v2 is no longer stored, so a second restore has nothing to undo
        let err = store.restore(&v2, &v1).unwrap_err();
        assert!(matches!(
            ExchangeError::from_anyhow(&err),
            Some(ExchangeError::Conflict { found: 1, .. })
        ));
        Ok(())
    }

    #[test]
    fn refuses_empty_offer_and_cancelled_snapshots() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db = sled::open(temp_dir.path().join("store.db"))?;
        let store = ExchangeStore::open(&db)?;

        let v1 = exchange("exchange_a", "alice", "bob", TimeStamp::new());
        store.insert(&v1)?;

        let mut emptied = bumped(&v1);
        emptied.offered_records.clear();
        let err = store.replace(&v1, &emptied).unwrap_err();
        assert_eq!(
            ExchangeError::from_anyhow(&err),
            Some(&ExchangeError::Validation(ValidationError::EmptyOffer))
        );

        let mut cancelled = bumped(&v1);
        cancelled.state = ExchangeState::Cancelled {
            cancelled_at: TimeStamp::new(),
        };
        assert!(store.replace(&v1, &cancelled).is_err());
        assert_eq!(store.get(v1.id())?, v1);
        Ok(())
    }

    #[test]
    fn lists_newest_first_per_user() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db = sled::open(temp_dir.path().join("store.db"))?;
        let store = ExchangeStore::open(&db)?;

        let now = Utc::now();
        let old = exchange(
            "exchange_old",
            "alice",
            "bob",
            (now - Duration::hours(2)).into(),
        );
        let new = exchange("exchange_new", "bob", "alice", now.into());
        let other = exchange("exchange_other", "carol", "dave", now.into());
        for e in [&old, &new, &other] {
            store.insert(e)?;
        }

        let ids: Vec<_> = store
            .list_for_user(&UserId::from("alice"))?
            .into_iter()
            .map(|e| e.id().clone())
            .collect();
        assert_eq!(ids, vec![new.id().clone(), old.id().clone()]);
        assert_eq!(store.list_all()?.len(), 3);

        assert!(store.purge(other.id())?);
        assert!(!store.purge(other.id())?);
        Ok(())
    }
}
