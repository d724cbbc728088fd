//! Record catalog collaborator
//!
//! The exchange core only needs record existence, ownership and the
//! `available_for_exchange` flag, plus the ability to swap owners once an
//! exchange is finalized. [`SledCatalog`] keeps records in their own sled tree
//! so the service can run standalone.
use crate::exchange::{RecordId, UserId};
use sled::Tree;
use sled::transaction::{TransactionError, abort};

pub const RECORD_TREE: &str = "records";

/// Goldmine grading scale, shared by the record and cover ratings.
#[derive(
    minicbor::Encode,
    minicbor::Decode,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
)]
pub enum Condition {
    #[n(0)]
    Mint,
    #[n(1)]
    NearMint,
    #[n(2)]
    VeryGoodPlus,
    #[n(3)]
    VeryGood,
    #[n(4)]
    Good,
    #[n(5)]
    Poor,
}

#[derive(
    minicbor::Encode,
    minicbor::Decode,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    PartialEq,
    Eq,
)]
pub struct Record {
    #[n(0)]
    pub id: RecordId,
    #[n(1)]
    pub owner: UserId,
    #[n(2)]
    pub artist: String,
    #[n(3)]
    pub album_name: String,
    #[n(4)]
    pub catalog_number: String,
    #[n(5)]
    pub genre: Option<String>,
    #[n(6)]
    pub record_condition: Option<Condition>,
    #[n(7)]
    pub cover_condition: Option<Condition>,
    #[n(8)]
    pub available_for_exchange: bool,
}

impl Record {
    /// A listed record with no descriptive metadata, open for exchange.
    pub fn new(id: impl Into<RecordId>, owner: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            artist: String::new(),
            album_name: String::new(),
            catalog_number: String::new(),
            genre: None,
            record_condition: None,
            cover_condition: None,
            available_for_exchange: true,
        }
    }
    pub fn set_album(mut self, artist: &str, album_name: &str) -> Self {
        self.artist = artist.to_owned();
        self.album_name = album_name.to_owned();
        self
    }
    pub fn set_catalog_number(mut self, catalog_number: &str) -> Self {
        self.catalog_number = catalog_number.to_owned();
        self
    }
    pub fn set_genre(mut self, genre: &str) -> Self {
        self.genre = Some(genre.to_owned());
        self
    }
    pub fn set_conditions(mut self, record: Condition, cover: Condition) -> Self {
        self.record_condition = Some(record);
        self.cover_condition = Some(cover);
        self
    }
    pub fn set_available(mut self, available: bool) -> Self {
        self.available_for_exchange = available;
        self
    }
}

/// Read and ownership-transfer operations the exchange core consumes.
pub trait RecordCatalog: Send + Sync {
    fn get_record(&self, id: &RecordId) -> anyhow::Result<Option<Record>>;
    fn records_by_owner(&self, owner: &UserId) -> anyhow::Result<Vec<Record>>;
    fn transfer_ownership(&self, id: &RecordId, new_owner: &UserId) -> anyhow::Result<()>;
    /// Move every record to its new owner, or leave all of them untouched.
    fn transfer_all(&self, transfers: &[(RecordId, UserId)]) -> anyhow::Result<()>;
}

pub struct SledCatalog {
    tree: Tree,
}

impl SledCatalog {
    pub fn open(db: &sled::Db) -> anyhow::Result<Self> {
        Ok(Self {
            tree: db.open_tree(RECORD_TREE)?,
        })
    }

    /// Insert or overwrite a record listing.
    pub fn insert_record(&self, record: &Record) -> anyhow::Result<()> {
        self.tree
            .insert(record.id.as_str().as_bytes(), minicbor::to_vec(record)?)?;
        Ok(())
    }

    pub fn set_available(&self, id: &RecordId, available: bool) -> anyhow::Result<()> {
        self.modify(id, |record| record.available_for_exchange = available)
    }

    // read-modify-write guarded by compare and swap on the stored bytes
    fn modify(&self, id: &RecordId, change: impl Fn(&mut Record)) -> anyhow::Result<()> {
        let key = id.as_str().as_bytes();
        let Some(current) = self.tree.get(key)? else {
            anyhow::bail!("Record {id} does not exist");
        };

        let mut record: Record = minicbor::decode(&current)?;
        change(&mut record);

        self.tree
            .compare_and_swap(key, Some(current), Some(minicbor::to_vec(&record)?))?
            .map_err(|_| anyhow::anyhow!("Record {id} was modified concurrently"))?;
        Ok(())
    }
}

impl RecordCatalog for SledCatalog {
    fn get_record(&self, id: &RecordId) -> anyhow::Result<Option<Record>> {
        match self.tree.get(id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn records_by_owner(&self, owner: &UserId) -> anyhow::Result<Vec<Record>> {
        let mut records = vec![];
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            let record: Record = minicbor::decode(&bytes)?;
            if record.owner == *owner {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn transfer_ownership(&self, id: &RecordId, new_owner: &UserId) -> anyhow::Result<()> {
        self.transfer_all(&[(id.clone(), new_owner.clone())])
    }

    fn transfer_all(&self, transfers: &[(RecordId, UserId)]) -> anyhow::Result<()> {
        let outcome = self.tree.transaction(|tx| {
            for (id, new_owner) in transfers {
                let Some(bytes) = tx.get(id.as_str())? else {
                    return abort(format!("Record {id} does not exist"));
                };
                let mut record: Record = minicbor::decode(&bytes)
                    .or_else(|err| abort(format!("Record {id} cannot be decoded: {err}")))?;
                record.owner = new_owner.clone();
                let encoded = minicbor::to_vec(&record)
                    .or_else(|err| abort(format!("Record {id} cannot be encoded: {err}")))?;
                tx.insert(id.as_str(), encoded)?;
            }
            Ok(())
        });

        match outcome {
            Ok(()) => {
                for (id, new_owner) in transfers {
                    tracing::debug!(record = %id, owner = %new_owner, "ownership transferred");
                }
                Ok(())
            }
            Err(TransactionError::Abort(reason)) => Err(anyhow::anyhow!(reason)),
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }
}
