//! Core exchange aggregate, identifiers and timestamps
use bech32::Bech32m;
use chrono::{DateTime, TimeZone, Utc};
use uuid7::uuid7;

/// Human readable prefix of generated exchange ids.
pub const EXCHANGE_HRP: &str = "exchange_";

// Ids issued by the user and record collaborators are opaque strings.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl<C> minicbor::Encode<C> for $name {
            fn encode<W: minicbor::encode::Write>(
                &self,
                e: &mut minicbor::Encoder<W>,
                _: &mut C,
            ) -> Result<(), minicbor::encode::Error<W::Error>> {
                e.str(&self.0)?.ok()
            }
        }

        impl<'b, C> minicbor::Decode<'b, C> for $name {
            fn decode(
                d: &mut minicbor::Decoder<'b>,
                _: &mut C,
            ) -> Result<Self, minicbor::decode::Error> {
                Ok(Self(d.str()?.to_owned()))
            }
        }
    };
}

string_id!(
    /// Identity issued by the authentication collaborator.
    UserId
);
string_id!(
    /// Identity of a record in the catalog.
    RecordId
);
string_id!(
    /// bech32m encoded uuid7, e.g. `exchange_1...`
    ExchangeId
);

impl ExchangeId {
    /// Construct a fresh, time ordered exchange id.
    pub fn generate() -> anyhow::Result<Self> {
        let hrp = bech32::Hrp::parse(EXCHANGE_HRP)?;
        let encoded = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
        Ok(Self(encoded))
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl From<DateTime<Utc>> for TimeStamp<Utc> {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// One side of a two-party exchange.
#[derive(
    minicbor::Encode, minicbor::Decode, serde::Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    #[n(0)]
    Initiator,
    #[n(1)]
    Receiver,
}

impl Party {
    pub fn other(self) -> Party {
        match self {
            Party::Initiator => Party::Receiver,
            Party::Receiver => Party::Initiator,
        }
    }
    pub fn label(self) -> &'static str {
        match self {
            Party::Initiator => "initiator",
            Party::Receiver => "receiver",
        }
    }
}

/// Negotiation state of an exchange.
///
/// `Cancelled` is never persisted: cancelling deletes the aggregate and the
/// variant only describes the final snapshot handed back to the caller.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeState {
    #[n(0)]
    AwaitingReceiverReview,
    #[n(1)]
    AwaitingInitiatorReview,
    #[n(2)]
    Completed {
        #[n(0)]
        completed_at: TimeStamp<Utc>,
    },
    #[n(3)]
    Cancelled {
        #[n(0)]
        cancelled_at: TimeStamp<Utc>,
    },
}

impl ExchangeState {
    pub fn awaiting(party: Party) -> Self {
        match party {
            Party::Initiator => ExchangeState::AwaitingInitiatorReview,
            Party::Receiver => ExchangeState::AwaitingReceiverReview,
        }
    }
    /// The party holding the review turn, if the exchange is still open.
    pub fn turn(&self) -> Option<Party> {
        match self {
            ExchangeState::AwaitingReceiverReview => Some(Party::Receiver),
            ExchangeState::AwaitingInitiatorReview => Some(Party::Initiator),
            ExchangeState::Completed { .. } | ExchangeState::Cancelled { .. } => None,
        }
    }
    pub fn is_terminal(&self) -> bool {
        self.turn().is_none()
    }
    pub fn label(&self) -> &'static str {
        match self {
            ExchangeState::AwaitingReceiverReview => "awaiting_receiver_review",
            ExchangeState::AwaitingInitiatorReview => "awaiting_initiator_review",
            ExchangeState::Completed { .. } => "completed",
            ExchangeState::Cancelled { .. } => "cancelled",
        }
    }
}

/// The negotiation aggregate. Keyed in the store by its id.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    #[n(0)]
    pub(crate) id: ExchangeId,
    #[n(1)]
    pub(crate) initiator_user: UserId,
    #[n(2)]
    pub(crate) receiver_user: UserId,
    #[n(3)]
    pub(crate) requested_record: RecordId,
    #[n(4)]
    pub(crate) offered_records: Vec<RecordId>,
    #[n(5)]
    pub(crate) records_requested_by_receiver: Vec<RecordId>,
    #[n(6)]
    pub(crate) state: ExchangeState,
    #[n(7)]
    pub(crate) version: u64, // bumped on every accepted write
    #[n(8)]
    pub(crate) creation_datetime: TimeStamp<Utc>,
    #[n(9)]
    pub(crate) last_modification_datetime: TimeStamp<Utc>,
}

impl Exchange {
    pub fn id(&self) -> &ExchangeId {
        &self.id
    }
    pub fn initiator_user(&self) -> &UserId {
        &self.initiator_user
    }
    pub fn receiver_user(&self) -> &UserId {
        &self.receiver_user
    }
    pub fn requested_record(&self) -> &RecordId {
        &self.requested_record
    }
    pub fn offered_records(&self) -> &[RecordId] {
        &self.offered_records
    }
    pub fn records_requested_by_receiver(&self) -> &[RecordId] {
        &self.records_requested_by_receiver
    }
    pub fn state(&self) -> &ExchangeState {
        &self.state
    }
    pub fn version(&self) -> u64 {
        self.version
    }
    pub fn creation_datetime(&self) -> &TimeStamp<Utc> {
        &self.creation_datetime
    }
    pub fn last_modification_datetime(&self) -> &TimeStamp<Utc> {
        &self.last_modification_datetime
    }
    pub fn completed_datetime(&self) -> Option<&TimeStamp<Utc>> {
        match &self.state {
            ExchangeState::Completed { completed_at } => Some(completed_at),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.state, ExchangeState::Completed { .. })
    }
    pub fn turn(&self) -> Option<Party> {
        self.state.turn()
    }
    pub fn next_user_to_review(&self) -> Option<&UserId> {
        self.turn().map(|party| self.user_of(party))
    }

    pub fn user_of(&self, party: Party) -> &UserId {
        match party {
            Party::Initiator => &self.initiator_user,
            Party::Receiver => &self.receiver_user,
        }
    }
    /// Which side `user` is on, or `None` for outsiders.
    pub fn party_of(&self, user: &UserId) -> Option<Party> {
        if *user == self.initiator_user {
            Some(Party::Initiator)
        } else if *user == self.receiver_user {
            Some(Party::Receiver)
        } else {
            None
        }
    }

    /// Every record referenced by the exchange, requested record first.
    pub fn records(&self) -> impl Iterator<Item = &RecordId> {
        std::iter::once(&self.requested_record)
            .chain(self.offered_records.iter())
            .chain(self.records_requested_by_receiver.iter())
    }
    pub fn involves_record(&self, record: &RecordId) -> bool {
        self.records().any(|r| r == record)
    }

    /// CBOR encoding of the aggregate together with its sha256 digest.
    pub fn serialize_with_hash(&self) -> anyhow::Result<(String, Vec<u8>)> {
        let cbor = minicbor::to_vec(self)?;
        let hash = sha256::digest(&cbor);

        Ok((hash, cbor))
    }
}
