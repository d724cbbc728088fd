use anyhow::Context;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::{TempDir, tempdir};
use vinyl_exchange::catalog::{Condition, Record, RecordCatalog, SledCatalog};
use vinyl_exchange::draft::ExchangeDraft;
use vinyl_exchange::error::{ExchangeError, ValidationError};
use vinyl_exchange::exchange::{Exchange, RecordId, UserId};
use vinyl_exchange::machine::ReviewSubmission;
use vinyl_exchange::service::ExchangeService;

struct Market {
    // keeps the database directory alive for the test
    _dir: TempDir,
    db: Arc<sled::Db>,
    catalog: Arc<SledCatalog>,
    service: ExchangeService,
}

// Refuses the next `failures` batches of transfers, then behaves like the sled catalog
struct FlakyCatalog {
    inner: Arc<SledCatalog>,
    failures: AtomicUsize,
}

impl RecordCatalog for FlakyCatalog {
    fn get_record(&self, id: &RecordId) -> anyhow::Result<Option<Record>> {
        self.inner.get_record(id)
    }

    fn records_by_owner(&self, owner: &UserId) -> anyhow::Result<Vec<Record>> {
        self.inner.records_by_owner(owner)
    }

    fn transfer_ownership(&self, id: &RecordId, new_owner: &UserId) -> anyhow::Result<()> {
        self.inner.transfer_ownership(id, new_owner)
    }

    fn transfer_all(&self, transfers: &[(RecordId, UserId)]) -> anyhow::Result<()> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            anyhow::bail!("catalog unavailable");
        }
        self.inner.transfer_all(transfers)
    }
}

// Sled locks the database file, so every test opens its own under a temp dir.
fn market(name: &str) -> anyhow::Result<Market> {
    let dir = tempdir()?;
    let db = Arc::new(sled::open(dir.path().join(name))?);

    let catalog = Arc::new(SledCatalog::open(&db)?);
    let listings = [
        Record::new("R", "2")
            .set_album("Nick Drake", "Pink Moon")
            .set_catalog_number("ILPS 9184")
            .set_conditions(Condition::NearMint, Condition::VeryGoodPlus),
        Record::new("O1", "1").set_album("Talk Talk", "Spirit of Eden"),
        Record::new("O2", "1").set_album("Slint", "Spiderland"),
        Record::new("Z", "1").set_album("Low", "Things We Lost in the Fire"),
        Record::new("T3", "3"),
        Record::new("T4", "3"),
    ];
    for record in &listings {
        catalog.insert_record(record)?;
    }

    let service = ExchangeService::new(db.clone(), catalog.clone())?;
    Ok(Market {
        _dir: dir,
        db,
        catalog,
        service,
    })
}

fn user(id: &str) -> UserId {
    UserId::from(id)
}

fn rec(id: &str) -> RecordId {
    RecordId::from(id)
}

fn domain_error(err: &anyhow::Error) -> Option<&ExchangeError> {
    ExchangeError::from_anyhow(err)
}

fn owner(catalog: &SledCatalog, id: &str) -> anyhow::Result<UserId> {
    Ok(catalog
        .get_record(&rec(id))?
        .context("record missing from catalog")?
        .owner)
}

// Scenario A
fn open_exchange(market: &Market) -> anyhow::Result<Exchange> {
    market
        .service
        .create_exchange(&user("1"), &rec("R"), &[rec("O1")])
        .context("Exchange failed on create: ")
}

#[test]
fn full_negotiation_swaps_ownership() -> anyhow::Result<()> {
    let market = market("full_negotiation.db")?;

    // A: the receiver reviews first
    let exchange = open_exchange(&market)?;
    assert_eq!(exchange.next_user_to_review(), Some(&user("2")));
    assert_eq!(exchange.offered_records(), &[rec("O1")]);
    assert!(!exchange.is_completed());

    // B: receiver asks for O2 as well
    let o2 = market
        .catalog
        .get_record(&rec("O2"))?
        .context("O2 missing")?;
    let mut draft = ExchangeDraft::from_snapshot(&exchange, &user("2"))?;
    draft.request_record(&o2)?;
    let exchange = market
        .service
        .submit_review(exchange.id(), &user("2"), &draft.submission())
        .context("Exchange failed on receiver review: ")?;
    assert_eq!(exchange.next_user_to_review(), Some(&user("1")));
    assert_eq!(exchange.records_requested_by_receiver(), &[rec("O2")]);

    // C: initiator accepts, O2 moves into the offer
    let mut draft = ExchangeDraft::from_snapshot(&exchange, &user("1"))?;
    draft.accept_request(&rec("O2"))?;
    let exchange = market
        .service
        .submit_review(exchange.id(), &user("1"), &draft.submission())
        .context("Exchange failed on initiator review: ")?;
    assert_eq!(exchange.offered_records(), &[rec("O1"), rec("O2")]);
    assert!(exchange.records_requested_by_receiver().is_empty());
    assert_eq!(exchange.next_user_to_review(), Some(&user("2")));

    // D: receiver finalizes
    let exchange = market
        .service
        .finalize_exchange(exchange.id(), &user("2"))
        .context("Exchange failed on finalize: ")?;
    assert!(exchange.is_completed());
    assert!(exchange.completed_datetime().is_some());
    assert_eq!(owner(&market.catalog, "R")?, user("1"));
    assert_eq!(owner(&market.catalog, "O1")?, user("2"));
    assert_eq!(owner(&market.catalog, "O2")?, user("2"));

    let history = market.service.exchange_history(&user("1"))?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id(), exchange.id());

    Ok(())
}

#[test]
fn last_offered_record_is_kept_locally() -> anyhow::Result<()> {
    let market = market("last_offered.db")?;
    let exchange = open_exchange(&market)?;

    // E: rejected before anything is sent
    let mut draft = ExchangeDraft::from_snapshot(&exchange, &user("1"))?;
    let err = draft.remove_offered(&rec("O1")).unwrap_err();
    assert_eq!(err, ExchangeError::Validation(ValidationError::EmptyOffer));

    // the server refuses the same thing on its own
    let err = market
        .service
        .submit_review(
            exchange.id(),
            &user("2"),
            &ReviewSubmission {
                offered_records: vec![],
                ..Default::default()
            },
        )
        .unwrap_err();
    assert_eq!(
        domain_error(&err),
        Some(&ExchangeError::Validation(ValidationError::EmptyOffer))
    );
    assert_eq!(
        market
            .service
            .get_exchange(exchange.id(), &user("1"))?
            .offered_records(),
        &[rec("O1")]
    );
    Ok(())
}

#[test]
fn only_the_turn_holder_may_review() -> anyhow::Result<()> {
    let market = market("turn_holder.db")?;
    let exchange = open_exchange(&market)?;

    // F: user 1 does not hold the turn
    let err = market
        .service
        .submit_review(
            exchange.id(),
            &user("1"),
            &ReviewSubmission::unchanged(&exchange),
        )
        .unwrap_err();
    assert!(matches!(
        domain_error(&err),
        Some(ExchangeError::Forbidden { .. })
    ));

    let err = market
        .service
        .finalize_exchange(exchange.id(), &user("3"))
        .unwrap_err();
    assert!(matches!(
        domain_error(&err),
        Some(ExchangeError::Forbidden { .. })
    ));

    let unchanged = market.service.get_exchange(exchange.id(), &user("2"))?;
    assert_eq!(unchanged, exchange);
    Ok(())
}

#[test]
fn stale_version_is_a_conflict() -> anyhow::Result<()> {
    let market = market("stale_version.db")?;
    let exchange = open_exchange(&market)?;

    let submission = ReviewSubmission::unchanged(&exchange);
    market
        .service
        .submit_review(exchange.id(), &user("2"), &submission)?;
    market.service.switch_reviewer(exchange.id(), &user("1"))?;

    // same submission again, now two versions behind
    let err = market
        .service
        .submit_review(exchange.id(), &user("2"), &submission)
        .unwrap_err();
    assert!(matches!(
        domain_error(&err),
        Some(ExchangeError::Conflict {
            expected: 1,
            found: 3,
            ..
        })
    ));
    assert_eq!(
        market
            .service
            .get_exchange(exchange.id(), &user("2"))?
            .version(),
        3
    );
    Ok(())
}

#[test]
fn switching_requires_a_reason() -> anyhow::Result<()> {
    let market = market("switching.db")?;
    let exchange = open_exchange(&market)?;

    let err = market
        .service
        .switch_reviewer(exchange.id(), &user("2"))
        .unwrap_err();
    assert_eq!(
        domain_error(&err),
        Some(&ExchangeError::Validation(
            ValidationError::NothingRequested
        ))
    );

    let submission = ReviewSubmission {
        offered_records: vec![rec("O1")],
        records_requested_by_receiver: Some(vec![rec("Z")]),
        expected_version: None,
    };
    let exchange = market
        .service
        .submit_review(exchange.id(), &user("2"), &submission)?;

    let err = market
        .service
        .switch_reviewer(exchange.id(), &user("1"))
        .unwrap_err();
    assert_eq!(
        domain_error(&err),
        Some(&ExchangeError::Validation(
            ValidationError::UnresolvedRequests
        ))
    );
    Ok(())
}

#[test]
fn finalize_purges_exchanges_touching_swapped_records() -> anyhow::Result<()> {
    let market = market("finalize_purge.db")?;
    let exchange = open_exchange(&market)?;

    // user 3 wants O1, which is about to change hands
    let competing = market
        .service
        .create_exchange(&user("3"), &rec("O1"), &[rec("T3")])?;
    // and Z, which is not part of the swap
    let unrelated = market
        .service
        .create_exchange(&user("3"), &rec("Z"), &[rec("T4")])?;

    market.service.finalize_exchange(exchange.id(), &user("2"))?;

    let err = market
        .service
        .get_exchange(competing.id(), &user("3"))
        .unwrap_err();
    assert!(matches!(
        domain_error(&err),
        Some(ExchangeError::NotFound(_))
    ));
    assert!(
        market
            .service
            .get_exchange(unrelated.id(), &user("3"))
            .is_ok()
    );
    Ok(())
}

#[test]
fn cancel_is_safe_to_repeat() -> anyhow::Result<()> {
    let market = market("cancel_twice.db")?;
    let exchange = open_exchange(&market)?;

    // the initiator may cancel on the receiver's turn
    let cancelled = market.service.cancel_exchange(exchange.id(), &user("1"))?;
    assert_eq!(cancelled.state().label(), "cancelled");
    assert!(market.service.list_exchanges(&user("1"))?.is_empty());

    let err = market
        .service
        .cancel_exchange(exchange.id(), &user("1"))
        .unwrap_err();
    assert!(matches!(
        domain_error(&err),
        Some(ExchangeError::NotFound(_))
    ));
    Ok(())
}

#[test]
fn completed_exchanges_cannot_be_cancelled() -> anyhow::Result<()> {
    let market = market("cancel_completed.db")?;
    let exchange = open_exchange(&market)?;
    market.service.finalize_exchange(exchange.id(), &user("2"))?;

    let err = market
        .service
        .cancel_exchange(exchange.id(), &user("1"))
        .unwrap_err();
    assert_eq!(
        domain_error(&err),
        Some(&ExchangeError::Validation(
            ValidationError::AlreadyCompleted
        ))
    );

    let err = market
        .service
        .submit_review(
            exchange.id(),
            &user("2"),
            &ReviewSubmission::unchanged(&exchange),
        )
        .unwrap_err();
    assert!(matches!(
        domain_error(&err),
        Some(ExchangeError::NotFound(_))
    ));
    Ok(())
}

#[test]
fn ineligible_requests_are_rejected() -> anyhow::Result<()> {
    let market = market("ineligible.db")?;

    let err = market
        .service
        .create_exchange(&user("2"), &rec("R"), &[rec("O1")])
        .unwrap_err();
    assert!(matches!(
        domain_error(&err),
        Some(ExchangeError::InvalidRequest(_))
    ));

    market.catalog.set_available(&rec("R"), false)?;
    let err = market
        .service
        .create_exchange(&user("1"), &rec("R"), &[rec("O1")])
        .unwrap_err();
    assert!(matches!(
        domain_error(&err),
        Some(ExchangeError::InvalidRequest(_))
    ));

    market.catalog.set_available(&rec("R"), true)?;
    let err = market
        .service
        .create_exchange(&user("1"), &rec("R"), &[])
        .unwrap_err();
    assert!(matches!(
        domain_error(&err),
        Some(ExchangeError::InvalidRequest(_))
    ));
    Ok(())
}

#[test]
fn failed_transfer_leaves_the_exchange_open() -> anyhow::Result<()> {
    let market = market("failed_transfer.db")?;
    let exchange = open_exchange(&market)?;
    let competing = market
        .service
        .create_exchange(&user("3"), &rec("O1"), &[rec("T3")])?;

    let flaky = ExchangeService::new(
        market.db.clone(),
        Arc::new(FlakyCatalog {
            inner: market.catalog.clone(),
            failures: AtomicUsize::new(1),
        }),
    )?;

    let err = flaky
        .finalize_exchange(exchange.id(), &user("2"))
        .unwrap_err();
    assert!(err.to_string().contains("catalog unavailable"));

    // nothing moved and nothing was sealed
    let reopened = market.service.get_exchange(exchange.id(), &user("2"))?;
    assert_eq!(reopened, exchange);
    assert!(!reopened.is_completed());
    assert_eq!(owner(&market.catalog, "R")?, user("2"));
    assert_eq!(owner(&market.catalog, "O1")?, user("1"));
    assert!(
        market
            .service
            .get_exchange(competing.id(), &user("3"))
            .is_ok()
    );

    // once the catalog recovers the same finalize goes through
    let sealed = flaky.finalize_exchange(exchange.id(), &user("2"))?;
    assert!(sealed.is_completed());
    assert_eq!(owner(&market.catalog, "R")?, user("1"));
    assert_eq!(owner(&market.catalog, "O1")?, user("2"));
    Ok(())
}
