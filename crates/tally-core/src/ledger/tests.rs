//! Ledger unit tests.

use chrono::{TimeZone, Utc};
use serde_json::json;

use super::*;
use crate::application::ApplicationRegistry;
use crate::identity::{IdentityResolver, SignalBag, ServerContext};
use crate::policy::AppPolicy;
use crate::store::Store;

struct Fixture {
    store: Store,
    app_id: i64,
}

impl Fixture {
    fn new(shared: bool) -> Self {
        let store = Store::in_memory().expect("failed to create store");
        let reg = ApplicationRegistry::new(store.clone());
        let org = reg.create_org("acme").expect("create org");
        let app = reg
            .create_app(org.id, "landing", shared, &AppPolicy::default())
            .expect("create app");
        Self {
            store,
            app_id: app.id,
        }
    }

    fn identity(&self, primary: &str) -> IdentityId {
        self.identity_in(self.app_id, primary)
    }

    fn identity_in(&self, app_id: i64, primary: &str) -> IdentityId {
        let resolver = IdentityResolver::new(self.store.clone());
        let bag = SignalBag {
            primary: primary.to_string(),
            canvas: None,
            browser_sig: None,
        };
        // Distinct visitors come from distinct addresses; otherwise the
        // server-signal fallback would merge them.
        let ctx = ServerContext {
            client_ip: format!("ip-{primary}"),
            ..ServerContext::default()
        };
        resolver
            .resolve(app_id, &bag, &ctx)
            .expect("resolve identity")
            .identity
            .id
    }

    fn ledger(&self) -> CreditLedger {
        CreditLedger::new(self.store.clone())
    }
}

#[test]
fn balance_is_sum_of_entries() {
    let fx = Fixture::new(false);
    let id = fx.identity("fp-1");
    let ledger = fx.ledger();

    ledger.grant(id, 10, Reason::Invitation, None).expect("grant");
    ledger.grant(id, 5, Reason::Referral, None).expect("grant");
    ledger.debit(id, 3, Reason::Consumed, None).expect("debit");

    assert_eq!(ledger.balance(id).expect("balance"), 12);
}

#[test]
fn debit_stores_negative_amount() {
    let fx = Fixture::new(false);
    let id = fx.identity("fp-1");
    let ledger = fx.ledger();

    let entry = ledger.debit(id, 4, Reason::Consumed, None).expect("debit");
    assert_eq!(entry.amount, -4);
    assert_eq!(entry.reason, Reason::Consumed);
}

#[test]
fn rejects_non_positive_amounts() {
    let fx = Fixture::new(false);
    let id = fx.identity("fp-1");
    let ledger = fx.ledger();

    for amount in [0, -5] {
        let err = ledger.grant(id, amount, Reason::Referral, None).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount { .. }));
        let err = ledger.debit(id, amount, Reason::Consumed, None).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount { .. }));
    }
}

#[test]
fn unknown_identity_is_rejected() {
    let fx = Fixture::new(false);
    let ledger = fx.ledger();
    let err = ledger.grant(999, 5, Reason::Referral, None).unwrap_err();
    assert!(matches!(
        err,
        LedgerError::IdentityNotFound { identity_id: 999 }
    ));
}

#[test]
fn guarded_debit_applies_when_covered() {
    let fx = Fixture::new(false);
    let id = fx.identity("fp-1");
    let ledger = fx.ledger();
    ledger.grant(id, 10, Reason::Invitation, None).expect("grant");

    match ledger
        .guarded_debit(id, 7, Reason::Consumed, None)
        .expect("guarded debit")
    {
        DebitOutcome::Applied { entry } => assert_eq!(entry.amount, -7),
        DebitOutcome::InsufficientCredits { .. } => panic!("balance covered the debit"),
    }
    assert_eq!(ledger.balance(id).expect("balance"), 3);
}

#[test]
fn guarded_debit_refuses_overdraw_without_writing() {
    let fx = Fixture::new(false);
    let id = fx.identity("fp-1");
    let ledger = fx.ledger();
    ledger.grant(id, 5, Reason::Invitation, None).expect("grant");

    match ledger
        .guarded_debit(id, 6, Reason::Consumed, None)
        .expect("guarded debit")
    {
        DebitOutcome::InsufficientCredits { balance } => assert_eq!(balance, 5),
        DebitOutcome::Applied { .. } => panic!("overdraw must not apply"),
    }
    assert_eq!(ledger.balance(id).expect("balance"), 5);
    assert_eq!(ledger.stats().expect("stats").entry_count, 1);
}

#[test]
fn consolidated_balance_pools_shared_apps() {
    let store = Store::in_memory().expect("failed to create store");
    let reg = ApplicationRegistry::new(store.clone());
    let org = reg.create_org("acme").expect("create org");
    let app_a = reg
        .create_app(org.id, "landing", true, &AppPolicy::default())
        .expect("create app");
    let app_b = reg
        .create_app(org.id, "dashboard", true, &AppPolicy::default())
        .expect("create app");

    let fx = Fixture {
        store: store.clone(),
        app_id: app_a.id,
    };
    let id_a = fx.identity_in(app_a.id, "fp-1");
    let id_b = fx.identity_in(app_b.id, "fp-1");

    let ledger = CreditLedger::new(store);
    ledger.grant(id_a, 10, Reason::Invitation, None).expect("grant");
    ledger.grant(id_b, 4, Reason::Referral, None).expect("grant");

    assert_eq!(ledger.balance(id_a).expect("balance"), 10);
    assert_eq!(ledger.consolidated_balance(id_a).expect("pooled"), 14);
    assert_eq!(ledger.consolidated_balance(id_b).expect("pooled"), 14);
}

#[test]
fn consolidated_balance_falls_back_when_isolated() {
    let fx = Fixture::new(false);
    let id = fx.identity("fp-1");
    let ledger = fx.ledger();
    ledger.grant(id, 9, Reason::Invitation, None).expect("grant");

    assert_eq!(ledger.consolidated_balance(id).expect("balance"), 9);
}

#[test]
fn guarded_debit_draws_on_the_pooled_balance() {
    let store = Store::in_memory().expect("failed to create store");
    let reg = ApplicationRegistry::new(store.clone());
    let org = reg.create_org("acme").expect("create org");
    let app_a = reg
        .create_app(org.id, "landing", true, &AppPolicy::default())
        .expect("create app");
    let app_b = reg
        .create_app(org.id, "dashboard", true, &AppPolicy::default())
        .expect("create app");

    let fx = Fixture {
        store: store.clone(),
        app_id: app_a.id,
    };
    let id_a = fx.identity_in(app_a.id, "fp-1");
    let id_b = fx.identity_in(app_b.id, "fp-1");

    let ledger = CreditLedger::new(store);
    ledger.grant(id_b, 10, Reason::Invitation, None).expect("grant");

    // id_a holds nothing itself; the pool covers the debit.
    match ledger
        .guarded_debit(id_a, 6, Reason::Consumed, None)
        .expect("guarded debit")
    {
        DebitOutcome::Applied { entry } => assert_eq!(entry.identity_id, id_a),
        DebitOutcome::InsufficientCredits { .. } => panic!("pool covered the debit"),
    }
    assert_eq!(ledger.consolidated_balance(id_a).expect("pooled"), 4);
}

#[test]
fn entries_page_by_cursor() {
    let fx = Fixture::new(false);
    let id = fx.identity("fp-1");
    let ledger = fx.ledger();
    for i in 1..=5 {
        ledger
            .grant(id, i, Reason::AdminAdjustment, None)
            .expect("grant");
    }

    let first = ledger.entries(id, 0, 2).expect("entries");
    assert_eq!(first.len(), 2);
    let next_cursor = first.last().expect("non-empty").id + 1;
    let rest = ledger.entries(id, next_cursor, 10).expect("entries");
    assert_eq!(rest.len(), 3);
    assert!(first.iter().chain(&rest).all(|e| e.identity_id == id));
}

#[test]
fn metadata_round_trips() {
    let fx = Fixture::new(false);
    let id = fx.identity("fp-1");
    let ledger = fx.ledger();
    let meta = json!({"action": "chat.message", "request_id": "r-17"});
    ledger
        .grant(id, 2, Reason::AdminAdjustment, Some(meta.clone()))
        .expect("grant");

    let entries = ledger.entries(id, 0, 10).expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].metadata.as_ref(), Some(&meta));
}

#[test]
fn stats_aggregate_the_whole_ledger() {
    let fx = Fixture::new(false);
    let a = fx.identity("fp-1");
    let b = fx.identity("fp-2");
    let ledger = fx.ledger();
    ledger.grant(a, 10, Reason::Invitation, None).expect("grant");
    ledger.grant(b, 3, Reason::Referral, None).expect("grant");
    ledger.debit(a, 4, Reason::Consumed, None).expect("debit");

    let stats = ledger.stats().expect("stats");
    assert_eq!(stats.entry_count, 3);
    assert_eq!(stats.identity_count, 2);
    assert_eq!(stats.total_granted, 13);
    assert_eq!(stats.total_debited, -4);
    assert!(stats.max_entry_id >= 3);
}

#[test]
fn explicit_clock_controls_entry_timestamps() {
    let fx = Fixture::new(false);
    let id = fx.identity("fp-1");
    let ledger = fx.ledger();
    let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
    let entry = ledger
        .grant_at(id, 5, Reason::Referral, None, at)
        .expect("grant");
    assert_eq!(entry.created_at_ms, at.timestamp_millis());
}

#[test]
fn reason_tags_round_trip_through_storage_form() {
    for reason in Reason::all() {
        let parsed: Reason = reason.as_str().parse().expect("parse");
        assert_eq!(parsed, *reason);
    }
    assert!("bogus".parse::<Reason>().is_err());
}
