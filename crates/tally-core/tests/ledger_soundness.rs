//! Ledger soundness: balances are always the sum of the entry log, under
//! arbitrary and under interleaved concurrent operation sequences.

use std::thread;

use proptest::prelude::*;
use tally_core::application::ApplicationRegistry;
use tally_core::identity::{IdentityResolver, ServerContext, SignalBag};
use tally_core::ledger::{CreditLedger, DebitOutcome, Reason};
use tally_core::policy::AppPolicy;
use tally_core::store::Store;

fn fixture() -> (Store, i64) {
    let store = Store::in_memory().expect("failed to create store");
    let reg = ApplicationRegistry::new(store.clone());
    let org = reg.create_org("acme").expect("create org");
    let app = reg
        .create_app(org.id, "landing", false, &AppPolicy::default())
        .expect("create app");
    let resolver = IdentityResolver::new(store.clone());
    let identity_id = resolver
        .resolve(
            app.id,
            &SignalBag {
                primary: "fp-1".to_string(),
                canvas: None,
                browser_sig: None,
            },
            &ServerContext::default(),
        )
        .expect("resolve")
        .identity
        .id;
    (store, identity_id)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn balance_equals_entry_sum_for_any_sequence(
        ops in prop::collection::vec((any::<bool>(), 1..50i64), 1..40)
    ) {
        let (store, identity_id) = fixture();
        let ledger = CreditLedger::new(store);

        let mut expected: i64 = 0;
        for (is_grant, amount) in ops {
            if is_grant {
                ledger
                    .grant(identity_id, amount, Reason::AdminAdjustment, None)
                    .expect("grant");
                expected += amount;
            } else {
                ledger
                    .debit(identity_id, amount, Reason::Consumed, None)
                    .expect("debit");
                expected -= amount;
            }
        }

        prop_assert_eq!(ledger.balance(identity_id).expect("balance"), expected);

        let replayed: i64 = ledger
            .entries(identity_id, 0, u32::MAX)
            .expect("entries")
            .iter()
            .map(|e| e.amount)
            .sum();
        prop_assert_eq!(replayed, expected);
    }
}

#[test]
fn interleaved_appends_lose_nothing() {
    let (store, identity_id) = fixture();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let ledger = CreditLedger::new(store.clone());
            thread::spawn(move || {
                for i in 1..=25i64 {
                    if (t + i) % 3 == 0 {
                        ledger
                            .debit(identity_id, i, Reason::Consumed, None)
                            .expect("debit");
                    } else {
                        ledger
                            .grant(identity_id, i, Reason::AdminAdjustment, None)
                            .expect("grant");
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let ledger = CreditLedger::new(store);
    let entries = ledger.entries(identity_id, 0, u32::MAX).expect("entries");
    assert_eq!(entries.len(), 100, "every append must land");
    let sum: i64 = entries.iter().map(|e| e.amount).sum();
    assert_eq!(ledger.balance(identity_id).expect("balance"), sum);
}

#[test]
fn concurrent_guarded_debits_never_overdraw() {
    let (store, identity_id) = fixture();
    let ledger = CreditLedger::new(store.clone());
    ledger
        .grant(identity_id, 10, Reason::AdminAdjustment, None)
        .expect("grant");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ledger = CreditLedger::new(store.clone());
            thread::spawn(move || {
                ledger
                    .guarded_debit(identity_id, 3, Reason::Consumed, None)
                    .expect("guarded debit")
            })
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let applied = outcomes
        .iter()
        .filter(|o| matches!(o, DebitOutcome::Applied { .. }))
        .count();

    // 10 credits cover exactly three debits of 3.
    assert_eq!(applied, 3);
    assert_eq!(ledger.balance(identity_id).expect("balance"), 1);
}

#[test]
fn balances_survive_reopening_the_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tally.db");

    let identity_id = {
        let store = Store::open(&path).expect("open");
        let reg = ApplicationRegistry::new(store.clone());
        let org = reg.create_org("acme").expect("create org");
        let app = reg
            .create_app(org.id, "landing", false, &AppPolicy::default())
            .expect("create app");
        let resolver = IdentityResolver::new(store.clone());
        let identity_id = resolver
            .resolve(
                app.id,
                &SignalBag {
                    primary: "fp-1".to_string(),
                    canvas: None,
                    browser_sig: None,
                },
                &ServerContext::default(),
            )
            .expect("resolve")
            .identity
            .id;
        let ledger = CreditLedger::new(store);
        ledger
            .grant(identity_id, 42, Reason::AdminAdjustment, None)
            .expect("grant");
        identity_id
    };

    let store = Store::open(&path).expect("reopen");
    let ledger = CreditLedger::new(store);
    assert_eq!(ledger.balance(identity_id).expect("balance"), 42);
}
