//! End-to-end referral claim flows.

use std::thread;

use tally_core::config::EngineConfig;
use tally_core::engine::Engine;
use tally_core::identity::{Identity, ServerContext, SignalBag};
use tally_core::policy::AppPolicy;
use tally_core::referral::ClaimOutcome;

const SECRET_TOML: &str = "claim_token_secret_hex = \"30313233343536373839616263646566\"";

fn engine() -> Engine {
    let config = EngineConfig::from_toml(SECRET_TOML).expect("config parses");
    Engine::in_memory(&config).expect("engine opens")
}

fn app_with_policy(engine: &Engine, policy: &AppPolicy) -> i64 {
    let org = engine.create_org("acme").expect("create org");
    engine
        .create_app(org.id, "landing", false, policy)
        .expect("create app")
        .id
}

fn resolve(engine: &Engine, app_id: i64, primary: &str) -> Identity {
    // Distinct visitors come from distinct addresses; otherwise the
    // server-signal fallback would merge them.
    let ctx = ServerContext {
        client_ip: format!("ip-{primary}"),
        ..ServerContext::default()
    };
    engine
        .resolve_identity(
            app_id,
            &SignalBag {
                primary: primary.to_string(),
                canvas: None,
                browser_sig: None,
            },
            &ctx,
        )
        .expect("resolve")
        .identity
}

fn referral_policy() -> AppPolicy {
    let mut policy = AppPolicy::default();
    policy.referral_credits = 5;
    policy.referred_credits = 3;
    policy.daily_referral_cap = 2;
    policy
}

#[test]
fn successful_claim_grants_both_sides_once() {
    let engine = engine();
    let app_id = app_with_policy(&engine, &referral_policy());
    let referrer = resolve(&engine, app_id, "fp-ref");
    let referred = resolve(&engine, app_id, "fp-new");

    let claim = engine
        .issue_referral_claim(&referrer.referral_code)
        .expect("issue");
    let outcome = engine
        .redeem_referral_claim(&claim.token, referred.id)
        .expect("redeem");

    match outcome {
        ClaimOutcome::Claimed {
            referrer_credits,
            referred_credits,
            ..
        } => {
            assert_eq!(referrer_credits, 5);
            assert_eq!(referred_credits, 3);
        }
        other => panic!("expected claim, got {other:?}"),
    }
    assert_eq!(engine.get_balance(referrer.id, false).expect("balance"), 5);
    assert_eq!(engine.get_balance(referred.id, false).expect("balance"), 3);
}

#[test]
fn repeat_claim_for_same_referred_identity_is_a_noop() {
    let engine = engine();
    let app_id = app_with_policy(&engine, &referral_policy());
    let referrer = resolve(&engine, app_id, "fp-ref");
    let other = resolve(&engine, app_id, "fp-other");
    let referred = resolve(&engine, app_id, "fp-new");

    let claim = engine
        .issue_referral_claim(&referrer.referral_code)
        .expect("issue");
    engine
        .redeem_referral_claim(&claim.token, referred.id)
        .expect("redeem");

    // Same token again, and a different referrer's token: both dropped.
    let outcome = engine
        .redeem_referral_claim(&claim.token, referred.id)
        .expect("redeem");
    assert!(matches!(outcome, ClaimOutcome::AlreadyReferred));

    let other_claim = engine
        .issue_referral_claim(&other.referral_code)
        .expect("issue");
    let outcome = engine
        .redeem_referral_claim(&other_claim.token, referred.id)
        .expect("redeem");
    assert!(matches!(outcome, ClaimOutcome::AlreadyReferred));

    assert_eq!(engine.get_balance(referrer.id, false).expect("balance"), 5);
    assert_eq!(engine.get_balance(other.id, false).expect("balance"), 0);
    assert_eq!(engine.get_balance(referred.id, false).expect("balance"), 3);
}

#[test]
fn self_referral_never_claims() {
    let engine = engine();
    let app_id = app_with_policy(&engine, &referral_policy());
    let referrer = resolve(&engine, app_id, "fp-ref");

    let claim = engine
        .issue_referral_claim(&referrer.referral_code)
        .expect("issue");
    let outcome = engine
        .redeem_referral_claim(&claim.token, referrer.id)
        .expect("redeem");
    assert!(matches!(outcome, ClaimOutcome::SelfReferral));
    assert_eq!(engine.get_balance(referrer.id, false).expect("balance"), 0);
}

#[test]
fn third_claim_of_the_day_is_silently_dropped() {
    use chrono::{Duration, TimeZone, Utc};
    use tally_core::application::ApplicationRegistry;
    use tally_core::identity::{IdentityResolver, ServerContext, SignalBag};
    use tally_core::ledger::CreditLedger;
    use tally_core::referral::ReferralEngine;
    use tally_core::store::Store;
    use tally_core::token::TokenSigner;

    // Driven with an explicit clock so the cap window is deterministic.
    let store = Store::in_memory().expect("store");
    let reg = ApplicationRegistry::new(store.clone());
    let org = reg.create_org("acme").expect("org");
    let app = reg
        .create_app(org.id, "landing", false, &referral_policy())
        .expect("app");
    let resolver = IdentityResolver::new(store.clone());
    let identity = |primary: &str| {
        let ctx = ServerContext {
            client_ip: format!("ip-{primary}"),
            ..ServerContext::default()
        };
        resolver
            .resolve(
                app.id,
                &SignalBag {
                    primary: primary.to_string(),
                    canvas: None,
                    browser_sig: None,
                },
                &ctx,
            )
            .expect("resolve")
            .identity
    };
    let referrer = identity("fp-ref");
    let signer = TokenSigner::new(*b"0123456789abcdef0123456789abcdef").expect("signer");
    let referrals = ReferralEngine::new(store.clone(), signer, Duration::hours(24));
    let ledger = CreditLedger::new(store);
    let noon = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

    // Claims 1..cap succeed.
    for i in 0..2 {
        let referred = identity(&format!("fp-new-{i}"));
        let claim = referrals
            .issue_claim_at(&referrer.referral_code, noon)
            .expect("issue");
        let at = noon + Duration::minutes(i);
        let outcome = referrals
            .redeem_claim_at(&claim.token, referred.id, at)
            .expect("redeem");
        assert!(matches!(outcome, ClaimOutcome::Claimed { .. }), "claim {i}");
    }
    assert_eq!(ledger.balance(referrer.id).expect("balance"), 10);

    // The (cap+1)-th claim the same day drops without credits on either
    // side.
    let unlucky = identity("fp-unlucky");
    let claim = referrals
        .issue_claim_at(&referrer.referral_code, noon)
        .expect("issue");
    let outcome = referrals
        .redeem_claim_at(&claim.token, unlucky.id, noon + Duration::hours(1))
        .expect("redeem");
    assert!(matches!(outcome, ClaimOutcome::DailyCapReached));
    assert_eq!(ledger.balance(referrer.id).expect("balance"), 10);
    assert_eq!(ledger.balance(unlucky.id).expect("balance"), 0);

    // The window rolls over at the day boundary and claims flow again.
    let claim = referrals
        .issue_claim_at(&referrer.referral_code, noon + Duration::hours(13))
        .expect("issue");
    let outcome = referrals
        .redeem_claim_at(&claim.token, unlucky.id, noon + Duration::hours(13))
        .expect("redeem");
    assert!(matches!(outcome, ClaimOutcome::Claimed { .. }));
    assert_eq!(ledger.balance(referrer.id).expect("balance"), 15);
}

#[test]
fn one_shared_link_serves_multiple_referred_identities() {
    let engine = engine();
    let app_id = app_with_policy(&engine, &referral_policy());
    let referrer = resolve(&engine, app_id, "fp-ref");
    let x = resolve(&engine, app_id, "fp-x");
    let y = resolve(&engine, app_id, "fp-y");

    // One link, one token, two people complete the qualifying action.
    let claim = engine
        .issue_referral_claim(&referrer.referral_code)
        .expect("issue");
    for referred in [&x, &y] {
        let outcome = engine
            .redeem_referral_claim(&claim.token, referred.id)
            .expect("redeem");
        assert!(matches!(outcome, ClaimOutcome::Claimed { .. }));
    }

    assert_eq!(engine.get_balance(referrer.id, false).expect("balance"), 10);
    assert_eq!(engine.get_balance(x.id, false).expect("balance"), 3);
    assert_eq!(engine.get_balance(y.id, false).expect("balance"), 3);
}

#[test]
fn visits_tracked_before_the_claim_survive_it() {
    let engine = engine();
    let app_id = app_with_policy(&engine, &referral_policy());
    let referrer = resolve(&engine, app_id, "fp-ref");
    let referred = resolve(&engine, app_id, "fp-new");

    let claim = engine
        .issue_referral_claim(&referrer.referral_code)
        .expect("issue");
    for _ in 0..3 {
        engine.track_referral_visit(&claim.token).expect("visit");
    }

    match engine
        .redeem_referral_claim(&claim.token, referred.id)
        .expect("redeem")
    {
        ClaimOutcome::Claimed { referral, .. } => {
            assert_eq!(referral.visit_count, 3);
            assert!(referral.claimed_at_ms.is_some());
        }
        other => panic!("expected claim, got {other:?}"),
    }
}

#[test]
fn concurrent_redemptions_claim_exactly_once() {
    let engine = engine();
    let app_id = app_with_policy(&engine, &referral_policy());
    let referrer = resolve(&engine, app_id, "fp-ref");
    let referred = resolve(&engine, app_id, "fp-new");

    let claim = engine
        .issue_referral_claim(&referrer.referral_code)
        .expect("issue");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let token = claim.token.clone();
            let referred_id = referred.id;
            thread::spawn(move || {
                engine
                    .redeem_referral_claim(&token, referred_id)
                    .expect("redeem")
            })
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let claimed = outcomes
        .iter()
        .filter(|o| matches!(o, ClaimOutcome::Claimed { .. }))
        .count();
    assert_eq!(claimed, 1, "exactly one concurrent redemption may claim");
    assert!(
        outcomes
            .iter()
            .all(|o| matches!(o, ClaimOutcome::Claimed { .. } | ClaimOutcome::AlreadyReferred)),
        "losers must observe the existing edge"
    );

    // Credits moved exactly once per side.
    assert_eq!(engine.get_balance(referrer.id, false).expect("balance"), 5);
    assert_eq!(engine.get_balance(referred.id, false).expect("balance"), 3);
}
