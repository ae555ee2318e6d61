//! Referral claims: issue, visit tracking, redemption.
//!
//! A referral link carries a signed claim token wrapping the referrer's
//! referral code; no server-side state is written until someone follows the
//! link. [`ReferralEngine::track_visit`] keeps pre-claim click counts on a
//! referral row keyed by the token. [`ReferralEngine::redeem_claim`]
//! adjudicates the claim: at most one claimed edge per referred identity,
//! never a self-referral, and a per-referrer daily cap. At the cap the
//! claim is silently dropped: the referred user's request still succeeds,
//! they just stop minting credits for the referrer.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::application::{ApplicationError, load_app};
use crate::identity::{IdentityId, find_by_referral_code, load_identity};
use crate::ledger::{LedgerError, Reason, append_entry};
use crate::store::{Store, StoreError};
use crate::token::{TokenError, TokenSigner};

/// Token kind for referral claim tokens.
pub const CLAIM_TOKEN_KIND: &str = "referral_claim";

/// Milliseconds in one calendar day.
const DAY_MS: i64 = 86_400_000;

/// Identifier for a referral row.
pub type ReferralId = i64;

/// Errors from referral operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReferralError {
    /// Store-level failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Claim token failed verification.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Application registry failure.
    #[error(transparent)]
    Application(#[from] ApplicationError),

    /// Ledger failure while appending the claim grants.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The token's referral code resolves to no identity.
    #[error("unknown referral code: {code}")]
    UnknownReferralCode {
        /// The unresolvable code.
        code: String,
    },

    /// No identity with the given id.
    #[error("identity not found: {identity_id}")]
    IdentityNotFound {
        /// The missing identity id.
        identity_id: IdentityId,
    },
}

impl From<rusqlite::Error> for ReferralError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

/// A referral row: pre-claim (visit tracking only) or claimed.
#[derive(Debug, Clone)]
pub struct Referral {
    /// Row id.
    pub id: ReferralId,
    /// The referrer.
    pub referrer_identity_id: IdentityId,
    /// The referred identity, set at claim time.
    pub referred_identity_id: Option<IdentityId>,
    /// The claim token this row tracks.
    pub claim_token: String,
    /// Link visits observed before the claim.
    pub visit_count: i64,
    /// Claim timestamp, unix milliseconds, once claimed.
    pub claimed_at_ms: Option<i64>,
    /// Creation timestamp, unix milliseconds.
    pub created_at_ms: i64,
}

/// A freshly issued claim token.
#[derive(Debug, Clone)]
pub struct IssuedClaim {
    /// The signed token to embed in the referral link.
    pub token: String,
    /// When the token stops verifying.
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a claim redemption.
///
/// Everything except `Claimed` is a policy or conflict outcome: nothing was
/// written and the caller's request should still succeed.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The edge was created and both grants were appended.
    Claimed {
        /// The claimed referral row.
        referral: Referral,
        /// Credits granted to the referrer.
        referrer_credits: i64,
        /// Credits granted to the referred identity.
        referred_credits: i64,
    },
    /// Referrer and referred are the same identity.
    SelfReferral,
    /// The referred identity already has a claimed edge.
    AlreadyReferred,
    /// The referrer reached the daily cap; the claim is dropped.
    DailyCapReached,
}

/// Issues and adjudicates referral claims.
#[derive(Debug, Clone)]
pub struct ReferralEngine {
    store: Store,
    signer: TokenSigner,
    claim_ttl: Duration,
}

impl ReferralEngine {
    /// Creates an engine with the given claim-token lifetime.
    #[must_use]
    pub fn new(store: Store, signer: TokenSigner, claim_ttl: Duration) -> Self {
        Self {
            store,
            signer,
            claim_ttl,
        }
    }

    /// Issues a claim token for a referral code.
    ///
    /// # Errors
    ///
    /// Returns [`ReferralError::UnknownReferralCode`] when the code resolves
    /// to no identity, or a token error if signing fails.
    pub fn issue_claim(&self, referral_code: &str) -> Result<IssuedClaim, ReferralError> {
        self.issue_claim_at(referral_code, Utc::now())
    }

    /// [`issue_claim`](Self::issue_claim) with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`issue_claim`](Self::issue_claim).
    pub fn issue_claim_at(
        &self,
        referral_code: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedClaim, ReferralError> {
        let referrer = self
            .store
            .read(|conn| find_by_referral_code(conn, referral_code))?
            .ok_or_else(|| ReferralError::UnknownReferralCode {
                code: referral_code.to_string(),
            })?;

        let expires_at = now + self.claim_ttl;
        let token = self
            .signer
            .sign(CLAIM_TOKEN_KIND, referral_code, expires_at)?;
        debug!(
            referrer_identity_id = referrer.id,
            %expires_at,
            "issued referral claim token"
        );
        Ok(IssuedClaim { token, expires_at })
    }

    /// Records a pre-claim link visit.
    ///
    /// Finds or creates the referral row keyed by this claim token and
    /// increments its visit count.
    ///
    /// # Errors
    ///
    /// Returns a token error for an invalid or expired token, or
    /// [`ReferralError::UnknownReferralCode`] when the token's code resolves
    /// to no identity.
    pub fn track_visit(&self, token: &str) -> Result<Referral, ReferralError> {
        self.track_visit_at(token, Utc::now())
    }

    /// [`track_visit`](Self::track_visit) with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`track_visit`](Self::track_visit).
    pub fn track_visit_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Referral, ReferralError> {
        let claims = self.signer.verify(token, CLAIM_TOKEN_KIND, now)?;
        let now_ms = now.timestamp_millis();

        self.store.write_tx(|tx| {
            if let Some(mut referral) = find_unclaimed_by_token(tx, token)? {
                tx.execute(
                    "UPDATE referrals SET visit_count = visit_count + 1 WHERE id = ?1",
                    params![referral.id],
                )?;
                referral.visit_count += 1;
                return Ok(referral);
            }

            let referrer = find_by_referral_code(tx, &claims.subject)?.ok_or_else(|| {
                ReferralError::UnknownReferralCode {
                    code: claims.subject.clone(),
                }
            })?;
            tx.execute(
                "INSERT INTO referrals
                     (referrer_identity_id, claim_token, visit_count, created_at_ms)
                 VALUES (?1, ?2, 1, ?3)",
                params![referrer.id, token, now_ms],
            )?;
            Ok(Referral {
                id: tx.last_insert_rowid(),
                referrer_identity_id: referrer.id,
                referred_identity_id: None,
                claim_token: token.to_string(),
                visit_count: 1,
                claimed_at_ms: None,
                created_at_ms: now_ms,
            })
        })
    }

    /// Redeems a claim token for a referred identity.
    ///
    /// The whole adjudication (duplicate-edge check, daily-cap count, edge
    /// creation and both grants) runs in one immediate transaction, so two
    /// concurrent redemptions for the same referred identity cannot both
    /// claim.
    ///
    /// # Errors
    ///
    /// Returns a token error for an invalid or expired token,
    /// [`ReferralError::UnknownReferralCode`] for an unresolvable code, or
    /// [`ReferralError::IdentityNotFound`] for an unknown referred identity.
    /// Policy outcomes (self-referral, duplicate, cap) are values.
    pub fn redeem_claim(
        &self,
        token: &str,
        referred_identity_id: IdentityId,
    ) -> Result<ClaimOutcome, ReferralError> {
        self.redeem_claim_at(token, referred_identity_id, Utc::now())
    }

    /// [`redeem_claim`](Self::redeem_claim) with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`redeem_claim`](Self::redeem_claim).
    pub fn redeem_claim_at(
        &self,
        token: &str,
        referred_identity_id: IdentityId,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, ReferralError> {
        let claims = self.signer.verify(token, CLAIM_TOKEN_KIND, now)?;
        let now_ms = now.timestamp_millis();

        let outcome = self.store.write_tx(|tx| {
            let referrer = find_by_referral_code(tx, &claims.subject)?.ok_or_else(|| {
                ReferralError::UnknownReferralCode {
                    code: claims.subject.clone(),
                }
            })?;
            if load_identity(tx, referred_identity_id)?.is_none() {
                return Err(ReferralError::IdentityNotFound {
                    identity_id: referred_identity_id,
                });
            }

            if referrer.id == referred_identity_id {
                return Ok(ClaimOutcome::SelfReferral);
            }

            let already_claimed: Option<i64> = tx
                .query_row(
                    "SELECT id FROM referrals WHERE referred_identity_id = ?1",
                    params![referred_identity_id],
                    |row| row.get(0),
                )
                .optional()?;
            if already_claimed.is_some() {
                return Ok(ClaimOutcome::AlreadyReferred);
            }

            let app = load_app(tx, referrer.app_id)?;
            let (day_start, day_end) =
                day_window(now_ms, app.policy.day_boundary_offset_minutes);
            let claimed_today: i64 = tx.query_row(
                "SELECT COUNT(*) FROM referrals
                 WHERE referrer_identity_id = ?1
                   AND claimed_at_ms >= ?2 AND claimed_at_ms < ?3",
                params![referrer.id, day_start, day_end],
                |row| row.get(0),
            )?;
            if claimed_today >= app.policy.daily_referral_cap {
                info!(
                    referrer_identity_id = referrer.id,
                    claimed_today,
                    cap = app.policy.daily_referral_cap,
                    "referral daily cap reached, claim dropped"
                );
                return Ok(ClaimOutcome::DailyCapReached);
            }

            // Adopt the pre-claim visit row for this token when present, so
            // visit counts survive the claim. A shared link's later
            // claimants find no unclaimed row and get their own edge.
            let referral = match find_unclaimed_by_token(tx, token)? {
                Some(mut referral) => {
                    tx.execute(
                        "UPDATE referrals
                         SET referred_identity_id = ?1, claimed_at_ms = ?2
                         WHERE id = ?3",
                        params![referred_identity_id, now_ms, referral.id],
                    )?;
                    referral.referred_identity_id = Some(referred_identity_id);
                    referral.claimed_at_ms = Some(now_ms);
                    referral
                }
                None => {
                    tx.execute(
                        "INSERT INTO referrals
                             (referrer_identity_id, referred_identity_id, claim_token,
                              visit_count, claimed_at_ms, created_at_ms)
                         VALUES (?1, ?2, ?3, 0, ?4, ?4)",
                        params![referrer.id, referred_identity_id, token, now_ms],
                    )?;
                    Referral {
                        id: tx.last_insert_rowid(),
                        referrer_identity_id: referrer.id,
                        referred_identity_id: Some(referred_identity_id),
                        claim_token: token.to_string(),
                        visit_count: 0,
                        claimed_at_ms: Some(now_ms),
                        created_at_ms: now_ms,
                    }
                }
            };

            let metadata = json!({ "referral_id": referral.id });
            if app.policy.referral_credits > 0 {
                append_entry(
                    tx,
                    referrer.id,
                    app.policy.referral_credits,
                    Reason::Referral,
                    Some(metadata.clone()),
                    now_ms,
                )?;
            }
            if app.policy.referred_credits > 0 {
                append_entry(
                    tx,
                    referred_identity_id,
                    app.policy.referred_credits,
                    Reason::Referred,
                    Some(metadata),
                    now_ms,
                )?;
            }

            info!(
                referral_id = referral.id,
                referrer_identity_id = referrer.id,
                referred_identity_id,
                referrer_credits = app.policy.referral_credits,
                referred_credits = app.policy.referred_credits,
                "referral claimed"
            );
            Ok(ClaimOutcome::Claimed {
                referral,
                referrer_credits: app.policy.referral_credits,
                referred_credits: app.policy.referred_credits,
            })
        })?;
        Ok(outcome)
    }
}

/// The calendar-day window containing `now_ms`, with the day boundary at
/// UTC midnight shifted by `offset_minutes`.
pub(crate) fn day_window(now_ms: i64, offset_minutes: i32) -> (i64, i64) {
    let offset_ms = i64::from(offset_minutes) * 60_000;
    let start = now_ms - (now_ms - offset_ms).rem_euclid(DAY_MS);
    (start, start + DAY_MS)
}

/// The pre-claim tracking row for a token. At most one exists.
fn find_unclaimed_by_token(
    conn: &Connection,
    token: &str,
) -> Result<Option<Referral>, StoreError> {
    conn.query_row(
        "SELECT id, referrer_identity_id, referred_identity_id, claim_token,
                visit_count, claimed_at_ms, created_at_ms
         FROM referrals WHERE claim_token = ?1 AND claimed_at_ms IS NULL",
        params![token],
        |row| {
            Ok(Referral {
                id: row.get(0)?,
                referrer_identity_id: row.get(1)?,
                referred_identity_id: row.get(2)?,
                claim_token: row.get(3)?,
                visit_count: row.get(4)?,
                claimed_at_ms: row.get(5)?,
                created_at_ms: row.get(6)?,
            })
        },
    )
    .optional()
    .map_err(StoreError::from)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::application::ApplicationRegistry;
    use crate::identity::{IdentityResolver, SignalBag, ServerContext};
    use crate::ledger::CreditLedger;
    use crate::policy::AppPolicy;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    struct Fixture {
        store: Store,
        app_id: i64,
    }

    impl Fixture {
        fn new(policy: &AppPolicy) -> Self {
            let store = Store::in_memory().expect("failed to create store");
            let reg = ApplicationRegistry::new(store.clone());
            let org = reg.create_org("acme").expect("create org");
            let app = reg
                .create_app(org.id, "landing", false, policy)
                .expect("create app");
            Self {
                store,
                app_id: app.id,
            }
        }

        fn identity(&self, primary: &str) -> crate::identity::Identity {
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
                .resolve(self.app_id, &bag, &ctx)
                .expect("resolve identity")
                .identity
        }

        fn engine(&self) -> ReferralEngine {
            let signer =
                TokenSigner::new(*b"0123456789abcdef0123456789abcdef").expect("valid secret");
            ReferralEngine::new(self.store.clone(), signer, Duration::hours(24))
        }
    }

    #[test]
    fn day_window_floors_to_utc_midnight_by_default() {
        let noon = 3 * DAY_MS + DAY_MS / 2;
        let (start, end) = day_window(noon, 0);
        assert_eq!(start, 3 * DAY_MS);
        assert_eq!(end, 4 * DAY_MS);
    }

    #[test]
    fn day_window_honors_boundary_offset() {
        // Boundary at 02:00: 01:00 belongs to the previous window.
        let one_am = 5 * DAY_MS + 3_600_000;
        let (start, _) = day_window(one_am, 120);
        assert_eq!(start, 4 * DAY_MS + 7_200_000);

        // 03:00 belongs to the new window.
        let three_am = 5 * DAY_MS + 3 * 3_600_000;
        let (start, _) = day_window(three_am, 120);
        assert_eq!(start, 5 * DAY_MS + 7_200_000);
    }

    #[test]
    fn issue_claim_rejects_unknown_code() {
        let fx = Fixture::new(&AppPolicy::default());
        let err = fx.engine().issue_claim("NOPE1234").unwrap_err();
        assert!(matches!(err, ReferralError::UnknownReferralCode { .. }));
    }

    #[test]
    fn track_visit_creates_then_increments() {
        let fx = Fixture::new(&AppPolicy::default());
        let referrer = fx.identity("fp-ref");
        let engine = fx.engine();
        let claim = engine
            .issue_claim_at(&referrer.referral_code, at(0))
            .expect("issue");

        let first = engine.track_visit_at(&claim.token, at(1_000)).expect("visit");
        assert_eq!(first.visit_count, 1);
        assert_eq!(first.referrer_identity_id, referrer.id);
        assert!(first.claimed_at_ms.is_none());

        let second = engine.track_visit_at(&claim.token, at(2_000)).expect("visit");
        assert_eq!(second.id, first.id);
        assert_eq!(second.visit_count, 2);
    }

    #[test]
    fn redeem_adopts_the_visit_row() {
        let fx = Fixture::new(&AppPolicy::default());
        let referrer = fx.identity("fp-ref");
        let referred = fx.identity("fp-new");
        let engine = fx.engine();
        let claim = engine
            .issue_claim_at(&referrer.referral_code, at(0))
            .expect("issue");
        engine.track_visit_at(&claim.token, at(1_000)).expect("visit");
        engine.track_visit_at(&claim.token, at(2_000)).expect("visit");

        match engine
            .redeem_claim_at(&claim.token, referred.id, at(3_000))
            .expect("redeem")
        {
            ClaimOutcome::Claimed { referral, .. } => {
                assert_eq!(referral.visit_count, 2);
                assert_eq!(referral.referred_identity_id, Some(referred.id));
                assert_eq!(referral.claimed_at_ms, Some(3_000));
            }
            other => panic!("expected claim, got {other:?}"),
        }
    }

    #[test]
    fn self_referral_is_dropped_without_credits() {
        let fx = Fixture::new(&AppPolicy::default());
        let referrer = fx.identity("fp-ref");
        let engine = fx.engine();
        let claim = engine
            .issue_claim_at(&referrer.referral_code, at(0))
            .expect("issue");

        let outcome = engine
            .redeem_claim_at(&claim.token, referrer.id, at(1_000))
            .expect("redeem");
        assert!(matches!(outcome, ClaimOutcome::SelfReferral));

        let ledger = CreditLedger::new(fx.store.clone());
        assert_eq!(ledger.balance(referrer.id).expect("balance"), 0);
    }

    #[test]
    fn expired_token_is_rejected() {
        let fx = Fixture::new(&AppPolicy::default());
        let referrer = fx.identity("fp-ref");
        let referred = fx.identity("fp-new");
        let engine = fx.engine();
        let claim = engine
            .issue_claim_at(&referrer.referral_code, at(0))
            .expect("issue");

        let err = engine
            .redeem_claim_at(&claim.token, referred.id, at(DAY_MS + 1))
            .unwrap_err();
        assert!(matches!(err, ReferralError::Token(TokenError::Expired { .. })));
    }

    #[test]
    fn zero_cap_disables_referrals() {
        let mut policy = AppPolicy::default();
        policy.daily_referral_cap = 0;
        let fx = Fixture::new(&policy);
        let referrer = fx.identity("fp-ref");
        let referred = fx.identity("fp-new");
        let engine = fx.engine();
        let claim = engine
            .issue_claim_at(&referrer.referral_code, at(0))
            .expect("issue");

        let outcome = engine
            .redeem_claim_at(&claim.token, referred.id, at(1_000))
            .expect("redeem");
        assert!(matches!(outcome, ClaimOutcome::DailyCapReached));
    }
}
