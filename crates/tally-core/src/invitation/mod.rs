//! Waitlist entries and invitation codes.
//!
//! A waitlist entry may carry one bounded-use, expiring invitation code.
//! Redeeming a valid code resolves (or creates) the redeeming identity,
//! promotes the entry to accepted, records the redemption, upserts a
//! verified lead from the entry's email and grants the one-time invitation
//! bonus, all in one transaction, so a crash mid-redemption cannot leave
//! the use count bumped without the matching grant or vice versa.
//!
//! A repeat redemption by the same resolved identity is answered with
//! `AlreadyRedeemed` instead of `Exhausted`, so a retried client request
//! stays harmless.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::application::{AppId, ApplicationError, load_app};
use crate::identity::{
    CodeTuning, IdentityError, IdentityId, ServerContext, SignalBag, resolve_in_tx,
};
use crate::ledger::{LedgerError, Reason, append_entry, has_entry_with_reason};
use crate::store::{Store, StoreError};

/// Identifier for a waitlist entry row.
pub type WaitlistEntryId = i64;

/// Invitation-code alphabet. Same confusable-free set as referral codes.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Default invitation-code length.
const DEFAULT_CODE_LENGTH: usize = 6;

/// Errors from waitlist and invitation operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvitationError {
    /// Store-level failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Application registry failure.
    #[error(transparent)]
    Application(#[from] ApplicationError),

    /// Identity resolution failure.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Ledger failure while appending the bonus grant.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// A request parameter failed validation.
    #[error("invalid request: {reason}")]
    Invalid {
        /// Why the request was rejected.
        reason: String,
    },

    /// No waitlist entry with the given id.
    #[error("waitlist entry not found: {entry_id}")]
    EntryNotFound {
        /// The missing entry id.
        entry_id: WaitlistEntryId,
    },

    /// No waitlist entry carries the given code.
    #[error("unknown invitation code: {code}")]
    UnknownCode {
        /// The unresolvable code.
        code: String,
    },

    /// Invitation-code generation kept colliding until the retry budget was
    /// spent.
    #[error("invitation code generation exhausted after {attempts} attempts")]
    CodeGenerationExhausted {
        /// How many candidate codes were tried.
        attempts: u32,
    },
}

impl From<rusqlite::Error> for InvitationError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

/// Waitlist entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitlistStatus {
    /// On the list, no invitation yet.
    Waiting,
    /// An invitation code was generated.
    Invited,
    /// A code was redeemed against this entry.
    Accepted,
}

impl WaitlistStatus {
    /// The stored string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Invited => "invited",
            Self::Accepted => "accepted",
        }
    }

    fn parse(s: &str) -> Result<Self, InvitationError> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "invited" => Ok(Self::Invited),
            "accepted" => Ok(Self::Accepted),
            other => Err(InvitationError::Invalid {
                reason: format!("unknown waitlist status: {other}"),
            }),
        }
    }
}

/// A waitlist entry row.
#[derive(Debug, Clone)]
pub struct WaitlistEntry {
    /// Row id.
    pub id: WaitlistEntryId,
    /// Owning application.
    pub app_id: AppId,
    /// The joiner's email, unique within the application.
    pub email: String,
    /// Entry status.
    pub status: WaitlistStatus,
    /// Identity that joined or redeemed, when known.
    pub identity_id: Option<IdentityId>,
    /// The entry's invitation code, once generated.
    pub invitation_code: Option<String>,
    /// Code expiry, unix milliseconds.
    pub code_expires_at_ms: Option<i64>,
    /// Maximum redemptions for the code.
    pub code_max_uses: i64,
    /// Redemptions so far.
    pub code_use_count: i64,
    /// Creation timestamp, unix milliseconds.
    pub created_at_ms: i64,
}

/// A freshly generated invitation code.
#[derive(Debug, Clone)]
pub struct GeneratedCode {
    /// The code to send to the invitee.
    pub code: String,
    /// When the code stops redeeming.
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a code redemption.
#[derive(Debug, Clone)]
pub enum RedemptionOutcome {
    /// The code was redeemed and the bonus granted.
    Redeemed {
        /// The redeeming identity.
        identity_id: IdentityId,
        /// Credits granted.
        credits_awarded: i64,
    },
    /// The same identity already redeemed this code. Nothing was written.
    AlreadyRedeemed {
        /// The previously redeeming identity.
        identity_id: IdentityId,
    },
    /// The code is past its expiry.
    Expired,
    /// The code's use budget is spent.
    Exhausted,
}

/// Outcome of a waitlist join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// The (existing or new) waitlist entry.
    pub entry: WaitlistEntry,
    /// The joining identity.
    pub identity_id: IdentityId,
    /// Whether this join created the entry.
    pub created: bool,
    /// Join bonus granted by this call, zero on replays.
    pub credits_awarded: i64,
}

/// Generates and redeems invitation codes, and manages waitlist joins.
#[derive(Debug, Clone)]
pub struct InvitationCodeManager {
    store: Store,
    code_length: usize,
    code_attempts: u32,
    identity_tuning: CodeTuning,
}

impl InvitationCodeManager {
    /// Creates a manager with default tuning.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            code_length: DEFAULT_CODE_LENGTH,
            code_attempts: 5,
            identity_tuning: CodeTuning::default(),
        }
    }

    /// Overrides the invitation-code length.
    #[must_use]
    pub fn with_code_length(mut self, length: usize) -> Self {
        self.code_length = length;
        self
    }

    /// Overrides the referral-code tuning used when redemption creates an
    /// identity.
    #[must_use]
    pub fn with_identity_tuning(mut self, tuning: CodeTuning) -> Self {
        self.identity_tuning = tuning;
        self
    }

    /// Adds an email to an application's waitlist, resolving the joiner's
    /// identity and paying the join bonus once.
    ///
    /// Joining twice with the same email returns the existing entry without
    /// a second bonus.
    ///
    /// # Errors
    ///
    /// Returns [`InvitationError::Invalid`] for a malformed email, or
    /// resolution/store errors.
    pub fn join_waitlist(
        &self,
        app_id: AppId,
        email: &str,
        signals: &SignalBag,
        ctx: &ServerContext,
    ) -> Result<JoinOutcome, InvitationError> {
        self.join_waitlist_at(app_id, email, signals, ctx, Utc::now())
    }

    /// [`join_waitlist`](Self::join_waitlist) with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`join_waitlist`](Self::join_waitlist).
    pub fn join_waitlist_at(
        &self,
        app_id: AppId,
        email: &str,
        signals: &SignalBag,
        ctx: &ServerContext,
        now: DateTime<Utc>,
    ) -> Result<JoinOutcome, InvitationError> {
        let email = normalize_email(email)?;
        signals.validate()?;
        let now_ms = now.timestamp_millis();
        let server_signal = ctx.derived_signal();
        let identity_tuning = self.identity_tuning;

        self.store.write_tx(|tx| {
            let app = load_app(tx, app_id)?;
            let resolution =
                resolve_in_tx(tx, &app, signals, &server_signal, identity_tuning, now_ms)?;
            let identity_id = resolution.identity.id;

            if let Some(entry) = find_entry_by_email(tx, app_id, &email)? {
                return Ok(JoinOutcome {
                    entry,
                    identity_id,
                    created: false,
                    credits_awarded: 0,
                });
            }

            tx.execute(
                "INSERT INTO waitlist_entries (app_id, email, identity_id, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![app_id, email, identity_id, now_ms],
            )?;
            let entry_id = tx.last_insert_rowid();

            let mut credits_awarded = 0;
            if app.policy.waitlist_join_credits > 0
                && !has_entry_with_reason(tx, identity_id, Reason::WaitlistJoin)?
            {
                append_entry(
                    tx,
                    identity_id,
                    app.policy.waitlist_join_credits,
                    Reason::WaitlistJoin,
                    Some(json!({ "waitlist_entry_id": entry_id })),
                    now_ms,
                )?;
                credits_awarded = app.policy.waitlist_join_credits;
            }

            info!(app_id, entry_id, identity_id, credits_awarded, "waitlist join");
            let entry = find_entry(tx, entry_id)?
                .ok_or(InvitationError::EntryNotFound { entry_id })?;
            Ok(JoinOutcome {
                entry,
                identity_id,
                created: true,
                credits_awarded,
            })
        })
    }

    /// Attaches a fresh invitation code to a waitlist entry.
    ///
    /// Replaces any previous code on the entry and resets nothing else; the
    /// use count keeps counting against the new `max_uses`.
    ///
    /// # Errors
    ///
    /// Returns [`InvitationError::EntryNotFound`] for an unknown entry,
    /// [`InvitationError::Invalid`] for non-positive expiry or use budget,
    /// or [`InvitationError::CodeGenerationExhausted`] when no free code was
    /// found.
    pub fn generate(
        &self,
        entry_id: WaitlistEntryId,
        expiry_days: i64,
        max_uses: i64,
    ) -> Result<GeneratedCode, InvitationError> {
        self.generate_at(entry_id, expiry_days, max_uses, Utc::now())
    }

    /// [`generate`](Self::generate) with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`generate`](Self::generate).
    pub fn generate_at(
        &self,
        entry_id: WaitlistEntryId,
        expiry_days: i64,
        max_uses: i64,
        now: DateTime<Utc>,
    ) -> Result<GeneratedCode, InvitationError> {
        if expiry_days <= 0 {
            return Err(InvitationError::Invalid {
                reason: format!("expiry_days must be positive, got {expiry_days}"),
            });
        }
        if max_uses <= 0 {
            return Err(InvitationError::Invalid {
                reason: format!("max_uses must be positive, got {max_uses}"),
            });
        }
        let expires_at = now + Duration::days(expiry_days);
        let code_length = self.code_length;
        let code_attempts = self.code_attempts;

        let code = self.store.write_tx(|tx| {
            if find_entry(tx, entry_id)?.is_none() {
                return Err(InvitationError::EntryNotFound { entry_id });
            }
            let code = generate_invite_code(tx, code_length, code_attempts)?;
            tx.execute(
                "UPDATE waitlist_entries
                 SET invitation_code = ?1, code_expires_at_ms = ?2, code_max_uses = ?3,
                     status = ?4
                 WHERE id = ?5",
                params![
                    code,
                    expires_at.timestamp_millis(),
                    max_uses,
                    WaitlistStatus::Invited.as_str(),
                    entry_id
                ],
            )?;
            Ok(code)
        })?;

        debug!(entry_id, %expires_at, max_uses, "generated invitation code");
        Ok(GeneratedCode { code, expires_at })
    }

    /// Redeems an invitation code.
    ///
    /// # Errors
    ///
    /// Returns [`InvitationError::UnknownCode`] for a code no entry carries,
    /// or resolution/store errors. Expired, exhausted and replayed codes are
    /// outcomes, not errors.
    pub fn redeem(
        &self,
        code: &str,
        signals: &SignalBag,
        ctx: &ServerContext,
    ) -> Result<RedemptionOutcome, InvitationError> {
        self.redeem_at(code, signals, ctx, Utc::now())
    }

    /// [`redeem`](Self::redeem) with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`redeem`](Self::redeem).
    pub fn redeem_at(
        &self,
        code: &str,
        signals: &SignalBag,
        ctx: &ServerContext,
        now: DateTime<Utc>,
    ) -> Result<RedemptionOutcome, InvitationError> {
        signals.validate()?;
        let now_ms = now.timestamp_millis();
        let server_signal = ctx.derived_signal();
        let identity_tuning = self.identity_tuning;

        let outcome = self.store.write_tx(|tx| -> Result<RedemptionOutcome, InvitationError> {
            let entry = find_entry_by_code(tx, code)?.ok_or_else(|| {
                InvitationError::UnknownCode {
                    code: code.to_string(),
                }
            })?;

            // Expiry beats everything, including replays.
            let expired = entry.code_expires_at_ms.map_or(true, |at| now_ms >= at);
            if expired {
                return Ok(RedemptionOutcome::Expired);
            }

            let app = load_app(tx, entry.app_id)?;
            let resolution =
                resolve_in_tx(tx, &app, signals, &server_signal, identity_tuning, now_ms)?;
            let identity_id = resolution.identity.id;

            let replay: Option<i64> = tx
                .query_row(
                    "SELECT id FROM invitation_redemptions
                     WHERE waitlist_entry_id = ?1 AND identity_id = ?2",
                    params![entry.id, identity_id],
                    |row| row.get(0),
                )
                .optional()?;
            if replay.is_some() {
                return Ok(RedemptionOutcome::AlreadyRedeemed { identity_id });
            }

            if entry.code_use_count >= entry.code_max_uses {
                return Ok(RedemptionOutcome::Exhausted);
            }

            tx.execute(
                "UPDATE waitlist_entries
                 SET status = ?1, code_use_count = code_use_count + 1,
                     identity_id = COALESCE(identity_id, ?2)
                 WHERE id = ?3",
                params![WaitlistStatus::Accepted.as_str(), identity_id, entry.id],
            )?;
            tx.execute(
                "INSERT INTO invitation_redemptions
                     (waitlist_entry_id, identity_id, created_at_ms)
                 VALUES (?1, ?2, ?3)",
                params![entry.id, identity_id, now_ms],
            )?;
            tx.execute(
                "INSERT INTO leads (app_id, email, verified, identity_id, created_at_ms)
                 VALUES (?1, ?2, 1, ?3, ?4)
                 ON CONFLICT (app_id, email)
                 DO UPDATE SET verified = 1, identity_id = excluded.identity_id",
                params![entry.app_id, entry.email, identity_id, now_ms],
            )?;

            let credits_awarded = app.policy.invitation_credits;
            if credits_awarded > 0 {
                append_entry(
                    tx,
                    identity_id,
                    credits_awarded,
                    Reason::Invitation,
                    Some(json!({ "waitlist_entry_id": entry.id })),
                    now_ms,
                )?;
            }

            info!(
                entry_id = entry.id,
                identity_id, credits_awarded, "invitation code redeemed"
            );
            Ok(RedemptionOutcome::Redeemed {
                identity_id,
                credits_awarded,
            })
        })?;
        Ok(outcome)
    }

    /// Loads a waitlist entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`InvitationError::EntryNotFound`] for an unknown id.
    pub fn entry(&self, entry_id: WaitlistEntryId) -> Result<WaitlistEntry, InvitationError> {
        self.store
            .read(|conn| match find_entry(conn, entry_id) {
                Ok(entry) => Ok(Ok(entry)),
                Err(InvitationError::Store(err)) => Err(err),
                Err(other) => Ok(Err(other)),
            })??
            .ok_or(InvitationError::EntryNotFound { entry_id })
    }
}

fn normalize_email(email: &str) -> Result<String, InvitationError> {
    let email = email.trim().to_ascii_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(InvitationError::Invalid {
            reason: "email must contain '@'".to_string(),
        });
    }
    Ok(email)
}

fn generate_invite_code(
    conn: &Connection,
    length: usize,
    attempts: u32,
) -> Result<String, InvitationError> {
    use rand::Rng;
    let mut attempt: u32 = 0;
    loop {
        if attempt >= attempts {
            return Err(InvitationError::CodeGenerationExhausted { attempts: attempt });
        }
        attempt += 1;
        let candidate: String = {
            let mut rng = rand::thread_rng();
            (0..length)
                .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
                .collect()
        };
        let taken: Option<i64> = conn
            .query_row(
                "SELECT id FROM waitlist_entries WHERE invitation_code = ?1",
                params![candidate],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)?;
        if taken.is_none() {
            return Ok(candidate);
        }
        debug!(attempt, "invitation code collision, retrying");
    }
}

const ENTRY_COLUMNS: &str = "id, app_id, email, status, identity_id, invitation_code, \
                             code_expires_at_ms, code_max_uses, code_use_count, created_at_ms";

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(WaitlistEntry, String)> {
    let status: String = row.get(3)?;
    Ok((
        WaitlistEntry {
            id: row.get(0)?,
            app_id: row.get(1)?,
            email: row.get(2)?,
            status: WaitlistStatus::Waiting,
            identity_id: row.get(4)?,
            invitation_code: row.get(5)?,
            code_expires_at_ms: row.get(6)?,
            code_max_uses: row.get(7)?,
            code_use_count: row.get(8)?,
            created_at_ms: row.get(9)?,
        },
        status,
    ))
}

fn finish_entry(parts: Option<(WaitlistEntry, String)>) -> Result<Option<WaitlistEntry>, InvitationError> {
    parts
        .map(|(mut entry, status)| {
            entry.status = WaitlistStatus::parse(&status)?;
            Ok(entry)
        })
        .transpose()
}

fn find_entry(
    conn: &Connection,
    entry_id: WaitlistEntryId,
) -> Result<Option<WaitlistEntry>, InvitationError> {
    let parts = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM waitlist_entries WHERE id = ?1"),
            params![entry_id],
            row_to_entry,
        )
        .optional()
        .map_err(StoreError::from)?;
    finish_entry(parts)
}

fn find_entry_by_code(
    conn: &Connection,
    code: &str,
) -> Result<Option<WaitlistEntry>, InvitationError> {
    let parts = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM waitlist_entries WHERE invitation_code = ?1"),
            params![code],
            row_to_entry,
        )
        .optional()
        .map_err(StoreError::from)?;
    finish_entry(parts)
}

fn find_entry_by_email(
    conn: &Connection,
    app_id: AppId,
    email: &str,
) -> Result<Option<WaitlistEntry>, InvitationError> {
    let parts = conn
        .query_row(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM waitlist_entries
                 WHERE app_id = ?1 AND email = ?2"
            ),
            params![app_id, email],
            row_to_entry,
        )
        .optional()
        .map_err(StoreError::from)?;
    finish_entry(parts)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::application::ApplicationRegistry;
    use crate::ledger::CreditLedger;
    use crate::policy::AppPolicy;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn signals(primary: &str) -> SignalBag {
        SignalBag {
            primary: primary.to_string(),
            canvas: None,
            browser_sig: None,
        }
    }

    struct Fixture {
        store: Store,
        app_id: AppId,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Store::in_memory().expect("failed to create store");
            let reg = ApplicationRegistry::new(store.clone());
            let org = reg.create_org("acme").expect("create org");
            let app = reg
                .create_app(org.id, "landing", false, &AppPolicy::default())
                .expect("create app");
            Self {
                store,
                app_id: app.id,
            }
        }

        fn manager(&self) -> InvitationCodeManager {
            InvitationCodeManager::new(self.store.clone())
        }
    }

    #[test]
    fn join_creates_entry_and_pays_once() {
        let fx = Fixture::new();
        let mgr = fx.manager();
        let ctx = ServerContext::default();

        let join = mgr
            .join_waitlist_at(fx.app_id, "User@Example.com", &signals("fp-1"), &ctx, at(0))
            .expect("join");
        assert!(join.created);
        assert_eq!(join.entry.email, "user@example.com");
        assert_eq!(
            join.credits_awarded,
            AppPolicy::default().waitlist_join_credits
        );

        let replay = mgr
            .join_waitlist_at(fx.app_id, "user@example.com", &signals("fp-1"), &ctx, at(1))
            .expect("join again");
        assert!(!replay.created);
        assert_eq!(replay.credits_awarded, 0);
        assert_eq!(replay.entry.id, join.entry.id);

        let ledger = CreditLedger::new(fx.store.clone());
        assert_eq!(
            ledger.balance(join.identity_id).expect("balance"),
            AppPolicy::default().waitlist_join_credits
        );
    }

    #[test]
    fn join_rejects_bad_email() {
        let fx = Fixture::new();
        let err = fx
            .manager()
            .join_waitlist(fx.app_id, "not-an-email", &signals("fp-1"), &ServerContext::default())
            .unwrap_err();
        assert!(matches!(err, InvitationError::Invalid { .. }));
    }

    #[test]
    fn generate_attaches_code_and_marks_invited() {
        let fx = Fixture::new();
        let mgr = fx.manager();
        let join = mgr
            .join_waitlist_at(
                fx.app_id,
                "a@example.com",
                &signals("fp-1"),
                &ServerContext::default(),
                at(0),
            )
            .expect("join");

        let generated = mgr
            .generate_at(join.entry.id, 7, 1, at(1_000))
            .expect("generate");
        assert_eq!(generated.code.len(), DEFAULT_CODE_LENGTH);
        assert_eq!(
            generated.expires_at.timestamp_millis(),
            1_000 + 7 * 86_400_000
        );

        let entry = mgr.entry(join.entry.id).expect("entry");
        assert_eq!(entry.status, WaitlistStatus::Invited);
        assert_eq!(entry.invitation_code.as_deref(), Some(generated.code.as_str()));
        assert_eq!(entry.code_use_count, 0);
    }

    #[test]
    fn generate_rejects_bad_bounds() {
        let fx = Fixture::new();
        let mgr = fx.manager();
        assert!(matches!(
            mgr.generate(1, 0, 1).unwrap_err(),
            InvitationError::Invalid { .. }
        ));
        assert!(matches!(
            mgr.generate(1, 7, 0).unwrap_err(),
            InvitationError::Invalid { .. }
        ));
        assert!(matches!(
            mgr.generate(999, 7, 1).unwrap_err(),
            InvitationError::EntryNotFound { entry_id: 999 }
        ));
    }

    #[test]
    fn redeem_unknown_code_is_an_error() {
        let fx = Fixture::new();
        let err = fx
            .manager()
            .redeem("NOPE99", &signals("fp-2"), &ServerContext::default())
            .unwrap_err();
        assert!(matches!(err, InvitationError::UnknownCode { .. }));
    }

    #[test]
    fn expired_code_is_rejected_before_anything_else() {
        let fx = Fixture::new();
        let mgr = fx.manager();
        let join = mgr
            .join_waitlist_at(
                fx.app_id,
                "a@example.com",
                &signals("fp-1"),
                &ServerContext::default(),
                at(0),
            )
            .expect("join");
        let generated = mgr.generate_at(join.entry.id, 1, 5, at(0)).expect("generate");

        let outcome = mgr
            .redeem_at(
                &generated.code,
                &signals("fp-2"),
                &ServerContext::default(),
                at(86_400_000),
            )
            .expect("redeem");
        assert!(matches!(outcome, RedemptionOutcome::Expired));
    }
}
