//! The operations facade.
//!
//! [`Engine`] wires the store, token signer and component structs into the
//! contract surface a request handler consumes: resolve an identity, move
//! credits, adjudicate referral and invitation claims, charge actions.
//! Transport framing, authentication and rendering stay outside.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::info;

use crate::application::{
    AppId, Application, ApplicationError, ApplicationRegistry, OrgId, Organization, load_app,
};
use crate::config::{ConfigError, EngineConfig};
use crate::identity::{
    Identity, IdentityError, IdentityId, IdentityResolver, IdentityStore, Resolution,
    ServerContext, SignalBag, load_identity,
};
use crate::invitation::{
    GeneratedCode, InvitationCodeManager, InvitationError, JoinOutcome, RedemptionOutcome,
    WaitlistEntry, WaitlistEntryId,
};
use crate::ledger::{
    CreditLedger, DebitOutcome, EntryId, LedgerEntry, LedgerError, LedgerStats, Reason,
    append_entry, has_entry_with_reason,
};
use crate::meter::{ActionMeter, ChargeResult, MeterError};
use crate::policy::AppPolicy;
use crate::referral::{ClaimOutcome, IssuedClaim, Referral, ReferralEngine, ReferralError};
use crate::store::{Store, StoreError};
use crate::token::{TokenError, TokenSigner};

/// Token kind for short-lived session tokens.
pub const SESSION_TOKEN_KIND: &str = "session";

/// Errors surfaced by the engine facade.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Store-level failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Token failure.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Application registry failure.
    #[error(transparent)]
    Application(#[from] ApplicationError),

    /// Identity resolution failure.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Ledger failure.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Referral failure.
    #[error(transparent)]
    Referral(#[from] ReferralError),

    /// Invitation failure.
    #[error(transparent)]
    Invitation(#[from] InvitationError),

    /// Metering failure.
    #[error(transparent)]
    Meter(#[from] MeterError),
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

/// A one-time profile-completion bonus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileAction {
    /// The visitor claimed a display name.
    NameClaim,
    /// The visitor attached an email address.
    EmailClaim,
    /// The visitor verified their email address.
    EmailVerify,
}

impl ProfileAction {
    /// The ledger reason this action grants under.
    #[must_use]
    pub const fn reason(&self) -> Reason {
        match self {
            Self::NameClaim => Reason::NameClaim,
            Self::EmailClaim => Reason::EmailClaim,
            Self::EmailVerify => Reason::EmailVerify,
        }
    }

    /// The policy-configured bonus for this action.
    #[must_use]
    pub const fn credits(&self, policy: &AppPolicy) -> i64 {
        match self {
            Self::NameClaim => policy.name_claim_credits,
            Self::EmailClaim => policy.email_claim_credits,
            Self::EmailVerify => policy.email_verify_credits,
        }
    }

    /// String form for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        self.reason().as_str()
    }
}

/// Outcome of a profile-action grant.
#[derive(Debug, Clone)]
pub enum ProfileGrantOutcome {
    /// The bonus was granted.
    Granted {
        /// Credits granted, zero when the policy pays nothing.
        credits_awarded: i64,
    },
    /// The identity already collected this bonus. Nothing was written.
    AlreadyGranted,
}

/// The identity resolution and credit ledger engine.
#[derive(Debug, Clone)]
pub struct Engine {
    store: Store,
    signer: TokenSigner,
    registry: ApplicationRegistry,
    identities: IdentityStore,
    resolver: IdentityResolver,
    ledger: CreditLedger,
    referrals: ReferralEngine,
    invitations: InvitationCodeManager,
    meter: ActionMeter,
}

impl Engine {
    /// Opens the engine against the configured database file.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the store fails to
    /// open.
    pub fn open(config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let store = Store::open_with(&config.database_path, config.retry_tuning())?;
        info!(path = %config.database_path.display(), "opened engine store");
        Self::with_store(store, config)
    }

    /// Builds the engine over an in-memory store. For tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the store fails to
    /// initialize.
    pub fn in_memory(config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Self::with_store(Store::in_memory()?, config)
    }

    fn with_store(store: Store, config: &EngineConfig) -> Result<Self, EngineError> {
        let signer = TokenSigner::new(config.secret()?)?;
        let code_tuning = config.referral_code_tuning();
        Ok(Self {
            registry: ApplicationRegistry::new(store.clone()),
            identities: IdentityStore::new(store.clone()),
            resolver: IdentityResolver::with_tuning(store.clone(), code_tuning),
            ledger: CreditLedger::new(store.clone()),
            referrals: ReferralEngine::new(store.clone(), signer.clone(), config.claim_ttl()),
            invitations: InvitationCodeManager::new(store.clone())
                .with_code_length(config.invitation_code_length)
                .with_identity_tuning(code_tuning),
            meter: ActionMeter::new(store.clone()),
            signer,
            store,
        })
    }

    // === Bootstrap ===

    /// Creates an organization.
    ///
    /// # Errors
    ///
    /// Propagates registry errors.
    pub fn create_org(&self, name: &str) -> Result<Organization, EngineError> {
        Ok(self.registry.create_org(name)?)
    }

    /// Creates an application under an organization.
    ///
    /// # Errors
    ///
    /// Propagates registry errors.
    pub fn create_app(
        &self,
        org_id: OrgId,
        name: &str,
        shared_accounts_enabled: bool,
        policy: &AppPolicy,
    ) -> Result<Application, EngineError> {
        Ok(self
            .registry
            .create_app(org_id, name, shared_accounts_enabled, policy)?)
    }

    /// Loads an application with its policy.
    ///
    /// # Errors
    ///
    /// Propagates registry errors.
    pub fn get_app(&self, app_id: AppId) -> Result<Application, EngineError> {
        Ok(self.registry.get_app(app_id)?)
    }

    /// Replaces an application's policy.
    ///
    /// # Errors
    ///
    /// Propagates registry errors.
    pub fn set_policy(&self, app_id: AppId, policy: &AppPolicy) -> Result<(), EngineError> {
        Ok(self.registry.set_policy(app_id, policy)?)
    }

    // === Identity ===

    /// Resolves request signals to an identity, creating one if none match.
    ///
    /// # Errors
    ///
    /// Propagates resolution errors.
    pub fn resolve_identity(
        &self,
        app_id: AppId,
        signals: &SignalBag,
        ctx: &ServerContext,
    ) -> Result<Resolution, EngineError> {
        Ok(self.resolver.resolve(app_id, signals, ctx)?)
    }

    /// Loads an identity by id.
    ///
    /// # Errors
    ///
    /// Propagates lookup errors.
    pub fn identity(&self, identity_id: IdentityId) -> Result<Identity, EngineError> {
        Ok(self.identities.get(identity_id)?)
    }

    /// Looks up an identity by referral code.
    ///
    /// # Errors
    ///
    /// Propagates lookup errors.
    pub fn identity_by_code(&self, code: &str) -> Result<Option<Identity>, EngineError> {
        Ok(self.identities.by_referral_code(code)?)
    }

    // === Ledger ===

    /// Grants credits.
    ///
    /// # Errors
    ///
    /// Propagates ledger errors.
    pub fn grant_credits(
        &self,
        identity_id: IdentityId,
        amount: i64,
        reason: Reason,
        metadata: Option<Value>,
    ) -> Result<LedgerEntry, EngineError> {
        Ok(self.ledger.grant(identity_id, amount, reason, metadata)?)
    }

    /// Debits credits behind a balance guard.
    ///
    /// # Errors
    ///
    /// Propagates ledger errors; an insufficient balance is an outcome.
    pub fn debit_credits(
        &self,
        identity_id: IdentityId,
        amount: i64,
        reason: Reason,
        metadata: Option<Value>,
    ) -> Result<DebitOutcome, EngineError> {
        Ok(self
            .ledger
            .guarded_debit(identity_id, amount, reason, metadata)?)
    }

    /// Reads a balance, optionally consolidated across the identity's
    /// shared account.
    ///
    /// # Errors
    ///
    /// Propagates ledger errors.
    pub fn get_balance(
        &self,
        identity_id: IdentityId,
        consolidated: bool,
    ) -> Result<i64, EngineError> {
        let balance = if consolidated {
            self.ledger.consolidated_balance(identity_id)?
        } else {
            self.ledger.balance(identity_id)?
        };
        Ok(balance)
    }

    /// Reads an identity's ledger entries from a cursor.
    ///
    /// # Errors
    ///
    /// Propagates ledger errors.
    pub fn ledger_entries(
        &self,
        identity_id: IdentityId,
        cursor: EntryId,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>, EngineError> {
        Ok(self.ledger.entries(identity_id, cursor, limit)?)
    }

    /// Aggregate ledger statistics.
    ///
    /// # Errors
    ///
    /// Propagates ledger errors.
    pub fn ledger_stats(&self) -> Result<LedgerStats, EngineError> {
        Ok(self.ledger.stats()?)
    }

    /// Applies a manual operator adjustment: positive grants, negative
    /// debits without a balance guard.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] for a zero delta, wrapped in
    /// [`EngineError::Ledger`].
    pub fn admin_adjust(
        &self,
        identity_id: IdentityId,
        delta: i64,
        note: Option<&str>,
    ) -> Result<LedgerEntry, EngineError> {
        let metadata = note.map(|n| json!({ "note": n }));
        let entry = if delta >= 0 {
            self.ledger
                .grant(identity_id, delta, Reason::AdminAdjustment, metadata)?
        } else {
            self.ledger
                .debit(identity_id, -delta, Reason::AdminAdjustment, metadata)?
        };
        info!(identity_id, delta, "admin adjustment applied");
        Ok(entry)
    }

    // === Referrals ===

    /// Issues a referral claim token.
    ///
    /// # Errors
    ///
    /// Propagates referral errors.
    pub fn issue_referral_claim(&self, referral_code: &str) -> Result<IssuedClaim, EngineError> {
        Ok(self.referrals.issue_claim(referral_code)?)
    }

    /// Records a pre-claim referral link visit.
    ///
    /// # Errors
    ///
    /// Propagates referral errors.
    pub fn track_referral_visit(&self, token: &str) -> Result<Referral, EngineError> {
        Ok(self.referrals.track_visit(token)?)
    }

    /// Redeems a referral claim for a referred identity.
    ///
    /// # Errors
    ///
    /// Propagates referral errors; policy outcomes are values.
    pub fn redeem_referral_claim(
        &self,
        token: &str,
        referred_identity_id: IdentityId,
    ) -> Result<ClaimOutcome, EngineError> {
        Ok(self.referrals.redeem_claim(token, referred_identity_id)?)
    }

    // === Waitlist & invitations ===

    /// Joins an application's waitlist.
    ///
    /// # Errors
    ///
    /// Propagates invitation errors.
    pub fn join_waitlist(
        &self,
        app_id: AppId,
        email: &str,
        signals: &SignalBag,
        ctx: &ServerContext,
    ) -> Result<JoinOutcome, EngineError> {
        Ok(self.invitations.join_waitlist(app_id, email, signals, ctx)?)
    }

    /// Generates an invitation code for a waitlist entry.
    ///
    /// # Errors
    ///
    /// Propagates invitation errors.
    pub fn generate_invitation_code(
        &self,
        entry_id: WaitlistEntryId,
        expiry_days: i64,
        max_uses: i64,
    ) -> Result<GeneratedCode, EngineError> {
        Ok(self.invitations.generate(entry_id, expiry_days, max_uses)?)
    }

    /// Redeems an invitation code.
    ///
    /// # Errors
    ///
    /// Propagates invitation errors; expired/exhausted/replay are outcomes.
    pub fn redeem_invitation_code(
        &self,
        code: &str,
        signals: &SignalBag,
        ctx: &ServerContext,
    ) -> Result<RedemptionOutcome, EngineError> {
        Ok(self.invitations.redeem(code, signals, ctx)?)
    }

    /// Loads a waitlist entry.
    ///
    /// # Errors
    ///
    /// Propagates invitation errors.
    pub fn waitlist_entry(
        &self,
        entry_id: WaitlistEntryId,
    ) -> Result<WaitlistEntry, EngineError> {
        Ok(self.invitations.entry(entry_id)?)
    }

    // === Metering ===

    /// Charges an identity for a named action.
    ///
    /// # Errors
    ///
    /// Propagates metering errors; insufficient credits is reported in the
    /// result.
    pub fn charge_for_action(
        &self,
        identity_id: IdentityId,
        action: &str,
        client_cost: Option<i64>,
    ) -> Result<ChargeResult, EngineError> {
        Ok(self.meter.charge(identity_id, action, client_cost)?)
    }

    // === Profile actions ===

    /// Grants a one-time profile-completion bonus, at most once per
    /// identity per action.
    ///
    /// # Errors
    ///
    /// Propagates ledger errors.
    pub fn grant_profile_action(
        &self,
        identity_id: IdentityId,
        action: ProfileAction,
    ) -> Result<ProfileGrantOutcome, EngineError> {
        self.grant_profile_action_at(identity_id, action, Utc::now())
    }

    /// [`grant_profile_action`](Self::grant_profile_action) with an
    /// explicit clock.
    ///
    /// # Errors
    ///
    /// See [`grant_profile_action`](Self::grant_profile_action).
    pub fn grant_profile_action_at(
        &self,
        identity_id: IdentityId,
        action: ProfileAction,
        now: DateTime<Utc>,
    ) -> Result<ProfileGrantOutcome, EngineError> {
        let now_ms = now.timestamp_millis();
        let outcome = self.store.write_tx(|tx| -> Result<ProfileGrantOutcome, EngineError> {
            let identity = load_identity(tx, identity_id)?
                .ok_or(IdentityError::NotFound { identity_id })
                .map_err(EngineError::from)?;
            let app = load_app(tx, identity.app_id)?;
            if has_entry_with_reason(tx, identity_id, action.reason())? {
                return Ok(ProfileGrantOutcome::AlreadyGranted);
            }
            let credits_awarded = action.credits(&app.policy);
            if credits_awarded > 0 {
                append_entry(tx, identity_id, credits_awarded, action.reason(), None, now_ms)
                    .map_err(EngineError::from)?;
            }
            Ok(ProfileGrantOutcome::Granted { credits_awarded })
        })?;
        Ok(outcome)
    }

    // === Session tokens ===

    /// Issues a short-lived session token for an identity.
    ///
    /// # Errors
    ///
    /// Propagates token and lookup errors.
    pub fn issue_session_token(
        &self,
        identity_id: IdentityId,
        ttl: Duration,
    ) -> Result<String, EngineError> {
        // Confirm the identity exists before minting a token for it.
        let identity = self.identities.get(identity_id)?;
        let token = self.signer.sign(
            SESSION_TOKEN_KIND,
            &identity.id.to_string(),
            Utc::now() + ttl,
        )?;
        Ok(token)
    }

    /// Verifies a session token and returns the identity it names.
    ///
    /// # Errors
    ///
    /// Returns a token error for an invalid or expired token, or a lookup
    /// error when the named identity no longer resolves.
    pub fn verify_session_token(&self, token: &str) -> Result<Identity, EngineError> {
        let claims = self.signer.verify(token, SESSION_TOKEN_KIND, Utc::now())?;
        let identity_id: IdentityId = claims
            .subject
            .parse()
            .map_err(|_| TokenError::Malformed)?;
        Ok(self.identities.get(identity_id)?)
    }
}
