//! Append-only credit ledger.
//!
//! Every credit movement is one immutable signed-amount entry; rows are
//! never updated or deleted. The visible balance is always `SUM(amount)`
//! over an identity's entries, never a stored counter, so concurrent grants
//! and debits cannot lose updates; each append is independent.
//!
//! The one read-then-write span, [`CreditLedger::guarded_debit`], runs
//! inside an immediate transaction: the balance check and the negative
//! append cannot interleave with another writer, so two concurrent debits
//! cannot both pass a check that only covers one of them.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::identity::{Identity, IdentityId, load_identity};
use crate::store::{Store, StoreError};

#[cfg(test)]
mod tests;

/// Identifier for a ledger entry row.
pub type EntryId = i64;

/// Why an entry was appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Reason {
    /// Referrer's share of a claimed referral.
    Referral,
    /// Referred identity's share of a claimed referral.
    Referred,
    /// Invitation-code redemption bonus.
    Invitation,
    /// Display-name claim bonus.
    NameClaim,
    /// Email-attach bonus.
    EmailClaim,
    /// Email-verification bonus.
    EmailVerify,
    /// Waitlist-join bonus.
    WaitlistJoin,
    /// Debit for a metered action.
    Consumed,
    /// Manual operator adjustment.
    AdminAdjustment,
}

impl Reason {
    /// Returns every reason tag.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Referral,
            Self::Referred,
            Self::Invitation,
            Self::NameClaim,
            Self::EmailClaim,
            Self::EmailVerify,
            Self::WaitlistJoin,
            Self::Consumed,
            Self::AdminAdjustment,
        ]
    }

    /// The stored string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Referral => "referral",
            Self::Referred => "referred",
            Self::Invitation => "invitation",
            Self::NameClaim => "name_claim",
            Self::EmailClaim => "email_claim",
            Self::EmailVerify => "email_verify",
            Self::WaitlistJoin => "waitlist_join",
            Self::Consumed => "consumed",
            Self::AdminAdjustment => "admin_adjustment",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Reason {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| LedgerError::UnknownReason {
                reason: s.to_string(),
            })
    }
}

/// Errors from ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Store-level failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Grant/debit amounts must be strictly positive.
    #[error("amount must be positive, got {amount}")]
    InvalidAmount {
        /// The rejected amount.
        amount: i64,
    },

    /// A stored reason tag did not parse.
    #[error("unknown ledger reason: {reason}")]
    UnknownReason {
        /// The unparseable tag.
        reason: String,
    },

    /// No identity with the given id.
    #[error("identity not found: {identity_id}")]
    IdentityNotFound {
        /// The missing identity id.
        identity_id: IdentityId,
    },

    /// Entry metadata failed to serialize or parse.
    #[error("invalid entry metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

/// One immutable ledger entry.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    /// Row id; also the read cursor.
    pub id: EntryId,
    /// Identity the entry belongs to.
    pub identity_id: IdentityId,
    /// Signed amount: positive grants, negative debits.
    pub amount: i64,
    /// Reason tag.
    pub reason: Reason,
    /// Optional structured metadata.
    pub metadata: Option<Value>,
    /// Creation timestamp, unix milliseconds.
    pub created_at_ms: i64,
}

/// Outcome of a guarded debit.
#[derive(Debug, Clone)]
pub enum DebitOutcome {
    /// The balance covered the debit and the entry was appended.
    Applied {
        /// The appended (negative) entry.
        entry: LedgerEntry,
    },
    /// The balance did not cover the debit. Nothing was written.
    InsufficientCredits {
        /// The applicable balance at check time.
        balance: i64,
    },
}

/// Aggregate ledger statistics.
#[derive(Debug, Clone, Default)]
pub struct LedgerStats {
    /// Total number of entries.
    pub entry_count: u64,
    /// Distinct identities with at least one entry.
    pub identity_count: u64,
    /// Sum of all positive amounts.
    pub total_granted: i64,
    /// Sum of all negative amounts (non-positive).
    pub total_debited: i64,
    /// Highest entry id (0 if empty).
    pub max_entry_id: EntryId,
}

/// The append-only credit ledger.
#[derive(Debug, Clone)]
pub struct CreditLedger {
    store: Store,
}

impl CreditLedger {
    /// Creates a ledger over the given store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Appends a positive entry.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] for non-positive amounts and
    /// [`LedgerError::IdentityNotFound`] for an unknown identity.
    pub fn grant(
        &self,
        identity_id: IdentityId,
        amount: i64,
        reason: Reason,
        metadata: Option<Value>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.grant_at(identity_id, amount, reason, metadata, Utc::now())
    }

    /// [`grant`](Self::grant) with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`grant`](Self::grant).
    pub fn grant_at(
        &self,
        identity_id: IdentityId,
        amount: i64,
        reason: Reason,
        metadata: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount { amount });
        }
        self.append(identity_id, amount, reason, metadata, now.timestamp_millis())
    }

    /// Appends a negative entry without a balance check.
    ///
    /// Use [`guarded_debit`](Self::guarded_debit) when the debit must not
    /// overdraw the balance.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] for non-positive amounts and
    /// [`LedgerError::IdentityNotFound`] for an unknown identity.
    pub fn debit(
        &self,
        identity_id: IdentityId,
        amount: i64,
        reason: Reason,
        metadata: Option<Value>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.debit_at(identity_id, amount, reason, metadata, Utc::now())
    }

    /// [`debit`](Self::debit) with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`debit`](Self::debit).
    pub fn debit_at(
        &self,
        identity_id: IdentityId,
        amount: i64,
        reason: Reason,
        metadata: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount { amount });
        }
        self.append(identity_id, -amount, reason, metadata, now.timestamp_millis())
    }

    fn append(
        &self,
        identity_id: IdentityId,
        signed_amount: i64,
        reason: Reason,
        metadata: Option<Value>,
        now_ms: i64,
    ) -> Result<LedgerEntry, LedgerError> {
        self.store.write_tx(|tx| {
            if load_identity(tx, identity_id)?.is_none() {
                return Err(LedgerError::IdentityNotFound { identity_id });
            }
            append_entry(tx, identity_id, signed_amount, reason, metadata, now_ms)
        })
    }

    /// Sums one identity's entries.
    ///
    /// # Errors
    ///
    /// Returns a store error if the query fails.
    pub fn balance(&self, identity_id: IdentityId) -> Result<i64, LedgerError> {
        Ok(self.store.read(|conn| balance_of(conn, identity_id))?)
    }

    /// Sums entries across the identity's shared account, when applicable.
    ///
    /// Falls back to the plain balance when the identity's application has
    /// shared accounts disabled or the identity is not linked.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::IdentityNotFound`] for an unknown identity.
    pub fn consolidated_balance(&self, identity_id: IdentityId) -> Result<i64, LedgerError> {
        self.store.read(|conn| {
            let identity = load_identity(conn, identity_id)?;
            match identity {
                None => Ok(Err(LedgerError::IdentityNotFound { identity_id })),
                Some(identity) => Ok(Ok(applicable_balance(conn, &identity)?.0)),
            }
        })?
    }

    /// Checks the applicable balance and debits only if it covers `amount`,
    /// in one immediate transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] for non-positive amounts and
    /// [`LedgerError::IdentityNotFound`] for an unknown identity.
    /// An insufficient balance is an outcome, not an error.
    pub fn guarded_debit(
        &self,
        identity_id: IdentityId,
        amount: i64,
        reason: Reason,
        metadata: Option<Value>,
    ) -> Result<DebitOutcome, LedgerError> {
        self.guarded_debit_at(identity_id, amount, reason, metadata, Utc::now())
    }

    /// [`guarded_debit`](Self::guarded_debit) with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`guarded_debit`](Self::guarded_debit).
    pub fn guarded_debit_at(
        &self,
        identity_id: IdentityId,
        amount: i64,
        reason: Reason,
        metadata: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<DebitOutcome, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount { amount });
        }
        let now_ms = now.timestamp_millis();
        let outcome = self.store.write_tx(|tx| -> Result<DebitOutcome, LedgerError> {
            let identity = load_identity(tx, identity_id)?
                .ok_or(LedgerError::IdentityNotFound { identity_id })?;
            let (balance, consolidated) = applicable_balance(tx, &identity)?;
            if balance < amount {
                return Ok(DebitOutcome::InsufficientCredits { balance });
            }
            let entry = append_entry(tx, identity_id, -amount, reason, metadata, now_ms)?;
            debug!(
                identity_id,
                amount, consolidated, remaining = balance - amount, "guarded debit applied"
            );
            Ok(DebitOutcome::Applied { entry })
        })?;
        Ok(outcome)
    }

    /// Reads entries for one identity starting from a cursor position.
    ///
    /// Returns up to `limit` entries with ids >= `cursor`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a store error if the query fails.
    pub fn entries(
        &self,
        identity_id: IdentityId,
        cursor: EntryId,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.store.read(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, identity_id, amount, reason, metadata, created_at_ms
                     FROM ledger_entries
                     WHERE identity_id = ?1 AND id >= ?2
                     ORDER BY id LIMIT ?3",
                )
                .map_err(StoreError::from)?;
            let rows = stmt
                .query_map(params![identity_id, cursor, limit], row_to_parts)
                .map_err(StoreError::from)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StoreError::from)?;
            Ok(rows)
        })?
        .into_iter()
        .map(parts_to_entry)
        .collect()
    }

    /// Returns aggregate statistics over the whole ledger.
    ///
    /// # Errors
    ///
    /// Returns a store error if the query fails.
    pub fn stats(&self) -> Result<LedgerStats, LedgerError> {
        Ok(self.store.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*),
                        COUNT(DISTINCT identity_id),
                        COALESCE(SUM(CASE WHEN amount > 0 THEN amount ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN amount < 0 THEN amount ELSE 0 END), 0),
                        COALESCE(MAX(id), 0)
                 FROM ledger_entries",
                [],
                |row| {
                    Ok(LedgerStats {
                        entry_count: row.get::<_, i64>(0)?.unsigned_abs(),
                        identity_count: row.get::<_, i64>(1)?.unsigned_abs(),
                        total_granted: row.get(2)?,
                        total_debited: row.get(3)?,
                        max_entry_id: row.get(4)?,
                    })
                },
            )
            .map_err(StoreError::from)
        })?)
    }
}

/// Appends one entry inside an existing connection or transaction.
///
/// Shared with the referral and invitation flows, which append grants inside
/// their own transactions.
pub(crate) fn append_entry(
    conn: &Connection,
    identity_id: IdentityId,
    signed_amount: i64,
    reason: Reason,
    metadata: Option<Value>,
    now_ms: i64,
) -> Result<LedgerEntry, LedgerError> {
    let metadata_json = metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO ledger_entries (identity_id, amount, reason, metadata, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![identity_id, signed_amount, reason.as_str(), metadata_json, now_ms],
    )
    .map_err(StoreError::from)?;
    Ok(LedgerEntry {
        id: conn.last_insert_rowid(),
        identity_id,
        amount: signed_amount,
        reason,
        metadata,
        created_at_ms: now_ms,
    })
}

/// Sums one identity's entries inside an existing connection.
pub(crate) fn balance_of(conn: &Connection, identity_id: IdentityId) -> Result<i64, StoreError> {
    conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM ledger_entries WHERE identity_id = ?1",
        params![identity_id],
        |row| row.get(0),
    )
    .map_err(StoreError::from)
}

/// The balance a debit is checked against: the shared-account pool when the
/// identity's application opts in and the identity is linked, else the plain
/// balance. Returns `(balance, consolidated)`.
pub(crate) fn applicable_balance(
    conn: &Connection,
    identity: &Identity,
) -> Result<(i64, bool), StoreError> {
    let shared_enabled: bool = conn
        .query_row(
            "SELECT shared_accounts_enabled FROM applications WHERE id = ?1",
            params![identity.app_id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(false);

    match identity.shared_account_id {
        Some(account_id) if shared_enabled => {
            let balance = conn.query_row(
                "SELECT COALESCE(SUM(le.amount), 0)
                 FROM ledger_entries le
                 JOIN identities i ON i.id = le.identity_id
                 JOIN applications a ON a.id = i.app_id
                 WHERE i.shared_account_id = ?1 AND a.shared_accounts_enabled = 1",
                params![account_id],
                |row| row.get(0),
            )?;
            Ok((balance, true))
        }
        _ => Ok((balance_of(conn, identity.id)?, false)),
    }
}

/// Whether the identity already has an entry with the given reason. Used to
/// keep one-time bonuses one-time.
pub(crate) fn has_entry_with_reason(
    conn: &Connection,
    identity_id: IdentityId,
    reason: Reason,
) -> Result<bool, StoreError> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT id FROM ledger_entries WHERE identity_id = ?1 AND reason = ?2 LIMIT 1",
            params![identity_id, reason.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

type EntryParts = (EntryId, IdentityId, i64, String, Option<String>, i64);

fn row_to_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn parts_to_entry(parts: EntryParts) -> Result<LedgerEntry, LedgerError> {
    let (id, identity_id, amount, reason, metadata_json, created_at_ms) = parts;
    Ok(LedgerEntry {
        id,
        identity_id,
        amount,
        reason: reason.parse()?,
        metadata: metadata_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        created_at_ms,
    })
}
