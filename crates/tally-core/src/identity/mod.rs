//! Identity records and tiered resolution.
//!
//! One identity exists per (application, visitor). Visitors are recognized
//! by a bag of signals of decreasing strength: the client-computed primary
//! fingerprint, a canvas-render hash, a browser-signature hash, and a
//! server-derived hash over the client IP and stable request headers.
//!
//! Resolution tries the strongest signal first and falls through tier by
//! tier. A fallback match promotes the observed signals onto the matched
//! record, so a visitor whose browser storage was cleared is re-recognized
//! and the primary signal heals going forward. The fallback tiers are a
//! lossy heuristic, not an identity proof: two real users can collide on a
//! weak signal and be merged. That risk is accepted in exchange for
//! retaining referral and credit history across storage resets.

use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::application::{AppId, Application, ApplicationError, load_app};
use crate::store::{Store, StoreError};

/// Identifier for an identity row.
pub type IdentityId = i64;

/// Identifier for a shared-account row.
pub type SharedAccountId = i64;

/// Referral-code alphabet. Uppercase alphanumeric without confusable
/// characters (no I, O, 0, 1).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Maximum accepted length for any client-supplied signal.
const MAX_SIGNAL_LEN: usize = 512;

/// Errors from identity resolution and lookup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdentityError {
    /// Store-level failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Application registry failure.
    #[error(transparent)]
    Application(#[from] ApplicationError),

    /// A client-supplied signal failed validation.
    #[error("invalid signal: {reason}")]
    InvalidSignal {
        /// Why the signal was rejected.
        reason: String,
    },

    /// No identity with the given id.
    #[error("identity not found: {identity_id}")]
    NotFound {
        /// The missing identity id.
        identity_id: IdentityId,
    },

    /// Referral-code generation kept colliding until the retry budget was
    /// spent. Rare enough to page an operator.
    #[error("referral code generation exhausted after {attempts} attempts")]
    CodeGenerationExhausted {
        /// How many candidate codes were tried.
        attempts: u32,
    },
}

impl From<rusqlite::Error> for IdentityError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

/// An identity row.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Row id.
    pub id: IdentityId,
    /// Owning application.
    pub app_id: AppId,
    /// Client-computed device fingerprint. Unique within the application.
    pub primary_signal: String,
    /// Canvas-render hash, matching fallback only.
    pub canvas_signal: Option<String>,
    /// Browser-signature hash, matching fallback only.
    pub browser_signal: Option<String>,
    /// Server-derived IP+headers hash, matching fallback only.
    pub server_signal: Option<String>,
    /// Unique referral code.
    pub referral_code: String,
    /// Shared account this identity is linked to, if any.
    pub shared_account_id: Option<SharedAccountId>,
    /// Creation timestamp, unix milliseconds.
    pub created_at_ms: i64,
    /// Last recognized visit, unix milliseconds.
    pub last_active_at_ms: i64,
}

/// Client-supplied signals for one request.
#[derive(Debug, Clone, Default)]
pub struct SignalBag {
    /// Client-computed device fingerprint. Required.
    pub primary: String,
    /// Canvas-render hash.
    pub canvas: Option<String>,
    /// Browser-signature hash.
    pub browser_sig: Option<String>,
}

impl SignalBag {
    /// Validates the bag.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidSignal`] when the primary signal is
    /// empty or any signal exceeds the length bound.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.primary.trim().is_empty() {
            return Err(IdentityError::InvalidSignal {
                reason: "primary signal must not be empty".to_string(),
            });
        }
        for (name, value) in [
            ("primary", Some(&self.primary)),
            ("canvas", self.canvas.as_ref()),
            ("browser_sig", self.browser_sig.as_ref()),
        ] {
            if let Some(value) = value {
                if value.len() > MAX_SIGNAL_LEN {
                    return Err(IdentityError::InvalidSignal {
                        reason: format!(
                            "{name} signal exceeds {MAX_SIGNAL_LEN} bytes ({})",
                            value.len()
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Server-observable request context.
///
/// The derived signal is the weakest matching tier: everything behind one
/// NAT with the same browser build hashes identically.
#[derive(Debug, Clone, Default)]
pub struct ServerContext {
    /// Client IP as observed by the server.
    pub client_ip: String,
    /// `User-Agent` header.
    pub user_agent: Option<String>,
    /// `Accept-Language` header.
    pub accept_language: Option<String>,
    /// Client-declared platform or device, when supplied.
    pub platform_hint: Option<String>,
}

impl ServerContext {
    /// Derives the server-side signal: hex SHA-256 over the IP and the
    /// stable header subset, NUL-separated.
    #[must_use]
    pub fn derived_signal(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.client_ip.as_bytes());
        for part in [&self.user_agent, &self.accept_language, &self.platform_hint] {
            hasher.update([0u8]);
            if let Some(value) = part {
                hasher.update(value.as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// Which tier produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    /// Tier 1: exact primary-signal match.
    Primary,
    /// Tier 2: canvas-signal fallback.
    Canvas,
    /// Tier 3: browser-signature fallback.
    BrowserSignature,
    /// Tier 4: server-derived signal fallback.
    ServerSignal,
    /// Tier 5: no match, a new identity was created.
    Created,
}

impl ResolvedVia {
    /// String form for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Canvas => "canvas",
            Self::BrowserSignature => "browser_signature",
            Self::ServerSignal => "server_signal",
            Self::Created => "created",
        }
    }
}

/// Outcome of a resolution: the identity and how it was found.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The resolved or created identity.
    pub identity: Identity,
    /// The tier that matched.
    pub via: ResolvedVia,
}

/// Referral-code generation tuning.
#[derive(Debug, Clone, Copy)]
pub struct CodeTuning {
    /// Code length in characters.
    pub length: usize,
    /// Candidate codes tried before giving up.
    pub attempts: u32,
}

impl Default for CodeTuning {
    fn default() -> Self {
        Self {
            length: 8,
            attempts: 5,
        }
    }
}

/// Lookup operations over identity rows.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    store: Store,
}

impl IdentityStore {
    /// Creates an identity store over the given store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Loads an identity by id.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::NotFound`] for an unknown id.
    pub fn get(&self, identity_id: IdentityId) -> Result<Identity, IdentityError> {
        self.store
            .read(|conn| load_identity(conn, identity_id))?
            .ok_or(IdentityError::NotFound { identity_id })
    }

    /// Looks up an identity by its referral code.
    ///
    /// # Errors
    ///
    /// Returns a store error if the query fails.
    pub fn by_referral_code(&self, code: &str) -> Result<Option<Identity>, IdentityError> {
        Ok(self.store.read(|conn| find_by_referral_code(conn, code))?)
    }
}

/// Tiered identity resolver.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    store: Store,
    tuning: CodeTuning,
}

impl IdentityResolver {
    /// Creates a resolver with default code tuning.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self::with_tuning(store, CodeTuning::default())
    }

    /// Creates a resolver with explicit code tuning.
    #[must_use]
    pub fn with_tuning(store: Store, tuning: CodeTuning) -> Self {
        Self { store, tuning }
    }

    /// Resolves the signals to an identity, creating one if nothing matches.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidSignal`] for a bad signal bag,
    /// [`IdentityError::CodeGenerationExhausted`] when a fresh referral code
    /// cannot be generated, or a store error.
    pub fn resolve(
        &self,
        app_id: AppId,
        signals: &SignalBag,
        ctx: &ServerContext,
    ) -> Result<Resolution, IdentityError> {
        self.resolve_at(app_id, signals, ctx, Utc::now())
    }

    /// [`resolve`](Self::resolve) with an explicit clock.
    ///
    /// The whole tier walk, promotion and creation run inside one immediate
    /// transaction, so two concurrent first visits with the same signals
    /// produce one identity, not two.
    ///
    /// # Errors
    ///
    /// See [`resolve`](Self::resolve).
    pub fn resolve_at(
        &self,
        app_id: AppId,
        signals: &SignalBag,
        ctx: &ServerContext,
        now: DateTime<Utc>,
    ) -> Result<Resolution, IdentityError> {
        signals.validate()?;
        let now_ms = now.timestamp_millis();
        let server_signal = ctx.derived_signal();
        let tuning = self.tuning;

        let resolution = self.store.write_tx(|tx| {
            let app = load_app(tx, app_id)?;
            resolve_in_tx(tx, &app, signals, &server_signal, tuning, now_ms)
        })?;

        debug!(
            app_id,
            identity_id = resolution.identity.id,
            via = resolution.via.as_str(),
            "resolved identity"
        );
        Ok(resolution)
    }
}

/// Runs the tier walk inside an existing immediate transaction.
///
/// Shared with invitation redemption, which resolves the redeeming identity
/// inside its own transaction.
pub(crate) fn resolve_in_tx(
    tx: &Connection,
    app: &Application,
    signals: &SignalBag,
    server_signal: &str,
    tuning: CodeTuning,
    now_ms: i64,
) -> Result<Resolution, IdentityError> {
    // Tier 1: exact primary match. No promotion, only an activity refresh.
    if let Some(mut identity) = find_by_primary(tx, app.id, &signals.primary)? {
        tx.execute(
            "UPDATE identities SET last_active_at_ms = ?1 WHERE id = ?2",
            params![now_ms, identity.id],
        )?;
        identity.last_active_at_ms = now_ms;
        consolidate(tx, app, &mut identity, now_ms)?;
        return Ok(Resolution {
            identity,
            via: ResolvedVia::Primary,
        });
    }

    // Tiers 2-4: weaker signals, first (oldest) holder wins.
    let fallback = match signals.canvas.as_deref() {
        Some(canvas) => {
            find_by_column(tx, app.id, "canvas_signal", canvas)?.map(|i| (i, ResolvedVia::Canvas))
        }
        None => None,
    };
    let fallback = match fallback {
        Some(hit) => Some(hit),
        None => match signals.browser_sig.as_deref() {
            Some(sig) => find_by_column(tx, app.id, "browser_signal", sig)?
                .map(|i| (i, ResolvedVia::BrowserSignature)),
            None => None,
        },
    };
    let fallback = match fallback {
        Some(hit) => Some(hit),
        None => find_by_column(tx, app.id, "server_signal", server_signal)?
            .map(|i| (i, ResolvedVia::ServerSignal)),
    };

    if let Some((mut identity, via)) = fallback {
        // Promote every observed signal onto the matched row. The primary
        // is only adopted while no other identity holds it; the uniqueness
        // constraint on (app, primary) stays authoritative.
        let primary_taken = find_by_primary(tx, app.id, &signals.primary)?
            .is_some_and(|other| other.id != identity.id);
        let new_primary = if primary_taken {
            identity.primary_signal.clone()
        } else {
            signals.primary.clone()
        };
        tx.execute(
            "UPDATE identities
             SET primary_signal = ?1, canvas_signal = ?2, browser_signal = ?3,
                 server_signal = ?4, last_active_at_ms = ?5
             WHERE id = ?6",
            params![
                new_primary,
                signals.canvas,
                signals.browser_sig,
                server_signal,
                now_ms,
                identity.id
            ],
        )?;
        identity.primary_signal = new_primary;
        identity.canvas_signal = signals.canvas.clone();
        identity.browser_signal = signals.browser_sig.clone();
        identity.server_signal = Some(server_signal.to_string());
        identity.last_active_at_ms = now_ms;
        consolidate(tx, app, &mut identity, now_ms)?;
        info!(
            app_id = app.id,
            identity_id = identity.id,
            via = via.as_str(),
            "identity re-recognized via fallback signal"
        );
        return Ok(Resolution { identity, via });
    }

    // Tier 5: nothing matched, create.
    let referral_code = generate_code(tx, tuning)?;
    tx.execute(
        "INSERT INTO identities
             (app_id, primary_signal, canvas_signal, browser_signal, server_signal,
              referral_code, created_at_ms, last_active_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            app.id,
            signals.primary,
            signals.canvas,
            signals.browser_sig,
            server_signal,
            referral_code,
            now_ms
        ],
    )?;
    let mut identity = Identity {
        id: tx.last_insert_rowid(),
        app_id: app.id,
        primary_signal: signals.primary.clone(),
        canvas_signal: signals.canvas.clone(),
        browser_signal: signals.browser_sig.clone(),
        server_signal: Some(server_signal.to_string()),
        referral_code,
        shared_account_id: None,
        created_at_ms: now_ms,
        last_active_at_ms: now_ms,
    };
    consolidate(tx, app, &mut identity, now_ms)?;
    Ok(Resolution {
        identity,
        via: ResolvedVia::Created,
    })
}

/// Generates a fresh referral code, retrying on collision.
fn generate_code(conn: &Connection, tuning: CodeTuning) -> Result<String, IdentityError> {
    let mut attempt: u32 = 0;
    loop {
        if attempt >= tuning.attempts {
            return Err(IdentityError::CodeGenerationExhausted { attempts: attempt });
        }
        attempt += 1;
        let candidate = random_code(tuning.length);
        let taken: Option<i64> = conn
            .query_row(
                "SELECT id FROM identities WHERE referral_code = ?1",
                params![candidate],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)?;
        if taken.is_none() {
            return Ok(candidate);
        }
        debug!(attempt, "referral code collision, retrying");
    }
}

fn random_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Links the identity to a shared account when its application opts in and
/// a sibling-app identity in the same organization holds the same primary
/// signal. The shared account is created lazily on the first cross-app
/// match.
fn consolidate(
    tx: &Connection,
    app: &Application,
    identity: &mut Identity,
    now_ms: i64,
) -> Result<(), IdentityError> {
    if !app.shared_accounts_enabled || identity.shared_account_id.is_some() {
        return Ok(());
    }

    let sibling: Option<(IdentityId, Option<SharedAccountId>)> = tx
        .query_row(
            "SELECT i.id, i.shared_account_id
             FROM identities i
             JOIN applications a ON a.id = i.app_id
             WHERE a.org_id = ?1 AND a.shared_accounts_enabled = 1
               AND i.primary_signal = ?2 AND i.id != ?3
             ORDER BY i.id LIMIT 1",
            params![app.org_id, identity.primary_signal, identity.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(StoreError::from)?;

    let Some((sibling_id, sibling_account)) = sibling else {
        return Ok(());
    };

    let account_id = match sibling_account {
        Some(account_id) => account_id,
        None => {
            tx.execute(
                "INSERT INTO shared_accounts (org_id, created_at_ms) VALUES (?1, ?2)",
                params![app.org_id, now_ms],
            )?;
            let account_id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE identities SET shared_account_id = ?1 WHERE id = ?2",
                params![account_id, sibling_id],
            )?;
            account_id
        }
    };

    tx.execute(
        "UPDATE identities SET shared_account_id = ?1 WHERE id = ?2",
        params![account_id, identity.id],
    )?;
    identity.shared_account_id = Some(account_id);
    info!(
        org_id = app.org_id,
        identity_id = identity.id,
        shared_account_id = account_id,
        "identity linked to shared account"
    );
    Ok(())
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Identity> {
    Ok(Identity {
        id: row.get(0)?,
        app_id: row.get(1)?,
        primary_signal: row.get(2)?,
        canvas_signal: row.get(3)?,
        browser_signal: row.get(4)?,
        server_signal: row.get(5)?,
        referral_code: row.get(6)?,
        shared_account_id: row.get(7)?,
        created_at_ms: row.get(8)?,
        last_active_at_ms: row.get(9)?,
    })
}

const IDENTITY_COLUMNS: &str = "id, app_id, primary_signal, canvas_signal, browser_signal, \
                                server_signal, referral_code, shared_account_id, \
                                created_at_ms, last_active_at_ms";

/// Loads an identity row by id inside an existing connection.
pub(crate) fn load_identity(
    conn: &Connection,
    identity_id: IdentityId,
) -> Result<Option<Identity>, StoreError> {
    conn.query_row(
        &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?1"),
        params![identity_id],
        row_to_identity,
    )
    .optional()
    .map_err(StoreError::from)
}

fn find_by_primary(
    conn: &Connection,
    app_id: AppId,
    primary: &str,
) -> Result<Option<Identity>, StoreError> {
    conn.query_row(
        &format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities
             WHERE app_id = ?1 AND primary_signal = ?2"
        ),
        params![app_id, primary],
        row_to_identity,
    )
    .optional()
    .map_err(StoreError::from)
}

fn find_by_column(
    conn: &Connection,
    app_id: AppId,
    column: &str,
    value: &str,
) -> Result<Option<Identity>, StoreError> {
    conn.query_row(
        &format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities
             WHERE app_id = ?1 AND {column} = ?2
             ORDER BY id LIMIT 1"
        ),
        params![app_id, value],
        row_to_identity,
    )
    .optional()
    .map_err(StoreError::from)
}

/// Looks up an identity by referral code inside an existing connection.
pub(crate) fn find_by_referral_code(
    conn: &Connection,
    code: &str,
) -> Result<Option<Identity>, StoreError> {
    conn.query_row(
        &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE referral_code = ?1"),
        params![code],
        row_to_identity,
    )
    .optional()
    .map_err(StoreError::from)
}
