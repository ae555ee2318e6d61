//! Action cost resolution and guarded charging.
//!
//! The cost of a named action comes from exactly one source, checked in a
//! fixed priority order: the application's policy entry for the action, the
//! caller-supplied cost (only when the policy allows client pricing, and
//! clamped), then the policy default. The order is a trust boundary: it
//! decides whether operator or caller controls pricing, and must not be
//! reordered.
//!
//! Insufficient credits is a normal outcome: `charge` reports it in the
//! result instead of erroring, and writes nothing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::application::{ApplicationError, load_app};
use crate::identity::{IdentityId, load_identity};
use crate::ledger::{LedgerError, Reason, append_entry, applicable_balance};
use crate::policy::AppPolicy;
use crate::store::{Store, StoreError};

/// Errors from metering operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MeterError {
    /// Store-level failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Application registry failure.
    #[error(transparent)]
    Application(#[from] ApplicationError),

    /// Ledger failure while appending the debit.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// No identity with the given id.
    #[error("identity not found: {identity_id}")]
    IdentityNotFound {
        /// The missing identity id.
        identity_id: IdentityId,
    },
}

impl From<rusqlite::Error> for MeterError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

/// Which source decided an action's cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CostSource {
    /// The policy names this action.
    PolicyAction,
    /// The caller priced it, within the policy clamp.
    ClientSupplied,
    /// The policy's default action cost.
    Default,
}

impl CostSource {
    /// String form for logs and metadata.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyAction => "policy_action",
            Self::ClientSupplied => "client_supplied",
            Self::Default => "default",
        }
    }
}

/// A resolved action cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostDecision {
    /// Credits the action costs.
    pub credits: i64,
    /// Where the number came from.
    pub source: CostSource,
}

/// Result of a charge attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeResult {
    /// Whether the debit was applied.
    pub charged: bool,
    /// The applicable balance after the call.
    pub remaining: i64,
    /// The resolved cost of the action.
    pub credits_required: i64,
}

/// Resolves the cost of a named action.
///
/// Priority: policy action entry, then the clamped client cost when the
/// policy allows client pricing, then the policy default.
#[must_use]
pub fn cost_of(policy: &AppPolicy, action: &str, client_cost: Option<i64>) -> CostDecision {
    if let Some(&credits) = policy.action_costs.get(action) {
        return CostDecision {
            credits,
            source: CostSource::PolicyAction,
        };
    }
    if policy.allow_client_cost {
        if let Some(cost) = client_cost {
            return CostDecision {
                credits: cost.clamp(0, policy.max_client_cost),
                source: CostSource::ClientSupplied,
            };
        }
    }
    CostDecision {
        credits: policy.default_action_cost,
        source: CostSource::Default,
    }
}

/// Charges identities for metered actions.
#[derive(Debug, Clone)]
pub struct ActionMeter {
    store: Store,
}

impl ActionMeter {
    /// Creates a meter over the given store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Resolves an action's cost against the identity's application policy
    /// and debits the (possibly shared-account) balance when it covers the
    /// cost.
    ///
    /// The balance check and the debit run in one immediate transaction.
    /// A zero-cost action charges successfully without appending an entry.
    ///
    /// # Errors
    ///
    /// Returns [`MeterError::IdentityNotFound`] for an unknown identity.
    /// Insufficient credits is reported in the result, not as an error.
    pub fn charge(
        &self,
        identity_id: IdentityId,
        action: &str,
        client_cost: Option<i64>,
    ) -> Result<ChargeResult, MeterError> {
        self.charge_at(identity_id, action, client_cost, Utc::now())
    }

    /// [`charge`](Self::charge) with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`charge`](Self::charge).
    pub fn charge_at(
        &self,
        identity_id: IdentityId,
        action: &str,
        client_cost: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<ChargeResult, MeterError> {
        let now_ms = now.timestamp_millis();
        let result = self.store.write_tx(|tx| -> Result<ChargeResult, MeterError> {
            let identity = load_identity(tx, identity_id)?
                .ok_or(MeterError::IdentityNotFound { identity_id })?;
            let app = load_app(tx, identity.app_id)?;
            let decision = cost_of(&app.policy, action, client_cost);
            let (balance, _) = applicable_balance(tx, &identity)?;

            if decision.credits == 0 {
                return Ok(ChargeResult {
                    charged: true,
                    remaining: balance,
                    credits_required: 0,
                });
            }
            if balance < decision.credits {
                return Ok(ChargeResult {
                    charged: false,
                    remaining: balance,
                    credits_required: decision.credits,
                });
            }

            append_entry(
                tx,
                identity_id,
                -decision.credits,
                Reason::Consumed,
                Some(json!({ "action": action, "cost_source": decision.source.as_str() })),
                now_ms,
            )?;
            Ok(ChargeResult {
                charged: true,
                remaining: balance - decision.credits,
                credits_required: decision.credits,
            })
        })?;

        debug!(
            identity_id,
            action,
            charged = result.charged,
            credits_required = result.credits_required,
            remaining = result.remaining,
            "action charge"
        );
        Ok(result)
    }
}
