//! Per-application policy documents.
//!
//! A policy controls every credit amount the engine hands out or charges:
//! referral grants, invitation and profile-action bonuses, action costs, the
//! per-referrer daily cap, and whether callers may price their own actions.
//! Policies are stored as a JSON column on the application row and parsed
//! with per-field defaults, so an empty document `{}` is a valid policy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from policy parsing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PolicyError {
    /// The stored policy document is not valid JSON / does not match the
    /// schema.
    #[error("invalid policy document: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field failed semantic validation.
    #[error("invalid policy: {reason}")]
    Validation {
        /// Why the policy was rejected.
        reason: String,
    },
}

/// Credit policy for one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppPolicy {
    /// Credits granted to the referrer on a successful claim.
    pub referral_credits: i64,

    /// Credits granted to the referred identity on a successful claim.
    pub referred_credits: i64,

    /// Maximum successful referral claims per referrer per calendar day.
    /// Zero disables referrals entirely.
    pub daily_referral_cap: i64,

    /// One-time bonus for redeeming an invitation code.
    pub invitation_credits: i64,

    /// One-time bonus for claiming a display name.
    pub name_claim_credits: i64,

    /// One-time bonus for attaching an email address.
    pub email_claim_credits: i64,

    /// One-time bonus for verifying an email address.
    pub email_verify_credits: i64,

    /// One-time bonus for joining the waitlist.
    pub waitlist_join_credits: i64,

    /// Per-action credit costs, keyed by action name.
    pub action_costs: BTreeMap<String, i64>,

    /// Whether callers may supply their own action cost.
    pub allow_client_cost: bool,

    /// Upper clamp applied to client-supplied costs.
    pub max_client_cost: i64,

    /// Cost for actions with no policy entry and no (allowed) client cost.
    pub default_action_cost: i64,

    /// Minutes added to UTC before computing the daily-cap day boundary.
    /// `0` means the referral day rolls over at UTC midnight.
    pub day_boundary_offset_minutes: i32,
}

impl Default for AppPolicy {
    fn default() -> Self {
        Self {
            referral_credits: 5,
            referred_credits: 3,
            daily_referral_cap: 10,
            invitation_credits: 10,
            name_claim_credits: 2,
            email_claim_credits: 3,
            email_verify_credits: 5,
            waitlist_join_credits: 1,
            action_costs: BTreeMap::new(),
            allow_client_cost: false,
            max_client_cost: 100,
            default_action_cost: 1,
            day_boundary_offset_minutes: 0,
        }
    }
}

impl AppPolicy {
    /// Parses a policy from its stored JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or fails validation.
    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let policy: Self = serde_json::from_str(json)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Serializes the policy to its stored JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, PolicyError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Validates semantic constraints.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Validation`] when an amount is negative.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let amounts = [
            ("referral_credits", self.referral_credits),
            ("referred_credits", self.referred_credits),
            ("daily_referral_cap", self.daily_referral_cap),
            ("invitation_credits", self.invitation_credits),
            ("name_claim_credits", self.name_claim_credits),
            ("email_claim_credits", self.email_claim_credits),
            ("email_verify_credits", self.email_verify_credits),
            ("waitlist_join_credits", self.waitlist_join_credits),
            ("max_client_cost", self.max_client_cost),
            ("default_action_cost", self.default_action_cost),
        ];
        for (name, value) in amounts {
            if value < 0 {
                return Err(PolicyError::Validation {
                    reason: format!("{name} must be non-negative, got {value}"),
                });
            }
        }
        if let Some((action, cost)) = self.action_costs.iter().find(|(_, c)| **c < 0) {
            return Err(PolicyError::Validation {
                reason: format!("action_costs[{action}] must be non-negative, got {cost}"),
            });
        }
        Ok(())
    }
}
