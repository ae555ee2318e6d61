//! # tally-core
//!
//! Identity resolution and credit ledger engine for growth-marketing
//! backends: waitlists, referrals and point-like incentives.
//!
//! The engine does three things:
//!
//! - **Recognizes** an anonymous visitor across sessions and devices from a
//!   bag of progressively weaker signals ([`identity`]), creating one
//!   identity per (application, visitor) and optionally consolidating
//!   identities across sibling applications into a shared account.
//! - **Accounts** for earned and spent credits in an append-only ledger
//!   ([`ledger`]) whose balances are always derived sums, never stored
//!   counters.
//! - **Adjudicates** referral claims ([`referral`]), invitation-code
//!   redemptions ([`invitation`]) and metered action charges ([`meter`]) so
//!   credits move exactly once under concurrent, partially-failing
//!   requests.
//!
//! All synchronization lives in the durable store ([`store`]): every
//! check-then-act span runs inside one immediate `SQLite` transaction. The
//! HTTP layer, admin UI and email delivery are consumers of this crate and
//! live elsewhere; [`engine::Engine`] is the surface they call.
//!
//! ## Example
//!
//! ```rust
//! use tally_core::config::EngineConfig;
//! use tally_core::engine::Engine;
//! use tally_core::identity::{ServerContext, SignalBag};
//! use tally_core::policy::AppPolicy;
//!
//! let config = EngineConfig::from_toml(
//!     "claim_token_secret_hex = \"30313233343536373839616263646566\"",
//! )
//! .unwrap();
//! let engine = Engine::in_memory(&config).unwrap();
//!
//! let org = engine.create_org("acme").unwrap();
//! let app = engine
//!     .create_app(org.id, "landing", false, &AppPolicy::default())
//!     .unwrap();
//!
//! let signals = SignalBag {
//!     primary: "device-fingerprint".to_string(),
//!     canvas: None,
//!     browser_sig: None,
//! };
//! let visitor = engine
//!     .resolve_identity(app.id, &signals, &ServerContext::default())
//!     .unwrap();
//!
//! let claim = engine
//!     .issue_referral_claim(&visitor.identity.referral_code)
//!     .unwrap();
//! assert!(!claim.token.is_empty());
//! ```

pub mod application;
pub mod config;
pub mod engine;
pub mod identity;
pub mod invitation;
pub mod ledger;
pub mod meter;
pub mod policy;
pub mod referral;
pub mod store;
pub mod token;

pub use application::{AppId, Application, ApplicationRegistry, OrgId, Organization};
pub use config::EngineConfig;
pub use engine::{Engine, EngineError, ProfileAction, ProfileGrantOutcome};
pub use identity::{
    Identity, IdentityId, IdentityResolver, IdentityStore, Resolution, ResolvedVia,
    ServerContext, SignalBag,
};
pub use invitation::{InvitationCodeManager, RedemptionOutcome, WaitlistEntry};
pub use ledger::{CreditLedger, DebitOutcome, LedgerEntry, Reason};
pub use meter::{ActionMeter, ChargeResult, cost_of};
pub use policy::AppPolicy;
pub use referral::{ClaimOutcome, IssuedClaim, Referral, ReferralEngine};
pub use store::Store;
pub use token::{TokenClaims, TokenSigner};
