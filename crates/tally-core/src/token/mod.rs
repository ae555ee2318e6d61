//! HMAC-signed, expiring tokens.
//!
//! A token binds a `kind` (what the token authorizes), a `subject` (what it
//! refers to, e.g. a referral code) and an expiry into a compact string:
//!
//! ```text
//! v1.<base64url(kind|subject|expires_at_ms)>.<hex(hmac-sha256(payload))>
//! ```
//!
//! Verification recomputes the MAC over the decoded payload and compares it
//! in constant time. Tokens carry no server-side state; possession of a
//! valid, unexpired token is the whole proof.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Version prefix for the current token format.
const TOKEN_VERSION: &str = "v1";

/// Payload field separator. Kind and subject must not contain it.
const PAYLOAD_SEP: char = '|';

/// Minimum accepted secret length in bytes.
pub const MIN_SECRET_LEN: usize = 16;

/// Errors from token signing and verification.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TokenError {
    /// The signing secret is too short to be safe.
    #[error("token secret must be at least {MIN_SECRET_LEN} bytes, got {len}")]
    SecretTooShort {
        /// Actual secret length in bytes.
        len: usize,
    },

    /// Kind or subject contained the payload separator.
    #[error("token field contains reserved separator: {field}")]
    InvalidField {
        /// Which field was rejected.
        field: &'static str,
    },

    /// The token string does not have the expected structure.
    #[error("malformed token")]
    Malformed,

    /// The MAC did not match the payload.
    #[error("token MAC mismatch")]
    MacMismatch,

    /// The token was valid for a different kind.
    #[error("wrong token kind: expected {expected}, got {actual}")]
    WrongKind {
        /// The kind the verifier demanded.
        expected: String,
        /// The kind carried by the token.
        actual: String,
    },

    /// The token expired.
    #[error("token expired at {expires_at_ms}")]
    Expired {
        /// Expiry carried by the token, unix milliseconds.
        expires_at_ms: i64,
    },
}

/// Claims recovered from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    /// What the token authorizes.
    pub kind: String,
    /// What the token refers to.
    pub subject: String,
    /// Expiry, unix milliseconds.
    pub expires_at_ms: i64,
}

/// Signs and verifies expiring tokens with a shared secret.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl TokenSigner {
    /// Creates a signer from a shared secret.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::SecretTooShort`] for secrets under
    /// [`MIN_SECRET_LEN`] bytes.
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, TokenError> {
        let secret = secret.into();
        if secret.len() < MIN_SECRET_LEN {
            return Err(TokenError::SecretTooShort { len: secret.len() });
        }
        Ok(Self { secret })
    }

    /// Signs a token over `(kind, subject, expires_at)`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::InvalidField`] if kind or subject contain the
    /// payload separator.
    pub fn sign(
        &self,
        kind: &str,
        subject: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        if kind.contains(PAYLOAD_SEP) {
            return Err(TokenError::InvalidField { field: "kind" });
        }
        if subject.contains(PAYLOAD_SEP) {
            return Err(TokenError::InvalidField { field: "subject" });
        }

        let payload = format!(
            "{kind}{PAYLOAD_SEP}{subject}{PAYLOAD_SEP}{}",
            expires_at.timestamp_millis()
        );
        let mac = self.compute_mac(payload.as_bytes());
        Ok(format!(
            "{TOKEN_VERSION}.{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            hex::encode(mac)
        ))
    }

    /// Verifies a token and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Malformed`] for structural problems,
    /// [`TokenError::MacMismatch`] when the MAC does not match,
    /// [`TokenError::WrongKind`] when the kind differs from `expected_kind`,
    /// and [`TokenError::Expired`] when `now` is at or past the expiry.
    pub fn verify(
        &self,
        token: &str,
        expected_kind: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenClaims, TokenError> {
        let mut parts = token.splitn(3, '.');
        let (version, payload_b64, mac_hex) = match (parts.next(), parts.next(), parts.next()) {
            (Some(v), Some(p), Some(m)) => (v, p, m),
            _ => return Err(TokenError::Malformed),
        };
        if version != TOKEN_VERSION {
            return Err(TokenError::Malformed);
        }

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let provided_mac = hex::decode(mac_hex).map_err(|_| TokenError::Malformed)?;

        let computed = self.compute_mac(&payload);
        if !bool::from(computed.ct_eq(provided_mac.as_slice())) {
            return Err(TokenError::MacMismatch);
        }

        let payload = String::from_utf8(payload).map_err(|_| TokenError::Malformed)?;
        let mut fields = payload.splitn(3, PAYLOAD_SEP);
        let (kind, subject, expires) = match (fields.next(), fields.next(), fields.next()) {
            (Some(k), Some(s), Some(e)) => (k, s, e),
            _ => return Err(TokenError::Malformed),
        };
        let expires_at_ms: i64 = expires.parse().map_err(|_| TokenError::Malformed)?;

        if kind != expected_kind {
            return Err(TokenError::WrongKind {
                expected: expected_kind.to_string(),
                actual: kind.to_string(),
            });
        }
        if now.timestamp_millis() >= expires_at_ms {
            return Err(TokenError::Expired { expires_at_ms });
        }

        Ok(TokenClaims {
            kind: kind.to_string(),
            subject: subject.to_string(),
            expires_at_ms,
        })
    }

    fn compute_mac(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new(*b"0123456789abcdef0123456789abcdef").expect("valid secret")
    }

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn round_trip_preserves_claims() {
        let s = signer();
        let token = s.sign("referral_claim", "ABC123", at(10_000)).unwrap();
        let claims = s.verify(&token, "referral_claim", at(5_000)).unwrap();
        assert_eq!(claims.subject, "ABC123");
        assert_eq!(claims.expires_at_ms, 10_000);
    }

    #[test]
    fn rejects_expired_token() {
        let s = signer();
        let token = s.sign("referral_claim", "ABC123", at(10_000)).unwrap();
        let err = s.verify(&token, "referral_claim", at(10_000)).unwrap_err();
        assert_eq!(err, TokenError::Expired { expires_at_ms: 10_000 });
    }

    #[test]
    fn rejects_wrong_kind() {
        let s = signer();
        let token = s.sign("session", "ABC123", at(10_000)).unwrap();
        let err = s.verify(&token, "referral_claim", at(0)).unwrap_err();
        assert!(matches!(err, TokenError::WrongKind { .. }));
    }

    #[test]
    fn rejects_tampered_payload() {
        let s = signer();
        let token = s.sign("referral_claim", "ABC123", at(10_000)).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(b"referral_claim|ZZZ999|10000");
        parts[1] = &forged;
        let forged_token = parts.join(".");
        let err = s.verify(&forged_token, "referral_claim", at(0)).unwrap_err();
        assert_eq!(err, TokenError::MacMismatch);
    }

    #[test]
    fn rejects_token_signed_with_other_secret() {
        let s = signer();
        let other = TokenSigner::new(*b"ffffffffffffffff0123456789abcdef").unwrap();
        let token = other.sign("referral_claim", "ABC123", at(10_000)).unwrap();
        let err = s.verify(&token, "referral_claim", at(0)).unwrap_err();
        assert_eq!(err, TokenError::MacMismatch);
    }

    #[test]
    fn rejects_malformed_structure() {
        let s = signer();
        for bad in ["", "v1", "v1.only", "v2.a.b", "v1.!!!.00", "v1.YQ.zz"] {
            let err = s.verify(bad, "referral_claim", at(0)).unwrap_err();
            assert_eq!(err, TokenError::Malformed, "input: {bad}");
        }
    }

    #[test]
    fn rejects_separator_in_subject() {
        let s = signer();
        let err = s.sign("referral_claim", "A|B", at(10_000)).unwrap_err();
        assert!(matches!(err, TokenError::InvalidField { field: "subject" }));
    }

    #[test]
    fn rejects_short_secret() {
        let err = TokenSigner::new(b"short".to_vec()).unwrap_err();
        assert_eq!(err, TokenError::SecretTooShort { len: 5 });
    }
}
