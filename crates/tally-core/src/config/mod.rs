//! Engine configuration.
//!
//! Parsed from TOML. Every field except the claim-token secret has a
//! default, so a minimal config is just the secret. The secret is hex so it
//! can hold arbitrary bytes; it must decode to at least 16 bytes.

use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::CodeTuning;
use crate::store::RetryTuning;
use crate::token::MIN_SECRET_LEN;

/// Errors from configuration loading.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to serialize TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A field failed semantic validation.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Engine configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Path to the `SQLite` database file.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Hex-encoded HMAC secret for claim and session tokens.
    pub claim_token_secret_hex: String,

    /// Claim-token lifetime in hours.
    #[serde(default = "default_claim_token_ttl_hours")]
    pub claim_token_ttl_hours: i64,

    /// Referral-code length in characters.
    #[serde(default = "default_referral_code_length")]
    pub referral_code_length: usize,

    /// Invitation-code length in characters.
    #[serde(default = "default_invitation_code_length")]
    pub invitation_code_length: usize,

    /// Candidate codes tried before code generation gives up.
    #[serde(default = "default_code_retry_attempts")]
    pub code_retry_attempts: u32,

    /// Read attempts against a busy database before giving up.
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,

    /// Backoff between busy-read attempts, milliseconds.
    #[serde(default = "default_read_backoff_ms")]
    pub read_backoff_ms: u64,

    /// `SQLite` busy timeout per statement, milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("tally.db")
}

const fn default_claim_token_ttl_hours() -> i64 {
    72
}

const fn default_referral_code_length() -> usize {
    8
}

const fn default_invitation_code_length() -> usize {
    6
}

const fn default_code_retry_attempts() -> u32 {
    5
}

const fn default_read_attempts() -> u32 {
    3
}

const fn default_read_backoff_ms() -> u64 {
    25
}

const fn default_busy_timeout_ms() -> u64 {
    2_000
}

impl EngineConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validates semantic constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] when a field is out of range or
    /// the secret does not decode.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let secret = self.secret()?;
        if secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Validation(format!(
                "claim_token_secret_hex must decode to at least {MIN_SECRET_LEN} bytes, got {}",
                secret.len()
            )));
        }
        if self.claim_token_ttl_hours <= 0 {
            return Err(ConfigError::Validation(format!(
                "claim_token_ttl_hours must be positive, got {}",
                self.claim_token_ttl_hours
            )));
        }
        for (name, value) in [
            ("referral_code_length", self.referral_code_length),
            ("invitation_code_length", self.invitation_code_length),
        ] {
            if value < 4 {
                return Err(ConfigError::Validation(format!(
                    "{name} must be at least 4, got {value}"
                )));
            }
        }
        if self.code_retry_attempts == 0 {
            return Err(ConfigError::Validation(
                "code_retry_attempts must be positive".to_string(),
            ));
        }
        if self.read_attempts == 0 {
            return Err(ConfigError::Validation(
                "read_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Decodes the token secret.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] when the hex does not decode.
    pub fn secret(&self) -> Result<Vec<u8>, ConfigError> {
        hex::decode(&self.claim_token_secret_hex)
            .map_err(|e| ConfigError::Validation(format!("claim_token_secret_hex: {e}")))
    }

    /// The claim-token lifetime.
    #[must_use]
    pub fn claim_ttl(&self) -> Duration {
        Duration::hours(self.claim_token_ttl_hours)
    }

    /// Referral-code generation tuning.
    #[must_use]
    pub const fn referral_code_tuning(&self) -> CodeTuning {
        CodeTuning {
            length: self.referral_code_length,
            attempts: self.code_retry_attempts,
        }
    }

    /// Store retry tuning.
    #[must_use]
    pub const fn retry_tuning(&self) -> RetryTuning {
        RetryTuning {
            read_attempts: self.read_attempts,
            read_backoff: StdDuration::from_millis(self.read_backoff_ms),
            busy_timeout: StdDuration::from_millis(self.busy_timeout_ms),
        }
    }
}
