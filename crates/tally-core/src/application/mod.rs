//! Organization and application registry.
//!
//! Applications are the tenancy unit: identities, waitlist entries and
//! policies all hang off an application, and applications belong to an
//! organization. Shared-account consolidation only spans applications whose
//! `shared_accounts_enabled` flag is set within one organization.

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::policy::{AppPolicy, PolicyError};
use crate::store::{Store, StoreError, now_ms};

/// Identifier for an organization row.
pub type OrgId = i64;

/// Identifier for an application row.
pub type AppId = i64;

/// Errors from the application registry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApplicationError {
    /// Store-level failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The stored policy document failed to parse.
    #[error("policy for application {app_id}: {source}")]
    Policy {
        /// Application whose policy was rejected.
        app_id: AppId,
        /// Underlying policy error.
        #[source]
        source: PolicyError,
    },

    /// No application with the given id.
    #[error("application not found: {app_id}")]
    NotFound {
        /// The missing application id.
        app_id: AppId,
    },

    /// No organization with the given id.
    #[error("organization not found: {org_id}")]
    OrgNotFound {
        /// The missing organization id.
        org_id: OrgId,
    },
}

impl From<rusqlite::Error> for ApplicationError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

/// An organization row.
#[derive(Debug, Clone)]
pub struct Organization {
    /// Row id.
    pub id: OrgId,
    /// Unique organization name.
    pub name: String,
    /// Creation timestamp, unix milliseconds.
    pub created_at_ms: i64,
}

/// An application row with its parsed policy.
#[derive(Debug, Clone)]
pub struct Application {
    /// Row id.
    pub id: AppId,
    /// Owning organization.
    pub org_id: OrgId,
    /// Application name, unique within the organization.
    pub name: String,
    /// Whether identities of this application participate in shared
    /// accounts.
    pub shared_accounts_enabled: bool,
    /// Parsed credit policy.
    pub policy: AppPolicy,
    /// Creation timestamp, unix milliseconds.
    pub created_at_ms: i64,
}

/// Registry operations over organizations and applications.
#[derive(Debug, Clone)]
pub struct ApplicationRegistry {
    store: Store,
}

impl ApplicationRegistry {
    /// Creates a registry over the given store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Creates an organization.
    ///
    /// # Errors
    ///
    /// Returns a store error if the insert fails (including a duplicate
    /// name).
    pub fn create_org(&self, name: &str) -> Result<Organization, ApplicationError> {
        let created_at_ms = now_ms();
        let id = self.store.write(|conn| {
            conn.execute(
                "INSERT INTO organizations (name, created_at_ms) VALUES (?1, ?2)",
                params![name, created_at_ms],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        Ok(Organization {
            id,
            name: name.to_string(),
            created_at_ms,
        })
    }

    /// Creates an application under an organization.
    ///
    /// # Errors
    ///
    /// Returns [`ApplicationError::OrgNotFound`] for an unknown
    /// organization, or a store error if the insert fails.
    pub fn create_app(
        &self,
        org_id: OrgId,
        name: &str,
        shared_accounts_enabled: bool,
        policy: &AppPolicy,
    ) -> Result<Application, ApplicationError> {
        policy
            .validate()
            .map_err(|source| ApplicationError::Policy { app_id: 0, source })?;
        let policy_json = policy
            .to_json()
            .map_err(|source| ApplicationError::Policy { app_id: 0, source })?;
        let created_at_ms = now_ms();

        let id = self.store.write_tx(|tx| {
            let org_exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM organizations WHERE id = ?1",
                    params![org_id],
                    |row| row.get(0),
                )
                .optional()?;
            if org_exists.is_none() {
                return Err(ApplicationError::OrgNotFound { org_id });
            }
            tx.execute(
                "INSERT INTO applications
                     (org_id, name, shared_accounts_enabled, policy_json, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![org_id, name, shared_accounts_enabled, policy_json, created_at_ms],
            )?;
            Ok(tx.last_insert_rowid())
        })?;

        Ok(Application {
            id,
            org_id,
            name: name.to_string(),
            shared_accounts_enabled,
            policy: policy.clone(),
            created_at_ms,
        })
    }

    /// Loads an application with its parsed policy.
    ///
    /// # Errors
    ///
    /// Returns [`ApplicationError::NotFound`] for an unknown id.
    pub fn get_app(&self, app_id: AppId) -> Result<Application, ApplicationError> {
        self.store.read(|conn| match load_app(conn, app_id) {
            Ok(app) => Ok(Ok(app)),
            Err(ApplicationError::Store(err)) => Err(err),
            Err(other) => Ok(Err(other)),
        })?
    }

    /// Replaces an application's policy document.
    ///
    /// # Errors
    ///
    /// Returns [`ApplicationError::NotFound`] for an unknown id, or a policy
    /// error if the new document fails validation.
    pub fn set_policy(&self, app_id: AppId, policy: &AppPolicy) -> Result<(), ApplicationError> {
        policy
            .validate()
            .map_err(|source| ApplicationError::Policy { app_id, source })?;
        let policy_json = policy
            .to_json()
            .map_err(|source| ApplicationError::Policy { app_id, source })?;
        let updated = self.store.write(|conn| {
            Ok(conn.execute(
                "UPDATE applications SET policy_json = ?1 WHERE id = ?2",
                params![policy_json, app_id],
            )?)
        })?;
        if updated == 0 {
            return Err(ApplicationError::NotFound { app_id });
        }
        Ok(())
    }
}

/// Loads an application row inside an existing connection or transaction.
pub(crate) fn load_app(conn: &Connection, app_id: AppId) -> Result<Application, ApplicationError> {
    let row = conn
        .query_row(
            "SELECT id, org_id, name, shared_accounts_enabled, policy_json, created_at_ms
             FROM applications WHERE id = ?1",
            params![app_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()
        .map_err(StoreError::from)?;

    let (id, org_id, name, shared_accounts_enabled, policy_json, created_at_ms) =
        row.ok_or(ApplicationError::NotFound { app_id })?;

    let policy = AppPolicy::from_json(&policy_json)
        .map_err(|source| ApplicationError::Policy { app_id, source })?;

    Ok(Application {
        id,
        org_id,
        name,
        shared_accounts_enabled,
        policy,
        created_at_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ApplicationRegistry {
        ApplicationRegistry::new(Store::in_memory().expect("failed to create store"))
    }

    #[test]
    fn create_and_load_app_round_trips_policy() {
        let reg = registry();
        let org = reg.create_org("acme").expect("create org");
        let mut policy = AppPolicy::default();
        policy.referral_credits = 7;
        let app = reg
            .create_app(org.id, "landing", true, &policy)
            .expect("create app");

        let loaded = reg.get_app(app.id).expect("load app");
        assert_eq!(loaded.org_id, org.id);
        assert!(loaded.shared_accounts_enabled);
        assert_eq!(loaded.policy.referral_credits, 7);
    }

    #[test]
    fn unknown_app_is_not_found() {
        let reg = registry();
        let err = reg.get_app(42).unwrap_err();
        assert!(matches!(err, ApplicationError::NotFound { app_id: 42 }));
    }

    #[test]
    fn create_app_requires_existing_org() {
        let reg = registry();
        let err = reg
            .create_app(99, "landing", false, &AppPolicy::default())
            .unwrap_err();
        assert!(matches!(err, ApplicationError::OrgNotFound { org_id: 99 }));
    }

    #[test]
    fn set_policy_replaces_document() {
        let reg = registry();
        let org = reg.create_org("acme").expect("create org");
        let app = reg
            .create_app(org.id, "landing", false, &AppPolicy::default())
            .expect("create app");

        let mut policy = AppPolicy::default();
        policy.daily_referral_cap = 2;
        reg.set_policy(app.id, &policy).expect("set policy");

        let loaded = reg.get_app(app.id).expect("load app");
        assert_eq!(loaded.policy.daily_referral_cap, 2);
    }
}
