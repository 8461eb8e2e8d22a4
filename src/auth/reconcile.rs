//! Maps an external identity to exactly one local user row.
//!
//! Lookup order is external id, then email, then insert. All reads and the
//! single write share one store transaction. A write that loses a race on a
//! unique index is followed by exactly one more pass over the lookups.

use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::auth::dto::{normalize_email, ProviderProfile};
use crate::users::repo::{StoreError, UserStore, UserTx};
use crate::users::repo_types::{NewUser, Role, User};

/// Extra lookup passes allowed after a write loses a uniqueness race.
pub const MAX_RACE_RETRIES: u32 = 1;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("token carries no user id")]
    MissingIdentity,
    #[error("user has no email address")]
    NoEmail,
    #[error("email {email} is already linked to a different account")]
    IdentityConflict { email: String },
    #[error("could not establish a user record for {external_id}")]
    ReconciliationFailed { external_id: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    /// True for the outcomes that mean "this identity cannot be mapped",
    /// as opposed to infrastructure failures.
    pub fn is_identity_failure(&self) -> bool {
        !matches!(self, ReconcileError::Store(_))
    }

    /// Message safe to hand to the caller: no addresses or ids.
    pub fn public_message(&self) -> String {
        match self {
            ReconcileError::IdentityConflict { .. } => {
                "email is already linked to a different account".to_string()
            }
            ReconcileError::ReconciliationFailed { .. } => {
                "could not establish a user record".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[instrument(skip(store, profile), fields(external_id = %external_id))]
pub async fn reconcile(
    store: &dyn UserStore,
    external_id: &str,
    profile: &ProviderProfile,
) -> Result<User, ReconcileError> {
    let external_id = external_id.trim();
    if external_id.is_empty() {
        return Err(ReconcileError::MissingIdentity);
    }
    let email = profile
        .primary_email()
        .map(normalize_email)
        .filter(|e| !e.is_empty())
        .ok_or(ReconcileError::NoEmail)?;

    let mut tx = store.begin().await?;
    match reconcile_in_tx(tx.as_mut(), external_id, &email, profile).await {
        Ok(user) => {
            tx.commit().await?;
            Ok(user)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                warn!(error = %rb, "rollback after failed reconciliation");
            }
            Err(e)
        }
    }
}

async fn reconcile_in_tx(
    tx: &mut dyn UserTx,
    external_id: &str,
    email: &str,
    profile: &ProviderProfile,
) -> Result<User, ReconcileError> {
    let mut retries_left = MAX_RACE_RETRIES;
    loop {
        let retrying = retries_left < MAX_RACE_RETRIES;

        let written = if let Some(user) = tx.find_by_external_id(external_id).await? {
            return refresh(tx, user, email, profile).await;
        } else if let Some(user) = tx.find_by_email(email).await? {
            if let Some(bound) = user.external_id.as_deref().filter(|b| *b != external_id) {
                error!(%email, bound_to = %bound, "email linked to another identity");
                return Err(ReconcileError::IdentityConflict {
                    email: email.to_string(),
                });
            }
            link(tx, user, external_id, profile).await
        } else if retrying {
            error!("no user row visible after losing insert race");
            return Err(ReconcileError::ReconciliationFailed {
                external_id: external_id.to_string(),
            });
        } else {
            create(tx, external_id, email, profile).await
        };

        match written {
            Ok(user) => return Ok(user),
            Err(StoreError::UniqueViolation { constraint }) if retries_left > 0 => {
                retries_left -= 1;
                warn!(?constraint, "concurrent reconciliation detected, looking up again");
            }
            Err(StoreError::UniqueViolation { constraint }) => {
                error!(?constraint, "unique violation persisted after retry");
                return Err(ReconcileError::ReconciliationFailed {
                    external_id: external_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Known identity: bring stored email and names in line with the provider.
async fn refresh(
    tx: &mut dyn UserTx,
    mut user: User,
    email: &str,
    profile: &ProviderProfile,
) -> Result<User, ReconcileError> {
    let mut changed = false;
    if user.email != email {
        user.email = email.to_string();
        changed = true;
    }
    if let Some(first) = profile.first_name.as_deref() {
        if user.first_name != first {
            user.first_name = first.to_string();
            changed = true;
        }
    }
    if let Some(last) = profile.last_name.as_deref() {
        if user.last_name != last {
            user.last_name = last.to_string();
            changed = true;
        }
    }
    if !changed {
        return Ok(user);
    }

    match tx.update_profile(&user).await {
        Ok(updated) => {
            info!(user_id = %updated.id, "user profile refreshed from provider");
            Ok(updated)
        }
        Err(StoreError::UniqueViolation { .. }) => {
            error!(user_id = %user.id, %email, "provider email already belongs to another user");
            Err(ReconcileError::IdentityConflict {
                email: email.to_string(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// One-time promotion of a local-only row to a provider-linked one.
async fn link(
    tx: &mut dyn UserTx,
    mut user: User,
    external_id: &str,
    profile: &ProviderProfile,
) -> Result<User, StoreError> {
    user.external_id = Some(external_id.to_string());
    if let Some(first) = profile.first_name.as_deref() {
        user.first_name = first.to_string();
    }
    if let Some(last) = profile.last_name.as_deref() {
        user.last_name = last.to_string();
    }
    if let Some(avatar) = profile.avatar_url.as_deref() {
        user.avatar_url = Some(avatar.to_string());
    }
    let linked = tx.update_profile(&user).await?;
    info!(user_id = %linked.id, email = %linked.email, "existing user linked to provider identity");
    Ok(linked)
}

async fn create(
    tx: &mut dyn UserTx,
    external_id: &str,
    email: &str,
    profile: &ProviderProfile,
) -> Result<User, StoreError> {
    let new = NewUser {
        external_id: Some(external_id.to_string()),
        email: email.to_string(),
        first_name: profile.first_name.clone().unwrap_or_default(),
        last_name: profile.last_name.clone().unwrap_or_default(),
        avatar_url: profile.avatar_url.clone(),
        role: Role::Unassigned,
    };
    let user = tx.insert(&new).await?;
    info!(user_id = %user.id, email = %user.email, "user created from provider identity");
    Ok(user)
}
