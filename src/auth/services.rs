use tracing::{info, warn};

use crate::auth::claims::{decode_unverified, UnverifiedClaims};
use crate::auth::dto::ProviderProfile;
use crate::auth::provider::IdentityProvider;
use crate::auth::reconcile::{reconcile, ReconcileError};
use crate::error::AppError;
use crate::state::AppState;
use crate::users::repo_types::User;

/// Provider profile for `external_id`, or one synthesized from the token's
/// claims when the provider does not know the user or cannot be reached.
pub async fn resolve_profile(
    provider: &dyn IdentityProvider,
    external_id: &str,
    claims: &UnverifiedClaims,
) -> ProviderProfile {
    match provider.fetch_user(external_id).await {
        Ok(Some(profile)) => profile,
        Ok(None) => {
            warn!(external_id, "unknown to provider, using token claims");
            ProviderProfile::from_claims(external_id, claims)
        }
        Err(e) => {
            warn!(external_id, error = %e, "provider fetch failed, using token claims");
            ProviderProfile::from_claims(external_id, claims)
        }
    }
}

/// Full authentication path for a bearer token: decode, resolve, reconcile.
pub async fn authenticate(state: &AppState, token: &str) -> Result<User, AppError> {
    let claims = decode_unverified(token)?;
    let external_id = claims
        .subject()
        .ok_or(ReconcileError::MissingIdentity)?
        .to_string();

    let profile = resolve_profile(state.provider.as_ref(), &external_id, &claims).await;
    let user = reconcile(state.users.as_ref(), &external_id, &profile).await?;

    if !user.is_active {
        warn!(user_id = %user.id, "inactive user attempted to authenticate");
        return Err(AppError::Forbidden("Account is disabled".into()));
    }

    info!(user_id = %user.id, email = %user.email, role = %user.role, "user authenticated");
    Ok(user)
}
