use axum::{
    extract::{Path, Query, State},
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::{
        extractors::{AdminUser, AuthUser},
        provider::IdentityProvider,
    },
    error::AppError,
    state::AppState,
    users::{
        dto::{ListUsersQuery, PublicUser, SyncMetadataResponse, UpdateProfileRequest, UpdateRoleRequest},
        repo_types::{Role, User, UserFilter},
    },
};

pub fn me_routes() -> Router<AppState> {
    Router::new()
        .route("/me", get(get_me))
        .route("/users/me", patch(update_profile))
        .route("/users/me/sync-metadata", post(sync_metadata))
}

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users))
        .route("/users/:id/role", patch(update_role))
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn get_me(AuthUser(user): AuthUser) -> Json<PublicUser> {
    Json(user.into())
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn update_profile(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<PublicUser>, AppError> {
    let first_name = payload
        .first_name
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| user.first_name.clone());
    let last_name = payload
        .last_name
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| user.last_name.clone());

    if first_name.len() > 255 || last_name.len() > 255 {
        return Err(AppError::BadRequest("Name too long".into()));
    }
    if let Some(role) = payload.role {
        check_self_assigned_role(user.role, role)?;
    }

    let mut updated = state
        .users
        .update_names(user.id, &first_name, &last_name)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;

    if let Some(role) = payload.role {
        if role != updated.role {
            updated = state
                .users
                .update_role(user.id, role)
                .await?
                .ok_or_else(|| AppError::NotFound("User not found".into()))?;
            info!(role = %updated.role, "role chosen during onboarding");
        }
        if updated.is_linked() {
            if let Err(e) = push_role_hint(state.provider.as_ref(), &updated).await {
                warn!(error = %e, "role saved locally but provider sync failed");
            }
        }
    }

    info!(first_name = %updated.first_name, last_name = %updated.last_name, "profile updated");
    Ok(Json(updated.into()))
}

/// Users pick `student` or `teacher` once, while still unassigned.
/// Resubmitting the current role is a no-op.
fn check_self_assigned_role(current: Role, requested: Role) -> Result<(), AppError> {
    if requested == current {
        return Ok(());
    }
    match (current, requested) {
        (Role::Unassigned, Role::Student | Role::Teacher) => Ok(()),
        (_, Role::Admin) | (_, Role::Unassigned) => {
            Err(AppError::Forbidden("This role can only be assigned by an admin".into()))
        }
        _ => Err(AppError::Forbidden("Role has already been chosen".into())),
    }
}

/// Pushes the caller's role to the provider. The local role stays
/// authoritative, so a failed push is reported but not an error.
#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn sync_metadata(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<SyncMetadataResponse>, AppError> {
    if !user.is_linked() {
        return Err(AppError::BadRequest("User is not linked to an identity provider".into()));
    }

    let response = match push_role_hint(state.provider.as_ref(), &user).await {
        Ok(()) => SyncMetadataResponse {
            success: true,
            role: user.role,
            message: "Metadata synced to identity provider".into(),
        },
        Err(e) => {
            warn!(error = %e, "role sync to provider failed");
            SyncMetadataResponse {
                success: false,
                role: user.role,
                message: "Could not sync to identity provider; the role is saved locally".into(),
            }
        }
    };
    Ok(Json(response))
}

#[instrument(skip_all)]
pub async fn list_users(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Query(q): Query<ListUsersQuery>,
) -> Result<Json<Vec<PublicUser>>, AppError> {
    let filter = UserFilter {
        role: q.role,
        is_active: q.is_active,
        limit: q.limit.clamp(1, 200),
        offset: q.offset.max(0),
    };
    let users = state.users.list(&filter).await?;
    Ok(Json(users.into_iter().map(PublicUser::from).collect()))
}

#[instrument(skip(state, admin, payload))]
pub async fn update_role(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateRoleRequest>,
) -> Result<Json<PublicUser>, AppError> {
    let updated = state
        .users
        .update_role(id, payload.role)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;

    info!(admin_id = %admin.id, user_id = %updated.id, role = %updated.role, "role updated");

    if updated.is_linked() {
        if let Err(e) = push_role_hint(state.provider.as_ref(), &updated).await {
            warn!(user_id = %updated.id, error = %e, "role saved locally but provider sync failed");
        }
    }

    Ok(Json(updated.into()))
}

async fn push_role_hint(provider: &dyn IdentityProvider, user: &User) -> anyhow::Result<()> {
    let Some(external_id) = user.external_id.as_deref() else {
        anyhow::bail!("user {} has no provider identity", user.id);
    };
    provider
        .update_public_metadata(
            external_id,
            json!({ "role": user.role, "profile_completed": true }),
        )
        .await
}
