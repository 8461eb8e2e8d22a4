use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::{ClerkUser, ProviderProfile},
        reconcile::reconcile,
    },
    error::AppError,
    state::AppState,
    webhooks::signature::{self, SignatureError, SvixHeaders},
};

pub fn routes() -> Router<AppState> {
    Router::new().route("/webhooks/clerk", post(clerk_webhook))
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct DeletedUser {
    id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub action: &'static str,
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or(SignatureError::MissingHeader(name))
}

fn verify_request(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), SignatureError> {
    let svix = SvixHeaders {
        id: header(headers, "svix-id")?,
        timestamp: header(headers, "svix-timestamp")?,
        signatures: header(headers, "svix-signature")?,
    };
    signature::verify(secret, &svix, body, OffsetDateTime::now_utc().unix_timestamp())
}

/// Out-of-band provisioning from the identity provider.
#[instrument(skip_all)]
pub async fn clerk_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, AppError> {
    let Some(secret) = state.config.clerk.webhook_secret.as_deref() else {
        return Err(AppError::ServiceUnavailable("Webhook secret is not configured".into()));
    };
    verify_request(secret, &headers, &body)?;

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid webhook payload: {e}")))?;

    let action = match event.kind.as_str() {
        "user.created" | "user.updated" => {
            let clerk_user: ClerkUser = serde_json::from_value(event.data)
                .map_err(|e| AppError::BadRequest(format!("Invalid user payload: {e}")))?;
            let profile = ProviderProfile::from(clerk_user);
            let external_id = profile.id.clone();

            let user = reconcile(state.users.as_ref(), &external_id, &profile)
                .await
                .map_err(|e| {
                    if e.is_identity_failure() {
                        AppError::Unprocessable(e.public_message())
                    } else {
                        AppError::from(e)
                    }
                })?;
            info!(event = %event.kind, user_id = %user.id, %external_id, "webhook reconciled user");
            "reconciled"
        }
        "user.deleted" => {
            let deleted: DeletedUser = serde_json::from_value(event.data)
                .map_err(|e| AppError::BadRequest(format!("Invalid user payload: {e}")))?;
            let Some(external_id) = deleted.id.filter(|id| !id.trim().is_empty()) else {
                return Err(AppError::BadRequest("Deleted user carries no id".into()));
            };
            let removed = state.users.delete_by_external_id(&external_id).await?;
            if removed == 0 {
                warn!(%external_id, "webhook delete for unknown user");
            } else {
                info!(%external_id, "webhook deleted user");
            }
            "deleted"
        }
        other => {
            info!(event = %other, "webhook event ignored");
            "ignored"
        }
    };

    Ok(Json(WebhookAck { received: true, action }))
}
