//! The thin operations surface the admin front-end calls into: campaign
//! lifecycle actions, webhook test/retry, and the availability toggle.
//! Everything here is bearer-token authenticated and tenant-scoped; a
//! cross-tenant id answers 404.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use omc_auth::resolve_identity;
use omc_core::{Error, ErrorKind, TenantCtx};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::state::AppState;

/// Super admins select a tenant to act in through this header.
const ORG_SELECTOR_HEADER: &str = "X-Organization-Id";

#[derive(Deserialize, Default)]
pub struct StartCampaignBody {
    #[serde(default)]
    recipients: Vec<omc_campaigns::RecipientSpec>,
}

pub async fn start_campaign(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<StartCampaignBody>,
) -> Response {
    let recipients = body.recipients;
    let st = state.clone();
    run(&state, &headers, "campaigns", "manage", move |ctx| async move {
        let campaign = st.campaigns.start(ctx.org_id, id, &recipients).await?;
        Ok(json!({ "campaign_id": campaign.id, "status": campaign.status, "total": campaign.total_count }))
    })
    .await
}

pub async fn pause_campaign(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let st = state.clone();
    run(&state, &headers, "campaigns", "manage", move |ctx| async move {
        st.campaigns.pause(ctx.org_id, id).await?;
        Ok(json!({ "campaign_id": id, "status": "paused" }))
    })
    .await
}

pub async fn resume_campaign(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let st = state.clone();
    run(&state, &headers, "campaigns", "manage", move |ctx| async move {
        st.campaigns.resume(ctx.org_id, id).await?;
        Ok(json!({ "campaign_id": id, "status": "running" }))
    })
    .await
}

pub async fn retry_campaign(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let st = state.clone();
    run(&state, &headers, "campaigns", "manage", move |ctx| async move {
        let reset = st.campaigns.retry_failed(ctx.org_id, id).await?;
        Ok(json!({ "campaign_id": id, "reset": reset }))
    })
    .await
}

pub async fn test_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let st = state.clone();
    run(&state, &headers, "webhooks", "manage", move |ctx| async move {
        st.outbox.send_test_event(ctx.org_id, id).await?;
        Ok(json!({ "message": "Test webhook sent successfully" }))
    })
    .await
}

pub async fn retry_webhook_deliveries(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let st = state.clone();
    run(&state, &headers, "webhooks", "manage", move |ctx| async move {
        let count = st.outbox.retry_failed(ctx.org_id, id).await?;
        Ok(json!({ "message": "Retry scheduled", "count": count }))
    })
    .await
}

pub async fn webhook_health(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let st = state.clone();
    run(&state, &headers, "webhooks", "read", move |ctx| async move {
        st.store
            .webhook_scoped(ctx.org_id, id)
            .await
            .and_then(omc_auth::require_scoped)?;
        let (failed, retrying) = st.store.delivery_health(ctx.org_id, id).await?;
        Ok(json!({ "failed_count": failed, "retrying_count": retrying }))
    })
    .await
}

#[derive(Deserialize)]
pub struct CreateTransferBody {
    contact_id: Uuid,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    team_id: Option<Uuid>,
}

/// Manual handoff of a contact to the human queue. A contact with an open
/// transfer answers 409.
pub async fn create_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateTransferBody>,
) -> Response {
    let st = state.clone();
    run(&state, &headers, "transfers", "handle", move |ctx| async move {
        st.store
            .contact_scoped(ctx.org_id, body.contact_id)
            .await
            .and_then(omc_auth::require_scoped)?;
        let transfer = st
            .transfers
            .create(
                ctx.org_id,
                body.contact_id,
                omc_transfers::TransferSource::Manual,
                &body.reason,
                body.team_id,
            )
            .await?;
        Ok(json!({
            "transfer_id": transfer.id,
            "contact_id": transfer.contact_id,
            "status": transfer.status,
            "agent_id": transfer.agent_id,
        }))
    })
    .await
}

/// Closes a transfer; automation resumes on the contact's next message.
pub async fn resume_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let st = state.clone();
    run(&state, &headers, "transfers", "handle", move |ctx| async move {
        let transfer = st.transfers.resume(ctx.org_id, id).await?;
        Ok(json!({ "transfer_id": transfer.id, "status": transfer.status }))
    })
    .await
}

#[derive(Deserialize)]
pub struct AvailabilityBody {
    away: bool,
}

pub async fn set_availability(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AvailabilityBody>,
) -> Response {
    let away = body.away;
    let st = state.clone();
    run(&state, &headers, "transfers", "handle", move |ctx| async move {
        let user_id = ctx
            .user_id
            .ok_or_else(|| Error::unauthenticated("user identity required"))?;
        let user = st
            .transfers
            .set_availability(ctx.org_id, user_id, away)
            .await?;
        Ok(json!({
            "user_id": user.id,
            "availability": user.availability,
            "break_started_at": user.break_started_at.map(|t| t.unix_timestamp()),
        }))
    })
    .await
}

async fn run<F, Fut>(
    state: &AppState,
    headers: &HeaderMap,
    resource: &str,
    action: &str,
    handler: F,
) -> Response
where
    F: FnOnce(TenantCtx) -> Fut,
    Fut: std::future::Future<Output = omc_core::Result<serde_json::Value>>,
{
    let ctx = match authenticate(state, headers).await {
        Ok(ctx) => ctx,
        Err(err) => return error_response(err),
    };
    match state
        .permissions
        .has_permission(&state.store, &ctx, resource, action)
        .await
    {
        Ok(true) => {}
        Ok(false) => return error_response(Error::permission_denied("missing permission")),
        Err(err) => return error_response(err),
    }
    match handler(ctx).await {
        Ok(data) => (StatusCode::OK, Json(json!({ "data": data }))).into_response(),
        Err(err) => error_response(err),
    }
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> omc_core::Result<TenantCtx> {
    let token = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| Error::unauthenticated("missing bearer token"))?;
    let claims = state.signer.verify(token)?;

    let org_selector = headers
        .get(ORG_SELECTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<Uuid>().ok());
    resolve_identity(&state.store, claims.sub, org_selector).await
}

fn error_response(err: Error) -> Response {
    let err = err.fail_closed();
    let status =
        StatusCode::from_u16(err.kind().http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if err.kind() == ErrorKind::Internal {
        tracing::error!(error = %err, "request failed");
    }
    (
        status,
        Json(json!({
            "error": { "kind": err.kind().as_str(), "message": err.message() }
        })),
    )
        .into_response()
}
