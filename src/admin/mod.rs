use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use axum_extra::typed_header::TypedHeader;
use chrono::Utc;
use headers::{authorization::Bearer, Authorization};
use serde::{Deserialize, Serialize};

use crate::{
    entitlement::{Evaluation, UploadGate},
    model::{
        entitlement::EntitlementRecord,
        plan::find_plan,
        user::{UserAccount, UserStats},
    },
    notify::{Notifier, NotificationKind},
};

/// Shared state for the operator and glue surface.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<UploadGate>,
    pub notifier: Notifier,
    pub admin_token: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/approve", post(approve))
        .route("/admin/unapprove", post(unapprove))
        .route("/admin/ban", post(ban))
        .route("/admin/unban", post(unban))
        .route("/admin/premium-users", get(premium_users))
        .route("/admin/users", get(list_users))
        .route("/admin/users/count", get(users_count))
        .route("/admin/users/{id}/stats", get(user_stats))
        .route("/admin/users/{id}", delete(delete_user))
        .route("/trial/activate", post(activate_trial))
        // Upload Gate contract consumed by the messaging glue.
        .route("/gate/authorize", post(gate_authorize))
        .route("/gate/commit", post(gate_commit))
        .route("/gate/release", post(gate_release))
}

type ApiError = (StatusCode, String);

fn check_token(state: &AppState, token: &str) -> Result<(), ApiError> {
    if token != state.admin_token {
        return Err((StatusCode::UNAUTHORIZED, "invalid_token".to_string()));
    }
    Ok(())
}

fn internal(err: anyhow::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

/// Store failures on the upload path are fail-closed: the glue shows the user
/// a transient "try again", never an allow.
fn store_unavailable(err: anyhow::Error) -> ApiError {
    tracing::error!("store failure on gate path: {err:#}");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        "store_unavailable_try_again".to_string(),
    )
}

#[derive(Deserialize)]
struct ApproveRequest {
    user_id: i64,
    plan_id: String,
    #[serde(default)]
    payment_details: String,
}

#[derive(Serialize)]
struct ApproveResponse {
    user_id: i64,
    plan: String,
    granted: bool,
}

async fn approve(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(payload): Json<ApproveRequest>,
) -> Result<Json<ApproveResponse>, ApiError> {
    check_token(&state, auth.token())?;
    let plan = find_plan(&payload.plan_id)
        .ok_or((StatusCode::BAD_REQUEST, "unknown_plan".to_string()))?;

    let granted = state
        .gate
        .evaluator()
        .grant_plan(payload.user_id, plan, &payload.payment_details, Utc::now())
        .await
        .map_err(internal)?;

    Ok(Json(ApproveResponse {
        user_id: payload.user_id,
        plan: plan.display_name.to_string(),
        granted,
    }))
}

#[derive(Deserialize)]
struct UserRequest {
    user_id: i64,
}

#[derive(Serialize)]
struct ChangedResponse {
    user_id: i64,
    changed: bool,
}

async fn unapprove(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(payload): Json<UserRequest>,
) -> Result<Json<ChangedResponse>, ApiError> {
    check_token(&state, auth.token())?;
    let changed = state
        .gate
        .evaluator()
        .store()
        .revoke_entitlement(payload.user_id)
        .await
        .map_err(internal)?;
    Ok(Json(ChangedResponse {
        user_id: payload.user_id,
        changed,
    }))
}

async fn ban(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(payload): Json<UserRequest>,
) -> Result<Json<ChangedResponse>, ApiError> {
    check_token(&state, auth.token())?;
    let changed = state
        .gate
        .evaluator()
        .store()
        .ban_user(payload.user_id)
        .await
        .map_err(internal)?;
    if changed {
        state.notifier.send(
            payload.user_id,
            NotificationKind::Banned,
            "You have been banned.".to_string(),
        );
    }
    Ok(Json(ChangedResponse {
        user_id: payload.user_id,
        changed,
    }))
}

async fn unban(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(payload): Json<UserRequest>,
) -> Result<Json<ChangedResponse>, ApiError> {
    check_token(&state, auth.token())?;
    let changed = state
        .gate
        .evaluator()
        .store()
        .unban_user(payload.user_id)
        .await
        .map_err(internal)?;
    if changed {
        state.notifier.send(
            payload.user_id,
            NotificationKind::Unbanned,
            "You have been unbanned.".to_string(),
        );
    }
    Ok(Json(ChangedResponse {
        user_id: payload.user_id,
        changed,
    }))
}

#[derive(Deserialize)]
struct PremiumUsersQuery {
    #[serde(default)]
    active_only: bool,
}

async fn premium_users(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Query(query): Query<PremiumUsersQuery>,
) -> Result<Json<Vec<EntitlementRecord>>, ApiError> {
    check_token(&state, auth.token())?;
    let records = state
        .gate
        .evaluator()
        .store()
        .list_entitlements(query.active_only, Utc::now())
        .await
        .map_err(internal)?;
    Ok(Json(records))
}

async fn list_users(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
) -> Result<Json<Vec<UserAccount>>, ApiError> {
    check_token(&state, auth.token())?;
    let users = state
        .gate
        .evaluator()
        .store()
        .list_users()
        .await
        .map_err(internal)?;
    Ok(Json(users))
}

#[derive(Serialize)]
struct UsersCountResponse {
    total_users: u64,
}

async fn users_count(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
) -> Result<Json<UsersCountResponse>, ApiError> {
    check_token(&state, auth.token())?;
    let total_users = state
        .gate
        .evaluator()
        .store()
        .total_users_count()
        .await
        .map_err(internal)?;
    Ok(Json(UsersCountResponse { total_users }))
}

async fn user_stats(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(id): Path<i64>,
) -> Result<Json<UserStats>, ApiError> {
    check_token(&state, auth.token())?;
    let stats = state
        .gate
        .evaluator()
        .store()
        .user_stats(id, Utc::now())
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "user_not_found".to_string()))?;
    Ok(Json(stats))
}

async fn delete_user(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    check_token(&state, auth.token())?;
    state
        .gate
        .evaluator()
        .store()
        .delete_user(id)
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct TrialResponse {
    user_id: i64,
    activated: bool,
}

async fn activate_trial(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(payload): Json<UserRequest>,
) -> Result<Json<TrialResponse>, ApiError> {
    check_token(&state, auth.token())?;
    let activated = state
        .gate
        .evaluator()
        .activate_trial(payload.user_id, Utc::now())
        .await
        .map_err(internal)?;
    Ok(Json(TrialResponse {
        user_id: payload.user_id,
        activated,
    }))
}

#[derive(Deserialize)]
struct AuthorizeRequest {
    user_id: i64,
    #[serde(default)]
    name: String,
}

async fn gate_authorize(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(payload): Json<AuthorizeRequest>,
) -> Result<Json<Evaluation>, ApiError> {
    check_token(&state, auth.token())?;
    let eval = state
        .gate
        .authorize(payload.user_id, &payload.name, Utc::now())
        .await
        .map_err(store_unavailable)?;
    Ok(Json(eval))
}

async fn gate_commit(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(payload): Json<UserRequest>,
) -> Result<StatusCode, ApiError> {
    check_token(&state, auth.token())?;
    state
        .gate
        .commit(payload.user_id, Utc::now())
        .await
        .map_err(store_unavailable)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Called by the glue when a forward fails after authorization, so the
/// reserved plan slot goes back instead of leaking.
async fn gate_release(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(payload): Json<UserRequest>,
) -> Result<StatusCode, ApiError> {
    check_token(&state, auth.token())?;
    state.gate.release(payload.user_id).await;
    Ok(StatusCode::NO_CONTENT)
}
