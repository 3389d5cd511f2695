use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::models::*;
use crate::{
    badges::earned_badges,
    error::{AppError, AppResult},
    reconciler::{PassOutcome, ReconcileScheduler, WatchOutcome},
};

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<ReconcileScheduler>,
}

/// Health check endpoint
/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let reconciler = state.scheduler.reconciler();
    let store = reconciler.store();

    let store_reachable = match store.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("Health check: store unreachable: {}", e);
            false
        }
    };

    Json(HealthResponse {
        status: if store_reachable { "healthy" } else { "degraded" }.to_string(),
        store: store.name().to_string(),
        store_reachable,
        instance_id: reconciler.instance_id(),
        active_sessions: state.scheduler.watched_count(),
        passes_in_flight: reconciler.passes_in_flight(),
        timestamp: Utc::now(),
    })
}

/// Start periodic reconciliation for a signed-in user. Clients repeat the
/// call as a heartbeat; a session without one expires.
/// POST /sessions/:user_id
pub async fn start_session(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<SessionResponse>> {
    let changed = match state.scheduler.watch_user(user_id) {
        WatchOutcome::Started => true,
        WatchOutcome::Refreshed => false,
        WatchOutcome::AtCapacity => {
            return Err(AppError::Capacity("session limit reached".into()));
        }
    };
    Ok(Json(SessionResponse {
        user_id,
        active: true,
        changed,
    }))
}

/// Stop periodic reconciliation when the user signs out
/// DELETE /sessions/:user_id
pub async fn end_session(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Json<SessionResponse> {
    let changed = state.scheduler.unwatch_user(user_id);
    Json(SessionResponse {
        user_id,
        active: false,
        changed,
    })
}

/// Run one pass now, e.g. after the client sees a challenge finish
/// POST /reconcile/:user_id
pub async fn trigger_reconcile(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<TriggerRequest>,
) -> AppResult<Json<PassOutcome>> {
    info!(
        "📨 Reconciliation requested for {} ({} challenges)",
        user_id,
        request.challenges.len()
    );

    match state.scheduler.trigger(user_id, &request.challenges).await {
        PassOutcome::Aborted { error } => {
            error!("❌ Requested pass for {} aborted: {}", user_id, error);
            Err(AppError::Internal(error))
        }
        outcome => Ok(Json(outcome)),
    }
}

/// Badges earned by a user
/// GET /users/:user_id/badges
pub async fn get_user_badges(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<BadgesResponse>> {
    let store = state.scheduler.reconciler().store();
    let badges = earned_badges(store.as_ref(), user_id).await?;
    Ok(Json(BadgesResponse { user_id, badges }))
}
