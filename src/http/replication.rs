//! Handlers for the replica-to-replica protocol

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use super::error::{AppError, AppResult};
use crate::{
    replica_set::ReplicaSet,
    state::AppState,
    store::UserId,
    sync::{export_entries, ApplyBatch, DigestResponse},
};

/// Query parameters addressing a range of a user's log.
#[derive(Debug, Deserialize)]
pub struct RangeParams {
    user_id: u64,
    #[serde(default)]
    low: u64,
    high: Option<u64>,
    limit: Option<u64>,
}

/// GET `/digest`: the summary over `(low, high]` plus the current clock.
///
/// `high` is capped to the clock, so a caller probing beyond what this
/// replica holds gets the summary over what it does hold.
pub async fn digest(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> AppResult<Json<DigestResponse>> {
    let user_id = UserId(params.user_id);
    let clock = state.store.current_clock(user_id)?;
    let high = params.high.unwrap_or(clock).min(clock);
    let summary = state.store.summary(user_id, params.low, high)?;
    Ok(Json(DigestResponse {
        user_id,
        clock,
        summary,
    }))
}

/// GET `/export`: entries in `(low, high]` with their content, postcard
/// encoded.
pub async fn export(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> AppResult<impl IntoResponse> {
    let user_id = UserId(params.user_id);
    let limit = params
        .limit
        .unwrap_or(state.max_export)
        .min(state.max_export);
    let high = params.high.unwrap_or(u64::MAX);
    let Some(export) = export_entries(&state.store, user_id, params.low, high, limit).await? else {
        return Err(AppError::with_status(StatusCode::NOT_FOUND));
    };
    let body = postcard::to_stdvec(&export).map_err(anyhow::Error::from)?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], body))
}

/// POST `/sync-apply`: apply a batch of entries pushed by another replica.
///
/// Requires the sync secret when one is configured. Integrity rejections
/// come back as 409 with the already-applied prefix kept.
pub async fn sync_apply(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    if !super::authorized(&state, &headers) {
        return Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            Some("missing or wrong sync secret"),
        ));
    }
    let batch: ApplyBatch = postcard::from_bytes(&body)
        .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, Some(err)))?;
    let response = state.applier.apply_batch(batch).await?;
    let body = postcard::to_stdvec(&response).map_err(anyhow::Error::from)?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], body))
}

/// The response to a replica-set ingest.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplicaSetResponse {
    /// False when the record was stale and ignored.
    pub accepted: bool,
}

/// POST `/replica-set`: ingest a replica-set record from the membership
/// feed.
///
/// Records with a blocknumber at or below the stored one are ignored.
/// Accepting a record voids queued sync work against the old set.
pub async fn put_replica_set(
    State(state): State<AppState>,
    Json(rs): Json<ReplicaSet>,
) -> AppResult<Json<ReplicaSetResponse>> {
    let outcome = state.store.apply_replica_set(&rs, &state.me)?;
    if outcome.accepted {
        state
            .scheduler
            .replica_set_changed(rs.user_id, rs.blocknumber)
            .await;
    }
    Ok(Json(ReplicaSetResponse {
        accepted: outcome.accepted,
    }))
}
