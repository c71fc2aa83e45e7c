//! Handlers for content upload and retrieval

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use iroh_metrics::inc;
use serde::Deserialize;

use super::error::{AppError, AppResult};
use crate::{
    digest::Digest,
    metrics::Metrics,
    state::AppState,
    store::{PutContent, PutOutcome, UserId},
};

/// Query parameters for a content upload.
#[derive(Debug, Deserialize)]
pub struct PutParams {
    user_id: u64,
    wallet: String,
    entity_id: Option<u64>,
    #[serde(default)]
    gated: bool,
}

/// POST `/content`: accept a content write for a user this node is primary
/// for.
pub async fn put(
    State(state): State<AppState>,
    Query(params): Query<PutParams>,
    body: Bytes,
) -> AppResult<(StatusCode, Json<PutOutcome>)> {
    let user_id = UserId(params.user_id);
    if let Some(rs) = state.store.replica_set(user_id)? {
        if !rs.is_primary(&state.me) {
            return Err(AppError::new(
                StatusCode::MISDIRECTED_REQUEST,
                Some(format!(
                    "not the primary for user {user_id}, write to {}",
                    rs.primary
                )),
            ));
        }
    }
    if let Some(user) = state.store.get_user(user_id)? {
        if user.wallet != params.wallet {
            return Err(AppError::new(
                StatusCode::FORBIDDEN,
                Some("wallet does not match the user record"),
            ));
        }
    }
    let outcome = state
        .store
        .put_content(PutContent {
            user_id,
            wallet: params.wallet,
            entity_id: params.entity_id,
            gated: params.gated,
            bytes: body,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// GET `/content/:digest`: serve stored bytes.
///
/// Gated content requires the sync secret when one is configured. Skipped
/// entries are recorded in the log but their bytes were never stored, so
/// they 404 like unknown digests.
pub async fn get(
    State(state): State<AppState>,
    Path(digest): Path<String>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let digest: Digest = digest
        .parse()
        .map_err(|_| AppError::new(StatusCode::BAD_REQUEST, Some("malformed digest")))?;
    let Some(meta) = state.store.content_meta(&digest)? else {
        return Err(AppError::with_status(StatusCode::NOT_FOUND));
    };
    if meta.gated && !super::authorized(&state, &headers) {
        return Err(AppError::new(
            StatusCode::FORBIDDEN,
            Some("content is gated"),
        ));
    }
    if meta.skipped {
        return Err(AppError::with_status(StatusCode::NOT_FOUND));
    }
    let Some(bytes) = state.store.get_content(&digest).await? else {
        return Err(AppError::with_status(StatusCode::NOT_FOUND));
    };
    inc!(Metrics, content_gets);
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes))
}
