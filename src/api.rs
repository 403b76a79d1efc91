use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::directory::normalize_name;
use crate::error::{ApiError, DirectoryError};
use crate::vip::TOKEN_TTL;

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

pub async fn health_handler(State(state): State<Arc<crate::AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "rooms_active": state.sessions.active_rooms(),
        "users_active": state.sessions.total_users(),
        "rooms_claimed": state.directory.len().await,
        "relay_trees": state.trees.active_trees(),
        "connections": state.peers.len(),
        "vip_tokens_outstanding": state.vip_tokens.len(),
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/rooms/:room/vip-tokens — out-of-band VIP code redemption
// ---------------------------------------------------------------------------
//
// Redeems a VIP code for the named room and mints a short-lived, single-use
// token in exchange.  The token is then supplied to `join-room` over the
// signaling socket instead of the code itself, so the code never has to be
// typed into the join form.

#[derive(Deserialize)]
pub struct IssueTokenRequest {
    pub code: String,
}

#[derive(Serialize, Debug)]
pub struct IssueTokenResponse {
    pub token: String,
    pub room: String,
    pub expires_in_secs: u64,
}

pub async fn issue_vip_token(
    State(state): State<Arc<crate::AppState>>,
    Path(room): Path<String>,
    Json(body): Json<IssueTokenRequest>,
) -> Result<Json<IssueTokenResponse>, ApiError> {
    let room = normalize_name(&room)?;

    let record = state
        .directory
        .get(&room)
        .await
        .ok_or_else(|| ApiError::room_not_found(&room))?;

    // Codes minted for other rooms must not be burned against this one.
    if !record.vip_codes.contains_key(&body.code) {
        return Err(DirectoryError::InvalidOrExhausted.into());
    }

    let redemption = state.directory.redeem_code(&body.code).await?;
    let token = state.vip_tokens.issue(&redemption.room_name);

    info!(
        room = %room,
        uses_left = ?redemption.uses_left,
        used = redemption.used,
        "vip token issued via code redemption"
    );

    Ok(Json(IssueTokenResponse {
        token,
        room: redemption.room_name,
        expires_in_secs: TOKEN_TTL.as_secs(),
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/rooms/:room/purchase — payment collaborator boundary
// ---------------------------------------------------------------------------
//
// The checkout flow itself lives elsewhere; this consumes its "room
// purchased" signal and marks the record as non-reclaimable.

pub async fn mark_room_purchased(
    State(state): State<Arc<crate::AppState>>,
    Path(room): Path<String>,
) -> Result<StatusCode, ApiError> {
    let room = normalize_name(&room)?;
    state.directory.mark_purchased(&room).await?;

    info!(room = %room, "room marked as permanently claimed");
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
