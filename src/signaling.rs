// src/signaling.rs
//
// The WebSocket signaling layer.
//
//   browser ──ws──> handle_socket ──dispatch──> directory / session /
//                                               admission / relay tree
//
// One task per connection reads frames and handles each to completion before
// the next, so a connection's operations never interleave with themselves.
// Outbound delivery goes through a per-peer unbounded channel registered in
// the `PeerRegistry`; a `CancellationToken` lets `kick-user` (and shutdown)
// terminate a connection from the outside.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::{self, Evaluation, GrantOutcome, JoinRequest, Role, RoomView};
use crate::directory::normalize_name;
use crate::error::ErrorCode;
use crate::protocol::{
    Ack, ClientMessage, GenerateVipCodeResult, JoinRoomResult, ParentAssigned, RoomUpdate,
    ServerMessage, UpdateRoomResult, UserEntry, VipCodeSummary,
};
use crate::relay_tree::Placement;
use crate::AppState;

// ─── Peer registry ──────────────────────────────────────────────────────────

/// Live connection handle: the outbound queue plus a kill switch.
pub struct PeerHandle {
    tx: mpsc::UnboundedSender<ServerMessage>,
    cancel: CancellationToken,
}

/// All live connections, keyed by socket identity.
#[derive(Default)]
pub struct PeerRegistry {
    inner: RwLock<std::collections::HashMap<String, PeerHandle>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, socket_id: &str, tx: mpsc::UnboundedSender<ServerMessage>, cancel: CancellationToken) {
        let mut peers = self.inner.write().expect("peer registry poisoned");
        peers.insert(socket_id.to_string(), PeerHandle { tx, cancel });
    }

    fn unregister(&self, socket_id: &str) {
        let mut peers = self.inner.write().expect("peer registry poisoned");
        peers.remove(socket_id);
    }

    /// Best-effort delivery: `false` (and the frame is dropped) when the
    /// target has no live connection.
    pub fn send(&self, socket_id: &str, message: ServerMessage) -> bool {
        let peers = self.inner.read().expect("peer registry poisoned");
        match peers.get(socket_id) {
            Some(handle) => handle.tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Terminate a connection from the outside (kick).
    pub fn cancel(&self, socket_id: &str) {
        let peers = self.inner.read().expect("peer registry poisoned");
        if let Some(handle) = peers.get(socket_id) {
            handle.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("peer registry poisoned").len()
    }
}

// ─── Per-connection state ───────────────────────────────────────────────────

struct ConnState {
    socket_id: String,
    /// Normalized name of the room this connection is currently in.
    room: Option<String>,
    /// Room names this connection has host-authenticated for; lives for the
    /// remainder of the connection.
    authed_rooms: HashSet<String>,
}

// ─── Upgrade handler ────────────────────────────────────────────────────────

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let socket_id = uuid::Uuid::new_v4().to_string();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let cancel = CancellationToken::new();

    state.peers.register(&socket_id, out_tx.clone(), cancel.clone());
    info!(socket = %socket_id, peers = state.peers.len(), "connection opened");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: drain the outbound queue onto the wire.
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!("outbound frame failed to serialize: {e}");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let _ = out_tx.send(ServerMessage::Welcome {
        socket_id: socket_id.clone(),
    });

    let mut conn = ConnState {
        socket_id: socket_id.clone(),
        room: None,
        authed_rooms: HashSet::new(),
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(socket = %socket_id, "connection cancelled");
                break;
            }
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => dispatch(&state, &mut conn, message).await,
                            Err(e) => {
                                debug!(socket = %socket_id, "unparseable frame: {e}");
                                let _ = out_tx.send(ServerMessage::Error {
                                    error: ErrorCode::BadRequest,
                                });
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary / ping / pong: ignored
                    Some(Err(e)) => {
                        debug!(socket = %socket_id, "socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    leave_current_room(&state, &mut conn).await;
    state.peers.unregister(&socket_id);
    drop(out_tx); // last sender gone -> writer drains and exits
    let _ = writer.await;
    info!(socket = %socket_id, peers = state.peers.len(), "connection closed");
}

// ─── Dispatch ───────────────────────────────────────────────────────────────

async fn dispatch(state: &Arc<AppState>, conn: &mut ConnState, message: ClientMessage) {
    // Negotiation payloads first: the hot path, forwarded verbatim.
    if let Some((kind, signal)) = message.as_signal() {
        let delivered = state.peers.send(
            &signal.target,
            ServerMessage::forwarded(kind, conn.socket_id.clone(), signal.payload.clone()),
        );
        if !delivered {
            debug!(target = %signal.target, "signal dropped: target not live");
        }
        return;
    }

    match message {
        ClientMessage::ClaimRoom {
            name,
            password,
            privacy,
        } => {
            let ack = match state
                .directory
                .create_room(&name, password.as_deref(), privacy)
                .await
            {
                Ok(record) => {
                    // The claimer evidently knows the password; treat the
                    // claim as authentication for this room name.
                    conn.authed_rooms.insert(record.name);
                    Ack::ok()
                }
                Err(e) => Ack::err(e.code()),
            };
            state
                .peers
                .send(&conn.socket_id, ServerMessage::ClaimRoomResult(ack));
        }

        ClientMessage::AuthHostRoom { name, password } => {
            let ack = match normalize_name(&name) {
                Ok(room) => match state.directory.authenticate(&room, &password).await {
                    Ok(()) => {
                        conn.authed_rooms.insert(room);
                        Ack::ok()
                    }
                    Err(e) => Ack::err(e.code()),
                },
                Err(e) => Ack::err(e.code()),
            };
            state
                .peers
                .send(&conn.socket_id, ServerMessage::AuthHostRoomResult(ack));
        }

        ClientMessage::JoinRoom {
            room,
            name,
            is_viewer,
            vip_code,
            vip_token,
        } => {
            handle_join(state, conn, &room, &name, is_viewer, vip_code, vip_token).await;
        }

        ClientMessage::LeaveRoom => {
            leave_current_room(state, conn).await;
        }

        ClientMessage::JoinRoomRelay {
            room, device_info, ..
        } => {
            handle_join_relay(state, conn, &room, &device_info).await;
        }

        ClientMessage::GenerateVipCode { room, max_uses } => {
            let result = match require_host_surface(state, conn, &room).await {
                Ok(room) => match state.directory.generate_vip_code(&room, max_uses).await {
                    Ok(generated) => GenerateVipCodeResult {
                        ok: true,
                        code: Some(generated.code),
                        max_uses: generated.max_uses,
                        uses_left: generated.uses_left,
                        error: None,
                    },
                    Err(e) => generate_failed(e.code()),
                },
                Err(code) => generate_failed(code),
            };
            state
                .peers
                .send(&conn.socket_id, ServerMessage::GenerateVipCodeResult(result));
        }

        ClientMessage::RevokeVipCode { room_name, code } => {
            let ack = match require_host_surface(state, conn, &room_name).await {
                Ok(room) => match state.directory.revoke_vip_code(&room, &code).await {
                    Ok(()) => Ack::ok(),
                    Err(e) => Ack::err(e.code()),
                },
                Err(code) => Ack::err(code),
            };
            state
                .peers
                .send(&conn.socket_id, ServerMessage::RevokeVipCodeResult(ack));
        }

        ClientMessage::AddVipUser {
            room_name,
            display_name,
        } => {
            let ack = match require_host_surface(state, conn, &room_name).await {
                Ok(room) => match state.directory.add_vip_user(&room, &display_name).await {
                    Ok(()) => Ack::ok(),
                    Err(e) => Ack::err(e.code()),
                },
                Err(code) => Ack::err(code),
            };
            state
                .peers
                .send(&conn.socket_id, ServerMessage::AddVipUserResult(ack));
        }

        ClientMessage::UpdateRoomPrivacy { room_name, privacy } => {
            let result = match require_host_surface(state, conn, &room_name).await {
                Ok(room) => match state.directory.update_privacy(&room, privacy).await {
                    Ok(()) => {
                        broadcast_room_update(state, &room).await;
                        UpdateRoomResult {
                            ok: true,
                            privacy: Some(privacy),
                            vip_required: None,
                            error: None,
                        }
                    }
                    Err(e) => update_failed(e.code()),
                },
                Err(code) => update_failed(code),
            };
            state
                .peers
                .send(&conn.socket_id, ServerMessage::UpdateRoomResult(result));
        }

        ClientMessage::UpdateVipRequired {
            room_name,
            vip_required,
        } => {
            let result = match require_host_surface(state, conn, &room_name).await {
                Ok(room) => match state.directory.update_vip_required(&room, vip_required).await {
                    Ok(effective) => {
                        broadcast_room_update(state, &room).await;
                        UpdateRoomResult {
                            ok: true,
                            privacy: None,
                            vip_required: Some(effective),
                            error: None,
                        }
                    }
                    Err(e) => update_failed(e.code()),
                },
                Err(code) => update_failed(code),
            };
            state
                .peers
                .send(&conn.socket_id, ServerMessage::UpdateRoomResult(result));
        }

        ClientMessage::PromoteToHost { target_id } => {
            let Some(room) = conn.room.clone() else { return };
            let changed = state
                .sessions
                .mutate(&room, |s| s.promote(&conn.socket_id, &target_id));
            if changed {
                info!(room = %room, from = %conn.socket_id, to = %target_id, "ownership transferred");
                broadcast_room_update(state, &room).await;
            }
        }

        ClientMessage::LockRoom { locked } => {
            let Some(room) = conn.room.clone() else { return };
            let changed = state
                .sessions
                .mutate(&room, |s| s.set_locked(&conn.socket_id, locked));
            if changed {
                broadcast_room_update(state, &room).await;
            }
        }

        ClientMessage::KickUser { target_id } => {
            handle_kick(state, conn, &target_id).await;
        }

        ClientMessage::SetStreamTitle { title } => {
            let Some(room) = conn.room.clone() else { return };
            let changed = state
                .sessions
                .mutate(&room, |s| s.set_stream_title(&conn.socket_id, &title));
            if changed {
                broadcast_room_update(state, &room).await;
                sync_live_metadata(state, &room).await;
            }
        }

        ClientMessage::RequestCall { requesting } => {
            let Some(room) = conn.room.clone() else { return };
            let changed = state
                .sessions
                .mutate(&room, |s| s.set_requesting_call(&conn.socket_id, requesting));
            if changed {
                broadcast_room_update(state, &room).await;
            }
        }

        // Signals were intercepted above.
        _ => {}
    }
}

fn generate_failed(code: ErrorCode) -> GenerateVipCodeResult {
    GenerateVipCodeResult {
        ok: false,
        code: None,
        max_uses: None,
        uses_left: None,
        error: Some(code),
    }
}

fn update_failed(code: ErrorCode) -> UpdateRoomResult {
    UpdateRoomResult {
        ok: false,
        privacy: None,
        vip_required: None,
        error: Some(code),
    }
}

/// Room-configuration surface gate: the caller must have authenticated for
/// the room name (or have claimed it this connection), or currently own the
/// room's session.
async fn require_host_surface(
    state: &Arc<AppState>,
    conn: &ConnState,
    raw_name: &str,
) -> Result<String, ErrorCode> {
    let room = normalize_name(raw_name).map_err(|e| e.code())?;
    if conn.authed_rooms.contains(&room) {
        return Ok(room);
    }
    let owns = state
        .sessions
        .read(&room, |s| s.is_owner(&conn.socket_id))
        .unwrap_or(false);
    if owns {
        return Ok(room);
    }
    Err(ErrorCode::AuthRequired)
}

// ─── join-room ──────────────────────────────────────────────────────────────

async fn handle_join(
    state: &Arc<AppState>,
    conn: &mut ConnState,
    raw_room: &str,
    display_name: &str,
    is_viewer: bool,
    vip_code: Option<String>,
    vip_token: Option<String>,
) {
    let room = match normalize_name(raw_room) {
        Ok(room) => room,
        Err(e) => {
            state.peers.send(
                &conn.socket_id,
                ServerMessage::JoinRoomResult(JoinRoomResult::rejected(e.code())),
            );
            return;
        }
    };

    // One room per connection: joining elsewhere leaves the old room first.
    if conn.room.as_deref().is_some_and(|current| current != room) {
        leave_current_room(state, conn).await;
    }

    let record = state.directory.get(&room).await;
    let (locked, owner_id) = state
        .sessions
        .read(&room, |s| (s.locked, s.owner_id.clone()))
        .unwrap_or((false, None));

    let grant_supplied = vip_code.is_some() || vip_token.is_some();
    let mut request = JoinRequest {
        socket_id: &conn.socket_id,
        display_name,
        is_viewer,
        authenticated: conn.authed_rooms.contains(&room),
        grant_supplied,
        grant_outcome: None,
    };
    let view = RoomView {
        record: record.as_ref(),
        locked,
        owner_id: owner_id.as_deref(),
    };

    let mut evaluation = admission::evaluate(&view, &request);

    if evaluation == Evaluation::NeedsGrant {
        // The roster check passed; only now is it safe to spend a grant.
        let mut outcome = GrantOutcome::Rejected;

        if let Some(code) = &vip_code {
            // Only codes minted for this room are redeemable here; a code
            // belonging to another room must not be burned.
            let belongs_here = record
                .as_ref()
                .map(|r| r.vip_codes.contains_key(code))
                .unwrap_or(false);
            if belongs_here && state.directory.redeem_code(code).await.is_ok() {
                outcome = GrantOutcome::Redeemed;
            }
        }
        if outcome == GrantOutcome::Rejected {
            if let Some(token) = &vip_token {
                if state.vip_tokens.consume(token, &room) {
                    outcome = GrantOutcome::Redeemed;
                }
            }
        }

        request.grant_outcome = Some(outcome);
        evaluation = admission::evaluate(&view, &request);
    }

    let role = match evaluation {
        Evaluation::Admit(role) => role,
        Evaluation::Reject(code) => {
            debug!(room = %room, socket = %conn.socket_id, %code, "join rejected");
            state.peers.send(
                &conn.socket_id,
                ServerMessage::JoinRoomResult(JoinRoomResult::rejected(code)),
            );
            return;
        }
        Evaluation::NeedsGrant => unreachable!("grant outcome was supplied"),
    };

    let is_vip = role == Role::Vip;
    let joins_as_viewer = role != Role::Host;
    let became_owner = state.sessions.mutate(&room, |s| {
        s.join(&conn.socket_id, display_name, joins_as_viewer, is_vip)
    });
    conn.room = Some(room.clone());

    if became_owner {
        // The relay tree is rooted at whoever holds the broadcast.
        state.trees.ensure_root(&room, &conn.socket_id);
    }

    let is_host = state
        .sessions
        .read(&room, |s| s.is_owner(&conn.socket_id))
        .unwrap_or(false);

    info!(room = %room, socket = %conn.socket_id, ?role, "joined room");

    // Hosts get the VIP roster and code list alongside the ack.  Re-read the
    // record: redemption above may have changed a code's counters.
    let (vip_roster, vip_codes) = if is_host {
        match state.directory.get(&room).await {
            Some(record) => {
                let mut codes: Vec<VipCodeSummary> = record
                    .vip_codes
                    .iter()
                    .map(|(code, entry)| VipCodeSummary {
                        code: code.clone(),
                        max_uses: entry.max_uses,
                        uses_left: entry.uses_left,
                        used: entry.used,
                    })
                    .collect();
                codes.sort_by(|a, b| a.code.cmp(&b.code));
                (Some(record.vip_roster), Some(codes))
            }
            None => (None, None),
        }
    } else {
        (None, None)
    };

    state.peers.send(
        &conn.socket_id,
        ServerMessage::JoinRoomResult(JoinRoomResult {
            ok: true,
            is_host,
            is_vip,
            error: None,
            vip_roster,
            vip_codes,
        }),
    );

    broadcast_room_update(state, &room).await;
    sync_live_metadata(state, &room).await;
}

// ─── join-room-relay ────────────────────────────────────────────────────────

async fn handle_join_relay(
    state: &Arc<AppState>,
    conn: &ConnState,
    raw_room: &str,
    device: &crate::relay_tree::DeviceInfo,
) {
    let Ok(room) = normalize_name(raw_room) else {
        state.peers.send(
            &conn.socket_id,
            ServerMessage::Error {
                error: ErrorCode::InvalidName,
            },
        );
        return;
    };

    // A repeated relay join re-enters the tree from scratch.
    if state.trees.contains(&room, &conn.socket_id) {
        let orphans = state.trees.remove(&room, &conn.socket_id);
        let results = state.trees.reassign_orphans(&room, &orphans);
        notify_reassignments(state, &results);
    }

    match state.trees.insert(&room, &conn.socket_id, device) {
        Ok(placement) => {
            state.peers.send(
                &placement.parent_id,
                ServerMessage::ChildConnecting {
                    child_id: conn.socket_id.clone(),
                },
            );
            state.peers.send(
                &conn.socket_id,
                ServerMessage::ParentAssigned(ParentAssigned {
                    ok: true,
                    parent_id: Some(placement.parent_id),
                    tier: Some(placement.tier),
                    capacity: Some(placement.capacity),
                    error: None,
                }),
            );
        }
        Err(code) => {
            // No eligible parent: the client falls back to a direct host
            // connection.  Nothing is retried here.
            debug!(room = %room, socket = %conn.socket_id, %code, "relay join failed");
            state.peers.send(
                &conn.socket_id,
                ServerMessage::ParentAssigned(ParentAssigned {
                    ok: false,
                    parent_id: None,
                    tier: None,
                    capacity: None,
                    error: Some(code),
                }),
            );
        }
    }
}

// ─── kick-user ──────────────────────────────────────────────────────────────

async fn handle_kick(state: &Arc<AppState>, conn: &ConnState, target_id: &str) {
    let Some(room) = conn.room.clone() else { return };

    let kicked = state
        .sessions
        .mutate(&room, |s| s.kick(&conn.socket_id, target_id));
    if !kicked {
        return;
    }

    info!(room = %room, target = %target_id, "user kicked");
    state.peers.send(target_id, ServerMessage::Kicked);

    // Pull the target out of the relay tree before its connection dies.
    let orphans = state.trees.remove(&room, target_id);
    let results = state.trees.reassign_orphans(&room, &orphans);
    notify_reassignments(state, &results);

    state.peers.cancel(target_id);

    broadcast_room_update(state, &room).await;
    sync_live_metadata(state, &room).await;
}

// ─── Leave / disconnect ─────────────────────────────────────────────────────

/// Shared by `leave-room`, kicks and disconnects.  Safe to call when the
/// connection is not in any room.
async fn leave_current_room(state: &Arc<AppState>, conn: &mut ConnState) {
    let Some(room) = conn.room.take() else { return };

    // Tree first: orphan reassignment must run against a tree that no
    // longer contains the departing node.
    let orphans = state.trees.remove(&room, &conn.socket_id);
    let results = state.trees.reassign_orphans(&room, &orphans);
    notify_reassignments(state, &results);

    let (removed, now_empty) = state.sessions.mutate(&room, |s| {
        let removed = s.leave(&conn.socket_id).is_some();
        (removed, s.is_empty())
    });

    if now_empty {
        // Session destroyed; the tree goes with it.
        state.trees.destroy(&room);
    } else if removed {
        broadcast_room_update(state, &room).await;
    }
    sync_live_metadata(state, &room).await;

    if removed {
        info!(room = %room, socket = %conn.socket_id, "left room");
    }
}

fn notify_reassignments(state: &Arc<AppState>, results: &[(String, Option<Placement>)]) {
    for (orphan_id, placement) in results {
        match placement {
            Some(placement) => {
                state.peers.send(
                    orphan_id,
                    ServerMessage::ParentChanged {
                        new_parent_id: Some(placement.parent_id.clone()),
                    },
                );
                state.peers.send(
                    &placement.parent_id,
                    ServerMessage::ChildConnecting {
                        child_id: orphan_id.clone(),
                    },
                );
            }
            None => {
                state
                    .peers
                    .send(orphan_id, ServerMessage::ParentChanged { new_parent_id: None });
            }
        }
    }
}

// ─── Broadcast / live metadata ──────────────────────────────────────────────

/// Send the full roster + metadata to every member of `room`.
async fn broadcast_room_update(state: &Arc<AppState>, room: &str) {
    let record = state.directory.get(room).await;
    let (privacy, vip_required) = match &record {
        Some(record) => (record.privacy, record.vip_required),
        None => (crate::directory::Privacy::Public, false),
    };

    let update = state.sessions.read(room, |session| {
        let mut users: Vec<UserEntry> = session
            .users
            .iter()
            .map(|(socket_id, user)| UserEntry {
                socket_id: socket_id.clone(),
                name: user.name.clone(),
                is_viewer: user.is_viewer,
                is_vip: user.is_vip,
                requesting_call: user.requesting_call,
            })
            .collect();
        users.sort_by(|a, b| a.socket_id.cmp(&b.socket_id));
        RoomUpdate {
            users,
            owner_id: session.owner_id.clone(),
            locked: session.locked,
            stream_title: session.stream_title.clone(),
            privacy,
            vip_required,
        }
    });

    if let Some(update) = update {
        for entry in &update.users {
            state
                .peers
                .send(&entry.socket_id, ServerMessage::RoomUpdate(update.clone()));
        }
    }
}

/// Best-effort push of the session's live state into the directory record.
/// Claimed rooms only; a persistence failure here is logged, not surfaced.
async fn sync_live_metadata(state: &Arc<AppState>, room: &str) {
    let snapshot = state
        .sessions
        .read(room, |s| (s.owner_id.is_some(), s.viewer_count(), s.stream_title.clone()));
    let (live, viewers, title) = snapshot.unwrap_or((false, 0, String::new()));

    if let Err(e) = state
        .directory
        .update_live_state(room, live, viewers, &title)
        .await
    {
        warn!(room = %room, "live metadata not persisted: {e}");
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::directory::Privacy;
    use crate::relay_tree::DeviceInfo;
    use crate::store::MemoryStore;

    async fn test_state(host_relay_capacity: u32) -> Arc<AppState> {
        let config = Config {
            host_relay_capacity,
            ..Default::default()
        };
        Arc::new(
            AppState::new(config, Arc::new(MemoryStore::new()))
                .await
                .unwrap(),
        )
    }

    /// Register a fake peer and hand back its connection state, its inbound
    /// queue and its kill switch.
    fn connect(
        state: &Arc<AppState>,
        socket_id: &str,
    ) -> (
        ConnState,
        mpsc::UnboundedReceiver<ServerMessage>,
        CancellationToken,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        state.peers.register(socket_id, tx, cancel.clone());
        (
            ConnState {
                socket_id: socket_id.to_string(),
                room: None,
                authed_rooms: HashSet::new(),
            },
            rx,
            cancel,
        )
    }

    /// Everything delivered so far (handlers send synchronously).
    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn join_result(messages: &[ServerMessage]) -> &JoinRoomResult {
        messages
            .iter()
            .find_map(|m| match m {
                ServerMessage::JoinRoomResult(result) => Some(result),
                _ => None,
            })
            .expect("a join-room-result was sent")
    }

    fn wifi() -> DeviceInfo {
        DeviceInfo {
            device_type: Some("desktop".into()),
            connection_type: Some("wifi".into()),
            downlink: Some(60.0),
        }
    }

    #[tokio::test]
    async fn scenario_single_use_code_admits_exactly_once() {
        let state = test_state(10).await;
        state
            .directory
            .create_room("demo", Some("pw1"), Privacy::Private)
            .await
            .unwrap();
        state.directory.update_vip_required("demo", true).await.unwrap();
        state.directory.add_vip_user("demo", "Alice").await.unwrap();
        let code = state
            .directory
            .generate_vip_code("demo", Some(1))
            .await
            .unwrap()
            .code;

        let (mut alice, mut alice_rx, _) = connect(&state, "alice-1");
        handle_join(&state, &mut alice, "demo", "Alice", true, Some(code.clone()), None).await;

        let result = join_result(&drain(&mut alice_rx)).clone();
        assert!(result.ok);
        assert!(result.is_vip);
        assert!(!result.is_host);

        let record = state.directory.get("demo").await.unwrap();
        assert_eq!(record.vip_codes[&code].uses_left, Some(0));

        // The same code again, from a second connection: exhausted.
        let (mut again, mut again_rx, _) = connect(&state, "alice-2");
        handle_join(&state, &mut again, "demo", "Alice", true, Some(code), None).await;

        let result = join_result(&drain(&mut again_rx)).clone();
        assert!(!result.ok);
        assert_eq!(result.error, Some(ErrorCode::InvalidOrExhausted));
    }

    #[tokio::test]
    async fn scenario_roster_check_precedes_code_and_spends_nothing() {
        let state = test_state(10).await;
        state
            .directory
            .create_room("demo", None, Privacy::Private)
            .await
            .unwrap();
        state.directory.update_vip_required("demo", true).await.unwrap();
        state.directory.add_vip_user("demo", "Alice").await.unwrap();
        let code = state
            .directory
            .generate_vip_code("demo", Some(1))
            .await
            .unwrap()
            .code;

        let (mut bob, mut bob_rx, _) = connect(&state, "bob-1");
        handle_join(&state, &mut bob, "demo", "Bob", true, Some(code.clone()), None).await;

        let result = join_result(&drain(&mut bob_rx)).clone();
        assert_eq!(result.error, Some(ErrorCode::VipUsernameRequired));

        // Bob's perfectly valid code was not burned.
        let record = state.directory.get("demo").await.unwrap();
        assert_eq!(record.vip_codes[&code].uses_left, Some(1));
    }

    #[tokio::test]
    async fn scenario_password_gates_later_hosts() {
        let state = test_state(10).await;

        // First host-role join to an unclaimed room succeeds and grants host.
        let (mut host, mut host_rx, _) = connect(&state, "host-1");
        handle_join(&state, &mut host, "fresh", "Host", false, None, None).await;
        let result = join_result(&drain(&mut host_rx)).clone();
        assert!(result.ok);
        assert!(result.is_host);

        // The room then acquires a password via claim-room.
        state
            .directory
            .create_room("fresh", Some("s3cret"), Privacy::Public)
            .await
            .unwrap();

        // A second host-role join without credentials is rejected.
        let (mut rival, mut rival_rx, _) = connect(&state, "rival-1");
        handle_join(&state, &mut rival, "fresh", "Rival", false, None, None).await;
        let result = join_result(&drain(&mut rival_rx)).clone();
        assert_eq!(result.error, Some(ErrorCode::AuthRequired));

        // After auth-host-room it goes through (as a non-owning host).
        rival.authed_rooms.insert("fresh".to_string());
        handle_join(&state, &mut rival, "fresh", "Rival", false, None, None).await;
        let result = join_result(&drain(&mut rival_rx)).clone();
        assert!(result.ok);
        assert!(!result.is_host);
    }

    #[tokio::test]
    async fn relay_join_assigns_parents_and_reports_orphans() {
        // Host capacity 1 forces a chain: relay under host, leaf under relay.
        let state = test_state(1).await;

        let (mut host, mut host_rx, _) = connect(&state, "host");
        handle_join(&state, &mut host, "demo", "Host", false, None, None).await;

        let (mut relay, mut relay_rx, _) = connect(&state, "relay");
        handle_join(&state, &mut relay, "demo", "Relay", true, None, None).await;
        handle_join_relay(&state, &relay, "demo", &wifi()).await;

        let messages = drain(&mut relay_rx);
        let assigned = messages
            .iter()
            .find_map(|m| match m {
                ServerMessage::ParentAssigned(p) => Some(p.clone()),
                _ => None,
            })
            .expect("parent-assigned sent");
        assert!(assigned.ok);
        assert_eq!(assigned.parent_id.as_deref(), Some("host"));
        assert_eq!(assigned.tier, Some(1));

        // The chosen parent hears about its new child.
        assert!(drain(&mut host_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::ChildConnecting { child_id } if child_id == "relay")));

        let (mut leaf, mut leaf_rx, _) = connect(&state, "leaf");
        handle_join(&state, &mut leaf, "demo", "Leaf", true, None, None).await;
        handle_join_relay(&state, &leaf, "demo", &wifi()).await;

        let messages = drain(&mut leaf_rx);
        let assigned = messages
            .iter()
            .find_map(|m| match m {
                ServerMessage::ParentAssigned(p) => Some(p.clone()),
                _ => None,
            })
            .expect("parent-assigned sent");
        assert_eq!(assigned.parent_id.as_deref(), Some("relay"));
        assert_eq!(assigned.tier, Some(2));

        // The relay leaves: its leaf is re-parented onto the host.
        leave_current_room(&state, &mut relay).await;

        let messages = drain(&mut leaf_rx);
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::ParentChanged { new_parent_id: Some(id) } if id == "host"
        )));
        assert!(drain(&mut host_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::ChildConnecting { child_id } if child_id == "leaf")));
    }

    #[tokio::test]
    async fn kick_removes_and_terminates_the_target() {
        let state = test_state(10).await;

        let (mut host, _host_rx, _) = connect(&state, "host");
        handle_join(&state, &mut host, "demo", "Host", false, None, None).await;

        let (mut viewer, mut viewer_rx, viewer_cancel) = connect(&state, "viewer");
        handle_join(&state, &mut viewer, "demo", "Viewer", true, None, None).await;
        drain(&mut viewer_rx);

        handle_kick(&state, &host, "viewer").await;

        assert!(drain(&mut viewer_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::Kicked)));
        assert!(viewer_cancel.is_cancelled());
        assert_eq!(
            state.sessions.read("demo", |s| s.users.contains_key("viewer")),
            Some(false)
        );
    }

    #[tokio::test]
    async fn room_update_reaches_every_member() {
        let state = test_state(10).await;

        let (mut host, mut host_rx, _) = connect(&state, "host");
        handle_join(&state, &mut host, "demo", "Host", false, None, None).await;
        drain(&mut host_rx);

        let (mut viewer, mut viewer_rx, _) = connect(&state, "viewer");
        handle_join(&state, &mut viewer, "demo", "Viewer", true, None, None).await;

        // Both members observe the join through a room-update.
        for rx in [&mut host_rx, &mut viewer_rx] {
            let update = drain(rx)
                .into_iter()
                .find_map(|m| match m {
                    ServerMessage::RoomUpdate(update) => Some(update),
                    _ => None,
                })
                .expect("room-update broadcast");
            assert_eq!(update.users.len(), 2);
            assert_eq!(update.owner_id.as_deref(), Some("host"));
        }
    }
}
