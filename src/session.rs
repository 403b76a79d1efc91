use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

// ---------------------------------------------------------------------------
// RoomSession — ephemeral per-room runtime state
// ---------------------------------------------------------------------------

pub const DEFAULT_STREAM_TITLE: &str = "Untitled Stream";

/// A connected member of a room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUser {
    pub name: String,
    pub is_viewer: bool,
    pub is_vip: bool,
    pub requesting_call: bool,
}

/// Run-state for one room: connected users, current owner, lock flag and the
/// stream title.  Created lazily on first reference and destroyed when the
/// last user leaves; never persisted.
///
/// Invariant: `owner_id`, if set, is a key of `users`.
#[derive(Debug)]
pub struct RoomSession {
    pub owner_id: Option<String>,
    pub locked: bool,
    pub stream_title: String,
    pub users: HashMap<String, RoomUser>,
}

impl RoomSession {
    pub fn new() -> Self {
        Self {
            owner_id: None,
            locked: false,
            stream_title: DEFAULT_STREAM_TITLE.to_string(),
            users: HashMap::new(),
        }
    }

    pub fn is_owner(&self, socket_id: &str) -> bool {
        self.owner_id.as_deref() == Some(socket_id)
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn viewer_count(&self) -> u64 {
        self.users.values().filter(|u| u.is_viewer).count() as u64
    }

    /// Add a member.  The first host-role joiner of an ownerless room claims
    /// ownership — the only automatic assignment there is.  Returns whether
    /// this join took ownership.
    pub fn join(&mut self, socket_id: &str, name: &str, is_viewer: bool, is_vip: bool) -> bool {
        self.users.insert(
            socket_id.to_string(),
            RoomUser {
                name: name.to_string(),
                is_viewer,
                is_vip,
                requesting_call: false,
            },
        );

        if !is_viewer && self.owner_id.is_none() {
            self.owner_id = Some(socket_id.to_string());
            return true;
        }
        false
    }

    /// Remove a member.  If it held ownership, ownership is released — never
    /// transferred automatically.
    pub fn leave(&mut self, socket_id: &str) -> Option<RoomUser> {
        let removed = self.users.remove(socket_id);
        if removed.is_some() && self.is_owner(socket_id) {
            self.owner_id = None;
        }
        removed
    }

    /// Transfer ownership.  Only the current owner may do so, and only to a
    /// current member; anything else is a silent no-op.  Permitted while the
    /// room is locked — locking gates new host joins, not control transfer.
    pub fn promote(&mut self, caller: &str, target: &str) -> bool {
        if !self.is_owner(caller) || !self.users.contains_key(target) {
            return false;
        }
        self.owner_id = Some(target.to_string());
        true
    }

    /// Toggle the lock flag (owner only).
    pub fn set_locked(&mut self, caller: &str, locked: bool) -> bool {
        if !self.is_owner(caller) {
            return false;
        }
        self.locked = locked;
        true
    }

    /// Forcibly remove `target` from the roster (owner only).  The caller is
    /// responsible for terminating the target's connection.
    pub fn kick(&mut self, caller: &str, target: &str) -> bool {
        if !self.is_owner(caller) || caller == target {
            return false;
        }
        self.leave(target).is_some()
    }

    /// Rename the stream (owner only).
    pub fn set_stream_title(&mut self, caller: &str, title: &str) -> bool {
        if !self.is_owner(caller) {
            return false;
        }
        self.stream_title = title.to_string();
        true
    }

    /// Toggle a member's call-request flag.
    pub fn set_requesting_call(&mut self, socket_id: &str, requesting: bool) -> bool {
        match self.users.get_mut(socket_id) {
            Some(user) => {
                user.requesting_call = requesting;
                true
            }
            None => false,
        }
    }
}

impl Default for RoomSession {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// SessionMap — all live sessions, keyed by normalized room name
// ---------------------------------------------------------------------------

/// Lazily-constructed map of room sessions.
///
/// Mutations run under one short-lived lock (nothing awaits while holding
/// it), so each inbound message observes and produces a consistent roster.
#[derive(Default)]
pub struct SessionMap {
    inner: Mutex<HashMap<String, RoomSession>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the session for `room`, creating it on first
    /// reference and destroying it if `f` leaves it empty.
    pub fn mutate<R>(&self, room: &str, f: impl FnOnce(&mut RoomSession) -> R) -> R {
        let mut sessions = self.inner.lock().expect("session mutex poisoned");
        let session = sessions.entry(room.to_string()).or_default();
        let result = f(session);
        if session.is_empty() {
            sessions.remove(room);
            info!(room = %room, "room session destroyed");
        }
        result
    }

    /// Run `f` against an existing session; `None` if the room has none.
    pub fn read<R>(&self, room: &str, f: impl FnOnce(&RoomSession) -> R) -> Option<R> {
        let sessions = self.inner.lock().expect("session mutex poisoned");
        sessions.get(room).map(f)
    }

    pub fn active_rooms(&self) -> usize {
        self.inner.lock().expect("session mutex poisoned").len()
    }

    pub fn total_users(&self) -> usize {
        self.inner
            .lock()
            .expect("session mutex poisoned")
            .values()
            .map(|s| s.users.len())
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
