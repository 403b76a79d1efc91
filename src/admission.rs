// src/admission.rs
//
// The Admission Controller: a pure decision function over an immutable view
// of directory + session state.  The rule order below is a contract — when
// several conditions fail, the first matching rule decides which reason the
// requester sees.  In particular, roster membership is always checked before
// code/token validity, so a non-roster user supplying a valid code still
// sees VIP_USERNAME_REQUIRED (and the code is not spent).
//
// Grant redemption has side effects (codes decrement, tokens burn), so the
// controller never performs it.  When rule 5b is reached without a
// redemption outcome, the controller answers `NeedsGrant`; the signaling
// layer redeems and re-evaluates with the outcome filled in.
//
// ────────────────────────────────────────────────────────────────────────────

use serde::Serialize;

use crate::directory::{Privacy, RoomRecord};
use crate::error::ErrorCode;

// ─── Inputs ─────────────────────────────────────────────────────────────────

/// Immutable view of the room consulted by the rules.
#[derive(Debug, Default)]
pub struct RoomView<'a> {
    /// Directory record, if the room is claimed.
    pub record: Option<&'a RoomRecord>,
    /// Session lock flag (false when no session exists yet).
    pub locked: bool,
    /// Current owner, if any.
    pub owner_id: Option<&'a str>,
}

/// Outcome of the caller's grant redemption attempt, when one was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    Redeemed,
    Rejected,
}

/// One join request, as seen by the rules.
#[derive(Debug)]
pub struct JoinRequest<'a> {
    pub socket_id: &'a str,
    pub display_name: &'a str,
    pub is_viewer: bool,
    /// Whether this connection previously authenticated for the room name.
    pub authenticated: bool,
    /// Whether a VIP code or token accompanied the request.
    pub grant_supplied: bool,
    /// Filled in by the signaling layer after it attempts redemption.
    pub grant_outcome: Option<GrantOutcome>,
}

// ─── Outputs ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Viewer,
    Vip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Admit(Role),
    Reject(ErrorCode),
    /// Rule 5b reached with a grant supplied but not yet attempted: the
    /// caller must redeem and evaluate again.
    NeedsGrant,
}

// ─── The rules ──────────────────────────────────────────────────────────────

/// Evaluate a join request.  Pure: no clocks, no stores, no side effects.
pub fn evaluate(view: &RoomView<'_>, request: &JoinRequest<'_>) -> Evaluation {
    if !request.is_viewer {
        return evaluate_host(view, request);
    }
    evaluate_viewer(view, request)
}

/// Rules 1–2: host-role admission.
fn evaluate_host(view: &RoomView<'_>, request: &JoinRequest<'_>) -> Evaluation {
    // 1. Locked rooms admit no new hosts, except the current owner itself
    //    (a reconnecting owner is not locked out of its own room).
    if view.locked && view.owner_id != Some(request.socket_id) {
        return Evaluation::Reject(ErrorCode::Locked);
    }

    // 2. A claimed room with a password requires prior authentication.
    let has_password = view
        .record
        .map(|r| r.owner_password_hash.is_some())
        .unwrap_or(false);
    if has_password && !request.authenticated {
        return Evaluation::Reject(ErrorCode::AuthRequired);
    }

    Evaluation::Admit(Role::Host)
}

/// Rules 3–5: viewer-role admission.  An unclaimed room behaves as public.
fn evaluate_viewer(view: &RoomView<'_>, request: &JoinRequest<'_>) -> Evaluation {
    let (privacy, vip_required) = match view.record {
        Some(record) => (record.privacy, record.vip_required),
        None => (Privacy::Public, false),
    };

    // 3. Public rooms admit any named viewer.
    if privacy == Privacy::Public {
        return Evaluation::Admit(Role::Viewer);
    }

    // 4. Private rooms without VIP gating admit any named viewer.
    if !vip_required {
        return Evaluation::Admit(Role::Viewer);
    }

    // 5a. Roster membership comes first — always.
    let on_roster = view
        .record
        .map(|r| r.roster_contains(request.display_name))
        .unwrap_or(false);
    if !on_roster {
        return Evaluation::Reject(ErrorCode::VipUsernameRequired);
    }

    // 5b/5c. A redeemed grant admits as VIP; otherwise the reason depends on
    // whether anything was supplied at all.
    match request.grant_outcome {
        Some(GrantOutcome::Redeemed) => Evaluation::Admit(Role::Vip),
        Some(GrantOutcome::Rejected) => Evaluation::Reject(ErrorCode::InvalidOrExhausted),
        None if request.grant_supplied => Evaluation::NeedsGrant,
        None => Evaluation::Reject(ErrorCode::VipCodeRequired),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
