// src/protocol.rs
//
// The signaling wire contract: every frame is a JSON object tagged by
// `"type"` (kebab-case event name) with camelCase fields.  The schema is
// validated here, at the boundary, before anything reaches business logic —
// an unparseable frame never gets further than an `error` ack.
//
// Negotiation payloads (SDP, ICE, and their call/relay variants) are opaque
// `serde_json::Value`s: the relay forwards them verbatim and never inspects
// their shape.
//
// ────────────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::directory::Privacy;
use crate::error::ErrorCode;
use crate::relay_tree::DeviceInfo;

// ─── Client → server ────────────────────────────────────────────────────────

/// An opaque negotiation payload addressed to a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalIn {
    pub target: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    ClaimRoom {
        name: String,
        #[serde(default)]
        password: Option<String>,
        privacy: Privacy,
    },

    #[serde(rename_all = "camelCase")]
    AuthHostRoom { name: String, password: String },

    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room: String,
        name: String,
        #[serde(default)]
        is_viewer: bool,
        #[serde(default)]
        vip_code: Option<String>,
        #[serde(default)]
        vip_token: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    JoinRoomRelay {
        room: String,
        name: String,
        #[serde(default)]
        device_info: DeviceInfo,
    },

    LeaveRoom,

    #[serde(rename_all = "camelCase")]
    GenerateVipCode {
        room: String,
        #[serde(default)]
        max_uses: Option<i64>,
    },

    #[serde(rename_all = "camelCase")]
    RevokeVipCode { room_name: String, code: String },

    #[serde(rename_all = "camelCase")]
    AddVipUser {
        room_name: String,
        display_name: String,
    },

    #[serde(rename_all = "camelCase")]
    UpdateRoomPrivacy {
        room_name: String,
        privacy: Privacy,
    },

    #[serde(rename_all = "camelCase")]
    UpdateVipRequired {
        room_name: String,
        vip_required: bool,
    },

    #[serde(rename_all = "camelCase")]
    PromoteToHost { target_id: String },

    #[serde(rename_all = "camelCase")]
    LockRoom { locked: bool },

    #[serde(rename_all = "camelCase")]
    KickUser { target_id: String },

    #[serde(rename_all = "camelCase")]
    SetStreamTitle { title: String },

    #[serde(rename_all = "camelCase")]
    RequestCall { requesting: bool },

    // Negotiation relays — handled identically regardless of payload shape.
    Offer(SignalIn),
    Answer(SignalIn),
    IceCandidate(SignalIn),
    CallOffer(SignalIn),
    CallAnswer(SignalIn),
    CallIce(SignalIn),
    CallEnd(SignalIn),
    RelayOffer(SignalIn),
    RelayAnswer(SignalIn),
    RelayIce(SignalIn),
}

/// The ten relayed negotiation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    CallOffer,
    CallAnswer,
    CallIce,
    CallEnd,
    RelayOffer,
    RelayAnswer,
    RelayIce,
}

impl ClientMessage {
    /// View a frame as a relayed signal, if it is one.
    pub fn as_signal(&self) -> Option<(SignalKind, &SignalIn)> {
        match self {
            Self::Offer(s) => Some((SignalKind::Offer, s)),
            Self::Answer(s) => Some((SignalKind::Answer, s)),
            Self::IceCandidate(s) => Some((SignalKind::IceCandidate, s)),
            Self::CallOffer(s) => Some((SignalKind::CallOffer, s)),
            Self::CallAnswer(s) => Some((SignalKind::CallAnswer, s)),
            Self::CallIce(s) => Some((SignalKind::CallIce, s)),
            Self::CallEnd(s) => Some((SignalKind::CallEnd, s)),
            Self::RelayOffer(s) => Some((SignalKind::RelayOffer, s)),
            Self::RelayAnswer(s) => Some((SignalKind::RelayAnswer, s)),
            Self::RelayIce(s) => Some((SignalKind::RelayIce, s)),
            _ => None,
        }
    }
}

// ─── Server → client ────────────────────────────────────────────────────────

/// A forwarded negotiation payload, stamped with the sender's identity so
/// the target can address its reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalOut {
    pub from: String,
    pub payload: Value,
}

/// Generic `{ok, error?}` acknowledgment body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true, error: None }
    }

    pub fn err(code: ErrorCode) -> Self {
        Self {
            ok: false,
            error: Some(code),
        }
    }
}

/// One VIP code as listed in a host's `join-room-result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VipCodeSummary {
    pub code: String,
    pub max_uses: Option<u32>,
    pub uses_left: Option<u32>,
    pub used: u32,
}

/// One roster row in a `room-update` broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntry {
    pub socket_id: String,
    pub name: String,
    pub is_viewer: bool,
    pub is_vip: bool,
    pub requesting_call: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomResult {
    pub ok: bool,
    pub is_host: bool,
    pub is_vip: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    /// Present on host acceptance only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vip_roster: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vip_codes: Option<Vec<VipCodeSummary>>,
}

impl JoinRoomResult {
    pub fn rejected(code: ErrorCode) -> Self {
        Self {
            ok: false,
            is_host: false,
            is_vip: false,
            error: Some(code),
            vip_roster: None,
            vip_codes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateVipCodeResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses_left: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

/// Ack for the two room-configuration updates, echoing the effective values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoomResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy: Option<Privacy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vip_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

/// Full roster + metadata, broadcast to every member after any change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUpdate {
    pub users: Vec<UserEntry>,
    pub owner_id: Option<String>,
    pub locked: bool,
    pub stream_title: String,
    pub privacy: Privacy,
    pub vip_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentAssigned {
    pub ok: bool,
    /// `None` on failure: fall back to a direct host connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First frame on every connection: the socket identity used to address
    /// this peer for the rest of its lifetime.
    #[serde(rename_all = "camelCase")]
    Welcome { socket_id: String },

    ClaimRoomResult(Ack),
    AuthHostRoomResult(Ack),
    JoinRoomResult(JoinRoomResult),
    GenerateVipCodeResult(GenerateVipCodeResult),
    RevokeVipCodeResult(Ack),
    AddVipUserResult(Ack),
    UpdateRoomResult(UpdateRoomResult),

    RoomUpdate(RoomUpdate),

    ParentAssigned(ParentAssigned),

    #[serde(rename_all = "camelCase")]
    ChildConnecting { child_id: String },

    /// `newParentId == null` means: give up on relaying, connect directly to
    /// the host.
    #[serde(rename_all = "camelCase")]
    ParentChanged { new_parent_id: Option<String> },

    Kicked,

    /// Boundary-level failure for frames that never reached a typed ack.
    #[serde(rename_all = "camelCase")]
    Error { error: ErrorCode },

    // Forwarded negotiation payloads.
    Offer(SignalOut),
    Answer(SignalOut),
    IceCandidate(SignalOut),
    CallOffer(SignalOut),
    CallAnswer(SignalOut),
    CallIce(SignalOut),
    CallEnd(SignalOut),
    RelayOffer(SignalOut),
    RelayAnswer(SignalOut),
    RelayIce(SignalOut),
}

impl ServerMessage {
    /// Wrap a forwarded signal under the same event name it arrived with.
    pub fn forwarded(kind: SignalKind, from: String, payload: Value) -> Self {
        let signal = SignalOut { from, payload };
        match kind {
            SignalKind::Offer => Self::Offer(signal),
            SignalKind::Answer => Self::Answer(signal),
            SignalKind::IceCandidate => Self::IceCandidate(signal),
            SignalKind::CallOffer => Self::CallOffer(signal),
            SignalKind::CallAnswer => Self::CallAnswer(signal),
            SignalKind::CallIce => Self::CallIce(signal),
            SignalKind::CallEnd => Self::CallEnd(signal),
            SignalKind::RelayOffer => Self::RelayOffer(signal),
            SignalKind::RelayAnswer => Self::RelayAnswer(signal),
            SignalKind::RelayIce => Self::RelayIce(signal),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_use_kebab_case_tags() {
        let json = r#"{"type":"join-room","room":"demo","name":"Alice","isViewer":true,"vipCode":"X1X1X1X1"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::JoinRoom {
                room,
                name,
                is_viewer,
                vip_code,
                vip_token,
            } => {
                assert_eq!(room, "demo");
                assert_eq!(name, "Alice");
                assert!(is_viewer);
                assert_eq!(vip_code.as_deref(), Some("X1X1X1X1"));
                assert_eq!(vip_token, None);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn is_viewer_defaults_to_false() {
        let json = r#"{"type":"join-room","room":"demo","name":"Host"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::JoinRoom { is_viewer, .. } => assert!(!is_viewer),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_validation() {
        let json = r#"{"type":"launch-missiles","target":"moon"}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn signal_kinds_round_trip_opaquely() {
        let json = r#"{"type":"ice-candidate","target":"peer-7","payload":{"candidate":"candidate:1 1 udp ..."}}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();

        let (kind, signal) = msg.as_signal().expect("is a signal");
        assert_eq!(kind, SignalKind::IceCandidate);
        assert_eq!(signal.target, "peer-7");

        let out = ServerMessage::forwarded(kind, "peer-3".into(), signal.payload.clone());
        let encoded = serde_json::to_value(&out).unwrap();
        assert_eq!(encoded["type"], "ice-candidate");
        assert_eq!(encoded["from"], "peer-3");
        assert_eq!(encoded["payload"]["candidate"], "candidate:1 1 udp ...");
    }

    #[test]
    fn non_signals_are_not_signals() {
        let msg = ClientMessage::LockRoom { locked: true };
        assert!(msg.as_signal().is_none());
    }

    #[test]
    fn join_result_omits_empty_fields() {
        let ok = JoinRoomResult {
            ok: true,
            is_host: true,
            is_vip: false,
            error: None,
            vip_roster: Some(vec!["Alice".into()]),
            vip_codes: Some(vec![]),
        };
        let encoded = serde_json::to_value(ServerMessage::JoinRoomResult(ok)).unwrap();
        assert_eq!(encoded["type"], "join-room-result");
        assert_eq!(encoded["isHost"], true);
        assert!(encoded.get("error").is_none());

        let rejected = JoinRoomResult::rejected(ErrorCode::VipUsernameRequired);
        let encoded = serde_json::to_value(ServerMessage::JoinRoomResult(rejected)).unwrap();
        assert_eq!(encoded["error"], "VIP_USERNAME_REQUIRED");
        assert!(encoded.get("vipRoster").is_none());
    }

    #[test]
    fn parent_events_use_contract_names() {
        let assigned = ServerMessage::ParentAssigned(ParentAssigned {
            ok: true,
            parent_id: Some("host".into()),
            tier: Some(1),
            capacity: Some(5),
            error: None,
        });
        let encoded = serde_json::to_value(&assigned).unwrap();
        assert_eq!(encoded["type"], "parent-assigned");
        assert_eq!(encoded["parentId"], "host");
        assert_eq!(encoded["tier"], 1);

        let changed = ServerMessage::ParentChanged { new_parent_id: None };
        let encoded = serde_json::to_value(&changed).unwrap();
        assert_eq!(encoded["type"], "parent-changed");
        assert_eq!(encoded["newParentId"], serde_json::Value::Null);

        let connecting = ServerMessage::ChildConnecting { child_id: "c1".into() };
        let encoded = serde_json::to_value(&connecting).unwrap();
        assert_eq!(encoded["type"], "child-connecting");
        assert_eq!(encoded["childId"], "c1");
    }

    #[test]
    fn leave_room_is_a_bare_frame() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"leave-room"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::LeaveRoom));
    }
}
