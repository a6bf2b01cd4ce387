//! Agent-protocol types carried across the bridge.
//!
//! Payloads are relayed untouched. The only message the relay ever
//! originates itself is `SSH_AGENT_FAILURE`, sent when the bridge gives up.

use bytes::Bytes;

pub const SSH_AGENT_FAILURE: u8 = 5;

/// Payload of the generic failure reply.
pub const FAILURE_PAYLOAD: &[u8] = &[SSH_AGENT_FAILURE];

/// Correlation token tying a bridge call to the connection that issued it.
///
/// UUID v4 so a stale reply can never alias a later request on a reused
/// file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded client request on its way to the foreign agent.
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    pub id: RequestId,
    pub payload: Bytes,
}

impl BridgeRequest {
    pub fn new(payload: Bytes) -> Self {
        Self {
            id: RequestId::new(),
            payload,
        }
    }

    /// Human-readable message type for diagnostics.
    pub fn kind(&self) -> &'static str {
        self.payload
            .first()
            .map_or("empty", |&code| message_name(code))
    }
}

/// The foreign agent's answer, unframed.
#[derive(Debug, Clone)]
pub struct BridgeReply {
    pub id: RequestId,
    pub payload: Bytes,
}

impl BridgeReply {
    pub fn new(id: RequestId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    pub fn failure(id: RequestId) -> Self {
        Self::new(id, Bytes::from_static(FAILURE_PAYLOAD))
    }
}

/// Name of an agent message code, as used in log fields.
pub fn message_name(code: u8) -> &'static str {
    match code {
        1 => "rsa1_request_identities",
        5 => "failure",
        6 => "success",
        11 => "request_identities",
        12 => "identities_answer",
        13 => "sign_request",
        14 => "sign_response",
        17 => "add_identity",
        18 => "remove_identity",
        19 => "remove_all_identities",
        20 => "add_smartcard_key",
        21 => "remove_smartcard_key",
        22 => "lock",
        23 => "unlock",
        25 => "add_id_constrained",
        26 => "add_smartcard_key_constrained",
        27 => "extension",
        28 => "extension_failure",
        _ => "unknown",
    }
}
