use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker line that closes a session description once candidate gathering is done.
pub const END_OF_CANDIDATES: &str = "a=end-of-candidates";

/// Which side of the negotiation a description belongs to.
///
/// `Local` is the answering endpoint embedded in the consumer context,
/// `Remote` is the offering helper endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Local,
    Remote,
}

impl Role {
    /// The role on the other side of the channel.
    pub fn peer(self) -> Role {
        match self {
            Role::Local => Role::Remote,
            Role::Remote => Role::Local,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Local => "local",
            Role::Remote => "remote",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bare request tag asking the relay for the description of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestTag {
    GetLocal,
    GetRemote,
}

impl RequestTag {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Local => RequestTag::GetLocal,
            Role::Remote => RequestTag::GetRemote,
        }
    }

    /// The role whose description is being asked for.
    pub fn role(self) -> Role {
        match self {
            RequestTag::GetLocal => Role::Local,
            RequestTag::GetRemote => Role::Remote,
        }
    }
}

/// Message carried on a signaling port.
///
/// On the wire this is either `{"role":"remote","sdp":"v=0..."}` or a bare
/// `"get-local"` / `"get-remote"` string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalingMessage {
    Description { role: Role, sdp: String },
    Request(RequestTag),
}

impl SignalingMessage {
    pub fn description(role: Role, sdp: impl Into<String>) -> Self {
        SignalingMessage::Description {
            role,
            sdp: sdp.into(),
        }
    }

    pub fn request(role: Role) -> Self {
        SignalingMessage::Request(RequestTag::for_role(role))
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// In-process signal from the streaming helper to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostSignal {
    /// Activation: hand over the payload.
    Start,
    /// No-op that resets the relay's idle timer.
    KeepAlive,
}

/// Whether `sdp` already carries the end-of-candidates marker.
pub fn has_end_of_candidates(sdp: &str) -> bool {
    sdp.lines().any(|line| line.trim_end() == END_OF_CANDIDATES)
}

/// Append the end-of-candidates marker unless the transport already emitted it.
pub fn ensure_end_of_candidates(sdp: &str) -> String {
    if has_end_of_candidates(sdp) {
        return sdp.to_string();
    }

    let mut out = String::with_capacity(sdp.len() + END_OF_CANDIDATES.len() + 4);
    out.push_str(sdp);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push_str("\r\n");
    }
    out.push_str(END_OF_CANDIDATES);
    out.push_str("\r\n");
    out
}
