use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::control::{ControlCatalog, ControlValue};

/// Message kinds carried over the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    SessionDescription,
    Candidate,
    UserControl,
    Command,
    Roster,
    IceServers,
    /// Remote refused a record command because one is already running.
    RecordRefused,
}

impl SignalKind {
    pub fn from_wire(tag: &str) -> Option<Self> {
        match tag {
            "sdp" => Some(SignalKind::SessionDescription),
            "ice" => Some(SignalKind::Candidate),
            "v4l2" => Some(SignalKind::UserControl),
            "cmd" => Some(SignalKind::Command),
            "users" => Some(SignalKind::Roster),
            "iceServers" => Some(SignalKind::IceServers),
            "record" => Some(SignalKind::RecordRefused),
            _ => None,
        }
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            SignalKind::SessionDescription => "sdp",
            SignalKind::Candidate => "ice",
            SignalKind::UserControl => "v4l2",
            SignalKind::Command => "cmd",
            SignalKind::Roster => "users",
            SignalKind::IceServers => "iceServers",
            SignalKind::RecordRefused => "record",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorRole {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    #[serde(rename = "type")]
    pub role: DescriptorRole,
    pub sdp: String,
}

impl SessionDescriptor {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            role: DescriptorRole::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            role: DescriptorRole::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn body(&self) -> &str {
        &self.sdp
    }
}

/// Trickled ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl ConnectivityCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            IceUrls::One(url) => vec![url.clone()],
            IceUrls::Many(urls) => urls.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: IceUrls::One(url.into()),
            username: None,
            credential: None,
        }
    }
}

/// The relay sends either a bare server list or a whole peer configuration
/// object wrapping it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceServerList {
    Config {
        #[serde(rename = "iceServers")]
        ice_servers: Vec<IceServer>,
    },
    Servers(Vec<IceServer>),
}

impl IceServerList {
    pub fn servers(&self) -> &[IceServer] {
        match self {
            IceServerList::Config { ice_servers } => ice_servers,
            IceServerList::Servers(servers) => servers,
        }
    }

    pub fn into_servers(self) -> Vec<IceServer> {
        match self {
            IceServerList::Config { ice_servers } => ice_servers,
            IceServerList::Servers(servers) => servers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    pub indate: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteCommand {
    Record,
    Talk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandArg {
    Start,
    Stop,
}

impl CommandArg {
    pub fn from_flag(start: bool) -> Self {
        if start { CommandArg::Start } else { CommandArg::Stop }
    }
}

/// One relay message. Every frame on the relay socket is exactly one of these
/// serialized as a JSON object tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalEnvelope {
    #[serde(rename = "sdp")]
    SessionDescription { data: SessionDescriptor },
    #[serde(rename = "ice")]
    Candidate { data: ConnectivityCandidate },
    #[serde(rename = "v4l2")]
    UserControl {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<ControlValue>,
        #[serde(default, skip_serializing_if = "crate::is_false")]
        reset: bool,
    },
    #[serde(rename = "cmd")]
    Command { cmd: RemoteCommand, arg: CommandArg },
    #[serde(rename = "users")]
    Roster { data: Vec<RosterEntry> },
    #[serde(rename = "iceServers")]
    IceServers {
        #[serde(rename = "iceServers")]
        ice_servers: IceServerList,
    },
    #[serde(rename = "record")]
    RecordRefused {
        #[serde(default)]
        data: Value,
    },
}

impl SignalEnvelope {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalEnvelope::SessionDescription { .. } => SignalKind::SessionDescription,
            SignalEnvelope::Candidate { .. } => SignalKind::Candidate,
            SignalEnvelope::UserControl { .. } => SignalKind::UserControl,
            SignalEnvelope::Command { .. } => SignalKind::Command,
            SignalEnvelope::Roster { .. } => SignalKind::Roster,
            SignalEnvelope::IceServers { .. } => SignalKind::IceServers,
            SignalEnvelope::RecordRefused { .. } => SignalKind::RecordRefused,
        }
    }

    pub fn descriptor(descriptor: SessionDescriptor) -> Self {
        SignalEnvelope::SessionDescription { data: descriptor }
    }

    pub fn candidate(candidate: ConnectivityCandidate) -> Self {
        SignalEnvelope::Candidate { data: candidate }
    }

    pub fn set_control(id: u32, value: i64) -> Self {
        SignalEnvelope::UserControl {
            data: Some(ControlValue { id, value }),
            reset: false,
        }
    }

    pub fn reset_controls() -> Self {
        SignalEnvelope::UserControl {
            data: None,
            reset: true,
        }
    }

    pub fn command(cmd: RemoteCommand, start: bool) -> Self {
        SignalEnvelope::Command {
            cmd,
            arg: CommandArg::from_flag(start),
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("frame has neither a type nor a control catalog")]
    MissingType,
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed control catalog: {0}")]
    Catalog(#[source] serde_json::Error),
}

/// A decoded relay frame.
///
/// `envelope` is `None` when the frame carries a `type` this client does not
/// understand; such frames are not errors. Any frame may additionally carry a
/// top-level `ctrls` device control catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayFrame {
    pub tag: Option<String>,
    pub envelope: Option<SignalEnvelope>,
    pub catalog: Option<ControlCatalog>,
}

impl RelayFrame {
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        let object = value.as_object().ok_or(EnvelopeError::NotAnObject)?;

        let tag = object
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let catalog = match object.get("ctrls") {
            Some(raw) => Some(
                serde_json::from_value::<ControlCatalog>(raw.clone())
                    .map_err(EnvelopeError::Catalog)?,
            ),
            None => None,
        };
        if tag.is_none() && catalog.is_none() {
            return Err(EnvelopeError::MissingType);
        }

        let envelope = match tag.as_deref().and_then(SignalKind::from_wire) {
            Some(kind) => Some(serde_json::from_value::<SignalEnvelope>(value).map_err(
                |source| EnvelopeError::Payload {
                    kind: kind.as_wire(),
                    source,
                },
            )?),
            None => None,
        };

        Ok(Self {
            tag,
            envelope,
            catalog,
        })
    }
}
