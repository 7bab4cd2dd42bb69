//! Wire protocol spoken with the relay.
//!
//! Every frame is a JSON object with a `MsgType` discriminant and flat PascalCase
//! fields. The relay is untrusted: string fields default to empty when absent so
//! that validation, not parsing, decides what to do with an incomplete message.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};

/// `Error` text a responder uses to decline an offer.
pub const REJECTED: &str = "rejected";
/// `Error` text a responder uses when it is already in a call.
pub const BUSY: &str = "busy";

/// Which side of a session a client plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientRole {
    /// Camera/mic source, the offering side.
    Source,
    /// Remote controller, the answering side.
    Controller,
}

impl ClientRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientRole::Source => "Source",
            ClientRole::Controller => "Controller",
        }
    }

    /// Sources pick a controller and a gamepad from the relay's directory.
    pub fn browses_directory(&self) -> bool {
        matches!(self, ClientRole::Source)
    }

    pub fn is_offerer(&self) -> bool {
        matches!(self, ClientRole::Source)
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClientRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "source" => Ok(ClientRole::Source),
            "controller" => Ok(ClientRole::Controller),
            other => Err(Error::config(format!("unknown client role: {other}"))),
        }
    }
}

/// Identity handed out by the relay on registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub id: String,
    pub role: ClientRole,
}

/// The three identifiers binding one source, one controller and one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SessionTriple {
    pub source_id: String,
    pub peer_id: String,
    pub resource_id: String,
}

impl SessionTriple {
    pub fn new(
        source_id: impl Into<String>,
        peer_id: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            peer_id: peer_id.into(),
            resource_id: resource_id.into(),
        }
    }

    /// First empty identifier, by wire name.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.source_id.is_empty() {
            Some("SourceId")
        } else if self.peer_id.is_empty() {
            Some("PeerId")
        } else if self.resource_id.is_empty() {
            Some("ResourceId")
        } else {
            None
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing_field().is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.source_id.is_empty() && self.peer_id.is_empty() && self.resource_id.is_empty()
    }

    /// Checks an identifier set echoed back by the relay against this one.
    pub fn verify_echo(&self, echoed: &SessionTriple) -> Result<()> {
        if let Some(field) = echoed.missing_field() {
            return Err(Error::validation(format!("echoed identifiers lack {field}")));
        }
        if echoed != self {
            return Err(Error::identity_mismatch(self, echoed));
        }
        Ok(())
    }
}

impl fmt::Display for SessionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.source_id, self.peer_id, self.resource_id)
    }
}

/// Treats an absent and an empty `Error` field the same way.
pub fn error_text(error: &Option<String>) -> Option<&str> {
    error.as_deref().filter(|e| !e.is_empty())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RegisterRequest {
    pub client_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RegisterResponse {
    pub client_id: String,
    pub client_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One row of the relay's directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DirectoryEntry {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LookupResponse {
    pub controllers: Vec<DirectoryEntry>,
    pub resources: Vec<DirectoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `offerReq` and `answerReq`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SdpRequest {
    pub name: String,
    #[serde(flatten)]
    pub triple: SessionTriple,
    pub sdp: String,
}

impl SdpRequest {
    pub fn missing_field(&self) -> Option<&'static str> {
        self.triple
            .missing_field()
            .or_else(|| self.sdp.is_empty().then_some("Sdp"))
    }
}

/// Body of `offerRes`, `answerRes` and `linkRes`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub triple: SessionTriple,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionResponse {
    pub fn ok(triple: SessionTriple) -> Self {
        Self {
            triple,
            error: None,
        }
    }

    pub fn failed(triple: SessionTriple, error: impl Into<String>) -> Self {
        Self {
            triple,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LinkRequest {
    #[serde(flatten)]
    pub triple: SessionTriple,
}

/// Fatal notice the relay sends when it cannot forward a negotiation step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServerNotice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Frames of the negotiation channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "MsgType", rename_all = "camelCase")]
pub enum NegotiationMessage {
    Ping,
    RegisterReq(RegisterRequest),
    RegisterRes(RegisterResponse),
    LookupReq,
    LookupRes(LookupResponse),
    OfferReq(SdpRequest),
    OfferRes(SessionResponse),
    AnswerReq(SdpRequest),
    AnswerRes(SessionResponse),
    LinkReq(LinkRequest),
    LinkRes(SessionResponse),
    OfferServerError(ServerNotice),
    AnswerServerError(ServerNotice),
    /// Any `MsgType` this build does not know.
    #[serde(other)]
    Unknown,
}

/// One button as reported by the input source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ButtonState {
    pub pressed: bool,
    pub touched: bool,
    pub value: f64,
}

/// A poll of the local gamepad.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlSnapshot {
    pub buttons: Vec<ButtonState>,
    pub axes: Vec<f64>,
    /// Monotonic counter from the input hardware; unchanged means no new input.
    pub timestamp: u64,
}

/// Body of `relayState`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ControlState {
    #[serde(flatten)]
    pub triple: SessionTriple,
    pub buttons: Vec<ButtonState>,
    pub axes: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `relayStateRes`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RelayAck {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Haptic command handed to the local vibration capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FeedbackCommand {
    pub start_delay: f64,
    pub duration: f64,
    pub weak_magnitude: f64,
    pub strong_magnitude: f64,
}

/// Body of `relayFeedback`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FeedbackNotice {
    #[serde(flatten)]
    pub triple: SessionTriple,
    #[serde(flatten)]
    pub command: FeedbackCommand,
}

/// Frames of the control-relay channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "MsgType", rename_all = "camelCase")]
pub enum RelayMessage {
    Ping,
    RelayState(ControlState),
    RelayStateRes(RelayAck),
    RelayFeedback(FeedbackNotice),
    #[serde(other)]
    Unknown,
}

/// A message type that can travel over a channel adapter.
pub trait Envelope: Serialize + DeserializeOwned + Send + 'static {
    /// The keepalive frame.
    fn ping() -> Self;

    /// Wire name of the variant, for logs.
    fn kind(&self) -> &'static str;

    fn is_ping(&self) -> bool {
        self.kind() == "ping"
    }

    fn is_unknown(&self) -> bool {
        self.kind() == "unknown"
    }

    fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl Envelope for NegotiationMessage {
    fn ping() -> Self {
        NegotiationMessage::Ping
    }

    fn kind(&self) -> &'static str {
        match self {
            NegotiationMessage::Ping => "ping",
            NegotiationMessage::RegisterReq(_) => "registerReq",
            NegotiationMessage::RegisterRes(_) => "registerRes",
            NegotiationMessage::LookupReq => "lookupReq",
            NegotiationMessage::LookupRes(_) => "lookupRes",
            NegotiationMessage::OfferReq(_) => "offerReq",
            NegotiationMessage::OfferRes(_) => "offerRes",
            NegotiationMessage::AnswerReq(_) => "answerReq",
            NegotiationMessage::AnswerRes(_) => "answerRes",
            NegotiationMessage::LinkReq(_) => "linkReq",
            NegotiationMessage::LinkRes(_) => "linkRes",
            NegotiationMessage::OfferServerError(_) => "offerServerError",
            NegotiationMessage::AnswerServerError(_) => "answerServerError",
            NegotiationMessage::Unknown => "unknown",
        }
    }
}

impl Envelope for RelayMessage {
    fn ping() -> Self {
        RelayMessage::Ping
    }

    fn kind(&self) -> &'static str {
        match self {
            RelayMessage::Ping => "ping",
            RelayMessage::RelayState(_) => "relayState",
            RelayMessage::RelayStateRes(_) => "relayStateRes",
            RelayMessage::RelayFeedback(_) => "relayFeedback",
            RelayMessage::Unknown => "unknown",
        }
    }
}
