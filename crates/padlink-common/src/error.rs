//! Common error types for Padlink.

use thiserror::Error;

/// Result type alias using Padlink's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Padlink operations.
///
/// Every fatal kind ends up in the engine's teardown. The relay is untrusted, so
/// nothing here is ever "repaired" in place.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed message or missing required fields
    #[error("validation error: {0}")]
    Validation(String),

    /// Echoed session identifiers disagree with the local session
    #[error("identity mismatch: expected {expected}, received {received}")]
    IdentityMismatch { expected: String, received: String },

    /// Description create/apply failed, or the peer answered with an explicit error
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// Peer declined the call
    #[error("rejected by peer")]
    RejectedByPeer,

    /// Transport bridge reported failed, disconnected or closed
    #[error("transport error: {0}")]
    Transport(String),

    /// Underlying message channel failed or closed
    #[error("channel error: {0}")]
    Channel(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a validation error from any displayable type.
    pub fn validation(msg: impl std::fmt::Display) -> Self {
        Self::Validation(msg.to_string())
    }

    /// Create an identity mismatch error from the two disagreeing values.
    pub fn identity_mismatch(expected: impl std::fmt::Display, received: impl std::fmt::Display) -> Self {
        Self::IdentityMismatch {
            expected: expected.to_string(),
            received: received.to_string(),
        }
    }

    /// Create a negotiation error from any displayable type.
    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::Negotiation(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create a channel error from any displayable type.
    pub fn channel(msg: impl std::fmt::Display) -> Self {
        Self::Channel(msg.to_string())
    }

    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Stable short label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::IdentityMismatch { .. } => "identity_mismatch",
            Self::Negotiation(_) => "negotiation",
            Self::RejectedByPeer => "rejected_by_peer",
            Self::Transport(_) => "transport",
            Self::Channel(_) => "channel",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }

    /// Whether the end user should hear about this failure.
    ///
    /// Protocol violations are only logged: the relay is adversarial and there is
    /// nothing useful to tell the user about a forged or malformed message.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::RejectedByPeer | Self::Transport(_) | Self::Channel(_) | Self::Negotiation(_)
        )
    }

    /// Whether this error points at a misbehaving relay or peer.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::IdentityMismatch { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
