//! Capability interface to the peer transport.
//!
//! The engine never creates descriptions or gathers candidates itself. It asks a
//! [`TransportBridge`] to do so and learns about the outcome through the returned
//! futures and the [`BridgeEvent`] stream handed to the engine next to it.
//!
//! Every create call carries a [`Generation`]. The bridge stamps the events of
//! that connection with it, and the engine bumps it on every reset, so events
//! from a discarded connection are told apart from the current one.

use std::fmt;

use futures::future::BoxFuture;
use padlink_common::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// A remote description to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Peer connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the session cannot recover.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Identifies one peer connection between two bridge resets.
pub type Generation = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Candidate gathering finished; `sdp` is the complete local description.
    IceGatheringComplete { generation: Generation, sdp: String },
    ConnectionState {
        generation: Generation,
        state: ConnectionState,
    },
}

impl BridgeEvent {
    pub fn generation(&self) -> Generation {
        match self {
            BridgeEvent::IceGatheringComplete { generation, .. }
            | BridgeEvent::ConnectionState { generation, .. } => *generation,
        }
    }
}

/// Operations the engine needs from the peer transport.
///
/// Returned futures must not borrow the bridge; they may complete long after
/// the session moved on, and the engine discards such stale results.
pub trait TransportBridge: Send {
    /// Creates the local offer and starts gathering.
    ///
    /// Events of the resulting connection carry `generation`.
    fn create_local_offer(&mut self, generation: Generation) -> BoxFuture<'static, Result<()>>;

    /// Creates the local answer after a remote offer was applied.
    fn create_local_answer(&mut self, generation: Generation) -> BoxFuture<'static, Result<()>>;

    fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> BoxFuture<'static, Result<()>>;

    /// Drops local and remote descriptions so a new call can start.
    fn reset(&mut self);

    fn close(&mut self);
}
