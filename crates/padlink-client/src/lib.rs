//! Padlink session negotiation engine.
//!
//! The [`Engine`] drives one session between a `Source` and a `Controller` through
//! an untrusted relay: registration, the offer/answer/link exchange, and the
//! control relay that streams gamepad state once the session is linked.
//!
//! Media and the concrete peer transport stay outside; they are reached through
//! [`TransportBridge`] and the traits in [`hooks`].

#![forbid(unsafe_code)]

pub mod bridge;
pub mod channel;
pub mod config;
pub mod control;
pub mod engine;
pub mod hooks;
pub mod negotiation;
pub mod registration;
pub mod timer;

pub use bridge::{
    BridgeEvent, ConnectionState, DescriptionKind, Generation, SessionDescription, TransportBridge,
};
pub use channel::{ChannelAdapter, ChannelEvent, LoopbackPeer, SIGNALING_SUBPROTOCOL, RELAY_SUBPROTOCOL};
pub use config::EngineConfig;
pub use control::ControlRelay;
pub use engine::{Collaborators, Engine, EngineHandle};
pub use hooks::{ConsentPrompt, FixedConsent, HapticSink, InputSource};
pub use negotiation::{
    Advisory, CompletionFlags, Directive, IncomingCall, Negotiator, SessionPhase, SessionState,
    Ticket,
};
pub use registration::{Directory, RegistrationSupervisor, SupervisorTick};
pub use timer::ScheduledTask;
