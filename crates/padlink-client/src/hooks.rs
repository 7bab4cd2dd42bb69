//! Collaborators the engine consults but does not implement.

use futures::future::BoxFuture;
use futures::FutureExt;
use padlink_common::{ControlSnapshot, FeedbackCommand};

use crate::negotiation::IncomingCall;

/// Asks the local user whether to take an incoming call.
pub trait ConsentPrompt: Send {
    fn prompt(&mut self, call: IncomingCall) -> BoxFuture<'static, bool>;
}

/// Answers every prompt the same way. Used by headless tools and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedConsent(pub bool);

impl ConsentPrompt for FixedConsent {
    fn prompt(&mut self, _call: IncomingCall) -> BoxFuture<'static, bool> {
        futures::future::ready(self.0).boxed()
    }
}

/// The local gamepad, polled on every sampling tick.
pub trait InputSource: Send {
    /// Current state, or `None` when no pad is attached.
    fn poll(&mut self) -> Option<ControlSnapshot>;
}

/// The local vibration capability.
pub trait HapticSink: Send {
    fn play(&mut self, command: FeedbackCommand);
}
