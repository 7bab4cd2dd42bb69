//! Control relay: gamepad state out, haptic feedback in.

use padlink_common::{
    error_text, ControlSnapshot, ControlState, Envelope, FeedbackCommand, RelayMessage,
};
use tracing::{debug, trace, warn};

use crate::negotiation::SessionState;

/// Gates and deduplicates control traffic for one session.
///
/// It reads the negotiator's [`SessionState`] and never changes it; nothing
/// flows until every completion flag is set and the triple is complete.
#[derive(Debug, Default)]
pub struct ControlRelay {
    last_timestamp: Option<u64>,
}

impl ControlRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the `relayState` for a fresh snapshot, if one should go out.
    pub fn sample(
        &mut self,
        session: &SessionState,
        snapshot: &ControlSnapshot,
    ) -> Option<RelayMessage> {
        if !session.relay_open() {
            return None;
        }
        if self.last_timestamp == Some(snapshot.timestamp) {
            return None;
        }
        self.last_timestamp = Some(snapshot.timestamp);
        trace!(timestamp = snapshot.timestamp, "relaying control state");
        Some(RelayMessage::RelayState(ControlState {
            triple: session.triple.clone(),
            buttons: snapshot.buttons.clone(),
            axes: snapshot.axes.clone(),
            error: None,
        }))
    }

    /// Handles one inbound relay message; returns feedback to play locally.
    pub fn on_message(
        &mut self,
        session: &SessionState,
        msg: RelayMessage,
    ) -> Option<FeedbackCommand> {
        match msg {
            RelayMessage::RelayStateRes(ack) => {
                if let Some(err) = error_text(&ack.error) {
                    warn!(error = err, "relay refused control state");
                }
                None
            }
            RelayMessage::RelayFeedback(notice) => {
                if !session.relay_open() {
                    debug!("feedback before the session is linked dropped");
                    return None;
                }
                if notice.triple != session.triple {
                    debug!(session = %notice.triple, "feedback for another session dropped");
                    return None;
                }
                Some(notice.command)
            }
            other => {
                debug!(kind = other.kind(), "unexpected control message ignored");
                None
            }
        }
    }

    /// Forgets the last transmitted timestamp.
    pub fn reset(&mut self) {
        self.last_timestamp = None;
    }
}
