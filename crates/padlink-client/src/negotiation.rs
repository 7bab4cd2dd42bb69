//! Per-session negotiation state machine.
//!
//! [`Negotiator`] is sans-IO: every input (a relay message, a bridge event, a
//! completed bridge operation, the user's consent) returns the [`Directive`]s the
//! engine must carry out, or the error that ends the session. It never talks to
//! the channel or the bridge directly.
//!
//! Every asynchronous request carries a [`Ticket`]. Completions whose ticket is
//! no longer the pending one are dropped, which is how results that outlive a
//! rejected or torn-down call are kept from touching the next one.

use std::fmt;

use padlink_common::{
    error_text, ClientIdentity, ClientRole, Envelope, Error, LinkRequest, NegotiationMessage,
    Result, SdpRequest, SessionResponse, SessionTriple, BUSY, REJECTED,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::{ConnectionState, SessionDescription};

pub type Ticket = u64;

const APPLY_FAILED: &str = "could not set remote description";
const OFFER_NOT_ACKED: &str = "offer not acknowledged";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Registering,
    Registered,
    /// Source: offer being created or sent, no `offerRes` yet.
    OfferPending,
    /// Controller: offer received, waiting for consent and the remote apply.
    AwaitingOffer,
    /// Controller: offer applied and acknowledged.
    OfferAcked,
    /// Controller: `answerReq` sent.
    AnswerPending,
    /// Source: offer acknowledged, waiting for `answerReq`.
    AwaitingAnswer,
    AnswerAcked,
    /// Source: `linkReq` sent.
    ResourceLinking,
    Active,
    Closed,
}

impl SessionPhase {
    pub fn in_call(&self) -> bool {
        matches!(
            self,
            SessionPhase::OfferPending
                | SessionPhase::AwaitingOffer
                | SessionPhase::OfferAcked
                | SessionPhase::AnswerPending
                | SessionPhase::AwaitingAnswer
                | SessionPhase::AnswerAcked
                | SessionPhase::ResourceLinking
                | SessionPhase::Active
        )
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The three acknowledgements that together open the control relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionFlags {
    pub offer_acked: bool,
    pub answer_acked: bool,
    pub resource_linked: bool,
}

impl CompletionFlags {
    pub fn all(&self) -> bool {
        self.offer_acked && self.answer_acked && self.resource_linked
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub flags: CompletionFlags,
    pub triple: SessionTriple,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: SessionPhase::Idle,
            flags: CompletionFlags::default(),
            triple: SessionTriple::default(),
        }
    }

    /// Whether control state may flow for this session.
    pub fn relay_open(&self) -> bool {
        self.flags.all() && self.triple.is_complete()
    }
}

/// An offer waiting for the local user's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub caller_name: String,
    pub triple: SessionTriple,
}

/// Notice meant for the end user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    RejectedByPeer,
    Busy,
    CallEnded,
    Failed(String),
}

impl Advisory {
    /// Advisory for an error, if the user should see it at all.
    pub fn from_error(err: &Error) -> Option<Self> {
        match err {
            Error::RejectedByPeer => Some(Advisory::RejectedByPeer),
            err if err.is_user_visible() => Some(Advisory::Failed(err.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Advisory::RejectedByPeer => f.write_str("rejected by peer"),
            Advisory::Busy => f.write_str("peer is busy"),
            Advisory::CallEnded => f.write_str("call ended"),
            Advisory::Failed(reason) => write!(f, "call failed: {reason}"),
        }
    }
}

/// Work the engine performs on the negotiator's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Send(NegotiationMessage),
    CreateOffer(Ticket),
    CreateAnswer(Ticket),
    ApplyRemote {
        ticket: Ticket,
        description: SessionDescription,
    },
    PromptConsent {
        ticket: Ticket,
        call: IncomingCall,
    },
    /// All flags are set; start streaming control state for this session.
    Activate(SessionTriple),
    Advise(Advisory),
    ResetBridge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    CreateOffer,
    CreateAnswer,
    ApplyRemote,
    Consent,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    ticket: Ticket,
    op: Operation,
}

pub struct Negotiator {
    role: ClientRole,
    name: String,
    identity: Option<ClientIdentity>,
    state: SessionState,
    next_ticket: Ticket,
    pending: Option<Pending>,
    remote_sdp: Option<String>,
    description_sent: bool,
    failure_notice: Option<NegotiationMessage>,
    call_id: Option<Uuid>,
}

impl Negotiator {
    pub fn new(role: ClientRole) -> Self {
        Self {
            role,
            name: String::new(),
            identity: None,
            state: SessionState::new(),
            next_ticket: 0,
            pending: None,
            remote_sdp: None,
            description_sent: false,
            failure_notice: None,
            call_id: None,
        }
    }

    pub fn role(&self) -> ClientRole {
        self.role
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    /// Correlation id of the current call, for log spans.
    pub fn call_id(&self) -> Option<Uuid> {
        self.call_id
    }

    pub fn begin_registration(&mut self, name: &str) {
        self.name = name.to_string();
        if self.state.phase == SessionPhase::Idle {
            self.enter(SessionPhase::Registering);
        }
    }

    pub fn registered(&mut self, identity: ClientIdentity) {
        self.identity = Some(identity);
        if matches!(self.state.phase, SessionPhase::Idle | SessionPhase::Registering) {
            self.enter(SessionPhase::Registered);
        }
    }

    /// Places a call to `peer_id` for `resource_id`.
    pub fn start_call(&mut self, peer_id: &str, resource_id: &str) -> Result<Vec<Directive>> {
        if !self.role.is_offerer() {
            return Err(Error::validation(format!("a {} does not place calls", self.role)));
        }
        let Some(identity) = &self.identity else {
            return Err(Error::negotiation("not registered"));
        };
        if self.state.phase == SessionPhase::Closed || self.state.phase.in_call() {
            return Err(Error::negotiation(format!(
                "cannot start a call in phase {}",
                self.state.phase
            )));
        }
        if peer_id.trim().is_empty() || resource_id.trim().is_empty() {
            return Err(Error::validation("a controller and a resource must be chosen"));
        }

        let triple = SessionTriple::new(identity.id.clone(), peer_id, resource_id);
        self.begin_call(triple);
        self.enter(SessionPhase::OfferPending);
        let ticket = self.issue(Operation::CreateOffer);
        Ok(vec![Directive::CreateOffer(ticket)])
    }

    pub fn on_message(&mut self, msg: NegotiationMessage) -> Result<Vec<Directive>> {
        if self.state.phase == SessionPhase::Closed {
            debug!(kind = msg.kind(), "session closed, message ignored");
            return Ok(Vec::new());
        }
        match msg {
            NegotiationMessage::OfferReq(req) => self.on_offer_request(req),
            NegotiationMessage::OfferRes(res) => self.on_offer_response(res),
            NegotiationMessage::AnswerReq(req) => self.on_answer_request(req),
            NegotiationMessage::AnswerRes(res) => self.on_answer_response(res),
            NegotiationMessage::LinkReq(req) => self.on_link_request(req),
            NegotiationMessage::LinkRes(res) => self.on_link_response(res),
            NegotiationMessage::OfferServerError(notice)
            | NegotiationMessage::AnswerServerError(notice) => {
                if !self.state.phase.in_call() {
                    debug!("server error outside a call ignored");
                    return Ok(Vec::new());
                }
                Err(Error::negotiation(format!(
                    "relay reported failure: {}",
                    error_text(&notice.error).unwrap_or("unspecified")
                )))
            }
            other => {
                debug!(kind = other.kind(), "not a negotiation step, ignored");
                Ok(Vec::new())
            }
        }
    }

    /// The transport finished gathering; `sdp` is the full local description.
    pub fn on_gathering_complete(&mut self, sdp: String) -> Result<Vec<Directive>> {
        let request: fn(SdpRequest) -> NegotiationMessage = match (self.role, self.state.phase) {
            (ClientRole::Source, SessionPhase::OfferPending) if !self.description_sent => {
                NegotiationMessage::OfferReq
            }
            (ClientRole::Controller, SessionPhase::OfferAcked) if !self.description_sent => {
                NegotiationMessage::AnswerReq
            }
            (_, phase) => {
                debug!(%phase, "gathering completion ignored");
                return Ok(Vec::new());
            }
        };
        if sdp.is_empty() {
            return Err(Error::negotiation("transport produced an empty description"));
        }

        self.description_sent = true;
        // the description is out; a create future still in flight has nothing left to report
        if matches!(
            self.pending,
            Some(Pending {
                op: Operation::CreateOffer | Operation::CreateAnswer,
                ..
            })
        ) {
            self.pending = None;
        }
        if self.state.phase == SessionPhase::OfferAcked {
            self.enter(SessionPhase::AnswerPending);
        }
        let msg = request(SdpRequest {
            name: self.name.clone(),
            triple: self.state.triple.clone(),
            sdp,
        });
        debug!(kind = msg.kind(), session = %self.state.triple, "sending local description");
        Ok(vec![Directive::Send(msg)])
    }

    /// Outcome of a bridge operation issued under `ticket`.
    pub fn on_bridge_result(&mut self, ticket: Ticket, result: Result<()>) -> Result<Vec<Directive>> {
        let op = match self.pending {
            Some(pending) if pending.ticket == ticket && pending.op != Operation::Consent => {
                pending.op
            }
            _ => {
                debug!(ticket, "stale bridge completion ignored");
                return Ok(Vec::new());
            }
        };
        self.pending = None;

        match (op, result) {
            (Operation::CreateOffer | Operation::CreateAnswer, Ok(())) => {
                debug!(?op, "local description created, waiting for gathering");
                Ok(Vec::new())
            }
            (Operation::CreateOffer, Err(err)) => {
                Err(Error::negotiation(format!("creating offer failed: {err}")))
            }
            (Operation::CreateAnswer, Err(err)) => {
                Err(Error::negotiation(format!("creating answer failed: {err}")))
            }
            (Operation::ApplyRemote, Ok(())) => Ok(self.remote_applied()),
            (Operation::ApplyRemote, Err(err)) => {
                let response = SessionResponse::failed(self.state.triple.clone(), APPLY_FAILED);
                self.failure_notice = Some(if self.role.is_offerer() {
                    NegotiationMessage::AnswerRes(response)
                } else {
                    NegotiationMessage::OfferRes(response)
                });
                Err(Error::negotiation(format!("{APPLY_FAILED}: {err}")))
            }
            (Operation::Consent, _) => Ok(Vec::new()),
        }
    }

    /// The local user's answer to the prompt issued under `ticket`.
    pub fn on_consent(&mut self, ticket: Ticket, accepted: bool) -> Result<Vec<Directive>> {
        let current = matches!(
            self.pending,
            Some(Pending { ticket: t, op: Operation::Consent }) if t == ticket
        );
        if !current || self.state.phase != SessionPhase::AwaitingOffer {
            debug!(ticket, "stale consent ignored");
            return Ok(Vec::new());
        }
        self.pending = None;

        if !accepted {
            info!(session = %self.state.triple, "incoming call declined");
            let reply = SessionResponse::failed(self.state.triple.clone(), REJECTED);
            self.reset_call();
            return Ok(vec![Directive::Send(NegotiationMessage::OfferRes(reply))]);
        }

        let sdp = self.remote_sdp.take().unwrap_or_default();
        let ticket = self.issue(Operation::ApplyRemote);
        Ok(vec![Directive::ApplyRemote {
            ticket,
            description: SessionDescription::offer(sdp),
        }])
    }

    pub fn on_connection_state(&mut self, state: ConnectionState) -> Result<Vec<Directive>> {
        if state.is_terminal() && self.state.phase.in_call() {
            return Err(Error::transport(format!("peer connection {state}")));
        }
        debug!(%state, "peer connection state");
        Ok(Vec::new())
    }

    /// Best-effort error response to send before the channel closes.
    pub fn take_failure_notice(&mut self) -> Option<NegotiationMessage> {
        self.failure_notice.take()
    }

    /// Ends the session for good. Later inputs are ignored.
    pub fn close(&mut self) {
        if self.state.phase == SessionPhase::Closed {
            return;
        }
        self.clear_call();
        self.failure_notice = None;
        self.enter(SessionPhase::Closed);
    }

    fn on_offer_request(&mut self, req: SdpRequest) -> Result<Vec<Directive>> {
        if self.role.is_offerer() {
            debug!("offerReq sent to a source ignored");
            return Ok(Vec::new());
        }
        if self.state.phase.in_call() {
            if req.triple == self.state.triple {
                debug!("repeated offerReq for the live session ignored");
                return Ok(Vec::new());
            }
            if !req.triple.is_complete() {
                warn!(session = %req.triple, "malformed offerReq during a call dropped");
                return Ok(Vec::new());
            }
            info!(caller = %req.name, session = %req.triple, "busy, declining second offer");
            return Ok(vec![Directive::Send(NegotiationMessage::OfferRes(
                SessionResponse::failed(req.triple, BUSY),
            ))]);
        }

        let Some(identity) = &self.identity else {
            warn!("offerReq before registration dropped");
            return Ok(Vec::new());
        };
        if let Some(field) = req.missing_field() {
            warn!(field, "offerReq missing a field dropped");
            return Ok(Vec::new());
        }
        if req.triple.peer_id != identity.id {
            warn!(peer_id = %req.triple.peer_id, "offerReq addressed to another controller dropped");
            return Ok(Vec::new());
        }

        let call = IncomingCall {
            caller_name: req.name,
            triple: req.triple.clone(),
        };
        self.begin_call(req.triple);
        self.remote_sdp = Some(req.sdp);
        self.enter(SessionPhase::AwaitingOffer);
        let ticket = self.issue(Operation::Consent);
        Ok(vec![Directive::PromptConsent { ticket, call }])
    }

    fn on_offer_response(&mut self, res: SessionResponse) -> Result<Vec<Directive>> {
        if !self.role.is_offerer()
            || self.state.phase != SessionPhase::OfferPending
            || !self.description_sent
        {
            return self.unexpected("offerRes");
        }

        match error_text(&res.error) {
            Some(reason @ (REJECTED | BUSY)) => {
                if !res.triple.is_empty() {
                    self.state.triple.verify_echo(&res.triple)?;
                }
                info!(session = %self.state.triple, reason, "call declined by peer");
                let advisory = if reason == BUSY {
                    Advisory::Busy
                } else {
                    Advisory::RejectedByPeer
                };
                self.reset_call();
                Ok(vec![Directive::ResetBridge, Directive::Advise(advisory)])
            }
            Some(other) => Err(Error::negotiation(format!("offer refused: {other}"))),
            None => {
                self.state.triple.verify_echo(&res.triple)?;
                self.state.flags.offer_acked = true;
                self.enter(SessionPhase::AwaitingAnswer);
                Ok(Vec::new())
            }
        }
    }

    fn on_answer_request(&mut self, req: SdpRequest) -> Result<Vec<Directive>> {
        if !self.role.is_offerer() {
            return self.unexpected("answerReq");
        }
        match self.state.phase {
            SessionPhase::OfferPending => {
                self.failure_notice = Some(NegotiationMessage::AnswerRes(SessionResponse::failed(
                    self.state.triple.clone(),
                    OFFER_NOT_ACKED,
                )));
                Err(Error::negotiation("answer arrived before the offer was acknowledged"))
            }
            SessionPhase::AwaitingAnswer if !self.applying_remote() => {
                if let Some(field) = req.missing_field() {
                    return Err(Error::validation(format!("answerReq lacks {field}")));
                }
                self.state.triple.verify_echo(&req.triple)?;
                let ticket = self.issue(Operation::ApplyRemote);
                Ok(vec![Directive::ApplyRemote {
                    ticket,
                    description: SessionDescription::answer(req.sdp),
                }])
            }
            _ => self.unexpected("answerReq"),
        }
    }

    fn on_answer_response(&mut self, res: SessionResponse) -> Result<Vec<Directive>> {
        if self.role.is_offerer() || self.state.phase != SessionPhase::AnswerPending {
            return self.unexpected("answerRes");
        }
        self.state.triple.verify_echo(&res.triple)?;
        if let Some(err) = error_text(&res.error) {
            return Err(Error::negotiation(format!("answer refused: {err}")));
        }
        self.state.flags.answer_acked = true;
        self.enter(SessionPhase::AnswerAcked);
        Ok(Vec::new())
    }

    fn on_link_request(&mut self, req: LinkRequest) -> Result<Vec<Directive>> {
        if self.role.is_offerer() || self.state.phase != SessionPhase::AnswerAcked {
            return self.unexpected("linkReq");
        }
        self.state.triple.verify_echo(&req.triple)?;
        let triple = self.state.triple.clone();
        self.state.flags.resource_linked = true;
        self.enter(SessionPhase::Active);
        Ok(vec![
            Directive::Send(NegotiationMessage::LinkRes(SessionResponse::ok(triple.clone()))),
            Directive::Activate(triple),
        ])
    }

    fn on_link_response(&mut self, res: SessionResponse) -> Result<Vec<Directive>> {
        if !self.role.is_offerer() || self.state.phase != SessionPhase::ResourceLinking {
            return self.unexpected("linkRes");
        }
        self.state.triple.verify_echo(&res.triple)?;
        if let Some(err) = error_text(&res.error) {
            return Err(Error::negotiation(format!("resource link refused: {err}")));
        }
        self.state.flags.resource_linked = true;
        self.enter(SessionPhase::Active);
        Ok(vec![Directive::Activate(self.state.triple.clone())])
    }

    fn remote_applied(&mut self) -> Vec<Directive> {
        let triple = self.state.triple.clone();
        match (self.role, self.state.phase) {
            (ClientRole::Controller, SessionPhase::AwaitingOffer) => {
                self.state.flags.offer_acked = true;
                self.enter(SessionPhase::OfferAcked);
                let ticket = self.issue(Operation::CreateAnswer);
                vec![
                    Directive::Send(NegotiationMessage::OfferRes(SessionResponse::ok(triple))),
                    Directive::CreateAnswer(ticket),
                ]
            }
            (ClientRole::Source, SessionPhase::AwaitingAnswer) => {
                self.state.flags.answer_acked = true;
                self.enter(SessionPhase::AnswerAcked);
                let link = NegotiationMessage::LinkReq(LinkRequest {
                    triple: triple.clone(),
                });
                self.enter(SessionPhase::ResourceLinking);
                vec![
                    Directive::Send(NegotiationMessage::AnswerRes(SessionResponse::ok(triple))),
                    Directive::Send(link),
                ]
            }
            (_, phase) => {
                debug!(%phase, "remote description applied out of phase");
                Vec::new()
            }
        }
    }

    fn applying_remote(&self) -> bool {
        matches!(
            self.pending,
            Some(Pending {
                op: Operation::ApplyRemote,
                ..
            })
        )
    }

    /// Out-of-sequence messages end a live call; with no call they are noise.
    fn unexpected(&self, kind: &str) -> Result<Vec<Directive>> {
        if self.state.phase.in_call() {
            return Err(Error::validation(format!(
                "{kind} out of sequence in phase {}",
                self.state.phase
            )));
        }
        debug!(kind, phase = %self.state.phase, "no call in progress, message ignored");
        Ok(Vec::new())
    }

    fn begin_call(&mut self, triple: SessionTriple) {
        let call_id = Uuid::new_v4();
        info!(call = %call_id, session = %triple, "call started");
        self.call_id = Some(call_id);
        self.state.triple = triple;
        self.state.flags = CompletionFlags::default();
        self.description_sent = false;
        self.remote_sdp = None;
    }

    /// Back to idle after a decline; identity and registration survive.
    fn reset_call(&mut self) {
        self.clear_call();
        self.enter(SessionPhase::Idle);
    }

    fn clear_call(&mut self) {
        self.pending = None;
        self.remote_sdp = None;
        self.description_sent = false;
        self.call_id = None;
        self.state.triple = SessionTriple::default();
        self.state.flags = CompletionFlags::default();
    }

    fn issue(&mut self, op: Operation) -> Ticket {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.pending = Some(Pending { ticket, op });
        ticket
    }

    fn enter(&mut self, next: SessionPhase) {
        if self.state.phase != next {
            info!(call = ?self.call_id, from = %self.state.phase, to = %next, "phase changed");
            self.state.phase = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple() -> SessionTriple {
        SessionTriple::new("S1", "C1", "G1")
    }

    fn registered(role: ClientRole, id: &str) -> Negotiator {
        let mut n = Negotiator::new(role);
        n.begin_registration("tester");
        n.registered(ClientIdentity {
            id: id.into(),
            role,
        });
        n
    }

    fn sent(directives: &[Directive]) -> Vec<&NegotiationMessage> {
        directives
            .iter()
            .filter_map(|d| match d {
                Directive::Send(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    fn only_ticket(directives: &[Directive]) -> Ticket {
        directives
            .iter()
            .find_map(|d| match d {
                Directive::CreateOffer(t) | Directive::CreateAnswer(t) => Some(*t),
                Directive::ApplyRemote { ticket, .. } | Directive::PromptConsent { ticket, .. } => {
                    Some(*ticket)
                }
                _ => None,
            })
            .expect("directive with a ticket")
    }

    fn offer_request(t: SessionTriple) -> NegotiationMessage {
        NegotiationMessage::OfferReq(SdpRequest {
            name: "camera".into(),
            triple: t,
            sdp: "offer-sdp".into(),
        })
    }

    fn answer_request(t: SessionTriple) -> NegotiationMessage {
        NegotiationMessage::AnswerReq(SdpRequest {
            name: "alice".into(),
            triple: t,
            sdp: "answer-sdp".into(),
        })
    }

    /// Source with its offer sent and nothing acknowledged yet.
    fn source_offer_sent() -> Negotiator {
        let mut n = registered(ClientRole::Source, "S1");
        let dirs = n.start_call("C1", "G1").unwrap();
        let ticket = only_ticket(&dirs);
        assert!(n.on_bridge_result(ticket, Ok(())).unwrap().is_empty());
        let dirs = n.on_gathering_complete("offer-sdp".into()).unwrap();
        assert!(matches!(sent(&dirs).as_slice(), [NegotiationMessage::OfferReq(_)]));
        n
    }

    #[test]
    fn source_happy_path_reaches_active() {
        let mut n = source_offer_sent();
        assert_eq!(n.phase(), SessionPhase::OfferPending);

        let dirs = n
            .on_message(NegotiationMessage::OfferRes(SessionResponse::ok(triple())))
            .unwrap();
        assert!(dirs.is_empty());
        assert_eq!(n.phase(), SessionPhase::AwaitingAnswer);
        assert!(n.state().flags.offer_acked);

        let dirs = n.on_message(answer_request(triple())).unwrap();
        assert!(matches!(
            &dirs[..],
            [Directive::ApplyRemote { description, .. }] if description.sdp == "answer-sdp"
        ));

        let dirs = n.on_bridge_result(only_ticket(&dirs), Ok(())).unwrap();
        let msgs = sent(&dirs);
        assert!(matches!(msgs[0], NegotiationMessage::AnswerRes(res) if res.error.is_none()));
        assert!(matches!(msgs[1], NegotiationMessage::LinkReq(req) if req.triple == triple()));
        assert_eq!(n.phase(), SessionPhase::ResourceLinking);

        let dirs = n
            .on_message(NegotiationMessage::LinkRes(SessionResponse::ok(triple())))
            .unwrap();
        assert_eq!(dirs, vec![Directive::Activate(triple())]);
        assert_eq!(n.phase(), SessionPhase::Active);
        assert!(n.state().relay_open());
    }

    #[test]
    fn controller_happy_path_reaches_active() {
        let mut n = registered(ClientRole::Controller, "C1");
        let dirs = n.on_message(offer_request(triple())).unwrap();
        let Directive::PromptConsent { ticket, call } = &dirs[0] else {
            panic!("expected a consent prompt, got {dirs:?}");
        };
        assert_eq!(call.caller_name, "camera");
        assert_eq!(n.phase(), SessionPhase::AwaitingOffer);

        let dirs = n.on_consent(*ticket, true).unwrap();
        assert!(matches!(
            &dirs[..],
            [Directive::ApplyRemote { description, .. }] if description.sdp == "offer-sdp"
        ));

        let dirs = n.on_bridge_result(only_ticket(&dirs), Ok(())).unwrap();
        assert!(matches!(sent(&dirs).as_slice(), [NegotiationMessage::OfferRes(res)] if res.error.is_none()));
        assert_eq!(n.phase(), SessionPhase::OfferAcked);
        let answer_ticket = only_ticket(&dirs);
        n.on_bridge_result(answer_ticket, Ok(())).unwrap();

        let dirs = n.on_gathering_complete("answer-sdp".into()).unwrap();
        assert!(matches!(sent(&dirs).as_slice(), [NegotiationMessage::AnswerReq(req)] if req.sdp == "answer-sdp"));
        assert_eq!(n.phase(), SessionPhase::AnswerPending);

        n.on_message(NegotiationMessage::AnswerRes(SessionResponse::ok(triple())))
            .unwrap();
        assert_eq!(n.phase(), SessionPhase::AnswerAcked);
        assert!(!n.state().relay_open());

        let dirs = n
            .on_message(NegotiationMessage::LinkReq(LinkRequest { triple: triple() }))
            .unwrap();
        assert!(matches!(sent(&dirs).as_slice(), [NegotiationMessage::LinkRes(res)] if res.triple == triple()));
        assert!(dirs.contains(&Directive::Activate(triple())));
        assert_eq!(n.phase(), SessionPhase::Active);
        assert!(n.state().relay_open());
    }

    #[test]
    fn gathering_before_the_create_future_resolves() {
        let mut n = registered(ClientRole::Source, "S1");
        let create = only_ticket(&n.start_call("C1", "G1").unwrap());
        let dirs = n.on_gathering_complete("offer-sdp".into()).unwrap();
        assert!(matches!(sent(&dirs).as_slice(), [NegotiationMessage::OfferReq(_)]));

        n.on_message(NegotiationMessage::OfferRes(SessionResponse::ok(triple())))
            .unwrap();
        let dirs = n.on_message(answer_request(triple())).unwrap();
        let apply = only_ticket(&dirs);
        assert!(matches!(&dirs[..], [Directive::ApplyRemote { .. }]));

        // the late create result neither aborts nor disturbs the apply
        assert!(n.on_bridge_result(create, Ok(())).unwrap().is_empty());
        let dirs = n.on_bridge_result(apply, Ok(())).unwrap();
        assert!(matches!(sent(&dirs)[1], NegotiationMessage::LinkReq(_)));
        assert_eq!(n.phase(), SessionPhase::ResourceLinking);
    }

    #[test]
    fn second_answer_while_applying_aborts() {
        let mut n = source_offer_sent();
        n.on_message(NegotiationMessage::OfferRes(SessionResponse::ok(triple())))
            .unwrap();
        n.on_message(answer_request(triple())).unwrap();
        let err = n.on_message(answer_request(triple())).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn mismatched_link_response_aborts() {
        let mut n = source_offer_sent();
        n.on_message(NegotiationMessage::OfferRes(SessionResponse::ok(triple())))
            .unwrap();
        let dirs = n.on_message(answer_request(triple())).unwrap();
        n.on_bridge_result(only_ticket(&dirs), Ok(())).unwrap();
        assert_eq!(n.phase(), SessionPhase::ResourceLinking);

        let err = n
            .on_message(NegotiationMessage::LinkRes(SessionResponse::ok(
                SessionTriple::new("S1", "C1", "G2"),
            )))
            .unwrap_err();
        assert!(matches!(err, Error::IdentityMismatch { .. }));
        assert!(!n.state().flags.resource_linked);
        assert!(!n.state().relay_open());
    }

    #[test]
    fn mismatched_link_request_aborts() {
        let mut n = registered(ClientRole::Controller, "C1");
        let dirs = n.on_message(offer_request(triple())).unwrap();
        let dirs = n.on_consent(only_ticket(&dirs), true).unwrap();
        let dirs = n.on_bridge_result(only_ticket(&dirs), Ok(())).unwrap();
        n.on_bridge_result(only_ticket(&dirs), Ok(())).unwrap();
        n.on_gathering_complete("answer-sdp".into()).unwrap();
        n.on_message(NegotiationMessage::AnswerRes(SessionResponse::ok(triple())))
            .unwrap();
        assert_eq!(n.phase(), SessionPhase::AnswerAcked);

        let err = n
            .on_message(NegotiationMessage::LinkReq(LinkRequest {
                triple: SessionTriple::new("S9", "C1", "G1"),
            }))
            .unwrap_err();
        assert!(matches!(err, Error::IdentityMismatch { .. }));
        assert!(!n.state().flags.resource_linked);
    }

    #[test]
    fn gathering_sends_the_offer_once() {
        let mut n = source_offer_sent();
        assert!(n.on_gathering_complete("again".into()).unwrap().is_empty());
    }

    #[test]
    fn answer_before_offer_ack_aborts_with_notice() {
        let mut n = source_offer_sent();
        let err = n.on_message(answer_request(triple())).unwrap_err();
        assert_eq!(err.kind(), "negotiation");
        let Some(NegotiationMessage::AnswerRes(res)) = n.take_failure_notice() else {
            panic!("expected an answerRes notice");
        };
        assert_eq!(error_text(&res.error), Some(OFFER_NOT_ACKED));
    }

    #[test]
    fn rejected_offer_resets_to_idle_with_advisory() {
        let mut n = source_offer_sent();
        let dirs = n
            .on_message(NegotiationMessage::OfferRes(SessionResponse::failed(
                SessionTriple::default(),
                REJECTED,
            )))
            .unwrap();
        assert_eq!(
            dirs,
            vec![
                Directive::ResetBridge,
                Directive::Advise(Advisory::RejectedByPeer)
            ]
        );
        assert_eq!(n.phase(), SessionPhase::Idle);
        assert!(n.state().triple.is_empty());

        // identity survives, so a new call may start
        assert_eq!(n.start_call("C2", "G2").unwrap().len(), 1);
    }

    #[test]
    fn busy_offer_response_is_a_busy_advisory() {
        let mut n = source_offer_sent();
        let dirs = n
            .on_message(NegotiationMessage::OfferRes(SessionResponse::failed(triple(), BUSY)))
            .unwrap();
        assert!(dirs.contains(&Directive::Advise(Advisory::Busy)));
    }

    #[test]
    fn mismatched_offer_response_aborts() {
        let mut n = source_offer_sent();
        let err = n
            .on_message(NegotiationMessage::OfferRes(SessionResponse::ok(
                SessionTriple::new("S1", "C2", "G1"),
            )))
            .unwrap_err();
        assert!(matches!(err, Error::IdentityMismatch { .. }));
        assert!(!n.state().flags.offer_acked);
    }

    #[test]
    fn explicit_offer_error_aborts() {
        let mut n = source_offer_sent();
        let err = n
            .on_message(NegotiationMessage::OfferRes(SessionResponse::failed(
                triple(),
                "could not set remote description",
            )))
            .unwrap_err();
        assert_eq!(err.kind(), "negotiation");
    }

    #[test]
    fn controller_answer_response_mismatch_aborts() {
        let mut n = registered(ClientRole::Controller, "C1");
        let dirs = n.on_message(offer_request(triple())).unwrap();
        let dirs = n.on_consent(only_ticket(&dirs), true).unwrap();
        let dirs = n.on_bridge_result(only_ticket(&dirs), Ok(())).unwrap();
        n.on_bridge_result(only_ticket(&dirs), Ok(())).unwrap();
        n.on_gathering_complete("answer-sdp".into()).unwrap();

        let err = n
            .on_message(NegotiationMessage::AnswerRes(SessionResponse::ok(
                SessionTriple::new("S1", "C2", "G1"),
            )))
            .unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(!n.state().flags.answer_acked);
    }

    #[test]
    fn controller_drops_malformed_or_misaddressed_offers() {
        let mut n = registered(ClientRole::Controller, "C1");
        let mut req = SdpRequest {
            name: "camera".into(),
            triple: triple(),
            sdp: String::new(),
        };
        assert!(n.on_message(NegotiationMessage::OfferReq(req.clone())).unwrap().is_empty());

        req.sdp = "offer-sdp".into();
        req.triple.peer_id = "C7".into();
        assert!(n.on_message(NegotiationMessage::OfferReq(req)).unwrap().is_empty());
        assert_eq!(n.phase(), SessionPhase::Registered);
    }

    #[test]
    fn second_offer_during_a_call_gets_busy() {
        let mut n = registered(ClientRole::Controller, "C1");
        n.on_message(offer_request(triple())).unwrap();

        let other = SessionTriple::new("S2", "C1", "G2");
        let dirs = n.on_message(offer_request(other.clone())).unwrap();
        assert_eq!(
            dirs,
            vec![Directive::Send(NegotiationMessage::OfferRes(
                SessionResponse::failed(other, BUSY)
            ))]
        );
        assert_eq!(n.state().triple, triple());
    }

    #[test]
    fn declined_call_replies_rejected() {
        let mut n = registered(ClientRole::Controller, "C1");
        let dirs = n.on_message(offer_request(triple())).unwrap();
        let dirs = n.on_consent(only_ticket(&dirs), false).unwrap();
        assert_eq!(
            dirs,
            vec![Directive::Send(NegotiationMessage::OfferRes(
                SessionResponse::failed(triple(), REJECTED)
            ))]
        );
        assert_eq!(n.phase(), SessionPhase::Idle);
    }

    #[test]
    fn apply_failure_leaves_an_error_notice() {
        let mut n = registered(ClientRole::Controller, "C1");
        let dirs = n.on_message(offer_request(triple())).unwrap();
        let dirs = n.on_consent(only_ticket(&dirs), true).unwrap();
        let err = n
            .on_bridge_result(only_ticket(&dirs), Err(Error::negotiation("bad sdp")))
            .unwrap_err();
        assert_eq!(err.kind(), "negotiation");
        let Some(NegotiationMessage::OfferRes(res)) = n.take_failure_notice() else {
            panic!("expected an offerRes notice");
        };
        assert_eq!(error_text(&res.error), Some(APPLY_FAILED));
        assert_eq!(res.triple, triple());
    }

    #[test]
    fn stale_completions_are_ignored() {
        let mut n = source_offer_sent();
        let dirs = n
            .on_message(NegotiationMessage::OfferRes(SessionResponse::ok(triple())))
            .unwrap();
        assert!(dirs.is_empty());
        let dirs = n.on_message(answer_request(triple())).unwrap();
        let ticket = only_ticket(&dirs);

        // an older ticket does nothing
        assert!(n.on_bridge_result(ticket - 1, Ok(())).unwrap().is_empty());
        assert_eq!(n.phase(), SessionPhase::AwaitingAnswer);

        n.close();
        assert!(n.on_bridge_result(ticket, Ok(())).unwrap().is_empty());
        assert!(n.on_consent(ticket, true).unwrap().is_empty());
        assert_eq!(n.phase(), SessionPhase::Closed);
        assert!(n.state().triple.is_empty());
    }

    #[test]
    fn terminal_connection_state_aborts_only_during_a_call() {
        let mut idle = registered(ClientRole::Source, "S1");
        assert!(idle.on_connection_state(ConnectionState::Failed).is_ok());

        let mut n = source_offer_sent();
        assert!(n.on_connection_state(ConnectionState::Connecting).is_ok());
        let err = n.on_connection_state(ConnectionState::Disconnected).unwrap_err();
        assert_eq!(err.kind(), "transport");
    }

    #[test]
    fn server_error_is_fatal_in_a_call() {
        let mut idle = registered(ClientRole::Source, "S1");
        let notice = padlink_common::ServerNotice {
            error: Some("peer gone".into()),
        };
        assert!(idle
            .on_message(NegotiationMessage::OfferServerError(notice.clone()))
            .unwrap()
            .is_empty());

        let mut n = source_offer_sent();
        let err = n
            .on_message(NegotiationMessage::OfferServerError(notice))
            .unwrap_err();
        assert!(err.to_string().contains("peer gone"));
    }

    #[test]
    fn out_of_sequence_link_response_aborts() {
        let mut n = source_offer_sent();
        assert!(n
            .on_message(NegotiationMessage::LinkRes(SessionResponse::ok(triple())))
            .is_err());
    }

    #[test]
    fn start_call_preconditions() {
        let mut unregistered = Negotiator::new(ClientRole::Source);
        assert!(unregistered.start_call("C1", "G1").is_err());

        let mut controller = registered(ClientRole::Controller, "C1");
        assert!(controller.start_call("C1", "G1").is_err());

        let mut n = registered(ClientRole::Source, "S1");
        assert!(n.start_call("", "G1").is_err());
        n.start_call("C1", "G1").unwrap();
        assert!(n.start_call("C1", "G1").is_err());
    }

    #[test]
    fn advisories_follow_error_visibility() {
        assert_eq!(
            Advisory::from_error(&Error::RejectedByPeer),
            Some(Advisory::RejectedByPeer)
        );
        assert!(matches!(
            Advisory::from_error(&Error::transport("peer connection failed")),
            Some(Advisory::Failed(_))
        ));
        assert_eq!(Advisory::from_error(&Error::validation("missing PeerId")), None);
    }
}
