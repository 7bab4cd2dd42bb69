//! The engine: one task that owns a session and everything attached to it.
//!
//! `Engine::run` is a single `select!` loop over user commands, both channels,
//! bridge events, in-flight bridge and consent futures, supervisor ticks and the
//! sampling interval. Each event is handled to completion before the next one,
//! so session state is only ever touched from this task.
//!
//! Every fatal error from any of those sources ends in [`Engine::teardown`].
//! After teardown the engine is closed for good; a new call needs a new engine.

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use padlink_common::{
    ClientIdentity, ClientRole, Envelope, Error, NegotiationMessage, RelayMessage, Result,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bridge::{BridgeEvent, Generation, TransportBridge};
use crate::channel::{ChannelAdapter, ChannelEvent};
use crate::config::EngineConfig;
use crate::control::ControlRelay;
use crate::hooks::{ConsentPrompt, HapticSink, InputSource};
use crate::negotiation::{Advisory, Directive, Negotiator, SessionPhase, SessionState, Ticket};
use crate::registration::{Directory, RegistrationSupervisor, SupervisorTick};

/// External pieces the engine drives.
pub struct Collaborators {
    pub bridge: Box<dyn TransportBridge>,
    pub bridge_events: mpsc::UnboundedReceiver<BridgeEvent>,
    pub consent: Box<dyn ConsentPrompt>,
    pub input: Option<Box<dyn InputSource>>,
    pub haptics: Option<Box<dyn HapticSink>>,
}

#[derive(Debug)]
enum Command {
    Register {
        name: String,
        reply: oneshot::Sender<Result<ClientIdentity>>,
    },
    SetReady(bool),
    Call {
        peer_id: String,
        resource_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Hangup,
}

enum Completion {
    Bridge { ticket: Ticket, result: Result<()> },
    Consent { ticket: Ticket, accepted: bool },
}

/// Cheap handle for talking to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    phase: watch::Receiver<SessionPhase>,
    directory: watch::Receiver<Directory>,
}

impl EngineHandle {
    /// Registers under `name` and resolves once the relay assigned an identity.
    pub async fn register(&self, name: &str) -> Result<ClientIdentity> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register {
            name: name.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::channel("engine stopped"))?
    }

    /// Sets the local ready flag that gates the first `registerReq`.
    pub fn set_ready(&self, ready: bool) -> Result<()> {
        self.send(Command::SetReady(ready))
    }

    /// Places a call; resolves once the offer is being created.
    pub async fn call(&self, peer_id: &str, resource_id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Call {
            peer_id: peer_id.to_string(),
            resource_id: resource_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::channel("engine stopped"))?
    }

    pub fn hangup(&self) -> Result<()> {
        self.send(Command::Hangup)
    }

    pub fn phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.clone()
    }

    pub fn directory(&self) -> watch::Receiver<Directory> {
        self.directory.clone()
    }

    /// Waits until the session reaches `target`, or fails if it closes first.
    pub async fn wait_for_phase(&self, target: SessionPhase) -> Result<()> {
        let mut phase = self.phase.clone();
        let reached = phase
            .wait_for(|p| *p == target || *p == SessionPhase::Closed)
            .await
            .map_err(|_| Error::channel("engine stopped"))?;
        if *reached == target {
            Ok(())
        } else {
            Err(Error::channel(format!("session closed before reaching {target}")))
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::channel("engine stopped"))
    }
}

pub struct Engine {
    role: ClientRole,
    config: EngineConfig,
    signaling: ChannelAdapter<NegotiationMessage>,
    control: Option<ChannelAdapter<RelayMessage>>,
    bridge: Box<dyn TransportBridge>,
    bridge_events: mpsc::UnboundedReceiver<BridgeEvent>,
    bridge_generation: Generation,
    bridge_closed: bool,
    consent: Box<dyn ConsentPrompt>,
    input: Option<Box<dyn InputSource>>,
    haptics: Option<Box<dyn HapticSink>>,
    negotiator: Negotiator,
    supervisor: RegistrationSupervisor,
    supervisor_ticks: mpsc::UnboundedReceiver<SupervisorTick>,
    relay: ControlRelay,
    sampler: Option<Interval>,
    in_flight: FuturesUnordered<BoxFuture<'static, Completion>>,
    commands: mpsc::UnboundedReceiver<Command>,
    phase_tx: watch::Sender<SessionPhase>,
    advisories: mpsc::UnboundedSender<Advisory>,
    register_reply: Option<oneshot::Sender<Result<ClientIdentity>>>,
}

impl Engine {
    /// Builds an engine over already connected channels.
    ///
    /// Without a control channel the session still negotiates to `Active`, but no
    /// control state is relayed.
    pub fn new(
        role: ClientRole,
        config: EngineConfig,
        signaling: ChannelAdapter<NegotiationMessage>,
        control: Option<ChannelAdapter<RelayMessage>>,
        collaborators: Collaborators,
    ) -> (Self, EngineHandle, mpsc::UnboundedReceiver<Advisory>) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (advisories, advisory_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Idle);
        let (supervisor, supervisor_ticks) = RegistrationSupervisor::new(role, &config);

        let handle = EngineHandle {
            commands: command_tx,
            phase: phase_rx,
            directory: supervisor.subscribe_directory(),
        };
        let engine = Self {
            role,
            config,
            signaling,
            control,
            bridge: collaborators.bridge,
            bridge_events: collaborators.bridge_events,
            bridge_generation: 0,
            bridge_closed: false,
            consent: collaborators.consent,
            input: collaborators.input,
            haptics: collaborators.haptics,
            negotiator: Negotiator::new(role),
            supervisor,
            supervisor_ticks,
            relay: ControlRelay::new(),
            sampler: None,
            in_flight: FuturesUnordered::new(),
            commands,
            phase_tx,
            advisories,
            register_reply: None,
        };
        (engine, handle, advisory_rx)
    }

    pub fn state(&self) -> &SessionState {
        self.negotiator.state()
    }

    pub fn is_closed(&self) -> bool {
        self.negotiator.phase() == SessionPhase::Closed
    }

    /// Scheduled tasks and intervals still alive across all components.
    pub fn active_timers(&self) -> usize {
        self.signaling.active_timers()
            + self.control.as_ref().map_or(0, |c| c.active_timers())
            + self.supervisor.active_timers()
            + usize::from(self.sampler.is_some())
    }

    /// Runs until the session is torn down.
    ///
    /// Usually spawned as `tokio::spawn(async move { engine.run().await; engine })`
    /// so the closed engine can be inspected afterwards.
    pub async fn run(&mut self) {
        info!(role = %self.role, "engine started");
        while !self.is_closed() {
            let step = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("all engine handles dropped");
                        self.teardown(None);
                        Ok(())
                    }
                },
                event = self.signaling.recv() => self.on_signaling(event),
                event = recv_control(&mut self.control) => self.on_control(event),
                Some(event) = self.bridge_events.recv() => self.on_bridge_event(event),
                Some(done) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.on_completion(done)
                }
                Some(tick) = self.supervisor_ticks.recv() => self.on_tick(tick),
                _ = next_sample(&mut self.sampler) => self.on_sample(),
            };
            if let Err(err) = step {
                self.teardown(Some(err));
            }
            self.publish_phase();
        }
        info!(role = %self.role, "engine stopped");
    }

    /// Ends the session. Safe to call any number of times.
    ///
    /// `None` is a local hang-up.
    pub fn teardown(&mut self, cause: Option<Error>) {
        if self.is_closed() {
            debug!("teardown on a closed engine ignored");
            return;
        }

        let call = self.negotiator.call_id();
        let advisory = match &cause {
            None => {
                info!(?call, "session ended locally");
                Some(Advisory::CallEnded)
            }
            Some(err) if err.is_protocol_violation() => {
                warn!(?call, kind = err.kind(), error = %err, "protocol violation, aborting session");
                None
            }
            Some(err) => {
                warn!(?call, kind = err.kind(), error = %err, "session aborted");
                Advisory::from_error(err)
            }
        };

        if let Some(notice) = self.negotiator.take_failure_notice() {
            if self.signaling.is_open() {
                if let Err(err) = self.signaling.send(&notice) {
                    debug!(error = %err, "failure notice not delivered");
                }
            }
        }

        if !self.bridge_closed {
            self.bridge.close();
            self.bridge_closed = true;
        }
        self.supervisor.cancel_all();
        self.sampler = None;
        self.in_flight = FuturesUnordered::new();
        self.relay.reset();
        self.signaling.close();
        if let Some(control) = self.control.as_mut() {
            control.close();
        }
        self.negotiator.close();

        if let Some(reply) = self.register_reply.take() {
            let _ = reply.send(Err(
                cause.unwrap_or_else(|| Error::channel("engine closed before registration finished"))
            ));
        }
        if let Some(advisory) = advisory {
            let _ = self.advisories.send(advisory);
        }
        self.publish_phase();
    }

    fn on_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Register { name, reply } => {
                if self.register_reply.is_some() {
                    let _ = reply.send(Err(Error::validation("registration already in progress")));
                    return Ok(());
                }
                match self.supervisor.register(&name) {
                    Ok(request) => {
                        self.negotiator.begin_registration(&name);
                        self.register_reply = Some(reply);
                        if let Some(request) = request {
                            self.signaling.send(&request)?;
                        }
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::SetReady(ready) => self.supervisor.set_ready(ready),
            Command::Call {
                peer_id,
                resource_id,
                reply,
            } => match self.negotiator.start_call(&peer_id, &resource_id) {
                Ok(directives) => {
                    let _ = reply.send(Ok(()));
                    self.execute(directives)?;
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Command::Hangup => self.teardown(None),
        }
        Ok(())
    }

    fn on_signaling(&mut self, event: ChannelEvent<NegotiationMessage>) -> Result<()> {
        let msg = match event {
            ChannelEvent::Message(msg) => msg,
            ChannelEvent::Closed { reason } => {
                return Err(Error::channel(format!("signaling channel closed: {reason}")));
            }
        };
        debug!(kind = msg.kind(), "signaling message");
        match msg {
            NegotiationMessage::RegisterRes(res) => {
                if let Some(identity) = self.supervisor.on_register_res(res)? {
                    self.negotiator.registered(identity.clone());
                    if let Some(reply) = self.register_reply.take() {
                        let _ = reply.send(Ok(identity));
                    }
                }
                Ok(())
            }
            NegotiationMessage::LookupRes(res) => {
                self.supervisor.on_lookup_res(res);
                Ok(())
            }
            other => {
                let directives = self.negotiator.on_message(other)?;
                self.execute(directives)
            }
        }
    }

    fn on_control(&mut self, event: ChannelEvent<RelayMessage>) -> Result<()> {
        let msg = match event {
            ChannelEvent::Message(msg) => msg,
            ChannelEvent::Closed { reason } => {
                return Err(Error::channel(format!("control channel closed: {reason}")));
            }
        };
        if let Some(command) = self.relay.on_message(self.negotiator.state(), msg) {
            match self.haptics.as_mut() {
                Some(haptics) => haptics.play(command),
                None => debug!("no haptic capability, feedback dropped"),
            }
        }
        Ok(())
    }

    fn on_bridge_event(&mut self, event: BridgeEvent) -> Result<()> {
        if event.generation() != self.bridge_generation {
            debug!(
                generation = event.generation(),
                current = self.bridge_generation,
                "event from a discarded connection ignored"
            );
            return Ok(());
        }
        let directives = match event {
            BridgeEvent::IceGatheringComplete { sdp, .. } => {
                self.negotiator.on_gathering_complete(sdp)?
            }
            BridgeEvent::ConnectionState { state, .. } => {
                self.negotiator.on_connection_state(state)?
            }
        };
        self.execute(directives)
    }

    fn on_completion(&mut self, completion: Completion) -> Result<()> {
        let directives = match completion {
            Completion::Bridge { ticket, result } => {
                self.negotiator.on_bridge_result(ticket, result)?
            }
            Completion::Consent { ticket, accepted } => {
                self.negotiator.on_consent(ticket, accepted)?
            }
        };
        self.execute(directives)
    }

    fn on_tick(&mut self, tick: SupervisorTick) -> Result<()> {
        if let Some(msg) = self.supervisor.on_tick(tick) {
            self.signaling.send(&msg)?;
        }
        Ok(())
    }

    fn on_sample(&mut self) -> Result<()> {
        let (Some(input), Some(control)) = (self.input.as_mut(), self.control.as_ref()) else {
            return Ok(());
        };
        let Some(snapshot) = input.poll() else {
            return Ok(());
        };
        if let Some(msg) = self.relay.sample(self.negotiator.state(), &snapshot) {
            if !control.offer(&msg)? {
                // retried on the next tick with whatever is current then
                debug!(timestamp = snapshot.timestamp, "control outbox full, snapshot dropped");
                self.relay.reset();
            }
        }
        Ok(())
    }

    fn execute(&mut self, directives: Vec<Directive>) -> Result<()> {
        for directive in directives {
            match directive {
                Directive::Send(msg) => self.signaling.send(&msg)?,
                Directive::CreateOffer(ticket) => {
                    let op = self.bridge.create_local_offer(self.bridge_generation);
                    self.track_bridge(ticket, op);
                }
                Directive::CreateAnswer(ticket) => {
                    let op = self.bridge.create_local_answer(self.bridge_generation);
                    self.track_bridge(ticket, op);
                }
                Directive::ApplyRemote {
                    ticket,
                    description,
                } => {
                    let op = self.bridge.set_remote_description(description);
                    self.track_bridge(ticket, op);
                }
                Directive::PromptConsent { ticket, call } => {
                    let prompt = self.consent.prompt(call);
                    self.in_flight.push(
                        async move {
                            Completion::Consent {
                                ticket,
                                accepted: prompt.await,
                            }
                        }
                        .boxed(),
                    );
                }
                Directive::Activate(triple) => {
                    info!(session = %triple, "session active");
                    self.relay.reset();
                    if self.input.is_some() && self.control.is_some() {
                        let mut sampler = interval(self.config.sample_interval);
                        sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);
                        self.sampler = Some(sampler);
                    }
                }
                Directive::Advise(advisory) => {
                    info!(%advisory, "advisory");
                    let _ = self.advisories.send(advisory);
                }
                Directive::ResetBridge => {
                    self.bridge.reset();
                    self.bridge_generation += 1;
                }
            }
        }
        Ok(())
    }

    fn track_bridge(&mut self, ticket: Ticket, op: BoxFuture<'static, Result<()>>) {
        self.in_flight.push(
            async move {
                Completion::Bridge {
                    ticket,
                    result: op.await,
                }
            }
            .boxed(),
        );
    }

    fn publish_phase(&self) {
        let phase = self.negotiator.phase();
        self.phase_tx.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
    }
}

async fn recv_control(control: &mut Option<ChannelAdapter<RelayMessage>>) -> ChannelEvent<RelayMessage> {
    match control {
        Some(control) => control.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_sample(sampler: &mut Option<Interval>) {
    match sampler {
        Some(sampler) => {
            sampler.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::FixedConsent;
    use crate::SessionDescription;
    use futures::future;
    use std::time::Duration;

    struct InertBridge;

    impl TransportBridge for InertBridge {
        fn create_local_offer(&mut self, _generation: Generation) -> BoxFuture<'static, Result<()>> {
            future::ready(Ok(())).boxed()
        }

        fn create_local_answer(&mut self, _generation: Generation) -> BoxFuture<'static, Result<()>> {
            future::ready(Ok(())).boxed()
        }

        fn set_remote_description(
            &mut self,
            _description: SessionDescription,
        ) -> BoxFuture<'static, Result<()>> {
            future::ready(Ok(())).boxed()
        }

        fn reset(&mut self) {}

        fn close(&mut self) {}
    }

    fn engine(role: ClientRole) -> (Engine, EngineHandle, mpsc::UnboundedReceiver<Advisory>) {
        let config = EngineConfig::default();
        let (signaling, _peer) = ChannelAdapter::loopback("signaling", config.keepalive);
        let (control, _relay) = ChannelAdapter::loopback("relay", config.keepalive);
        let (_events_tx, bridge_events) = mpsc::unbounded_channel();
        Engine::new(
            role,
            config,
            signaling,
            Some(control),
            Collaborators {
                bridge: Box::new(InertBridge),
                bridge_events,
                consent: Box::new(FixedConsent(true)),
                input: None,
                haptics: None,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_twice_is_a_no_op_and_stops_every_timer() {
        let (mut engine, _handle, mut advisories) = engine(ClientRole::Source);
        assert_eq!(engine.active_timers(), 2);

        engine.teardown(Some(Error::transport("peer connection failed")));
        let first = engine.state().clone();
        engine.teardown(Some(Error::transport("peer connection failed")));

        assert_eq!(engine.state(), &first);
        assert_eq!(first.phase, SessionPhase::Closed);
        assert!(first.triple.is_empty());
        assert_eq!(engine.active_timers(), 0);

        assert!(matches!(advisories.try_recv(), Ok(Advisory::Failed(_))));
        assert!(advisories.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(engine.active_timers(), 0);
    }

    #[tokio::test]
    async fn protocol_violations_raise_no_advisory() {
        let (mut engine, _handle, mut advisories) = engine(ClientRole::Controller);
        engine.teardown(Some(Error::identity_mismatch("S1/C1/G1", "S1/C2/G1")));
        assert!(engine.is_closed());
        assert!(advisories.try_recv().is_err());
    }

    #[tokio::test]
    async fn commands_fail_once_the_engine_is_gone() {
        let (engine, handle, _advisories) = engine(ClientRole::Source);
        drop(engine);
        assert!(handle.hangup().is_err());
        assert!(handle.call("C1", "G1").await.is_err());
    }
}
