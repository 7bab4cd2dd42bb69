//! Identity registration and directory polling.

use padlink_common::helpers::non_blank;
use padlink_common::{
    error_text, ClientIdentity, ClientRole, DirectoryEntry, Error, LookupResponse,
    NegotiationMessage, RegisterRequest, RegisterResponse, Result,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::timer::{count_active, ScheduledTask};

/// Peers the relay currently lists, republished verbatim on every lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    pub controllers: Vec<DirectoryEntry>,
    pub resources: Vec<DirectoryEntry>,
}

impl From<LookupResponse> for Directory {
    fn from(res: LookupResponse) -> Self {
        Self {
            controllers: res.controllers,
            resources: res.resources,
        }
    }
}

/// Posted by the supervisor's scheduled tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorTick {
    RegisterRetry,
    Lookup,
}

/// Drives `registerReq` until the relay hands out an identity, then keeps the
/// directory fresh for roles that browse peers.
///
/// The supervisor never touches the channel itself: every method returns the
/// message to send, if any.
pub struct RegistrationSupervisor {
    role: ClientRole,
    config: EngineConfig,
    ready: bool,
    pending_name: Option<String>,
    awaiting_response: bool,
    identity: Option<ClientIdentity>,
    retry_task: Option<ScheduledTask>,
    lookup_task: Option<ScheduledTask>,
    ticks: mpsc::UnboundedSender<SupervisorTick>,
    directory: watch::Sender<Directory>,
}

impl RegistrationSupervisor {
    pub fn new(
        role: ClientRole,
        config: &EngineConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorTick>) {
        let (ticks, tick_rx) = mpsc::unbounded_channel();
        let (directory, _) = watch::channel(Directory::default());
        let supervisor = Self {
            role,
            config: config.clone(),
            ready: false,
            pending_name: None,
            awaiting_response: false,
            identity: None,
            retry_task: None,
            lookup_task: None,
            ticks,
            directory,
        };
        (supervisor, tick_rx)
    }

    pub fn role(&self) -> ClientRole {
        self.role
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Marks the local side as ready; a pending registration goes out on the next retry tick.
    pub fn set_ready(&mut self, ready: bool) {
        if self.ready != ready {
            debug!(ready, "ready flag changed");
        }
        self.ready = ready;
    }

    pub fn subscribe_directory(&self) -> watch::Receiver<Directory> {
        self.directory.subscribe()
    }

    /// Starts registering under `name`.
    ///
    /// Returns the `registerReq` when the local side is ready, otherwise arms the
    /// retry task and returns nothing.
    pub fn register(&mut self, name: &str) -> Result<Option<NegotiationMessage>> {
        if self.identity.is_some() {
            return Err(Error::validation("already registered"));
        }
        if self.pending_name.is_some() {
            return Err(Error::validation("registration already in progress"));
        }
        let Some(name) = non_blank(name) else {
            return Err(Error::validation("client name is empty"));
        };
        self.pending_name = Some(name.to_string());

        if self.ready {
            return Ok(Some(self.request()));
        }

        info!(name, "not ready yet, registration deferred");
        let ticks = self.ticks.clone();
        self.retry_task = Some(ScheduledTask::every(
            "register-retry",
            self.config.register_retry,
            move || ticks.send(SupervisorTick::RegisterRetry).is_ok(),
        ));
        Ok(None)
    }

    /// Handles one tick from the supervisor's tasks.
    pub fn on_tick(&mut self, tick: SupervisorTick) -> Option<NegotiationMessage> {
        match tick {
            SupervisorTick::RegisterRetry => {
                if !self.ready || self.awaiting_response || self.pending_name.is_none() {
                    return None;
                }
                self.retry_task = None;
                Some(self.request())
            }
            SupervisorTick::Lookup => self.identity.is_some().then_some(NegotiationMessage::LookupReq),
        }
    }

    fn request(&mut self) -> NegotiationMessage {
        self.awaiting_response = true;
        let client_name = self.pending_name.clone().unwrap_or_default();
        debug!(name = %client_name, "sending registerReq");
        NegotiationMessage::RegisterReq(RegisterRequest { client_name })
    }

    /// Validates a `registerRes`.
    ///
    /// `Ok(None)` means the response was unsolicited and ignored. A failed
    /// validation abandons the registration for good.
    pub fn on_register_res(&mut self, res: RegisterResponse) -> Result<Option<ClientIdentity>> {
        if !self.awaiting_response {
            warn!(client_id = %res.client_id, "ignoring unsolicited registerRes");
            return Ok(None);
        }
        self.awaiting_response = false;
        self.pending_name = None;
        self.retry_task = None;

        if let Some(err) = error_text(&res.error) {
            return Err(Error::validation(format!("relay refused registration: {err}")));
        }
        if res.client_id.is_empty() {
            return Err(Error::validation("registerRes carries no ClientId"));
        }
        if res.client_type != self.role.as_str() {
            return Err(Error::validation(format!(
                "registered as {:?}, expected {}",
                res.client_type, self.role
            )));
        }

        let identity = ClientIdentity {
            id: res.client_id,
            role: self.role,
        };
        info!(client_id = %identity.id, role = %identity.role, "registered");
        self.identity = Some(identity.clone());

        if self.role.browses_directory() {
            let ticks = self.ticks.clone();
            self.lookup_task = Some(ScheduledTask::every(
                "lookup",
                self.config.lookup_interval,
                move || ticks.send(SupervisorTick::Lookup).is_ok(),
            ));
        }
        Ok(Some(identity))
    }

    /// Replaces the published directory with the relay's lists.
    pub fn on_lookup_res(&mut self, res: LookupResponse) {
        if let Some(err) = error_text(&res.error) {
            warn!(error = err, "lookup failed on the relay");
            return;
        }
        let directory = Directory::from(res);
        debug!(
            controllers = directory.controllers.len(),
            resources = directory.resources.len(),
            "directory refreshed"
        );
        self.directory.send_replace(directory);
    }

    pub fn cancel_all(&mut self) {
        self.retry_task = None;
        self.lookup_task = None;
    }

    pub fn active_timers(&self) -> usize {
        count_active([&self.retry_task, &self.lookup_task])
    }
}
