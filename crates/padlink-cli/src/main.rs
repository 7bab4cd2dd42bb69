//! Padlink CLI tools: registration checks, directory browsing, message decoding.

#![forbid(unsafe_code)]

use std::io::Read;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use padlink_client::{
    ChannelAdapter, ChannelEvent, Directory, EngineConfig, RegistrationSupervisor,
    SupervisorTick, SIGNALING_SUBPROTOCOL,
};
use padlink_common::helpers::non_blank;
use padlink_common::{
    error_text, ClientIdentity, ClientRole, Envelope, NegotiationMessage, RelayMessage,
    SessionTriple,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "padlink")]
#[command(about = "Padlink CLI tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register with a relay and print the assigned identity
    Register {
        /// Relay signaling URL (ws:// or wss://)
        #[arg(short, long, env = "PADLINK_RELAY_URL")]
        relay: String,

        /// Display name sent in registerReq
        #[arg(short, long)]
        name: String,

        /// Role to register as (Source or Controller)
        #[arg(long, default_value = "Controller")]
        role: ClientRole,
    },

    /// Register as a source and print the relay's directory
    Lookup {
        /// Relay signaling URL (ws:// or wss://)
        #[arg(short, long, env = "PADLINK_RELAY_URL")]
        relay: String,

        /// Display name sent in registerReq
        #[arg(short, long, default_value = "padlink-cli")]
        name: String,

        /// Directory rounds to print before exiting
        #[arg(long, default_value_t = 1)]
        rounds: u32,
    },

    /// Decode captured messages, one JSON object per line
    Decode {
        /// Input file; stdin when omitted
        #[arg(short, long)]
        file: Option<String>,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    padlink_common::init_tracing();

    let args = Args::parse();
    let config = EngineConfig::from_env();

    match args.command {
        Command::Register { relay, name, role } => {
            let session = Registered::connect(&relay, &name, role, &config).await?;
            println!("Client ID:   {}", session.identity.id);
            println!("Client type: {}", session.identity.role);
        }
        Command::Lookup {
            relay,
            name,
            rounds,
        } => {
            let mut session = Registered::connect(&relay, &name, ClientRole::Source, &config).await?;
            for round in 1..=rounds.max(1) {
                let directory = session.next_directory().await?;
                println!("-- round {round}");
                print_directory(&directory);
            }
            session.channel.close();
        }
        Command::Decode { file } => {
            let input = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {path}"))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            for (index, line) in input.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                println!("{:>4}: {}", index + 1, describe(line));
            }
        }
        Command::Version => {
            println!("padlink {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

/// A signaling channel with an identity assigned by the relay.
struct Registered {
    channel: ChannelAdapter<NegotiationMessage>,
    supervisor: RegistrationSupervisor,
    ticks: mpsc::UnboundedReceiver<SupervisorTick>,
    identity: ClientIdentity,
}

impl Registered {
    async fn connect(
        relay: &str,
        name: &str,
        role: ClientRole,
        config: &EngineConfig,
    ) -> Result<Self> {
        let mut channel = ChannelAdapter::<NegotiationMessage>::connect(
            relay,
            SIGNALING_SUBPROTOCOL,
            config.keepalive,
        )
        .await?;
        let (mut supervisor, ticks) = RegistrationSupervisor::new(role, config);
        supervisor.set_ready(true);
        if let Some(request) = supervisor.register(name)? {
            channel.send(&request)?;
        }

        let identity = tokio::time::timeout(
            REGISTER_TIMEOUT,
            await_identity(&mut channel, &mut supervisor),
        )
        .await
        .context("relay did not answer registerReq")??;
        info!(client_id = %identity.id, "registered");

        Ok(Self {
            channel,
            supervisor,
            ticks,
            identity,
        })
    }

    /// Sends lookups on the supervisor's schedule until one comes back.
    async fn next_directory(&mut self) -> Result<Directory> {
        let mut directory = self.supervisor.subscribe_directory();
        loop {
            tokio::select! {
                Some(tick) = self.ticks.recv() => {
                    if let Some(msg) = self.supervisor.on_tick(tick) {
                        self.channel.send(&msg)?;
                    }
                }
                event = self.channel.recv() => match event {
                    ChannelEvent::Message(NegotiationMessage::LookupRes(res)) => {
                        if let Some(err) = error_text(&res.error) {
                            println!("lookup failed: {err}");
                        }
                        self.supervisor.on_lookup_res(res);
                        if directory.has_changed()? {
                            return Ok(directory.borrow_and_update().clone());
                        }
                    }
                    ChannelEvent::Message(other) => debug!(kind = other.kind(), "ignored"),
                    ChannelEvent::Closed { reason } => bail!("relay closed the channel: {reason}"),
                },
                _ = tokio::signal::ctrl_c() => bail!("interrupted"),
            }
        }
    }
}

async fn await_identity(
    channel: &mut ChannelAdapter<NegotiationMessage>,
    supervisor: &mut RegistrationSupervisor,
) -> Result<ClientIdentity> {
    loop {
        match channel.recv().await {
            ChannelEvent::Message(NegotiationMessage::RegisterRes(res)) => {
                if let Some(identity) = supervisor.on_register_res(res)? {
                    return Ok(identity);
                }
            }
            ChannelEvent::Message(other) => {
                debug!(kind = other.kind(), "ignored while registering");
            }
            ChannelEvent::Closed { reason } => bail!("relay closed the channel: {reason}"),
        }
    }
}

fn print_directory(directory: &Directory) {
    println!("Controllers ({}):", directory.controllers.len());
    for entry in &directory.controllers {
        println!("  {:<24} {}", entry.name, entry.id);
    }
    println!("Resources ({}):", directory.resources.len());
    for entry in &directory.resources {
        println!("  {:<24} {}", entry.name, entry.id);
    }
}

/// One-line summary of a captured frame from either channel.
fn describe(line: &str) -> String {
    let msg = match NegotiationMessage::decode(line) {
        Ok(NegotiationMessage::Unknown) => return describe_relay(line),
        Ok(msg) => msg,
        Err(err) => return format!("undecodable: {err}"),
    };
    let kind = msg.kind();
    match msg {
        NegotiationMessage::RegisterReq(req) if non_blank(&req.client_name).is_none() => {
            format!("{kind} invalid: empty ClientName")
        }
        NegotiationMessage::RegisterReq(req) => format!("{kind} name={:?}", req.client_name),
        NegotiationMessage::RegisterRes(res) => match error_text(&res.error) {
            Some(err) => format!("{kind} error={err:?}"),
            None if res.client_id.is_empty() => format!("{kind} invalid: empty ClientId"),
            None => format!("{kind} id={} type={}", res.client_id, res.client_type),
        },
        NegotiationMessage::LookupRes(res) => format!(
            "{kind} controllers={} resources={}",
            res.controllers.len(),
            res.resources.len()
        ),
        NegotiationMessage::OfferReq(req) | NegotiationMessage::AnswerReq(req) => {
            match req.missing_field() {
                Some(field) => format!("{kind} invalid: missing {field}"),
                None => format!("{kind} {} from {:?} sdp={}B", req.triple, req.name, req.sdp.len()),
            }
        }
        NegotiationMessage::OfferRes(res)
        | NegotiationMessage::AnswerRes(res)
        | NegotiationMessage::LinkRes(res) => session_line(kind, &res.triple, &res.error),
        NegotiationMessage::LinkReq(req) => session_line(kind, &req.triple, &None),
        NegotiationMessage::OfferServerError(notice)
        | NegotiationMessage::AnswerServerError(notice) => format!(
            "{kind} error={:?}",
            error_text(&notice.error).unwrap_or("unspecified")
        ),
        NegotiationMessage::Ping | NegotiationMessage::LookupReq | NegotiationMessage::Unknown => {
            kind.to_string()
        }
    }
}

fn describe_relay(line: &str) -> String {
    let msg = match RelayMessage::decode(line) {
        Ok(msg) => msg,
        Err(err) => return format!("undecodable: {err}"),
    };
    let kind = msg.kind();
    match msg {
        RelayMessage::RelayState(state) => format!(
            "{} buttons={} axes={}",
            session_line(kind, &state.triple, &state.error),
            state.buttons.len(),
            state.axes.len()
        ),
        RelayMessage::RelayStateRes(ack) => match error_text(&ack.error) {
            Some(err) => format!("{kind} error={err:?}"),
            None => kind.to_string(),
        },
        RelayMessage::RelayFeedback(notice) => format!(
            "{} duration={}ms strong={} weak={}",
            session_line(kind, &notice.triple, &None),
            notice.command.duration,
            notice.command.strong_magnitude,
            notice.command.weak_magnitude
        ),
        RelayMessage::Ping => kind.to_string(),
        RelayMessage::Unknown => "unknown message kind".to_string(),
    }
}

fn session_line(kind: &str, triple: &SessionTriple, error: &Option<String>) -> String {
    let mut line = match triple.missing_field() {
        Some(field) if !triple.is_empty() => format!("{kind} incomplete session, missing {field}"),
        _ => format!("{kind} {triple}"),
    };
    if let Some(err) = error_text(error) {
        line.push_str(&format!(" error={err:?}"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_negotiation_frames() {
        assert_eq!(
            describe(r#"{"MsgType":"offerRes","SourceId":"S1","PeerId":"C1","ResourceId":"G1","Error":"rejected"}"#),
            r#"offerRes S1/C1/G1 error="rejected""#
        );
        assert_eq!(
            describe(r#"{"MsgType":"linkReq","SourceId":"S1","PeerId":"","ResourceId":"G1"}"#),
            "linkReq incomplete session, missing PeerId"
        );
        assert_eq!(
            describe(r#"{"MsgType":"registerReq","ClientName":"  "}"#),
            "registerReq invalid: empty ClientName"
        );
    }

    #[test]
    fn falls_back_to_relay_frames() {
        let line = describe(
            r#"{"MsgType":"relayState","SourceId":"S1","PeerId":"C1","ResourceId":"G1","Buttons":[],"Axes":[0.5,0.0]}"#,
        );
        assert_eq!(line, "relayState S1/C1/G1 buttons=0 axes=2");
        assert_eq!(describe(r#"{"MsgType":"gpHello"}"#), "unknown message kind");
        assert!(describe("not json").starts_with("undecodable"));
    }
}
