//! Duplex message channel to the relay.
//!
//! A [`ChannelAdapter`] owns one connection: a writer task fed through a bounded
//! outbox, a reader task feeding an inbox, and the keepalive that pings the relay
//! while the channel is open. The same adapter runs over a WebSocket or over an
//! in-memory loopback used by tests and embedders.

use std::marker::PhantomData;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use padlink_common::{Envelope, Error, Result};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::timer::ScheduledTask;

pub const SIGNALING_SUBPROTOCOL: &str = "signaling";
pub const RELAY_SUBPROTOCOL: &str = "relay";

const OUTBOX_CAPACITY: usize = 64;
const INBOX_CAPACITY: usize = 64;

/// Outgoing frame handed to the writer.
#[derive(Debug)]
enum Frame {
    Text(String),
    Close,
}

/// What the reader hands back.
#[derive(Debug)]
enum Inbound {
    Text(String),
    Closed(String),
}

/// Result of [`ChannelAdapter::recv`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent<M> {
    Message(M),
    /// Remote close or transport error. Reported once.
    Closed { reason: String },
}

pub struct ChannelAdapter<M: Envelope> {
    label: String,
    outbox: Option<mpsc::Sender<Frame>>,
    inbox: mpsc::Receiver<Inbound>,
    keepalive: Option<ScheduledTask>,
    closed: bool,
    _message: PhantomData<fn() -> M>,
}

impl<M: Envelope> std::fmt::Debug for ChannelAdapter<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelAdapter")
            .field("label", &self.label)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<M: Envelope> ChannelAdapter<M> {
    /// Opens a WebSocket to `url`, offering `subprotocol`.
    pub async fn connect(url: &str, subprotocol: &str, keepalive: Duration) -> Result<Self> {
        let parsed =
            Url::parse(url).map_err(|e| Error::config(format!("invalid relay url {url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "relay url must use ws:// or wss://, got {}",
                parsed.scheme()
            )));
        }

        let mut request = parsed
            .as_str()
            .into_client_request()
            .map_err(|e| Error::channel(format!("bad websocket request: {e}")))?;
        let protocol = HeaderValue::from_str(subprotocol)
            .map_err(|e| Error::config(format!("invalid subprotocol {subprotocol}: {e}")))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", protocol);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| Error::channel(format!("connect to {url} failed: {e}")))?;
        info!(channel = subprotocol, %url, "channel connected");

        let (mut sink, mut stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOX_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Inbound>(INBOX_CAPACITY);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame {
                    Frame::Text(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Frame::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let reason = loop {
                let Some(item) = stream.next().await else {
                    break "stream ended".to_string();
                };
                match item {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(Inbound::Text(text.as_str().to_owned())).await.is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        break frame
                            .map(|f| format!("closed by relay ({})", f.reason.as_str()))
                            .unwrap_or_else(|| "closed by relay".to_string());
                    }
                    Ok(Message::Binary(_)) => {
                        debug!("ignoring binary frame");
                    }
                    Ok(_) => continue,
                    Err(err) => break err.to_string(),
                }
            };
            let _ = in_tx.send(Inbound::Closed(reason)).await;
        });

        Ok(Self::from_parts(subprotocol, out_tx, in_rx, keepalive))
    }

    /// An adapter wired to an in-memory peer instead of a socket.
    pub fn loopback(label: &str, keepalive: Duration) -> (Self, LoopbackPeer<M>) {
        let (out_tx, out_rx) = mpsc::channel::<Frame>(OUTBOX_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Inbound>(INBOX_CAPACITY);
        let adapter = Self::from_parts(label, out_tx, in_rx, keepalive);
        let peer = LoopbackPeer {
            sent: out_rx,
            inject: in_tx,
            saw_close: false,
            _message: PhantomData,
        };
        (adapter, peer)
    }

    fn from_parts(
        label: &str,
        outbox: mpsc::Sender<Frame>,
        inbox: mpsc::Receiver<Inbound>,
        keepalive: Duration,
    ) -> Self {
        let keepalive = (!keepalive.is_zero()).then(|| {
            let outbox = outbox.clone();
            ScheduledTask::every("keepalive", keepalive, move || match M::ping().encode() {
                Ok(text) => !matches!(outbox.try_send(Frame::Text(text)), Err(TrySendError::Closed(_))),
                Err(_) => false,
            })
        });
        Self {
            label: label.to_string(),
            outbox: Some(outbox),
            inbox,
            keepalive,
            closed: false,
            _message: PhantomData,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Queues a message for the writer. Never waits; a full outbox is an error.
    pub fn send(&self, msg: &M) -> Result<()> {
        if self.offer(msg)? {
            Ok(())
        } else {
            Err(Error::channel(format!("{} outbox is full", self.label)))
        }
    }

    /// Like [`send`](Self::send), but a full outbox drops the message and
    /// returns `Ok(false)`. A closed channel is still an error.
    pub fn offer(&self, msg: &M) -> Result<bool> {
        let outbox = match (&self.outbox, self.closed) {
            (Some(outbox), false) => outbox,
            _ => {
                return Err(Error::channel(format!("{} channel is not open", self.label)));
            }
        };
        let text = msg.encode()?;
        match outbox.try_send(Frame::Text(text)) {
            Ok(()) => {
                trace!(channel = %self.label, kind = msg.kind(), "queued");
                Ok(true)
            }
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => {
                Err(Error::channel(format!("{} writer has stopped", self.label)))
            }
        }
    }

    /// Next meaningful inbound event.
    ///
    /// Pings, unknown kinds and undecodable frames are consumed here. Once the
    /// channel has closed this never resolves, so it can sit in a `select!`.
    pub async fn recv(&mut self) -> ChannelEvent<M> {
        if self.closed {
            return std::future::pending().await;
        }
        loop {
            let Some(inbound) = self.inbox.recv().await else {
                return self.remote_closed("reader stopped".to_string());
            };
            let text = match inbound {
                Inbound::Text(text) => text,
                Inbound::Closed(reason) => return self.remote_closed(reason),
            };
            match M::decode(&text) {
                Ok(msg) if msg.is_ping() => trace!(channel = %self.label, "ping"),
                Ok(msg) if msg.is_unknown() => {
                    debug!(channel = %self.label, "ignoring message of unknown kind");
                }
                Ok(msg) => return ChannelEvent::Message(msg),
                Err(err) => {
                    warn!(channel = %self.label, error = %err, "dropping undecodable frame");
                }
            }
        }
    }

    /// Stops the keepalive and sends a close frame. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.keepalive = None;
        if let Some(outbox) = self.outbox.take() {
            let _ = outbox.try_send(Frame::Close);
        }
        debug!(channel = %self.label, "channel closed locally");
    }

    /// Live scheduled tasks owned by this adapter.
    pub fn active_timers(&self) -> usize {
        crate::timer::count_active([&self.keepalive])
    }

    fn remote_closed(&mut self, reason: String) -> ChannelEvent<M> {
        // keepalive goes first so nothing is queued after the close is reported
        self.keepalive = None;
        self.outbox = None;
        self.closed = true;
        info!(channel = %self.label, %reason, "channel closed by remote");
        ChannelEvent::Closed { reason }
    }
}

/// The relay's end of a loopback adapter.
pub struct LoopbackPeer<M: Envelope> {
    sent: mpsc::Receiver<Frame>,
    inject: mpsc::Sender<Inbound>,
    saw_close: bool,
    _message: PhantomData<fn() -> M>,
}

impl<M: Envelope> LoopbackPeer<M> {
    /// Delivers a message to the adapter.
    pub async fn send(&self, msg: &M) -> Result<()> {
        self.send_raw(&msg.encode()?).await
    }

    /// Delivers raw text, valid or not.
    pub async fn send_raw(&self, text: &str) -> Result<()> {
        self.inject
            .send(Inbound::Text(text.to_string()))
            .await
            .map_err(|_| Error::channel("adapter dropped"))
    }

    /// Simulates the relay closing the connection.
    pub async fn close(&self, reason: &str) -> Result<()> {
        self.inject
            .send(Inbound::Closed(reason.to_string()))
            .await
            .map_err(|_| Error::channel("adapter dropped"))
    }

    /// Next message the adapter sent, keepalive pings included.
    ///
    /// `None` once the adapter sent its close frame or went away.
    pub async fn recv_frame(&mut self) -> Option<M> {
        if self.saw_close {
            return None;
        }
        loop {
            match self.sent.recv().await? {
                Frame::Text(text) => match M::decode(&text) {
                    Ok(msg) => return Some(msg),
                    Err(err) => warn!(error = %err, "adapter sent undecodable text"),
                },
                Frame::Close => {
                    self.saw_close = true;
                    return None;
                }
            }
        }
    }

    /// Next non-ping message the adapter sent.
    pub async fn recv(&mut self) -> Option<M> {
        loop {
            let msg = self.recv_frame().await?;
            if !msg.is_ping() {
                return Some(msg);
            }
        }
    }

    /// Non-ping messages already queued, without waiting.
    pub fn drain(&mut self) -> Vec<M> {
        let mut out = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            match frame {
                Frame::Text(text) => {
                    if let Ok(msg) = M::decode(&text) {
                        if !msg.is_ping() {
                            out.push(msg);
                        }
                    }
                }
                Frame::Close => self.saw_close = true,
            }
        }
        out
    }

    /// Whether a close frame has been observed by `recv_frame` or `drain`.
    pub fn saw_close(&self) -> bool {
        self.saw_close
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use padlink_common::{NegotiationMessage, RegisterRequest};

    fn register(name: &str) -> NegotiationMessage {
        NegotiationMessage::RegisterReq(RegisterRequest {
            client_name: name.into(),
        })
    }

    #[tokio::test]
    async fn send_reaches_the_peer() {
        let (adapter, mut peer) =
            ChannelAdapter::<NegotiationMessage>::loopback("signaling", Duration::ZERO);
        adapter.send(&register("alice")).unwrap();
        assert_eq!(peer.recv().await, Some(register("alice")));
    }

    #[tokio::test]
    async fn recv_skips_pings_unknown_and_garbage() {
        let (mut adapter, peer) =
            ChannelAdapter::<NegotiationMessage>::loopback("signaling", Duration::ZERO);
        peer.send(&NegotiationMessage::Ping).await.unwrap();
        peer.send_raw(r#"{"MsgType":"gpHello"}"#).await.unwrap();
        peer.send_raw("{not json").await.unwrap();
        peer.send(&register("bob")).await.unwrap();

        assert_eq!(adapter.recv().await, ChannelEvent::Message(register("bob")));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_until_closed() {
        let (mut adapter, mut peer) =
            ChannelAdapter::<NegotiationMessage>::loopback("signaling", Duration::from_secs(10));
        assert_eq!(adapter.active_timers(), 1);

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(peer.recv_frame().await, Some(NegotiationMessage::Ping));
        assert_eq!(peer.recv_frame().await, Some(NegotiationMessage::Ping));

        adapter.close();
        assert_eq!(adapter.active_timers(), 0);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(peer.recv_frame().await, None);
        assert!(peer.saw_close());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_close_stops_keepalive_and_reports_once() {
        let (mut adapter, peer) =
            ChannelAdapter::<NegotiationMessage>::loopback("relay", Duration::from_secs(10));
        peer.close("gone").await.unwrap();

        assert_eq!(
            adapter.recv().await,
            ChannelEvent::Closed {
                reason: "gone".into()
            }
        );
        assert_eq!(adapter.active_timers(), 0);
        assert!(!adapter.is_open());

        let again = tokio::time::timeout(Duration::from_secs(1), adapter.recv()).await;
        assert!(again.is_err(), "closed adapter must stay silent");
    }

    #[tokio::test]
    async fn send_after_close_is_a_channel_error() {
        let (mut adapter, _peer) =
            ChannelAdapter::<NegotiationMessage>::loopback("signaling", Duration::ZERO);
        adapter.close();
        adapter.close();
        let err = adapter.send(&register("late")).unwrap_err();
        assert_eq!(err.kind(), "channel");
    }

    #[tokio::test]
    async fn offer_drops_on_a_full_outbox_but_fails_when_closed() {
        let (adapter, mut peer) =
            ChannelAdapter::<NegotiationMessage>::loopback("relay", Duration::ZERO);
        for _ in 0..OUTBOX_CAPACITY {
            assert!(adapter.offer(&register("fill")).unwrap());
        }
        assert!(!adapter.offer(&register("overflow")).unwrap());
        assert_eq!(adapter.send(&register("overflow")).unwrap_err().kind(), "channel");

        // room again once the writer catches up
        assert_eq!(peer.recv().await, Some(register("fill")));
        assert!(adapter.offer(&register("late")).unwrap());

        drop(peer);
        assert!(adapter.offer(&register("gone")).is_err());
    }

    #[tokio::test]
    async fn connect_rejects_non_websocket_urls() {
        let err = ChannelAdapter::<NegotiationMessage>::connect(
            "http://relay.example",
            SIGNALING_SUBPROTOCOL,
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "config");
    }
}
