//! Transport seam between the SSH adapter and the connection handler.
//!
//! The adapter owns the secure channel; the core only sees typed events:
//! global requests, channel opens and in-channel requests, each carrying a
//! one-shot for the reply. Raw payloads stay in SSH wire encoding so the core
//! decodes them with [`crate::wire`].

use crate::error::TunnelResult;
use crate::session::{Role, SessionId};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

/// Queue depth for every per-session event channel.
pub const EVENT_QUEUE_DEPTH: usize = 32;

/// A duplex byte stream: an accepted TCP socket or a multiplexed channel.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Reply to a global or in-channel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Success(Vec<u8>),
    Failure(Vec<u8>),
}

impl Reply {
    pub fn success() -> Self {
        Reply::Success(Vec::new())
    }

    pub fn failure() -> Self {
        Reply::Failure(Vec::new())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Success(_))
    }
}

/// A session-scoped request exchanged outside any channel.
#[derive(Debug)]
pub struct GlobalRequest {
    pub kind: String,
    pub payload: Vec<u8>,
    reply_tx: oneshot::Sender<Reply>,
}

impl GlobalRequest {
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> (Self, oneshot::Receiver<Reply>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let req = Self {
            kind: kind.into(),
            payload,
            reply_tx,
        };
        (req, reply_rx)
    }

    /// Hand the reply to the transport. Returns `false` if the transport
    /// stopped waiting for it.
    pub fn reply(self, reply: Reply) -> bool {
        self.reply_tx.send(reply).is_ok()
    }
}

/// A request addressed to one accepted channel (`shell`, `exec`, `pty-req`...).
#[derive(Debug)]
pub struct ChannelRequest {
    pub kind: String,
    reply_tx: oneshot::Sender<Reply>,
}

impl ChannelRequest {
    pub fn new(kind: impl Into<String>) -> (Self, oneshot::Receiver<Reply>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let req = Self {
            kind: kind.into(),
            reply_tx,
        };
        (req, reply_rx)
    }

    pub fn reply(self, reply: Reply) -> bool {
        self.reply_tx.send(reply).is_ok()
    }
}

/// SSH channel-open failure reason codes (RFC 4254 section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    ConnectFailed = 2,
    UnknownChannelType = 3,
}

/// Outcome of a channel open, sent back to the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenDecision {
    Accept,
    Reject {
        reason: RejectReason,
        message: String,
    },
}

/// A channel the core accepted: its byte stream plus in-channel requests.
pub struct AcceptedChannel {
    pub stream: BoxedStream,
    pub requests: mpsc::Receiver<ChannelRequest>,
}

/// A peer-initiated channel waiting for the core to accept or reject it.
pub struct ChannelOpen {
    pub kind: String,
    pub extra_data: Vec<u8>,
    stream: BoxedStream,
    requests: mpsc::Receiver<ChannelRequest>,
    decision_tx: oneshot::Sender<OpenDecision>,
}

impl ChannelOpen {
    pub fn new(
        kind: impl Into<String>,
        extra_data: Vec<u8>,
        stream: BoxedStream,
        requests: mpsc::Receiver<ChannelRequest>,
    ) -> (Self, oneshot::Receiver<OpenDecision>) {
        let (decision_tx, decision_rx) = oneshot::channel();
        let open = Self {
            kind: kind.into(),
            extra_data,
            stream,
            requests,
            decision_tx,
        };
        (open, decision_rx)
    }

    /// Confirm the channel. `None` if the transport already gave up on it.
    pub fn accept(self) -> Option<AcceptedChannel> {
        self.decision_tx.send(OpenDecision::Accept).ok()?;
        Some(AcceptedChannel {
            stream: self.stream,
            requests: self.requests,
        })
    }

    pub fn reject(self, reason: RejectReason, message: &str) {
        let _ = self.decision_tx.send(OpenDecision::Reject {
            reason,
            message: message.to_string(),
        });
    }
}

/// Opens core-initiated channels (`forwarded-tcpip`) on the owning session.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open_channel(&self, kind: &str, extra_data: Vec<u8>) -> TunnelResult<BoxedStream>;
}

/// Everything the connection handler consumes for one session.
pub struct SessionTransport {
    pub session_id: SessionId,
    pub peer: SocketAddr,
    pub authenticated: oneshot::Receiver<Role>,
    pub global_requests: mpsc::Receiver<GlobalRequest>,
    pub channel_opens: mpsc::Receiver<ChannelOpen>,
    pub opener: Arc<dyn ChannelOpener>,
}

/// Adapter-side halves of a [`SessionTransport`].
///
/// Dropping the senders is how the adapter tells the handler the connection
/// is gone.
pub struct TransportSender {
    pub authenticated: Option<oneshot::Sender<Role>>,
    pub global_requests: mpsc::Sender<GlobalRequest>,
    pub channel_opens: mpsc::Sender<ChannelOpen>,
}

/// Receiver halves waiting for the adapter's [`ChannelOpener`].
pub struct PendingTransport {
    session_id: SessionId,
    peer: SocketAddr,
    authenticated: oneshot::Receiver<Role>,
    global_requests: mpsc::Receiver<GlobalRequest>,
    channel_opens: mpsc::Receiver<ChannelOpen>,
}

impl PendingTransport {
    /// Attach the opener once the adapter has a handle to the live session.
    pub fn with_opener(self, opener: Arc<dyn ChannelOpener>) -> SessionTransport {
        SessionTransport {
            session_id: self.session_id,
            peer: self.peer,
            authenticated: self.authenticated,
            global_requests: self.global_requests,
            channel_opens: self.channel_opens,
            opener,
        }
    }
}

/// Create the event channels for one session.
pub fn session_channels(session_id: SessionId, peer: SocketAddr) -> (TransportSender, PendingTransport) {
    let (auth_tx, auth_rx) = oneshot::channel();
    let (global_tx, global_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (open_tx, open_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    (
        TransportSender {
            authenticated: Some(auth_tx),
            global_requests: global_tx,
            channel_opens: open_tx,
        },
        PendingTransport {
            session_id,
            peer,
            authenticated: auth_rx,
            global_requests: global_rx,
            channel_opens: open_rx,
        },
    )
}

impl TransportSender {
    /// Announce the authenticated role. Only the first call has an effect.
    pub fn notify_authenticated(&mut self, role: Role) {
        if let Some(tx) = self.authenticated.take() {
            let _ = tx.send(role);
        }
    }
}
