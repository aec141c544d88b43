//! Per-session connection handler.
//!
//! Drives one authenticated session: answers global requests (reverse
//! forwards, token retrieval, keepalives) and peer-initiated channel opens
//! (`direct-tcpip` relays, refused `session` channels). When the transport
//! goes away, every route the session owns is released and an agent's token
//! is revoked.

use crate::dial::Dialer;
use crate::pipe::splice;
use crate::routes::RouteManager;
use crate::session::{Role, SessionId};
use crate::token::TokenBroker;
use crate::transport::{
    AcceptedChannel, ChannelOpen, ChannelOpener, ChannelRequest, GlobalRequest, RejectReason,
    Reply, SessionTransport,
};
use crate::wire::{ForwardRequest, ForwardResponse, OriginInfo, TokenResponse, WireMessage};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Written to every `session` channel before its requests are refused.
pub const BANNER: &str = "sshtun: this host only relays TCP forwards.\r\n";

/// Prefix of the token line an agent's `session` channel receives.
pub const TOKEN_PREFIX: &str = "session token: ";

/// Failure text returned for every request on a `session` channel.
pub const REFUSAL: &str = "shell and command execution are disabled; connect with `ssh -N`\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GlobalKind {
    TcpipForward,
    CancelTcpipForward,
    SessionToken,
    /// Answered with success here. The SSH adapter never sees these: russh
    /// replies to unrecognised global requests itself with
    /// `SSH_MSG_REQUEST_FAILURE`, which OpenSSH clients also take as proof of
    /// life.
    Keepalive,
    Other,
}

impl GlobalKind {
    fn parse(kind: &str) -> Self {
        match kind {
            "tcpip-forward" => GlobalKind::TcpipForward,
            "cancel-tcpip-forward" => GlobalKind::CancelTcpipForward,
            "session-token" => GlobalKind::SessionToken,
            k if k.contains("keepalive") => GlobalKind::Keepalive,
            _ => GlobalKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelKind {
    DirectTcpip,
    Session,
    Unknown,
}

impl ChannelKind {
    fn parse(kind: &str) -> Self {
        match kind {
            "direct-tcpip" => ChannelKind::DirectTcpip,
            "session" => ChannelKind::Session,
            _ => ChannelKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Handshaking,
    Authenticated,
    Active,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Handshaking => "handshaking",
            SessionState::Authenticated => "authenticated",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What a finished session did, for logging by the acceptor.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub peer: SocketAddr,
    /// `None` if the connection ended before authenticating.
    pub role: Option<Role>,
    pub routes_released: usize,
}

/// Shared per-host state every session handler works against.
#[derive(Clone)]
pub struct ConnectionHandler {
    routes: Arc<RouteManager>,
    broker: Arc<TokenBroker>,
    dialer: Dialer,
}

impl ConnectionHandler {
    pub fn new(routes: Arc<RouteManager>, broker: Arc<TokenBroker>, dialer: Dialer) -> Self {
        Self {
            routes,
            broker,
            dialer,
        }
    }

    pub fn routes(&self) -> &Arc<RouteManager> {
        &self.routes
    }

    /// Serve one session until its transport closes.
    pub async fn run(&self, transport: SessionTransport) -> SessionSummary {
        let SessionTransport {
            session_id,
            peer,
            authenticated,
            global_requests,
            mut channel_opens,
            opener,
        } = transport;

        let mut state = SessionState::Handshaking;
        debug!(session_id = %session_id, peer = %peer, state = %state, "session started");

        let role = match authenticated.await {
            Ok(role) => role,
            Err(_) => {
                state = SessionState::Closed;
                debug!(session_id = %session_id, state = %state, "connection ended before authentication");
                return SessionSummary {
                    session_id,
                    peer,
                    role: None,
                    routes_released: 0,
                };
            }
        };
        state = SessionState::Authenticated;
        info!(session_id = %session_id, peer = %peer, role = %role, state = %state, "session authenticated");

        let globals = tokio::spawn(self.clone().serve_globals(
            session_id.clone(),
            role,
            global_requests,
            opener,
        ));

        state = SessionState::Active;
        debug!(session_id = %session_id, state = %state, "serving requests");
        while let Some(open) = channel_opens.recv().await {
            self.dispatch_channel(&session_id, role, open);
        }

        if let Err(e) = globals.await {
            warn!(session_id = %session_id, error = %e, "global request task failed");
        }

        let routes_released = self.routes.release_session(&session_id).await;
        if role == Role::Agent {
            self.broker.revoke(&session_id).await;
        }

        state = SessionState::Closed;
        info!(
            session_id = %session_id,
            role = %role,
            routes_released,
            state = %state,
            "session closed"
        );

        SessionSummary {
            session_id,
            peer,
            role: Some(role),
            routes_released,
        }
    }

    async fn serve_globals(
        self,
        session: SessionId,
        role: Role,
        mut requests: mpsc::Receiver<GlobalRequest>,
        opener: Arc<dyn ChannelOpener>,
    ) {
        while let Some(req) = requests.recv().await {
            match GlobalKind::parse(&req.kind) {
                GlobalKind::TcpipForward => self.tcpip_forward(&session, role, &opener, req).await,
                GlobalKind::CancelTcpipForward => self.cancel_tcpip_forward(&session, req).await,
                GlobalKind::SessionToken => self.session_token(&session, role, req).await,
                GlobalKind::Keepalive => {
                    req.reply(Reply::success());
                }
                GlobalKind::Other => {
                    debug!(session_id = %session, kind = %req.kind, "unsupported global request");
                    req.reply(Reply::failure());
                }
            }
        }
    }

    async fn tcpip_forward(
        &self,
        session: &SessionId,
        role: Role,
        opener: &Arc<dyn ChannelOpener>,
        req: GlobalRequest,
    ) {
        if role != Role::Agent {
            warn!(session_id = %session, "tcpip-forward from client refused");
            req.reply(Reply::failure());
            return;
        }

        let fwd = match ForwardRequest::decode(&req.payload) {
            Ok(fwd) => fwd,
            Err(e) => {
                warn!(session_id = %session, error = %e, "bad tcpip-forward payload");
                req.reply(Reply::failure());
                return;
            }
        };

        let mut handle = match self
            .routes
            .request_route(session, &fwd.bind_ip, fwd.bind_port, opener.clone())
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    session_id = %session,
                    bind_ip = %fwd.bind_ip,
                    bind_port = fwd.bind_port,
                    error = %e,
                    "tcpip-forward refused"
                );
                req.reply(Reply::failure());
                return;
            }
        };

        let payload = ForwardResponse {
            bound_port: handle.bound_port() as u32,
        }
        .encode();
        if req.reply(Reply::Success(payload)) {
            self.routes.activate(&mut handle);
        } else {
            debug!(session_id = %session, "tcpip-forward reply undeliverable, releasing route");
            self.routes.release(&handle).await;
        }
    }

    async fn cancel_tcpip_forward(&self, session: &SessionId, req: GlobalRequest) {
        let fwd = match ForwardRequest::decode(&req.payload) {
            Ok(fwd) => fwd,
            Err(e) => {
                warn!(session_id = %session, error = %e, "bad cancel-tcpip-forward payload");
                req.reply(Reply::failure());
                return;
            }
        };

        let released = self
            .routes
            .release_bind(session, &fwd.bind_ip, fwd.bind_port)
            .await;
        req.reply(if released {
            Reply::success()
        } else {
            Reply::failure()
        });
    }

    async fn session_token(&self, session: &SessionId, role: Role, req: GlobalRequest) {
        let token = match role {
            Role::Agent => self.broker.token_for(session).await,
            Role::Client => None,
        };
        match token {
            Some(token) => {
                req.reply(Reply::Success(TokenResponse { token }.encode()));
            }
            None => {
                req.reply(Reply::failure());
            }
        }
    }

    fn dispatch_channel(&self, session: &SessionId, role: Role, open: ChannelOpen) {
        match ChannelKind::parse(&open.kind) {
            ChannelKind::DirectTcpip => self.direct_tcpip(session, open),
            ChannelKind::Session => {
                debug!(session_id = %session, role = %role, "session channel opened");
                if let Some(channel) = open.accept() {
                    let broker = self.broker.clone();
                    let session = session.clone();
                    tokio::spawn(async move {
                        let token = match role {
                            Role::Agent => broker.token_for(&session).await,
                            Role::Client => None,
                        };
                        refuse_session(session, token, channel).await;
                    });
                }
            }
            ChannelKind::Unknown => {
                debug!(session_id = %session, kind = %open.kind, "unknown channel type");
                open.reject(RejectReason::UnknownChannelType, "unknown channel type");
            }
        }
    }

    fn direct_tcpip(&self, session: &SessionId, open: ChannelOpen) {
        let target = match OriginInfo::decode(&open.extra_data) {
            Ok(target) => target,
            Err(e) => {
                warn!(session_id = %session, error = %e, "bad direct-tcpip payload");
                open.reject(RejectReason::ConnectFailed, "malformed direct-tcpip request");
                return;
            }
        };
        let Some(AcceptedChannel { stream, requests }) = open.accept() else {
            return;
        };

        let dialer = self.dialer.clone();
        let session = session.clone();
        tokio::spawn(async move {
            tokio::spawn(refuse_requests(requests, Reply::failure()));

            let tcp = match dialer.dial(&target.forward_ip, target.forward_port).await {
                Ok(tcp) => tcp,
                Err(e) => {
                    warn!(session_id = %session, error = %e, "direct-tcpip dial failed");
                    return;
                }
            };
            info!(
                session_id = %session,
                target_ip = %target.forward_ip,
                target_port = target.forward_port,
                origin_ip = %target.origin_ip,
                origin_port = target.origin_port,
                "direct-tcpip relay started"
            );

            match splice(stream, tcp).await {
                Ok(stats) => debug!(
                    session_id = %session,
                    to_target = stats.a_to_b,
                    from_target = stats.b_to_a,
                    "direct-tcpip relay closed"
                ),
                Err(e) => debug!(session_id = %session, error = %e, "direct-tcpip relay ended with error"),
            }
        });
    }
}

async fn refuse_requests(mut requests: mpsc::Receiver<ChannelRequest>, reply: Reply) {
    while let Some(req) = requests.recv().await {
        debug!(kind = %req.kind, "refusing channel request");
        req.reply(reply.clone());
    }
}

/// Agents also get their session token after the banner; stock SSH clients
/// have no way to send a `session-token` request.
async fn refuse_session(session: SessionId, token: Option<String>, channel: AcceptedChannel) {
    let AcceptedChannel {
        mut stream,
        requests,
    } = channel;

    let mut greeting = BANNER.to_string();
    if let Some(token) = token {
        greeting.push_str(&format!("{TOKEN_PREFIX}{token}\r\n"));
    }
    if let Err(e) = stream.write_all(greeting.as_bytes()).await {
        debug!(session_id = %session, error = %e, "banner write failed");
    }
    refuse_requests(requests, Reply::Failure(REFUSAL.as_bytes().to_vec())).await;

    let _ = stream.shutdown().await;
    debug!(session_id = %session, "session channel closed");
}
