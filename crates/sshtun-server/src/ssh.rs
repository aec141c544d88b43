//! russh adapter: turns SSH callbacks into transport events for the core.
//!
//! Every callback re-encodes its parsed arguments into the SSH wire records
//! the core decodes, forwards them through the session's [`TransportSender`]
//! and waits for the reply or open decision.

use async_trait::async_trait;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet};
use russh_keys::key::PublicKey;
use sshtun_core::transport::{
    BoxedStream, ChannelOpen, ChannelRequest, GlobalRequest, OpenDecision, Reply,
    EVENT_QUEUE_DEPTH,
};
use sshtun_core::wire::{ForwardRequest, ForwardResponse, OriginInfo, WireMessage};
use sshtun_core::{
    Authenticator, ChannelOpener, Role, SessionId, TransportSender, TunnelError, TunnelResult,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-connection russh handler.
pub struct SshSession {
    session_id: SessionId,
    peer: SocketAddr,
    auth: Arc<Authenticator>,
    sender: TransportSender,
    /// In-channel request queues of the channels the core accepted.
    channels: HashMap<ChannelId, mpsc::Sender<ChannelRequest>>,
}

impl SshSession {
    pub fn new(
        session_id: SessionId,
        peer: SocketAddr,
        auth: Arc<Authenticator>,
        sender: TransportSender,
    ) -> Self {
        Self {
            session_id,
            peer,
            auth,
            sender,
            channels: HashMap::new(),
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(MethodSet::PUBLICKEY | MethodSet::PASSWORD),
        }
    }

    async fn global(&self, kind: &str, payload: Vec<u8>) -> Reply {
        let (req, reply) = GlobalRequest::new(kind, payload);
        if self.sender.global_requests.send(req).await.is_err() {
            return Reply::failure();
        }
        reply.await.unwrap_or_else(|_| Reply::failure())
    }

    /// Offer a peer-initiated channel to the core.
    async fn offer_channel(
        &mut self,
        kind: &str,
        extra_data: Vec<u8>,
        channel: Channel<Msg>,
    ) -> Result<bool, russh::Error> {
        let id = channel.id();
        let (req_tx, req_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (open, decision) =
            ChannelOpen::new(kind, extra_data, Box::new(channel.into_stream()), req_rx);

        if self.sender.channel_opens.send(open).await.is_err() {
            return Ok(false);
        }
        match decision.await {
            Ok(OpenDecision::Accept) => {
                self.channels.insert(id, req_tx);
                Ok(true)
            }
            Ok(OpenDecision::Reject { reason, message }) => {
                debug!(
                    session_id = %self.session_id,
                    kind,
                    reason = reason as u32,
                    message = %message,
                    "channel open rejected"
                );
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }

    /// Forward an in-channel request and answer it on the wire.
    async fn channel_request(
        &mut self,
        channel: ChannelId,
        kind: &str,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        let reply = match self.channels.get(&channel) {
            Some(tx) => {
                let (req, reply) = ChannelRequest::new(kind);
                if tx.send(req).await.is_ok() {
                    reply.await.unwrap_or_else(|_| Reply::failure())
                } else {
                    Reply::failure()
                }
            }
            None => Reply::failure(),
        };

        match reply {
            Reply::Success(_) => {
                let _ = session.channel_success(channel);
            }
            Reply::Failure(message) => {
                if !message.is_empty() {
                    let _ = session.extended_data(channel, 1, CryptoVec::from_slice(&message));
                }
                let _ = session.channel_failure(channel);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for SshSession {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Self::reject())
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = format!("SHA256:{}", public_key.fingerprint());
        match self
            .auth
            .authenticate_agent(&self.session_id, user, &fingerprint)
            .await
        {
            Ok(_) => {
                self.sender.notify_authenticated(Role::Agent);
                Ok(Auth::Accept)
            }
            Err(_) => Ok(Self::reject()),
        }
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self
            .auth
            .authenticate_client(self.peer.ip(), user, password)
            .await
        {
            Ok(()) => {
                self.sender.notify_authenticated(Role::Client);
                Ok(Auth::Accept)
            }
            Err(_) => Ok(Self::reject()),
        }
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let payload = ForwardRequest {
            bind_ip: address.to_string(),
            bind_port: *port,
        }
        .encode();

        match self.global("tcpip-forward", payload).await {
            Reply::Success(body) => match ForwardResponse::decode(&body) {
                Ok(res) => {
                    *port = res.bound_port;
                    Ok(true)
                }
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "unreadable forward reply");
                    Ok(false)
                }
            },
            Reply::Failure(_) => Ok(false),
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let payload = ForwardRequest {
            bind_ip: address.to_string(),
            bind_port: port,
        }
        .encode();
        Ok(self
            .global("cancel-tcpip-forward", payload)
            .await
            .is_success())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.offer_channel("session", Vec::new(), channel).await
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let extra = OriginInfo {
            forward_ip: host_to_connect.to_string(),
            forward_port: port_to_connect,
            origin_ip: originator_address.to_string(),
            origin_port: originator_port,
        }
        .encode();
        self.offer_channel("direct-tcpip", extra, channel).await
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.offer_channel("x11", Vec::new(), channel).await
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channel_request(channel, "pty-req", session).await
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channel_request(channel, "env", session).await
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channel_request(channel, "shell", session).await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channel_request(channel, "exec", session).await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        _name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channel_request(channel, "subsystem", session).await
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }
}

/// Opens `forwarded-tcpip` channels on one live SSH session.
pub struct SshOpener {
    handle: Handle,
}

impl SshOpener {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl ChannelOpener for SshOpener {
    async fn open_channel(&self, kind: &str, extra_data: Vec<u8>) -> TunnelResult<BoxedStream> {
        if kind != "forwarded-tcpip" {
            return Err(TunnelError::ChannelOpen(format!(
                "unsupported channel type {kind}"
            )));
        }
        let info = OriginInfo::decode(&extra_data)?;
        let channel = self
            .handle
            .channel_open_forwarded_tcpip(
                info.forward_ip,
                info.forward_port,
                info.origin_ip,
                info.origin_port,
            )
            .await
            .map_err(|e| TunnelError::ChannelOpen(e.to_string()))?;
        Ok(Box::new(channel.into_stream()))
    }
}
