//! Acceptor: owns the rendezvous listener and starts one SSH session per
//! accepted connection.

use crate::ssh::{SshOpener, SshSession};
use anyhow::{Context, Result};
use sshtun_core::transport::session_channels;
use sshtun_core::{Authenticator, ConnectionHandler, SessionId, TunnelError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub struct TunnelServer {
    ssh_config: Arc<russh::server::Config>,
    auth: Arc<Authenticator>,
    handler: ConnectionHandler,
}

impl TunnelServer {
    pub fn new(
        ssh_config: russh::server::Config,
        auth: Arc<Authenticator>,
        handler: ConnectionHandler,
    ) -> Self {
        Self {
            ssh_config: Arc::new(ssh_config),
            auth,
            handler,
        }
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!(addr = %listener.local_addr()?, "listening for ssh connections");
        Ok(listener)
    }

    /// Accept connections until a non-transient accept error.
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) if is_transient(&e) => {
                    warn!(error = %e, "accept failed, continuing");
                    continue;
                }
                Err(e) => return Err(e).context("accept failed"),
            };

            debug!(peer = %peer, "connection accepted");
            tokio::spawn(serve_connection(
                self.ssh_config.clone(),
                stream,
                peer,
                self.auth.clone(),
                self.handler.clone(),
            ));
        }
    }
}

async fn serve_connection(
    ssh_config: Arc<russh::server::Config>,
    stream: TcpStream,
    peer: SocketAddr,
    auth: Arc<Authenticator>,
    handler: ConnectionHandler,
) {
    let session_id = SessionId::generate();
    let (sender, pending) = session_channels(session_id.clone(), peer);
    let ssh = SshSession::new(session_id.clone(), peer, auth, sender);

    let running = match russh::server::run_stream(ssh_config, stream, ssh)
        .await
        .map_err(handshake_error)
    {
        Ok(running) => running,
        Err(e) => {
            warn!(session_id = %session_id, peer = %peer, error = %e, "connection dropped");
            return;
        }
    };

    let transport = pending.with_opener(Arc::new(SshOpener::new(running.handle())));
    let core = tokio::spawn(async move { handler.run(transport).await });

    if let Err(e) = running.await {
        debug!(session_id = %session_id, error = %e, "ssh session ended with error");
    }

    match core.await {
        Ok(summary) => debug!(
            session_id = %summary.session_id,
            peer = %summary.peer,
            role = ?summary.role,
            routes_released = summary.routes_released,
            "connection finished"
        ),
        Err(e) => warn!(session_id = %session_id, error = %e, "session handler failed"),
    }
}

fn handshake_error(e: russh::Error) -> TunnelError {
    TunnelError::Handshake(e.to_string())
}

/// Accept errors that concern a single connection, not the listener.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
