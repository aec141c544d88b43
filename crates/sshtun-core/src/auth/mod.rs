//! Agent and client authentication.
//!
//! Agents prove a public key under the reserved user name and receive a
//! session token. Clients present a live token as their password.

pub mod rate_limit;
pub mod verifier;

pub use rate_limit::RateLimiter;
pub use verifier::{AcceptAnyKey, AuthorizedKeySet, KeyVerifier};

use crate::error::{TunnelError, TunnelResult};
use crate::session::SessionId;
use crate::token::TokenBroker;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// User name reserved for the agent role unless configured otherwise.
pub const DEFAULT_AGENT_USER: &str = "server";

pub struct Authenticator {
    agent_user: String,
    verifier: Box<dyn KeyVerifier>,
    broker: Arc<TokenBroker>,
    limiter: Mutex<RateLimiter>,
}

impl Authenticator {
    pub fn new(
        agent_user: impl Into<String>,
        verifier: Box<dyn KeyVerifier>,
        broker: Arc<TokenBroker>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            agent_user: agent_user.into(),
            verifier,
            broker,
            limiter: Mutex::new(limiter),
        }
    }

    /// Authenticate an agent by public key and issue its session token.
    pub async fn authenticate_agent(
        &self,
        session: &SessionId,
        user: &str,
        fingerprint: &str,
    ) -> TunnelResult<String> {
        if user != self.agent_user {
            debug!(session_id = %session, user, "public key offered for non-agent user");
            return Err(TunnelError::AuthRejected);
        }
        if !self.verifier.verify(user, fingerprint) {
            warn!(session_id = %session, fingerprint, "agent key not authorized");
            return Err(TunnelError::AuthRejected);
        }

        let token = self.broker.issue(session).await;
        info!(session_id = %session, fingerprint, "agent authenticated");
        Ok(token)
    }

    /// Authenticate a client by the session token it presents as password.
    pub async fn authenticate_client(
        &self,
        peer: IpAddr,
        user: &str,
        credential: &str,
    ) -> TunnelResult<()> {
        if self.limiter.lock().await.is_blocked(peer) {
            warn!(peer = %peer, "client auth rate limited");
            return Err(TunnelError::AuthRejected);
        }

        if self.broker.exists(credential).await {
            info!(peer = %peer, user, "client authenticated");
            return Ok(());
        }

        let mut limiter = self.limiter.lock().await;
        limiter.record_failure(peer);
        limiter.gc();
        debug!(peer = %peer, user, "client presented unknown token");
        Err(TunnelError::AuthRejected)
    }
}
