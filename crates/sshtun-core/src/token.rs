//! In-memory session token broker.
//!
//! An authenticated agent session gets one random token; clients present that
//! token as their credential. Tokens live only as long as the agent session.

use crate::session::SessionId;
use rand::RngCore;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

const TOKEN_BYTES: usize = 32;

#[derive(Default)]
struct Tables {
    by_session: HashMap<SessionId, String>,
    by_token: HashMap<String, SessionId>,
}

/// Issues, looks up and revokes session tokens.
#[derive(Default)]
pub struct TokenBroker {
    tables: RwLock<Tables>,
}

impl TokenBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a token for `session`, or return the one it already holds.
    pub async fn issue(&self, session: &SessionId) -> String {
        let mut tables = self.tables.write().await;
        if let Some(token) = tables.by_session.get(session) {
            return token.clone();
        }

        let token = generate_token();
        tables.by_session.insert(session.clone(), token.clone());
        tables.by_token.insert(token.clone(), session.clone());
        debug!(session_id = %session, "session token issued");
        token
    }

    /// Whether `token` belongs to a live agent session.
    pub async fn exists(&self, token: &str) -> bool {
        self.tables.read().await.by_token.contains_key(token)
    }

    /// Drop the token of `session`. Returns `true` if one was held.
    pub async fn revoke(&self, session: &SessionId) -> bool {
        let mut tables = self.tables.write().await;
        match tables.by_session.remove(session) {
            Some(token) => {
                tables.by_token.remove(&token);
                debug!(session_id = %session, "session token revoked");
                true
            }
            None => false,
        }
    }

    pub async fn token_for(&self, session: &SessionId) -> Option<String> {
        self.tables.read().await.by_session.get(session).cloned()
    }

    /// Number of live tokens.
    pub async fn len(&self) -> usize {
        self.tables.read().await.by_session.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
