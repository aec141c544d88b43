//! Session identity: the transport-assigned identifier and the peer role.

use rand::Rng;
use std::fmt;

/// Opaque identifier the transport assigns to one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random identifier (16 bytes, hex encoded).
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
        Self(hex::encode(bytes))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the tunnel an authenticated session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Proved a public key under the reserved user name; owns routes.
    Agent,
    /// Presented a live session token; consumes routes.
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Agent => f.write_str("agent"),
            Role::Client => f.write_str("client"),
        }
    }
}
