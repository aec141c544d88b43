//! sshtun-core: forwarding and relay engine for the sshtun rendezvous host.
//!
//! Provides the SSH wire records, the transport seam the SSH adapter feeds,
//! the relay splice, the session token broker, agent/client authentication,
//! reverse-forward route management and the per-session connection handler.

pub mod auth;
pub mod dial;
pub mod error;
pub mod handler;
pub mod pipe;
pub mod routes;
pub mod session;
pub mod token;
pub mod transport;
pub mod wire;

// Re-export commonly used items at crate root.
pub use auth::{AcceptAnyKey, Authenticator, AuthorizedKeySet, KeyVerifier, RateLimiter};
pub use dial::Dialer;
pub use error::{TunnelError, TunnelResult};
pub use handler::{ConnectionHandler, SessionSummary};
pub use pipe::{splice, RelayStats};
pub use routes::{RouteHandle, RouteManager};
pub use session::{Role, SessionId};
pub use token::TokenBroker;
pub use transport::{ChannelOpener, SessionTransport, TransportSender};
