use thiserror::Error;

/// Errors produced by the forwarding and relay engine.
///
/// Every variant is scoped to the connection, request or relay that produced
/// it; none of them tear down unrelated sessions.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Deliberately carries no detail so callers cannot learn which
    /// credentials are live.
    #[error("authentication rejected")]
    AuthRejected,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("route already exists for {0}")]
    DuplicateRoute(String),

    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("relay failed: {0}")]
    Relay(#[source] std::io::Error),

    #[error("channel open failed: {0}")]
    ChannelOpen(String),

    #[error("invalid authorized keys: {0}")]
    AuthorizedKeys(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
