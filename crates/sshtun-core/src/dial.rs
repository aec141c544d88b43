//! Outbound TCP dials for `direct-tcpip` channels.

use crate::error::{TunnelError, TunnelResult};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::debug;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to relay targets, optionally from a fixed source address.
#[derive(Debug, Clone)]
pub struct Dialer {
    source_ip: Option<IpAddr>,
    connect_timeout: Duration,
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new(None, DEFAULT_DIAL_TIMEOUT)
    }
}

impl Dialer {
    pub fn new(source_ip: Option<IpAddr>, connect_timeout: Duration) -> Self {
        Self {
            source_ip,
            connect_timeout,
        }
    }

    /// Connect to `host:port`, trying each resolved address in turn.
    pub async fn dial(&self, host: &str, port: u32) -> TunnelResult<TcpStream> {
        let port = u16::try_from(port)
            .map_err(|_| TunnelError::MalformedRequest(format!("port {port} out of range")))?;
        let target = format!("{host}:{port}");

        match tokio::time::timeout(self.connect_timeout, self.connect_any(host, port)).await {
            Ok(Ok(stream)) => {
                debug!(target = %target, "dialed relay target");
                Ok(stream)
            }
            Ok(Err(source)) => Err(TunnelError::Dial {
                addr: target,
                source,
            }),
            Err(_) => Err(TunnelError::Dial {
                addr: target,
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            }),
        }
    }

    async fn connect_any(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in lookup_host((host, port)).await? {
            match self.connect_one(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")
        }))
    }

    async fn connect_one(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let Some(source) = self.source_ip else {
            return TcpStream::connect(addr).await;
        };
        if source.is_ipv4() != addr.is_ipv4() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("source {source} cannot reach {addr}"),
            ));
        }

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(SocketAddr::new(source, 0))?;
        socket.connect(addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dials_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = Dialer::default().dial("127.0.0.1", port as u32).await.unwrap();
        let (_, peer) = listener.accept().await.unwrap();
        assert_eq!(stream.local_addr().unwrap(), peer);
    }

    #[tokio::test]
    async fn dials_from_source_ip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let source: IpAddr = "127.0.0.1".parse().unwrap();
        let dialer = Dialer::new(Some(source), DEFAULT_DIAL_TIMEOUT);
        let stream = dialer.dial("127.0.0.1", port as u32).await.unwrap();
        assert_eq!(stream.local_addr().unwrap().ip(), source);
    }

    #[tokio::test]
    async fn source_family_mismatch_fails() {
        let source: IpAddr = "::1".parse().unwrap();
        let dialer = Dialer::new(Some(source), DEFAULT_DIAL_TIMEOUT);
        let err = dialer.dial("127.0.0.1", 9).await.unwrap_err();
        assert!(matches!(err, TunnelError::Dial { .. }));
    }

    #[tokio::test]
    async fn rejects_out_of_range_port() {
        let err = Dialer::default().dial("127.0.0.1", 70_000).await.unwrap_err();
        assert!(matches!(err, TunnelError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_dial_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = Dialer::default().dial("127.0.0.1", port as u32).await.unwrap_err();
        assert!(matches!(err, TunnelError::Dial { .. }));
    }
}
