//! Reverse-forward route management.
//!
//! An agent's `tcpip-forward` request binds a TCP listener on the rendezvous
//! host. Each connection accepted there is carried back to the agent as a
//! `forwarded-tcpip` channel and spliced through. At most one route exists per
//! (bind address, bound port).
//!
//! A route's accept loop stays gated until [`RouteManager::activate`] is
//! called, so no channel is opened before the agent has seen the success
//! reply carrying the bound port.

use crate::error::{TunnelError, TunnelResult};
use crate::pipe::splice;
use crate::session::SessionId;
use crate::transport::ChannelOpener;
use crate::wire::{OriginInfo, WireMessage};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    bind_ip: String,
    port: u16,
}

impl RouteKey {
    fn label(&self) -> String {
        format!("{}:{}", self.bind_ip, self.port)
    }
}

struct RouteEntry {
    id: u64,
    owner: SessionId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type RouteTable = Arc<Mutex<HashMap<RouteKey, RouteEntry>>>;

/// A live route as seen by the session that requested it.
#[derive(Debug)]
pub struct RouteHandle {
    id: u64,
    bind_ip: String,
    bound_port: u16,
    ready: Option<oneshot::Sender<()>>,
}

impl RouteHandle {
    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    fn key(&self) -> RouteKey {
        RouteKey {
            bind_ip: self.bind_ip.clone(),
            port: self.bound_port,
        }
    }
}

/// Owns every reverse-forward listener on the host.
pub struct RouteManager {
    routes: RouteTable,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

impl Default for RouteManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteManager {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Bind a listener for `session` and register the route.
    ///
    /// The returned handle must be passed to [`activate`](Self::activate)
    /// once the success reply has been handed to the transport.
    pub async fn request_route(
        &self,
        session: &SessionId,
        bind_ip: &str,
        bind_port: u32,
        opener: Arc<dyn ChannelOpener>,
    ) -> TunnelResult<RouteHandle> {
        let requested_port = u16::try_from(bind_port).map_err(|_| {
            TunnelError::MalformedRequest(format!("bind port {bind_port} out of range"))
        })?;

        let listen_addr = resolve_bind(bind_ip, requested_port).await?;

        let mut routes = self.routes.lock().await;

        if requested_port != 0 {
            let key = RouteKey {
                bind_ip: bind_ip.to_string(),
                port: requested_port,
            };
            if routes.contains_key(&key) {
                return Err(TunnelError::DuplicateRoute(key.label()));
            }
        }

        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|source| TunnelError::Listen {
                addr: format!("{bind_ip}:{requested_port}"),
                source,
            })?;
        let bound_port = listener.local_addr()?.port();

        let key = RouteKey {
            bind_ip: bind_ip.to_string(),
            port: bound_port,
        };
        if routes.contains_key(&key) {
            return Err(TunnelError::DuplicateRoute(key.label()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let (ready_tx, ready_rx) = oneshot::channel();

        let route = ServedRoute {
            id,
            key: key.clone(),
            session: session.clone(),
            advertised_port: if requested_port == 0 {
                bound_port
            } else {
                requested_port
            },
            opener,
            table: self.routes.clone(),
        };
        let task = tokio::spawn(route.serve(listener, ready_rx, cancel.clone()));

        routes.insert(
            key,
            RouteEntry {
                id,
                owner: session.clone(),
                cancel,
                task,
            },
        );

        info!(
            session_id = %session,
            bind_ip,
            requested_port,
            bound_port,
            "route established"
        );

        Ok(RouteHandle {
            id,
            bind_ip: bind_ip.to_string(),
            bound_port,
            ready: Some(ready_tx),
        })
    }

    /// Start serving the route's listener. Returns `false` if the route was
    /// already active or has been torn down.
    pub fn activate(&self, handle: &mut RouteHandle) -> bool {
        match handle.ready.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Tear down the route behind `handle`. Idempotent.
    pub async fn release(&self, handle: &RouteHandle) -> bool {
        let entry = {
            let mut routes = self.routes.lock().await;
            let key = handle.key();
            match routes.get(&key) {
                Some(entry) if entry.id == handle.id => routes.remove(&key),
                _ => None,
            }
        };
        match entry {
            Some(entry) => {
                stop(entry).await;
                true
            }
            None => false,
        }
    }

    /// Tear down the route `session` owns on `bind_ip:port`.
    pub async fn release_bind(&self, session: &SessionId, bind_ip: &str, port: u32) -> bool {
        let Ok(port) = u16::try_from(port) else {
            return false;
        };
        let key = RouteKey {
            bind_ip: bind_ip.to_string(),
            port,
        };

        let entry = {
            let mut routes = self.routes.lock().await;
            match routes.get(&key) {
                Some(entry) if &entry.owner == session => routes.remove(&key),
                Some(_) => {
                    warn!(session_id = %session, route = %key.label(), "cancel for route owned by another session");
                    None
                }
                None => None,
            }
        };
        match entry {
            Some(entry) => {
                stop(entry).await;
                info!(session_id = %session, route = %key.label(), "route cancelled");
                true
            }
            None => false,
        }
    }

    /// Tear down every route owned by `session`. Returns how many were live.
    pub async fn release_session(&self, session: &SessionId) -> usize {
        let owned: Vec<RouteEntry> = {
            let mut routes = self.routes.lock().await;
            let keys: Vec<RouteKey> = routes
                .iter()
                .filter(|(_, entry)| &entry.owner == session)
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| routes.remove(key)).collect()
        };

        let count = owned.len();
        for entry in owned {
            stop(entry).await;
        }
        if count > 0 {
            info!(session_id = %session, routes = count, "session routes released");
        }
        count
    }

    /// Close every listener. Routes requested afterwards are closed at once.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let all: Vec<RouteEntry> = {
            let mut routes = self.routes.lock().await;
            routes.drain().map(|(_, entry)| entry).collect()
        };
        let count = all.len();
        for entry in all {
            stop(entry).await;
        }
        info!(routes = count, "all routes closed");
    }

    /// Number of live routes.
    pub async fn len(&self) -> usize {
        self.routes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Bound ports of the routes owned by `session`.
    pub async fn ports_of(&self, session: &SessionId) -> Vec<u16> {
        let routes = self.routes.lock().await;
        let mut ports: Vec<u16> = routes
            .iter()
            .filter(|(_, entry)| &entry.owner == session)
            .map(|(key, _)| key.port)
            .collect();
        ports.sort_unstable();
        ports
    }
}

/// Resolve the agent's bind address. Runs before the route table is locked,
/// so a slow resolver only stalls the requesting session.
async fn resolve_bind(bind_ip: &str, port: u16) -> TunnelResult<SocketAddr> {
    let host = if bind_ip.is_empty() { "0.0.0.0" } else { bind_ip };
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let listen_error = |source: io::Error| TunnelError::Listen {
        addr: format!("{bind_ip}:{port}"),
        source,
    };
    lookup_host((host, port))
        .await
        .map_err(listen_error)?
        .next()
        .ok_or_else(|| {
            listen_error(io::Error::new(
                io::ErrorKind::NotFound,
                "bind address resolved to nothing",
            ))
        })
}

async fn stop(entry: RouteEntry) {
    entry.cancel.cancel();
    if let Err(e) = entry.task.await {
        warn!(error = %e, "route accept task failed");
    }
}

/// State moved into a route's accept task.
struct ServedRoute {
    id: u64,
    key: RouteKey,
    session: SessionId,
    advertised_port: u16,
    opener: Arc<dyn ChannelOpener>,
    table: RouteTable,
}

impl ServedRoute {
    async fn serve(
        self,
        listener: TcpListener,
        ready: oneshot::Receiver<()>,
        cancel: CancellationToken,
    ) {
        let activated = tokio::select! {
            _ = cancel.cancelled() => false,
            res = ready => res.is_ok(),
        };

        if activated {
            self.accept_loop(&listener, &cancel).await;
        } else {
            debug!(route = %self.key.label(), "route torn down before activation");
        }

        drop(listener);
        self.deregister().await;
    }

    async fn accept_loop(&self, listener: &TcpListener, cancel: &CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(route = %self.key.label(), "accept loop cancelled");
                    return;
                }
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        debug!(route = %self.key.label(), peer = %peer, "inbound connection");
                        tokio::spawn(forward_connection(
                            stream,
                            peer,
                            self.origin_info(peer),
                            self.opener.clone(),
                            self.session.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(
                            session_id = %self.session,
                            route = %self.key.label(),
                            error = %e,
                            "accept failed, closing route"
                        );
                        return;
                    }
                },
            }
        }
    }

    fn origin_info(&self, peer: SocketAddr) -> OriginInfo {
        OriginInfo {
            forward_ip: self.key.bind_ip.clone(),
            forward_port: self.advertised_port as u32,
            origin_ip: peer.ip().to_string(),
            origin_port: peer.port() as u32,
        }
    }

    async fn deregister(&self) {
        let mut routes = self.table.lock().await;
        if routes.get(&self.key).is_some_and(|entry| entry.id == self.id) {
            routes.remove(&self.key);
        }
    }
}

async fn forward_connection(
    stream: TcpStream,
    peer: SocketAddr,
    info: OriginInfo,
    opener: Arc<dyn ChannelOpener>,
    session: SessionId,
) {
    let channel = match opener.open_channel("forwarded-tcpip", info.encode()).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(session_id = %session, peer = %peer, error = %e, "forwarded-tcpip open failed");
            return;
        }
    };

    match splice(stream, channel).await {
        Ok(stats) => debug!(
            session_id = %session,
            peer = %peer,
            sent = stats.a_to_b,
            received = stats.b_to_a,
            "forwarded connection closed"
        ),
        Err(e) => debug!(session_id = %session, peer = %peer, error = %e, "forwarded relay ended with error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BoxedStream;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    /// Hands the far end of every opened channel to the test.
    struct RecordingOpener {
        opened: mpsc::Sender<(String, Vec<u8>, DuplexStream)>,
    }

    #[async_trait]
    impl ChannelOpener for RecordingOpener {
        async fn open_channel(&self, kind: &str, extra_data: Vec<u8>) -> TunnelResult<BoxedStream> {
            let (near, far) = tokio::io::duplex(4096);
            self.opened
                .send((kind.to_string(), extra_data, far))
                .await
                .map_err(|_| TunnelError::TransportClosed)?;
            Ok(Box::new(near))
        }
    }

    fn opener() -> (Arc<dyn ChannelOpener>, mpsc::Receiver<(String, Vec<u8>, DuplexStream)>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(RecordingOpener { opened: tx }), rx)
    }

    #[tokio::test]
    async fn port_zero_binds_ephemeral_port() {
        let manager = RouteManager::new();
        let session = SessionId::generate();
        let (opener, _rx) = opener();

        let handle = manager
            .request_route(&session, "127.0.0.1", 0, opener)
            .await
            .unwrap();
        assert!(handle.bound_port() >= 1024);
        assert_eq!(manager.ports_of(&session).await, vec![handle.bound_port()]);
    }

    #[tokio::test]
    async fn forwards_after_activation() {
        let manager = RouteManager::new();
        let session = SessionId::generate();
        let (opener, mut opened) = opener();

        let mut handle = manager
            .request_route(&session, "127.0.0.1", 0, opener)
            .await
            .unwrap();
        let port = handle.bound_port();

        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let early = tokio::time::timeout(Duration::from_millis(200), opened.recv()).await;
        assert!(early.is_err(), "channel opened before activation");

        assert!(manager.activate(&mut handle));
        assert!(!manager.activate(&mut handle));

        let (kind, extra, mut far) = tokio::time::timeout(Duration::from_secs(5), opened.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kind, "forwarded-tcpip");
        let info = OriginInfo::decode(&extra).unwrap();
        assert_eq!(info.forward_ip, "127.0.0.1");
        assert_eq!(info.forward_port, port as u32);
        assert_eq!(info.origin_ip, "127.0.0.1");
        assert_eq!(info.origin_port, conn.local_addr().unwrap().port() as u32);

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        far.write_all(b"pong").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn duplicate_route_rejected() {
        let manager = RouteManager::new();
        let (opener, _rx) = opener();
        let first = manager
            .request_route(&SessionId::generate(), "127.0.0.1", 0, opener.clone())
            .await
            .unwrap();

        let err = manager
            .request_route(
                &SessionId::generate(),
                "127.0.0.1",
                first.bound_port() as u32,
                opener,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::DuplicateRoute(_)));
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn independent_sessions_get_independent_routes() {
        let manager = RouteManager::new();
        let (opener, _rx) = opener();
        let a = SessionId::generate();
        let b = SessionId::generate();

        let ra = manager.request_route(&a, "127.0.0.1", 0, opener.clone()).await.unwrap();
        let rb = manager.request_route(&b, "127.0.0.1", 0, opener).await.unwrap();
        assert_ne!(ra.bound_port(), rb.bound_port());

        assert_eq!(manager.release_session(&a).await, 1);
        assert_eq!(manager.ports_of(&b).await, vec![rb.bound_port()]);
    }

    #[tokio::test]
    async fn rejects_out_of_range_port() {
        let manager = RouteManager::new();
        let (opener, _rx) = opener();
        let err = manager
            .request_route(&SessionId::generate(), "127.0.0.1", 65_536, opener)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn release_closes_listener_and_frees_port() {
        let manager = RouteManager::new();
        let session = SessionId::generate();
        let (opener, _rx) = opener();

        let mut handle = manager
            .request_route(&session, "127.0.0.1", 0, opener.clone())
            .await
            .unwrap();
        manager.activate(&mut handle);
        let port = handle.bound_port();

        assert!(manager.release(&handle).await);
        assert!(!manager.release(&handle).await);
        assert!(manager.is_empty().await);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

        let again = manager
            .request_route(&session, "127.0.0.1", port as u32, opener)
            .await
            .unwrap();
        assert_eq!(again.bound_port(), port);
    }

    #[tokio::test]
    async fn release_bind_requires_owner() {
        let manager = RouteManager::new();
        let owner = SessionId::generate();
        let (opener, _rx) = opener();
        let handle = manager
            .request_route(&owner, "127.0.0.1", 0, opener)
            .await
            .unwrap();
        let port = handle.bound_port() as u32;

        assert!(!manager.release_bind(&SessionId::generate(), "127.0.0.1", port).await);
        assert!(!manager.release_bind(&owner, "0.0.0.0", port).await);
        assert!(manager.release_bind(&owner, "127.0.0.1", port).await);
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_closes_every_route() {
        let manager = RouteManager::new();
        let (opener, _rx) = opener();
        for _ in 0..3 {
            let mut handle = manager
                .request_route(&SessionId::generate(), "127.0.0.1", 0, opener.clone())
                .await
                .unwrap();
            manager.activate(&mut handle);
        }
        assert_eq!(manager.len().await, 3);

        manager.shutdown().await;
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn dropped_handle_deregisters_route() {
        let manager = RouteManager::new();
        let (opener, _rx) = opener();
        let handle = manager
            .request_route(&SessionId::generate(), "127.0.0.1", 0, opener)
            .await
            .unwrap();
        drop(handle);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !manager.is_empty().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn concurrent_sessions_forward_independently() {
        let manager = RouteManager::new();
        let (opener_a, mut opened_a) = opener();
        let (opener_b, mut opened_b) = opener();
        let a = SessionId::generate();
        let b = SessionId::generate();

        let (ra, rb) = tokio::join!(
            manager.request_route(&a, "127.0.0.1", 0, opener_a),
            manager.request_route(&b, "127.0.0.1", 0, opener_b),
        );
        let (mut ra, mut rb) = (ra.unwrap(), rb.unwrap());
        assert_ne!(ra.bound_port(), rb.bound_port());
        assert!(manager.activate(&mut ra));
        assert!(manager.activate(&mut rb));

        for (port, opened, payload) in [
            (ra.bound_port(), &mut opened_a, b"to-a"),
            (rb.bound_port(), &mut opened_b, b"to-b"),
        ] {
            let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let (_, extra, mut far) = tokio::time::timeout(Duration::from_secs(5), opened.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(OriginInfo::decode(&extra).unwrap().forward_port, port as u32);

            conn.write_all(payload).await.unwrap();
            let mut buf = [0u8; 4];
            far.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, payload);
        }
        assert_eq!(manager.len().await, 2);
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_port_admit_one() {
        let manager = RouteManager::new();
        let (opener, _rx) = opener();
        let port = {
            let scratch = TcpListener::bind("127.0.0.1:0").await.unwrap();
            scratch.local_addr().unwrap().port() as u32
        };

        let first_session = SessionId::generate();
        let second_session = SessionId::generate();
        let (first, second) = tokio::join!(
            manager.request_route(&first_session, "127.0.0.1", port, opener.clone()),
            manager.request_route(&second_session, "127.0.0.1", port, opener),
        );
        let results = [first, second];
        let won = results.iter().filter(|r| r.is_ok()).count();
        let duplicates = results
            .iter()
            .filter(|r| matches!(r, Err(TunnelError::DuplicateRoute(_))))
            .count();
        assert_eq!((won, duplicates), (1, 1));
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn bind_address_resolved_before_locking_table() {
        let manager = RouteManager::new();
        let (opener, _rx) = opener();

        let _table = manager.routes.lock().await;
        let res = tokio::time::timeout(
            Duration::from_secs(30),
            manager.request_route(&SessionId::generate(), "no-such-host.invalid", 0, opener),
        )
        .await
        .expect("resolution waited for the route table");
        assert!(matches!(res, Err(TunnelError::Listen { .. })));
    }

    #[tokio::test]
    async fn literal_and_empty_bind_addresses_skip_lookup() {
        assert_eq!(
            resolve_bind("", 0).await.unwrap(),
            SocketAddr::from(([0, 0, 0, 0], 0))
        );
        assert_eq!(
            resolve_bind("::1", 8022).await.unwrap(),
            "[::1]:8022".parse::<SocketAddr>().unwrap()
        );
    }
}
