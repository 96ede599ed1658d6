//! # TURN Client
//!
//! RFC 5766 relay client over TCP, with RFC 6062 data connections for
//! proxying inbound peer traffic to the local router port. The transport
//! uses it when the node has no reachable public address:
//!
//! 1. `TurnClient::select` races the configured servers and keeps the first
//!    one that grants an allocation.
//! 2. The allocation is refreshed strictly before expiry (one minute early);
//!    a socket error during refresh disposes the client so the supervisor can
//!    re-create it and re-establish permissions.
//! 3. `create_permission` authorizes a peer endpoint; permissions expire
//!    after five minutes per RFC and are re-issued by the supervisor.
//! 4. `bind_proxies` services ConnectionAttempt indications by opening a
//!    data connection, binding it, and splicing bytes to the local router.
//!
//! One control connection per client; requests are matched to responses by
//! transaction id through a pending map, the same way the RPC layer matches
//! oneshot replies.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::stun::{
    Attribute, Class, ERROR_STALE_NONCE, ERROR_UNAUTHENTICATED, HEADER_LEN, MAX_MESSAGE_LEN,
    METHOD_ALLOCATE, METHOD_CONNECTION_ATTEMPT, METHOD_CONNECTION_BIND, METHOD_CREATE_PERMISSION,
    METHOD_REFRESH, StunMessage, TRANSPORT_TCP, long_term_key,
};

/// Default allocation lifetime requested from the relay.
pub const DEFAULT_ALLOCATION_LIFETIME: Duration = Duration::from_secs(777);

/// Permission lifetime fixed by RFC 5766.
pub const PERMISSION_LIFETIME: Duration = Duration::from_secs(300);

/// Refreshes run this long before the corresponding expiry.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Deadline for a single control-connection transaction.
const TURN_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the initial connect + allocate handshake per server.
const SERVER_RACE_TIMEOUT: Duration = Duration::from_secs(15);

/// Queue depth for pending ConnectionAttempt indications.
const ATTEMPT_QUEUE_SIZE: usize = 32;

/// A TURN server entry from the host configuration.
#[derive(Clone, Debug)]
pub struct IceServer {
    /// `turn:host:port` (or bare `host:port`).
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    fn host_port(&self) -> Result<(String, u16), TransportError> {
        let stripped = self.url.strip_prefix("turn:").unwrap_or(&self.url);
        let (host, port) = stripped
            .rsplit_once(':')
            .ok_or_else(|| TransportError::Unexpected(format!("bad TURN url: {}", self.url)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| TransportError::Unexpected(format!("bad TURN port: {}", self.url)))?;
        Ok((host.to_string(), port))
    }
}

/// An inbound peer connection announced by the relay (RFC 6062).
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    pub connection_id: u32,
    pub peer: SocketAddr,
}

struct Auth {
    username: String,
    realm: String,
    nonce: Vec<u8>,
    key: Vec<u8>,
}

impl Auth {
    fn attributes(&self) -> [Attribute; 3] {
        [
            Attribute::Username(self.username.clone()),
            Attribute::Realm(self.realm.clone()),
            Attribute::Nonce(self.nonce.clone()),
        ]
    }
}

type PendingMap = Arc<std::sync::Mutex<HashMap<[u8; 12], oneshot::Sender<StunMessage>>>>;

pub struct TurnClient {
    server: IceServer,
    server_host: (String, u16),
    auth: Mutex<Auth>,
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingMap,
    attempts: Mutex<Option<mpsc::Receiver<ConnectionAttempt>>>,
    mapped: SocketAddr,
    relayed: SocketAddr,
    granted_lifetime: Mutex<Duration>,
    broken: Arc<AtomicBool>,
    reader_cancel: CancellationToken,
}

impl TurnClient {
    /// Race the configured servers; the first to grant an allocation wins.
    pub async fn select(servers: &[IceServer]) -> Result<Arc<TurnClient>, TransportError> {
        if servers.is_empty() {
            return Err(TransportError::Unexpected(
                "no TURN servers configured".into(),
            ));
        }

        let mut join_set = JoinSet::new();
        for server in servers.iter().cloned() {
            join_set.spawn(async move {
                let url = server.url.clone();
                let result = timeout(SERVER_RACE_TIMEOUT, TurnClient::connect(server)).await;
                (url, result)
            });
        }

        let mut last_error = None;
        while let Some(joined) = join_set.join_next().await {
            let Ok((url, result)) = joined else { continue };
            match result {
                Ok(Ok(client)) => {
                    info!(server = %url, relayed = %client.relayed, "selected TURN server");
                    return Ok(client);
                }
                Ok(Err(e)) => {
                    debug!(server = %url, error = %e, "TURN server rejected");
                    last_error = Some(e);
                }
                Err(_) => {
                    debug!(server = %url, "TURN server timed out");
                    last_error = Some(TransportError::Timeout);
                }
            }
        }
        Err(last_error.unwrap_or(TransportError::Timeout))
    }

    async fn connect(server: IceServer) -> Result<Arc<TurnClient>, TransportError> {
        let host_port = server.host_port()?;
        let mut stream =
            TcpStream::connect((host_port.0.as_str(), host_port.1)).await?;

        // First Allocate is unauthenticated; the 401 carries realm and nonce
        // for the retry.
        let probe = StunMessage::request(METHOD_ALLOCATE)
            .with_attribute(Attribute::RequestedTransport(TRANSPORT_TCP))
            .with_attribute(Attribute::Lifetime(
                DEFAULT_ALLOCATION_LIFETIME.as_secs() as u32,
            ));
        stream.write_all(&probe.encode(None)).await?;
        let challenge = read_stun(&mut stream).await?;

        let mut auth = match challenge.error_code() {
            Some((ERROR_UNAUTHENTICATED, _)) => {
                let realm = challenge
                    .realm()
                    .ok_or_else(|| TransportError::Unexpected("401 without realm".into()))?
                    .to_string();
                let nonce = challenge
                    .nonce()
                    .ok_or_else(|| TransportError::Unexpected("401 without nonce".into()))?
                    .to_vec();
                let key = long_term_key(&server.username, &realm, &server.credential);
                Auth {
                    username: server.username.clone(),
                    realm,
                    nonce,
                    key,
                }
            }
            Some((code, reason)) => {
                return Err(TransportError::Unexpected(format!(
                    "allocate rejected: {code} {reason}"
                )));
            }
            None => {
                return Err(TransportError::Unexpected(
                    "allocate answered without authentication challenge".into(),
                ));
            }
        };

        let mut request = StunMessage::request(METHOD_ALLOCATE)
            .with_attribute(Attribute::RequestedTransport(TRANSPORT_TCP))
            .with_attribute(Attribute::Lifetime(
                DEFAULT_ALLOCATION_LIFETIME.as_secs() as u32,
            ));
        for attribute in auth.attributes() {
            request = request.with_attribute(attribute);
        }
        stream.write_all(&request.encode(Some(&auth.key))).await?;
        let response = read_stun(&mut stream).await?;

        if let Some((code, reason)) = response.error_code() {
            return Err(TransportError::Unexpected(format!(
                "allocate rejected: {code} {reason}"
            )));
        }
        if let Some(nonce) = response.nonce() {
            auth.nonce = nonce.to_vec();
        }

        let relayed = response.xor_relayed_address().ok_or_else(|| {
            TransportError::Unexpected("allocate response missing relayed address".into())
        })?;
        let mapped = response.xor_mapped_address().ok_or_else(|| {
            TransportError::Unexpected("allocate response missing mapped address".into())
        })?;
        let granted = Duration::from_secs(u64::from(
            response
                .lifetime()
                .unwrap_or(DEFAULT_ALLOCATION_LIFETIME.as_secs() as u32),
        ));

        let (reader, writer) = stream.into_split();
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (attempts_tx, attempts_rx) = mpsc::channel(ATTEMPT_QUEUE_SIZE);
        let broken = Arc::new(AtomicBool::new(false));
        let reader_cancel = CancellationToken::new();

        tokio::spawn(control_reader(
            reader,
            pending.clone(),
            attempts_tx,
            broken.clone(),
            reader_cancel.clone(),
        ));

        Ok(Arc::new(TurnClient {
            server,
            server_host: host_port,
            auth: Mutex::new(auth),
            writer: Mutex::new(writer),
            pending,
            attempts: Mutex::new(Some(attempts_rx)),
            mapped,
            relayed,
            granted_lifetime: Mutex::new(granted),
            broken,
            reader_cancel,
        }))
    }

    /// Our server-reflexive address as seen by the relay.
    pub fn mapped_address(&self) -> SocketAddr {
        self.mapped
    }

    /// The relayed transport address peers send to.
    pub fn relayed_address(&self) -> SocketAddr {
        self.relayed
    }

    pub async fn granted_lifetime(&self) -> Duration {
        *self.granted_lifetime.lock().await
    }

    /// Whether the control connection has failed. A broken client must be
    /// dropped and re-created from the server list.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// True iff the mapped address differs from every local interface
    /// address, meaning peers cannot reach us directly.
    pub fn is_behind_nat(&self) -> bool {
        let mapped_ip = self.mapped.ip();
        if mapped_ip.is_loopback() {
            return false;
        }
        !local_interface_ips().contains(&mapped_ip)
    }

    /// Extend the allocation. The relay may grant less than requested; the
    /// returned value is authoritative for scheduling the next refresh.
    pub async fn refresh(&self, lifetime: Duration) -> Result<Duration, TransportError> {
        let request = StunMessage::request(METHOD_REFRESH)
            .with_attribute(Attribute::Lifetime(lifetime.as_secs() as u32));
        let response = self.request_with_auth(request).await?;
        let granted = Duration::from_secs(u64::from(
            response.lifetime().unwrap_or(lifetime.as_secs() as u32),
        ));
        *self.granted_lifetime.lock().await = granted;
        debug!(granted_secs = granted.as_secs(), "allocation refreshed");
        Ok(granted)
    }

    /// Authorize inbound relay traffic from `peer`.
    pub async fn create_permission(
        &self,
        peer: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let request = StunMessage::request(METHOD_CREATE_PERMISSION)
            .with_attribute(Attribute::XorPeerAddress(peer));
        tokio::select! {
            result = self.request_with_auth(request) => {
                result.map(|_| ())
            }
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
        }
    }

    /// Long-running task servicing ConnectionAttempt indications: each one
    /// gets a bound data connection spliced onto `127.0.0.1:local_port`.
    /// Returns when cancelled or when the control connection dies.
    pub async fn bind_proxies(
        self: &Arc<Self>,
        local_port: u16,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let mut attempts = self
            .attempts
            .lock()
            .await
            .take()
            .ok_or_else(|| TransportError::Unexpected("proxies already bound".into()))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                attempt = attempts.recv() => {
                    let Some(attempt) = attempt else {
                        return Err(TransportError::Socket("TURN control connection closed".into()));
                    };
                    debug!(
                        peer = %attempt.peer,
                        connection_id = attempt.connection_id,
                        "inbound relay connection attempt"
                    );
                    let client = self.clone();
                    let proxy_cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = client.run_proxy(attempt, local_port, proxy_cancel).await {
                            debug!(error = %e, "relay proxy ended");
                        }
                    });
                }
            }
        }
    }

    async fn run_proxy(
        &self,
        attempt: ConnectionAttempt,
        local_port: u16,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let mut data_stream =
            TcpStream::connect((self.server_host.0.as_str(), self.server_host.1)).await?;

        // ConnectionBind is answered on the data connection itself.
        let (request, key) = {
            let auth = self.auth.lock().await;
            let mut request = StunMessage::request(METHOD_CONNECTION_BIND)
                .with_attribute(Attribute::ConnectionId(attempt.connection_id));
            for attribute in auth.attributes() {
                request = request.with_attribute(attribute);
            }
            (request, auth.key.clone())
        };
        data_stream.write_all(&request.encode(Some(&key))).await?;
        let response = timeout(TURN_RPC_TIMEOUT, read_stun(&mut data_stream))
            .await
            .map_err(|_| TransportError::Timeout)??;
        if let Some((code, reason)) = response.error_code() {
            return Err(TransportError::Unexpected(format!(
                "connection bind rejected: {code} {reason}"
            )));
        }

        let mut local_stream =
            TcpStream::connect((IpAddr::from([127, 0, 0, 1]), local_port)).await?;

        tokio::select! {
            result = tokio::io::copy_bidirectional(&mut data_stream, &mut local_stream) => {
                result?;
                Ok(())
            }
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
        }
    }

    async fn request_with_auth(
        &self,
        request: StunMessage,
    ) -> Result<StunMessage, TransportError> {
        let response = self.send_request(request.clone()).await?;

        // A stale nonce is refreshed from the error response and the request
        // replayed once with a fresh transaction id.
        if let Some((ERROR_STALE_NONCE, _)) = response.error_code() {
            if let Some(nonce) = response.nonce() {
                self.auth.lock().await.nonce = nonce.to_vec();
            }
            let retry = StunMessage {
                transaction_id: crate::stun::transaction_id(),
                ..request
            };
            let response = self.send_request(retry).await?;
            return check_success(response);
        }
        check_success(response)
    }

    async fn send_request(&self, mut request: StunMessage) -> Result<StunMessage, TransportError> {
        if self.is_broken() {
            return Err(TransportError::Socket("TURN control connection broken".into()));
        }

        let key = {
            let auth = self.auth.lock().await;
            for attribute in auth.attributes() {
                request = request.with_attribute(attribute);
            }
            auth.key.clone()
        };

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map lock poisoned")
            .insert(request.transaction_id, tx);

        let raw = request.encode(Some(&key));
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(&raw).await {
                self.pending
                    .lock()
                    .expect("pending map lock poisoned")
                    .remove(&request.transaction_id);
                self.broken.store(true, Ordering::SeqCst);
                return Err(e.into());
            }
        }

        match timeout(TURN_RPC_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Socket(
                "TURN control connection closed".into(),
            )),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending map lock poisoned")
                    .remove(&request.transaction_id);
                Err(TransportError::Timeout)
            }
        }
    }
}

impl Drop for TurnClient {
    fn drop(&mut self) {
        self.reader_cancel.cancel();
    }
}

impl std::fmt::Debug for TurnClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnClient")
            .field("server", &self.server.url)
            .field("mapped", &self.mapped)
            .field("relayed", &self.relayed)
            .finish_non_exhaustive()
    }
}

fn check_success(response: StunMessage) -> Result<StunMessage, TransportError> {
    match response.error_code() {
        None if response.is_success() => Ok(response),
        Some((code, reason)) => Err(TransportError::Unexpected(format!(
            "TURN request rejected: {code} {reason}"
        ))),
        None => Err(TransportError::Unexpected(
            "TURN response is neither success nor error".into(),
        )),
    }
}

/// Routes control-connection traffic: responses to their pending transaction,
/// ConnectionAttempt indications to the proxy binder.
async fn control_reader(
    mut reader: impl AsyncRead + Unpin,
    pending: PendingMap,
    attempts_tx: mpsc::Sender<ConnectionAttempt>,
    broken: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            result = read_stun(&mut reader) => match result {
                Ok(message) => message,
                Err(e) => {
                    debug!(error = %e, "TURN control connection read failed");
                    broken.store(true, Ordering::SeqCst);
                    break;
                }
            },
        };

        match message.class {
            Class::Success | Class::Error => {
                let waiter = pending
                    .lock()
                    .expect("pending map lock poisoned")
                    .remove(&message.transaction_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    None => {
                        debug!("dropping TURN response with no pending transaction");
                    }
                }
            }
            Class::Indication if message.method == METHOD_CONNECTION_ATTEMPT => {
                let (Some(connection_id), Some(peer)) =
                    (message.connection_id(), message.xor_peer_address())
                else {
                    warn!("malformed ConnectionAttempt indication");
                    continue;
                };
                if attempts_tx
                    .send(ConnectionAttempt {
                        connection_id,
                        peer,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Class::Indication | Class::Request => {
                debug!(method = message.method, "ignoring unexpected TURN message");
            }
        }
    }
    // Waking every in-flight request; their receivers resolve to closed.
    pending
        .lock()
        .expect("pending map lock poisoned")
        .clear();
}

async fn read_stun(stream: &mut (impl AsyncRead + Unpin)) -> Result<StunMessage, TransportError> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let length = u16::from_be_bytes([header[2], header[3]]) as usize;
    if HEADER_LEN + length > MAX_MESSAGE_LEN {
        return Err(TransportError::Unexpected(format!(
            "oversized STUN message: {} bytes",
            HEADER_LEN + length
        )));
    }
    let mut buf = vec![0u8; HEADER_LEN + length];
    buf[..HEADER_LEN].copy_from_slice(&header);
    stream.read_exact(&mut buf[HEADER_LEN..]).await?;
    StunMessage::decode(&buf).map_err(|e| TransportError::Unexpected(format!("stun: {e}")))
}

/// Best-effort enumeration of local interface addresses by probing outbound
/// routes, loopback always included.
pub(crate) fn local_interface_ips() -> Vec<IpAddr> {
    let mut ips: Vec<IpAddr> = vec![IpAddr::from([127, 0, 0, 1])];
    let probe_targets = ["8.8.8.8:53", "1.1.1.1:53"];
    for target in probe_targets {
        if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0")
            && socket.connect(target).is_ok()
            && let Ok(local) = socket.local_addr()
        {
            let ip = local.ip();
            if !ip.is_unspecified() && !ips.contains(&ip) {
                ips.push(ip);
            }
        }
    }
    ips
}

// ============================================================================
// Shared TURN state
// ============================================================================

/// TURN state shared between the dispatcher (permission checks before an
/// exchange) and the supervisor's refresh tasks. The client slot is replaced
/// wholesale when the control connection breaks; permissions are invalidated
/// with it because the new allocation starts blank.
pub struct TurnState {
    servers: Vec<IceServer>,
    client: Mutex<Arc<TurnClient>>,
    permissions: Mutex<HashMap<crate::identity::PeerAddress, tokio::time::Instant>>,
    behind_nat: AtomicBool,
}

impl TurnState {
    pub fn new(servers: Vec<IceServer>, client: Arc<TurnClient>) -> Self {
        let behind_nat = client.is_behind_nat();
        Self {
            servers,
            client: Mutex::new(client),
            permissions: Mutex::new(HashMap::new()),
            behind_nat: AtomicBool::new(behind_nat),
        }
    }

    pub fn servers(&self) -> &[IceServer] {
        &self.servers
    }

    pub async fn client(&self) -> Arc<TurnClient> {
        self.client.lock().await.clone()
    }

    pub fn is_behind_nat(&self) -> bool {
        self.behind_nat.load(Ordering::SeqCst)
    }

    /// Swap in a freshly allocated client. Outstanding permissions die with
    /// the old allocation and must be re-issued by the caller.
    pub async fn replace_client(&self, client: Arc<TurnClient>) {
        self.behind_nat.store(client.is_behind_nat(), Ordering::SeqCst);
        *self.client.lock().await = client;
        self.permissions.lock().await.clear();
    }

    /// Make sure a live permission exists for `peer` before an exchange.
    /// No-op when we are not behind NAT.
    pub async fn ensure_permission(
        &self,
        peer: &crate::identity::BoundPeer,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        if !self.is_behind_nat() {
            return Ok(());
        }

        let address = peer.address();
        let now = tokio::time::Instant::now();
        let fresh = {
            let permissions = self.permissions.lock().await;
            permissions.get(&address).is_some_and(|expiry| *expiry > now)
        };
        if fresh {
            return Ok(());
        }

        let client = self.client().await;
        let target = self.resolve_permission_target(&client, &peer.endpoint).await?;
        client.create_permission(target, cancel).await?;
        self.permissions
            .lock()
            .await
            .insert(address, now + PERMISSION_LIFETIME);
        debug!(peer = %address, target = %target, "TURN permission installed");
        Ok(())
    }

    /// Re-issue permissions for every peer currently known; run by the
    /// supervisor every `PERMISSION_LIFETIME − REFRESH_MARGIN`.
    pub async fn refresh_permissions(
        &self,
        peers: &[crate::identity::BoundPeer],
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let client = self.client().await;
        let now = tokio::time::Instant::now();
        for peer in peers {
            let target = match self.resolve_permission_target(&client, &peer.endpoint).await {
                Ok(target) => target,
                Err(e) => {
                    debug!(peer = %peer.address(), error = %e, "skipping unresolvable peer");
                    continue;
                }
            };
            match client.create_permission(target, cancel).await {
                Ok(()) => {
                    self.permissions
                        .lock()
                        .await
                        .insert(peer.address(), now + PERMISSION_LIFETIME);
                }
                Err(e @ (TransportError::Socket(_) | TransportError::Cancelled)) => return Err(e),
                Err(e) => {
                    warn!(peer = %peer.address(), error = %e, "permission refresh rejected");
                }
            }
        }
        Ok(())
    }

    /// Resolve a peer endpoint to the socket address a permission should
    /// name. Loopback endpoints (in-process test fixtures) are substituted
    /// with the TURN-mapped address, which is what the relay actually sees.
    async fn resolve_permission_target(
        &self,
        client: &TurnClient,
        endpoint: &crate::identity::Endpoint,
    ) -> Result<SocketAddr, TransportError> {
        let mut addrs =
            tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port)).await?;
        let addr = addrs.next().ok_or_else(|| {
            TransportError::Socket(format!("unresolvable host {}", endpoint.host))
        })?;
        if addr.ip().is_loopback() {
            return Ok(client.mapped_address());
        }
        Ok(addr)
    }
}
