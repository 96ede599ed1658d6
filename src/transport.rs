//! # Transport Supervisor
//!
//! The public face of the crate: wires the router socket, dealer pool,
//! dispatcher, TURN client, and Kademlia protocol together and owns their
//! lifecycle.
//!
//! ## Lifecycle
//!
//! `Created → Started → Running → Stopped`.
//!
//! - [`Transport::start`] binds the router socket, establishes the TURN
//!   allocation when no host is configured, spawns the dispatch workers and
//!   the reply-queue consumer, and wires the first-reply feed into the
//!   discovery protocol.
//! - [`Transport::run`] flips Running and supervises four tasks: the table
//!   refresh (10 s), the connection rebuild (immediately, then every 30 min),
//!   the router poller, and the broadcast poller. The first task to finish
//!   ends `run`; a task failure is returned as the error.
//! - [`Transport::stop`] cancels the worker pool, waits `wait_for` for
//!   in-flight exchanges to drain, then tears down pollers, queues, router,
//!   TURN client, and dealers.
//!
//! Inbound dispatch order: codec parse → version gate (Pings exempt) →
//! discovery protocol → host message handler. A failure in one message is
//! logged and the drain loop moves on.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{Frame, Message, MessageBody, MessageCodec, MessageKindRegistry, RouterIdentity};
use crate::dealer::DealerPool;
use crate::dispatcher::{Direction, Dispatcher, HistoryEntry, MessageHistory};
use crate::error::TransportError;
use crate::identity::{BoundPeer, Endpoint, Peer, PeerAddress, PrivateKey, PublicKey};
use crate::kademlia::{
    DEFAULT_BUCKET_SIZE, DEFAULT_FIND_DEPTH, DEFAULT_TABLE_SIZE, KademliaProtocol, RoutingTable,
};
use crate::protocols::Messenger;
use crate::router::RouterSocket;
use crate::turn::{
    DEFAULT_ALLOCATION_LIFETIME, IceServer, PERMISSION_LIFETIME, REFRESH_MARGIN, TurnClient,
    TurnState,
};
use crate::version::{AppProtocolVersion, DifferentVersionHook, VersionGate};

/// Cadence of the routing table refresh task.
const TABLE_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Peers and buckets idle longer than this are refreshed.
const TABLE_REFRESH_MAX_AGE: Duration = Duration::from_secs(60);

/// Per-ping deadline used by the refresh task.
const TABLE_REFRESH_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence of the connection rebuild task. The first rebuild runs
/// immediately when `run` starts.
const REBUILD_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Deadline for fire-and-forget sends.
const FIRE_AND_FORGET_TIMEOUT: Duration = Duration::from_secs(3);

/// Poll floor for the TURN allocation maintenance loop.
const TURN_MAINTENANCE_TICK: Duration = Duration::from_secs(5);

/// Host callback receiving every validated inbound message.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Created,
    Started,
    Running,
    Stopped,
}

/// Constructor inputs for [`Transport`]. Callbacks are captured immutably at
/// construction; the "arbitrary" send deadlines are exposed here so hosts
/// can tune them.
pub struct TransportConfig {
    pub private_key: PrivateKey,
    pub app_protocol_version: AppProtocolVersion,
    pub trusted_version_signers: HashSet<PublicKey>,
    pub table_size: usize,
    pub bucket_size: usize,
    /// Dispatcher worker pool size.
    pub workers: usize,
    /// Advertised host. When absent, TURN is required and `ice_servers` must
    /// be non-empty.
    pub host: Option<String>,
    /// Router listen port; `None` picks a free ephemeral port.
    pub listen_port: Option<u16>,
    pub ice_servers: Vec<IceServer>,
    pub on_different_version: DifferentVersionHook,
    pub on_message: MessageHandler,
    pub message_kinds: MessageKindRegistry,
    pub broadcast_send_timeout: Duration,
    pub reply_send_timeout: Duration,
}

impl TransportConfig {
    pub fn new(private_key: PrivateKey, app_protocol_version: AppProtocolVersion) -> Self {
        Self {
            private_key,
            app_protocol_version,
            trusted_version_signers: HashSet::new(),
            table_size: DEFAULT_TABLE_SIZE,
            bucket_size: DEFAULT_BUCKET_SIZE,
            workers: 5,
            host: None,
            listen_port: None,
            ice_servers: Vec::new(),
            on_different_version: Arc::new(|_, _, _| false),
            on_message: Arc::new(|_| {}),
            message_kinds: MessageKindRegistry::new(),
            broadcast_send_timeout: Duration::from_secs(3),
            reply_send_timeout: Duration::from_secs(1),
        }
    }
}

struct Inner {
    router: Arc<RouterSocket>,
    pool: Arc<DealerPool>,
    dispatcher: Arc<Dispatcher>,
    kademlia: KademliaProtocol<Dispatcher>,
    table: Arc<RwLock<RoutingTable>>,
    turn: Option<Arc<TurnState>>,
    as_peer: BoundPeer,
    /// Cancels the dispatch worker pool; fired first during `stop`.
    worker_cancel: CancellationToken,
    /// Cancels pollers, the router, and TURN maintenance.
    tasks_cancel: CancellationToken,
    inbound: Mutex<Option<mpsc::Receiver<(RouterIdentity, Vec<Frame>)>>>,
}

pub struct Transport {
    config: TransportConfig,
    codec: Arc<MessageCodec>,
    gate: Arc<VersionGate>,
    history: Arc<MessageHistory>,
    state: std::sync::Mutex<State>,
    running_tx: watch::Sender<bool>,
    root_cancel: CancellationToken,
    inner: tokio::sync::RwLock<Option<Arc<Inner>>>,
}

impl Transport {
    pub fn new(mut config: TransportConfig) -> Arc<Self> {
        let registry = Arc::new(std::mem::take(&mut config.message_kinds));
        let codec = Arc::new(MessageCodec::new(config.private_key.clone(), registry));
        let gate = Arc::new(VersionGate::new(
            config.app_protocol_version.clone(),
            config.trusted_version_signers.clone(),
            config.on_different_version.clone(),
        ));
        let (running_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            codec,
            gate,
            history: Arc::new(MessageHistory::new()),
            state: std::sync::Mutex::new(State::Created),
            running_tx,
            root_cancel: CancellationToken::new(),
            inner: tokio::sync::RwLock::new(None),
        })
    }

    /// Our own address, derived from the configured key.
    pub fn local_address(&self) -> PeerAddress {
        self.config.private_key.address()
    }

    /// Bind sockets and prepare the machinery. Fails with `AlreadyRunning`
    /// when re-entered.
    pub async fn start(&self) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().expect("state lock");
            match *state {
                State::Created => *state = State::Started,
                State::Started | State::Running => return Err(TransportError::AlreadyRunning),
                State::Stopped => {
                    return Err(TransportError::Unexpected(
                        "transport was stopped and cannot be restarted".into(),
                    ));
                }
            }
        }

        let tasks_cancel = self.root_cancel.child_token();
        let worker_cancel = self.root_cancel.child_token();

        let bind_ip: IpAddr = "0.0.0.0".parse().expect("static address");
        let router = RouterSocket::bind(
            bind_ip,
            self.config.listen_port.unwrap_or(0),
            tasks_cancel.child_token(),
        )
        .await?;
        let listen_port = router.local_addr().port();

        // Advertised endpoint: the configured host, or the TURN relayed
        // address when the node has no reachable address of its own.
        let (turn, endpoint, public_ip) = match &self.config.host {
            Some(host) => (None, Endpoint::new(host.clone(), listen_port), None),
            None => {
                if self.config.ice_servers.is_empty() {
                    self.reset_to_created();
                    return Err(TransportError::Unexpected(
                        "either a host or at least one TURN server is required".into(),
                    ));
                }
                let client = match TurnClient::select(&self.config.ice_servers).await {
                    Ok(client) => client,
                    Err(e) => {
                        self.reset_to_created();
                        return Err(e);
                    }
                };
                let relayed = client.relayed_address();
                let mapped = client.mapped_address();
                let state = Arc::new(TurnState::new(self.config.ice_servers.clone(), client));
                (
                    Some(state),
                    Endpoint::new(relayed.ip().to_string(), relayed.port()),
                    Some(mapped.ip()),
                )
            }
        };

        let mut our_peer = Peer::new(
            self.config.private_key.public_key(),
            self.config.app_protocol_version.clone(),
        );
        our_peer.public_ip = public_ip;
        let as_peer = BoundPeer::new(our_peer, endpoint);
        info!(
            address = %as_peer.address(),
            endpoint = %as_peer.endpoint,
            nat = turn.as_ref().map(|t| t.is_behind_nat()).unwrap_or(false),
            "transport starting"
        );

        let table = Arc::new(RwLock::new(RoutingTable::new(
            as_peer.address(),
            self.config.table_size,
            self.config.bucket_size,
        )));
        let pool = Arc::new(DealerPool::new(self.config.broadcast_send_timeout));

        let (dispatcher, first_reply_rx) = Dispatcher::new(
            self.codec.clone(),
            self.gate.clone(),
            as_peer.clone(),
            table.clone(),
            pool.clone(),
            router.clone(),
            turn.clone(),
            self.history.clone(),
            self.config.reply_send_timeout,
            worker_cancel.clone(),
        );
        dispatcher.spawn_workers(self.config.workers);

        let kademlia = KademliaProtocol::new(table.clone(), dispatcher.clone());

        // First reply of every exchange feeds the discovery protocol.
        {
            let kademlia = kademlia.clone();
            let mut first_reply_rx = first_reply_rx;
            tokio::spawn(async move {
                while let Some(message) = first_reply_rx.recv().await {
                    if let Err(e) = kademlia.receive_message(&message).await {
                        debug!(error = %e, "first-reply processing failed");
                    }
                }
            });
        }

        // The reply queue drains from start onward so inbound requests can be
        // answered before `run` is entered.
        tokio::spawn(dispatcher.clone().run_reply_consumer(tasks_cancel.child_token()));

        if let Some(turn_state) = &turn {
            self.spawn_turn_maintenance(
                turn_state.clone(),
                table.clone(),
                listen_port,
                tasks_cancel.child_token(),
            );
        }

        let inbound = router.take_inbound().await;
        let inner = Arc::new(Inner {
            router,
            pool,
            dispatcher,
            kademlia,
            table,
            turn,
            as_peer,
            worker_cancel,
            tasks_cancel,
            inbound: Mutex::new(inbound),
        });
        *self.inner.write().await = Some(inner);
        Ok(())
    }

    fn reset_to_created(&self) {
        *self.state.lock().expect("state lock") = State::Created;
    }

    /// Supervise the transport until stopped or a supervised task fails.
    pub async fn run(&self) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().expect("state lock");
            match *state {
                State::Started => *state = State::Running,
                State::Running => return Err(TransportError::AlreadyRunning),
                State::Created | State::Stopped => return Err(TransportError::NoSwarmContext),
            }
        }
        let inner = self
            .inner
            .read()
            .await
            .clone()
            .ok_or(TransportError::NoSwarmContext)?;

        let mut inbound = inner
            .inbound
            .lock()
            .await
            .take()
            .ok_or(TransportError::AlreadyRunning)?;

        let _ = self.running_tx.send(true);
        info!(endpoint = %inner.as_peer.endpoint, "transport running");

        let cancel = inner.tasks_cancel.clone();
        let mut supervised: JoinSet<Result<(), TransportError>> = JoinSet::new();

        // 1. Table refresh: stale peers and buckets, replacement cache, and
        //    the dealer sweep keeping the pool consistent with the table.
        {
            let kademlia = inner.kademlia.clone();
            let table = inner.table.clone();
            let pool = inner.pool.clone();
            let cancel = cancel.clone();
            supervised.spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = sleep(TABLE_REFRESH_INTERVAL) => {}
                    }
                    kademlia
                        .refresh_table(
                            TABLE_REFRESH_MAX_AGE,
                            Some(TABLE_REFRESH_PING_TIMEOUT),
                            cancel.clone(),
                        )
                        .await?;
                    kademlia
                        .check_replacement_cache(Some(TABLE_REFRESH_PING_TIMEOUT), cancel.clone())
                        .await?;
                    let live: HashSet<PeerAddress> = {
                        let table = table.read().expect("routing table lock");
                        table.peers().iter().map(|p| p.address()).collect()
                    };
                    let swept = pool.sweep(&live).await;
                    if swept > 0 {
                        trace!(swept, "dealer sweep");
                    }
                }
            });
        }

        // 2. Connection rebuild: immediately on entry, then periodically.
        {
            let kademlia = inner.kademlia.clone();
            let cancel = cancel.clone();
            supervised.spawn(async move {
                loop {
                    kademlia
                        .rebuild_connection(
                            DEFAULT_FIND_DEPTH,
                            Some(TABLE_REFRESH_PING_TIMEOUT),
                            cancel.clone(),
                        )
                        .await?;
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = sleep(REBUILD_INTERVAL) => {}
                    }
                }
            });
        }

        // 3. Router poller: drain inbound messages; a bad message never
        //    stops the loop.
        {
            let codec = self.codec.clone();
            let gate = self.gate.clone();
            let history = self.history.clone();
            let kademlia = inner.kademlia.clone();
            let on_message = self.config.on_message.clone();
            let cancel = cancel.clone();
            supervised.spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        next = inbound.recv() => next,
                    };
                    let Some((identity, frames)) = next else {
                        return Err(TransportError::Socket("router inbound closed".into()));
                    };
                    if let Err(e) = handle_inbound(
                        &codec,
                        &gate,
                        &history,
                        &kademlia,
                        &on_message,
                        identity,
                        frames,
                    )
                    .await
                    {
                        debug!(error = %e, "inbound message dropped");
                    }
                }
            });
        }

        // 4. Broadcast poller.
        {
            let dispatcher = inner.dispatcher.clone();
            let cancel = cancel.clone();
            supervised.spawn(async move {
                match dispatcher.run_broadcast_consumer(cancel).await {
                    Err(TransportError::Cancelled) | Ok(()) => Ok(()),
                    Err(e) => Err(e),
                }
            });
        }

        // The first supervised task to complete ends `run`; its error is ours.
        let outcome = match supervised.join_next().await {
            Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(TransportError::Cancelled))) => Ok(()),
            Some(Ok(Err(e))) => Err(e),
            Some(Err(join_err)) => Err(TransportError::Unexpected(format!(
                "supervised task panicked: {join_err}"
            ))),
            None => Ok(()),
        };
        supervised.abort_all();
        let _ = self.running_tx.send(false);
        if let Err(e) = &outcome {
            warn!(error = %e, "transport run ended with failure");
        }
        outcome
    }

    /// Resolves once `run` has flipped the transport into Running.
    pub async fn wait_for_running(&self) {
        let mut rx = self.running_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Cancel workers, drain for `wait_for`, then tear everything down.
    pub async fn stop(&self, wait_for: Duration) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().expect("state lock");
            if *state == State::Stopped {
                return Ok(());
            }
            *state = State::Stopped;
        }

        let inner = self.inner.write().await.take();
        if let Some(inner) = inner {
            inner.worker_cancel.cancel();
            sleep(wait_for).await;
            let _ = self.running_tx.send(false);
            inner.tasks_cancel.cancel();
            inner.router.dispose();
            inner.pool.dispose_all();
            // TURN client and queues drop with `inner`.
            info!("transport stopped");
        }
        Ok(())
    }

    /// Terminal teardown; safe to call at any point.
    pub async fn dispose(&self) {
        let _ = self.stop(Duration::ZERO).await;
        self.root_cancel.cancel();
    }

    // ------------------------------------------------------------------
    // Peer-facing operations
    // ------------------------------------------------------------------

    /// Our bound peer record as advertised to others.
    pub async fn as_peer(&self) -> Result<BoundPeer, TransportError> {
        Ok(self.inner().await?.as_peer.clone())
    }

    pub async fn bootstrap(
        &self,
        seeds: &[BoundPeer],
        ping_timeout: Option<Duration>,
        find_timeout: Option<Duration>,
        depth: usize,
    ) -> Result<(), TransportError> {
        let inner = self.inner().await?;
        inner
            .kademlia
            .bootstrap(
                seeds,
                ping_timeout,
                find_timeout,
                depth,
                self.root_cancel.child_token(),
            )
            .await
    }

    pub async fn add_peers(
        &self,
        peers: &[BoundPeer],
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        let inner = self.inner().await?;
        inner
            .kademlia
            .add_peers(peers, timeout, self.root_cancel.child_token())
            .await
    }

    pub async fn find_specific_peer(
        &self,
        target: Option<PeerAddress>,
        search_address: PeerAddress,
        depth: usize,
        via: Option<BoundPeer>,
        timeout: Option<Duration>,
    ) -> Result<Option<BoundPeer>, TransportError> {
        let inner = self.inner().await?;
        inner
            .kademlia
            .find_specific_peer(
                target,
                via,
                depth,
                search_address,
                timeout,
                self.root_cancel.child_token(),
            )
            .await
    }

    /// Fire-and-forget send with the fixed 3 s deadline.
    pub async fn send_message(
        &self,
        peer: &BoundPeer,
        body: MessageBody,
    ) -> Result<(), TransportError> {
        let inner = self.inner().await?;
        inner
            .dispatcher
            .send_with_reply(
                peer,
                body,
                Some(FIRE_AND_FORGET_TIMEOUT),
                0,
                self.root_cancel.child_token(),
            )
            .await
            .map(|_| ())
    }

    /// Request/reply exchange expecting a single reply.
    pub async fn send_message_with_reply(
        &self,
        peer: &BoundPeer,
        body: MessageBody,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Message, TransportError> {
        let replies = self
            .send_message_with_replies(peer, body, timeout, 1, cancel)
            .await?;
        replies
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::InvalidMessage("empty reply set".into()))
    }

    /// Request/reply exchange expecting `expected_responses` replies.
    pub async fn send_message_with_replies(
        &self,
        peer: &BoundPeer,
        body: MessageBody,
        timeout: Option<Duration>,
        expected_responses: usize,
        cancel: CancellationToken,
    ) -> Result<Vec<Message>, TransportError> {
        let inner = self.inner().await?;
        inner
            .dispatcher
            .send_with_reply(peer, body, timeout, expected_responses, cancel)
            .await
    }

    /// Queue a broadcast to the routing table's coverage sample, excluding
    /// `except`.
    pub async fn broadcast_message(
        &self,
        except: Option<PeerAddress>,
        body: MessageBody,
    ) -> Result<(), TransportError> {
        let inner = self.inner().await?;
        inner.dispatcher.broadcast(except, body).await
    }

    /// Queue a reply to an inbound `request` message.
    pub async fn reply_message(
        &self,
        request: &Message,
        body: MessageBody,
    ) -> Result<(), TransportError> {
        let identity = request.identity.clone().ok_or_else(|| {
            TransportError::InvalidMessage("message carries no reply identity".into())
        })?;
        let inner = self.inner().await?;
        inner.dispatcher.reply(identity, body).await
    }

    /// Ping every known peer, evicting the unresponsive.
    pub async fn check_all_peers(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        let inner = self.inner().await?;
        inner
            .kademlia
            .refresh_table(Duration::ZERO, timeout, self.root_cancel.child_token())
            .await
    }

    /// Routing table snapshot.
    pub async fn peers(&self) -> Result<Vec<BoundPeer>, TransportError> {
        Ok(self.inner().await?.kademlia.peers())
    }

    /// Human-readable routing table dump.
    pub async fn trace(&self) -> Result<String, TransportError> {
        Ok(self.inner().await?.kademlia.trace())
    }

    /// Recent send/receive history (bounded ring).
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.snapshot()
    }

    /// Live outbound dealers in the broadcast pool.
    pub async fn dealer_count(&self) -> usize {
        match self.inner.read().await.as_ref() {
            Some(inner) => inner.pool.len().await,
            None => 0,
        }
    }

    /// Requests currently queued or executing.
    pub async fn in_flight(&self) -> u64 {
        match self.inner.read().await.as_ref() {
            Some(inner) => inner.dispatcher.in_flight(),
            None => 0,
        }
    }

    /// The router's actual listen port (useful with ephemeral ports).
    pub async fn listen_port(&self) -> Result<u16, TransportError> {
        Ok(self.inner().await?.router.local_addr().port())
    }

    async fn inner(&self) -> Result<Arc<Inner>, TransportError> {
        if !*self.running_tx.borrow() {
            return Err(TransportError::NoSwarmContext);
        }
        self.inner
            .read()
            .await
            .clone()
            .ok_or(TransportError::NoSwarmContext)
    }

    // ------------------------------------------------------------------
    // TURN maintenance
    // ------------------------------------------------------------------

    /// Three loops keep the relay path alive: proxy binding for inbound data
    /// connections, allocation refresh (strictly one minute before expiry,
    /// with client re-creation on socket failure), and permission re-issue
    /// for every known peer.
    fn spawn_turn_maintenance(
        &self,
        turn: Arc<TurnState>,
        table: Arc<RwLock<RoutingTable>>,
        listen_port: u16,
        cancel: CancellationToken,
    ) {
        // Proxy binder for the initial client.
        {
            let turn = turn.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let client = turn.client().await;
                if let Err(e) = client.bind_proxies(listen_port, cancel).await {
                    debug!(error = %e, "relay proxy binder ended");
                }
            });
        }

        // Allocation refresh and re-creation.
        {
            let turn = turn.clone();
            let table = table.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut next_refresh = {
                    let client = turn.client().await;
                    Instant::now() + client.granted_lifetime().await.saturating_sub(REFRESH_MARGIN)
                };
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(TURN_MAINTENANCE_TICK) => {}
                    }

                    let client = turn.client().await;
                    if client.is_broken() {
                        if let Some(deadline) =
                            recreate_turn_client(&turn, &table, listen_port, &cancel).await
                        {
                            next_refresh = deadline;
                        }
                        continue;
                    }
                    if Instant::now() < next_refresh {
                        continue;
                    }

                    match client.refresh(DEFAULT_ALLOCATION_LIFETIME).await {
                        Ok(granted) => {
                            next_refresh = Instant::now() + granted.saturating_sub(REFRESH_MARGIN);
                        }
                        Err(TransportError::Socket(e)) => {
                            warn!(error = %e, "TURN refresh hit a socket error, re-creating client");
                            if let Some(deadline) =
                                recreate_turn_client(&turn, &table, listen_port, &cancel).await
                            {
                                next_refresh = deadline;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "TURN refresh failed, retrying shortly");
                            next_refresh = Instant::now() + TURN_MAINTENANCE_TICK;
                        }
                    }
                }
            });
        }

        // Permission re-issue, one minute before the five-minute expiry.
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let interval = PERMISSION_LIFETIME.saturating_sub(REFRESH_MARGIN);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(interval) => {}
                    }
                    let peers = {
                        let table = table.read().expect("routing table lock");
                        table.peers()
                    };
                    if peers.is_empty() {
                        continue;
                    }
                    match turn.refresh_permissions(&peers, &cancel).await {
                        Ok(()) => trace!(peers = peers.len(), "TURN permissions refreshed"),
                        Err(TransportError::Cancelled) => return,
                        Err(e) => warn!(error = %e, "TURN permission refresh failed"),
                    }
                }
            });
        }
    }
}

/// Re-select a TURN server, swap the client in, re-issue permissions, and
/// re-bind the proxy listener. Returns the next refresh deadline on success.
async fn recreate_turn_client(
    turn: &Arc<TurnState>,
    table: &Arc<RwLock<RoutingTable>>,
    listen_port: u16,
    cancel: &CancellationToken,
) -> Option<Instant> {
    match TurnClient::select(turn.servers()).await {
        Ok(client) => {
            let granted = client.granted_lifetime().await;
            turn.replace_client(client.clone()).await;
            info!(relayed = %client.relayed_address(), "TURN client re-created");

            let peers = {
                let table = table.read().expect("routing table lock");
                table.peers()
            };
            if !peers.is_empty()
                && let Err(e) = turn.refresh_permissions(&peers, cancel).await
            {
                warn!(error = %e, "permission re-issue after re-creation failed");
            }

            {
                let turn = turn.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let client = turn.client().await;
                    if let Err(e) = client.bind_proxies(listen_port, cancel).await {
                        debug!(error = %e, "relay proxy binder ended");
                    }
                });
            }
            Some(Instant::now() + granted.saturating_sub(REFRESH_MARGIN))
        }
        Err(e) => {
            warn!(error = %e, "TURN re-creation failed, will retry");
            None
        }
    }
}

/// One inbound message through codec → gate → protocol → host handler.
async fn handle_inbound(
    codec: &MessageCodec,
    gate: &VersionGate,
    history: &MessageHistory,
    kademlia: &KademliaProtocol<Dispatcher>,
    on_message: &MessageHandler,
    identity: RouterIdentity,
    frames: Vec<Frame>,
) -> Result<(), TransportError> {
    // Reassemble the full router frame sequence: identity first.
    let mut full = Vec::with_capacity(frames.len() + 1);
    full.push(identity.0.clone());
    full.extend(frames);
    let message = codec.decode(&full, true)?;

    // Liveness probes pass the gate unexamined so nodes of unknown versions
    // can still be discovered.
    if !message.body.is_ping() {
        gate.validate_sender(&message.remote.peer)?;
    }

    history.record(
        Direction::Received,
        message.remote.address(),
        message.body.label(),
    );
    trace!(
        from = %message.remote.address(),
        body = %message.body.label(),
        "inbound message"
    );

    kademlia.receive_message(&message).await?;

    // Liveness probes stay inside the transport; everything that passed the
    // gate is the host's to see.
    if !message.body.is_ping() {
        (on_message)(message);
    }
    Ok(())
}
