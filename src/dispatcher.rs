//! # Request Dispatcher
//!
//! Outbound request/reply exchanges run through an unbounded queue consumed
//! by a fixed pool of workers. Each exchange opens a dedicated short-lived
//! dealer socket: reply frames correlate by receive order on that socket, so
//! no in-flight correlation map is needed.
//!
//! Worker failure policy: any error except cancellation re-enqueues the
//! request after 100 ms while `retry_count < 10`; cancellation resolves the
//! caller immediately and never retries. The caller's completion handle
//! resolves exactly once, when the exchange succeeds, is cancelled, or
//! exhausts its retries.
//!
//! Broadcast and reply traffic flow through two dedicated single-consumer
//! queues. The broadcast consumer computes its recipient set from the
//! routing table at send time; the reply consumer routes by the identity
//! token embedded in the request and logs (never retries) failures.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::{Frame, Message, MessageBody, MessageCodec, RouterIdentity};
use crate::dealer::{DealerPool, DealerSocket};
use crate::error::TransportError;
use crate::identity::{BoundPeer, PeerAddress};
use crate::kademlia::RoutingTable;
use crate::protocols::Messenger;
use crate::router::RouterSocket;
use crate::turn::TurnState;
use crate::version::VersionGate;

/// Retry cap per request; exceeding it discards the request with its last
/// error.
pub const MAX_RETRIES: u32 = 10;

/// Pause before a failed request is re-enqueued.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Depth of the broadcast and reply queues.
const QUEUE_SIZE: usize = 256;

/// Entries kept in the diagnostic message history ring.
const HISTORY_CAPACITY: usize = 30;

type Completion = oneshot::Sender<Result<Vec<Message>, TransportError>>;

/// One queued request/reply exchange.
struct MessageRequest {
    id: u64,
    body: MessageBody,
    peer: BoundPeer,
    requested_at: Instant,
    timeout: Option<Duration>,
    expected_responses: usize,
    completion: Completion,
    cancel: CancellationToken,
    retry_count: u32,
}

struct BroadcastJob {
    except: Option<PeerAddress>,
    body: MessageBody,
}

struct ReplyJob {
    identity: RouterIdentity,
    body: MessageBody,
}

// ============================================================================
// Message history (diagnostics)
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Clone, Debug)]
pub struct HistoryEntry {
    pub direction: Direction,
    pub peer: PeerAddress,
    pub label: String,
    pub at: SystemTime,
}

/// Fixed-size ring of recently sent/received messages; overflow drops the
/// oldest entry.
pub struct MessageHistory {
    entries: std::sync::Mutex<VecDeque<HistoryEntry>>,
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageHistory {
    pub fn new() -> Self {
        Self {
            entries: std::sync::Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    pub fn record(&self, direction: Direction, peer: PeerAddress, label: String) {
        let mut entries = self.entries.lock().expect("history lock");
        if entries.len() == HISTORY_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(HistoryEntry {
            direction,
            peer,
            label,
            at: SystemTime::now(),
        });
    }

    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.lock().expect("history lock").iter().cloned().collect()
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct Dispatcher {
    codec: Arc<MessageCodec>,
    gate: Arc<VersionGate>,
    as_peer: BoundPeer,
    table: Arc<RwLock<RoutingTable>>,
    pool: Arc<DealerPool>,
    router: Arc<RouterSocket>,
    turn: Option<Arc<TurnState>>,
    history: Arc<MessageHistory>,

    request_tx: mpsc::UnboundedSender<MessageRequest>,
    request_rx: Mutex<mpsc::UnboundedReceiver<MessageRequest>>,
    broadcast_tx: mpsc::Sender<BroadcastJob>,
    broadcast_rx: Mutex<Option<mpsc::Receiver<BroadcastJob>>>,
    reply_tx: mpsc::Sender<ReplyJob>,
    reply_rx: Mutex<Option<mpsc::Receiver<ReplyJob>>>,

    /// First reply of every exchange, forwarded to the discovery protocol.
    first_reply_tx: mpsc::UnboundedSender<Message>,

    in_flight: AtomicU64,
    next_id: AtomicU64,
    reply_send_timeout: Duration,
    worker_cancel: CancellationToken,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        codec: Arc<MessageCodec>,
        gate: Arc<VersionGate>,
        as_peer: BoundPeer,
        table: Arc<RwLock<RoutingTable>>,
        pool: Arc<DealerPool>,
        router: Arc<RouterSocket>,
        turn: Option<Arc<TurnState>>,
        history: Arc<MessageHistory>,
        reply_send_timeout: Duration,
        worker_cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(QUEUE_SIZE);
        let (reply_tx, reply_rx) = mpsc::channel(QUEUE_SIZE);
        let (first_reply_tx, first_reply_rx) = mpsc::unbounded_channel();

        let dispatcher = Arc::new(Self {
            codec,
            gate,
            as_peer,
            table,
            pool,
            router,
            turn,
            history,
            request_tx,
            request_rx: Mutex::new(request_rx),
            broadcast_tx,
            broadcast_rx: Mutex::new(Some(broadcast_rx)),
            reply_tx,
            reply_rx: Mutex::new(Some(reply_rx)),
            first_reply_tx,
            in_flight: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            reply_send_timeout,
            worker_cancel,
        });
        (dispatcher, first_reply_rx)
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Launch the fixed worker pool.
    pub fn spawn_workers(self: &Arc<Self>, workers: usize) {
        for worker in 0..workers.max(1) {
            let this = self.clone();
            tokio::spawn(async move {
                this.worker_loop(worker).await;
            });
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        loop {
            let request = {
                let mut rx = self.request_rx.lock().await;
                tokio::select! {
                    _ = self.worker_cancel.cancelled() => None,
                    request = rx.recv() => request,
                }
            };
            let Some(request) = request else {
                trace!(worker, "dispatch worker stopping");
                break;
            };
            Self::process(&self, request).await;
        }
    }

    async fn process(self: &Arc<Self>, request: MessageRequest) {
        let result = tokio::select! {
            _ = request.cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.execute(&request) => result,
        };

        match result {
            Ok(replies) => {
                trace!(
                    id = request.id,
                    peer = %request.peer.address(),
                    replies = replies.len(),
                    elapsed_ms = request.requested_at.elapsed().as_millis(),
                    "request completed"
                );
                self.resolve(request, Ok(replies));
            }
            Err(TransportError::Cancelled) => {
                debug!(id = request.id, "request cancelled");
                self.resolve(request, Err(TransportError::Cancelled));
            }
            Err(e) if e.is_retryable() && request.retry_count < MAX_RETRIES => {
                debug!(
                    id = request.id,
                    peer = %request.peer.address(),
                    retry = request.retry_count + 1,
                    error = %e,
                    "request failed, re-enqueueing"
                );
                let this = self.clone();
                let retried = MessageRequest {
                    retry_count: request.retry_count + 1,
                    ..request
                };
                tokio::spawn(async move {
                    sleep(RETRY_DELAY).await;
                    if let Err(send_err) = this.request_tx.send(retried) {
                        // Queue closed mid-retry; the transport is stopping.
                        this.resolve(send_err.0, Err(TransportError::Cancelled));
                    }
                });
            }
            Err(e) => {
                warn!(
                    id = request.id,
                    peer = %request.peer.address(),
                    retries = request.retry_count,
                    error = %e,
                    "request discarded after exhausting retries"
                );
                self.resolve(request, Err(e));
            }
        }
    }

    fn resolve(&self, request: MessageRequest, result: Result<Vec<Message>, TransportError>) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let _ = request.completion.send(result);
    }

    /// One exchange attempt on a dedicated dealer.
    async fn execute(&self, request: &MessageRequest) -> Result<Vec<Message>, TransportError> {
        if let Some(turn) = &self.turn {
            turn.ensure_permission(&request.peer, &request.cancel).await?;
        }

        let frames = self.codec.encode(&request.body, &self.as_peer, None)?;

        let mut dealer = with_timeout(
            request.timeout,
            DealerSocket::connect(&request.peer.endpoint),
        )
        .await?;
        with_timeout(request.timeout, dealer.send(&frames)).await?;
        self.history.record(
            Direction::Sent,
            request.peer.address(),
            request.body.label(),
        );

        let mut replies = Vec::with_capacity(request.expected_responses);
        for nth in 0..request.expected_responses {
            let reply_frames = with_timeout(request.timeout, dealer.recv()).await?;
            let message = self.codec.decode(&reply_frames, false)?;
            self.gate.validate_sender(&message.remote.peer)?;
            self.history.record(
                Direction::Received,
                message.remote.address(),
                message.body.label(),
            );
            if nth == 0 {
                let _ = self.first_reply_tx.send(message.clone());
            }
            replies.push(message);
        }
        Ok(replies)
    }

    // ------------------------------------------------------------------
    // Queue consumers (spawned by the supervisor)
    // ------------------------------------------------------------------

    /// Single consumer of the broadcast queue: computes the recipient set
    /// from the routing table and fans out through the dealer pool.
    pub async fn run_broadcast_consumer(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let mut rx = self
            .broadcast_rx
            .lock()
            .await
            .take()
            .ok_or(TransportError::AlreadyRunning)?;

        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                job = rx.recv() => job,
            };
            let Some(job) = job else { return Ok(()) };

            let recipients = {
                self.table
                    .read()
                    .expect("routing table lock")
                    .peers_to_broadcast(job.except)
            };
            if recipients.is_empty() {
                trace!(body = %job.body.label(), "broadcast with no recipients");
                continue;
            }

            let frames = match self.codec.encode(&job.body, &self.as_peer, None) {
                Ok(frames) => Arc::new(frames),
                Err(e) => {
                    warn!(error = %e, "broadcast message failed to encode");
                    continue;
                }
            };

            debug!(
                body = %job.body.label(),
                recipients = recipients.len(),
                "broadcasting"
            );
            let mut join_set = JoinSet::new();
            for peer in recipients {
                let pool = self.pool.clone();
                let frames = frames.clone();
                join_set.spawn(async move {
                    if let Err(e) = pool.send_to(&peer, &frames).await {
                        debug!(peer = %peer.address(), error = %e, "broadcast send failed");
                    }
                });
            }
            while join_set.join_next().await.is_some() {}
            self.history
                .record(Direction::Sent, self.as_peer.address(), job.body.label());
        }
    }

    /// Single consumer of the reply queue: routes each reply back through
    /// the router by its identity token. Failures are logged, never retried.
    pub async fn run_reply_consumer(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let mut rx = self
            .reply_rx
            .lock()
            .await
            .take()
            .ok_or(TransportError::AlreadyRunning)?;

        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                job = rx.recv() => job,
            };
            let Some(job) = job else { return Ok(()) };

            let frames: Vec<Frame> =
                match self
                    .codec
                    .encode(&job.body, &self.as_peer, Some(&job.identity))
                {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!(error = %e, "reply failed to encode");
                        continue;
                    }
                };

            match timeout(self.reply_send_timeout, self.router.send_to(frames)).await {
                Ok(Ok(())) => {
                    self.history.record(
                        Direction::Sent,
                        self.as_peer.address(),
                        job.body.label(),
                    );
                }
                Ok(Err(e)) => debug!(error = %e, "reply send failed"),
                Err(_) => debug!("reply send timed out"),
            }
        }
    }

    /// Compose a caller token with the worker-pool root: the returned token
    /// fires on either. The forwarding task parks until the composed token
    /// fires, so every exchange must cancel it on completion — otherwise a
    /// busy node accumulates one parked task and one registered child token
    /// per finished call. `send_with_reply` holds a drop guard for exactly
    /// that reason.
    fn compose_cancel(&self, caller: CancellationToken) -> CancellationToken {
        let composed = self.worker_cancel.child_token();
        let watched = composed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = caller.cancelled() => watched.cancel(),
                _ = watched.cancelled() => {}
            }
        });
        composed
    }
}

#[async_trait::async_trait]
impl Messenger for Dispatcher {
    async fn send_with_reply(
        &self,
        peer: &BoundPeer,
        body: MessageBody,
        timeout: Option<Duration>,
        expected_responses: usize,
        cancel: CancellationToken,
    ) -> Result<Vec<Message>, TransportError> {
        let cancel = self.compose_cancel(cancel);
        // Fires the composed token when this call resolves or its future is
        // dropped mid-flight: the watcher task exits and the child leaves
        // the root token's registry instead of lingering until `stop`.
        let _release = cancel.clone().drop_guard();
        let (completion, done) = oneshot::channel();
        let request = MessageRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            body,
            peer: peer.clone(),
            requested_at: Instant::now(),
            timeout,
            expected_responses,
            completion,
            cancel: cancel.clone(),
            retry_count: 0,
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        trace!(
            id = request.id,
            peer = %peer.address(),
            in_flight = self.in_flight(),
            "request enqueued"
        );
        if self.request_tx.send(request).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(TransportError::NoSwarmContext);
        }

        tokio::select! {
            result = done => result.unwrap_or(Err(TransportError::Cancelled)),
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
        }
    }

    async fn broadcast(
        &self,
        except: Option<PeerAddress>,
        body: MessageBody,
    ) -> Result<(), TransportError> {
        self.broadcast_tx
            .send(BroadcastJob { except, body })
            .await
            .map_err(|_| TransportError::NoSwarmContext)
    }

    async fn reply(
        &self,
        identity: RouterIdentity,
        body: MessageBody,
    ) -> Result<(), TransportError> {
        self.reply_tx
            .send(ReplyJob { identity, body })
            .await
            .map_err(|_| TransportError::NoSwarmContext)
    }
}

async fn with_timeout<T, E, F>(deadline: Option<Duration>, fut: F) -> Result<T, TransportError>
where
    E: Into<TransportError>,
    F: Future<Output = Result<T, E>>,
{
    match deadline {
        Some(deadline) => match timeout(deadline, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(TransportError::Timeout),
        },
        None => fut.await.map_err(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageKindRegistry;
    use crate::identity::{Endpoint, Peer, PrivateKey};
    use crate::kademlia::{DEFAULT_BUCKET_SIZE, DEFAULT_TABLE_SIZE};
    use crate::version::AppProtocolVersion;
    use std::collections::HashSet;
    use tokio::net::TcpListener;

    async fn make_dispatcher(
        worker_cancel: CancellationToken,
    ) -> (Arc<Dispatcher>, CancellationToken) {
        let key = PrivateKey::generate();
        let version = AppProtocolVersion::sign(&key, 1, Vec::new());
        let as_peer = BoundPeer::new(
            Peer::new(key.public_key(), version.clone()),
            Endpoint::new("127.0.0.1", 0),
        );
        let registry = Arc::new(MessageKindRegistry::new());
        let codec = Arc::new(MessageCodec::new(key, registry));
        let gate = Arc::new(VersionGate::new(
            version,
            HashSet::new(),
            Arc::new(|_, _, _| false),
        ));
        let table = Arc::new(RwLock::new(RoutingTable::new(
            as_peer.address(),
            DEFAULT_TABLE_SIZE,
            DEFAULT_BUCKET_SIZE,
        )));
        let pool = Arc::new(DealerPool::new(Duration::from_secs(3)));

        let router_cancel = CancellationToken::new();
        let router = RouterSocket::bind("127.0.0.1".parse().unwrap(), 0, router_cancel.clone())
            .await
            .expect("router bind");

        let (dispatcher, _first_replies) = Dispatcher::new(
            codec,
            gate,
            as_peer,
            table,
            pool,
            router,
            None,
            Arc::new(MessageHistory::new()),
            Duration::from_secs(1),
            worker_cancel,
        );
        dispatcher.spawn_workers(2);
        (dispatcher, router_cancel)
    }

    fn silent_peer(port: u16) -> BoundPeer {
        let key = PrivateKey::generate();
        let version = AppProtocolVersion::sign(&key, 1, Vec::new());
        BoundPeer::new(
            Peer::new(key.public_key(), version),
            Endpoint::new("127.0.0.1", port),
        )
    }

    /// Accepts connections and reads but never replies.
    async fn spawn_black_hole() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    use tokio::io::AsyncReadExt;
                    let mut stream = stream;
                    let mut buf = [0u8; 1024];
                    while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn unreachable_peer_exhausts_retries_with_pacing() {
        let (dispatcher, _router_cancel) = make_dispatcher(CancellationToken::new()).await;
        let port = spawn_black_hole().await;
        let peer = silent_peer(port);

        let started = Instant::now();
        let err = dispatcher
            .send_with_reply(
                &peer,
                MessageBody::Ping,
                Some(Duration::from_millis(50)),
                1,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, TransportError::Timeout));
        // 10 retries spaced 100 ms apart put a hard floor under the total.
        assert!(
            elapsed >= Duration::from_millis(1000),
            "retries finished too quickly: {elapsed:?}"
        );
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancellation_aborts_without_retry() {
        let (dispatcher, _router_cancel) = make_dispatcher(CancellationToken::new()).await;
        let port = spawn_black_hole().await;
        let peer = silent_peer(port);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = dispatcher
            .send_with_reply(
                &peer,
                MessageBody::Ping,
                Some(Duration::from_secs(10)),
                1,
                cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Cancelled));
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "cancellation must resolve promptly"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn worker_root_cancel_resolves_callers() {
        let worker_cancel = CancellationToken::new();
        let (dispatcher, _router_cancel) = make_dispatcher(worker_cancel.clone()).await;
        let port = spawn_black_hole().await;
        let peer = silent_peer(port);

        let call = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .send_with_reply(
                        &peer,
                        MessageBody::Ping,
                        Some(Duration::from_secs(30)),
                        1,
                        CancellationToken::new(),
                    )
                    .await
            })
        };

        sleep(Duration::from_millis(50)).await;
        worker_cancel.cancel();
        let result = timeout(Duration::from_secs(1), call)
            .await
            .expect("caller must resolve")
            .expect("join");
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }

    #[tokio::test]
    async fn zero_expected_responses_is_fire_and_forget() {
        let (dispatcher, _router_cancel) = make_dispatcher(CancellationToken::new()).await;
        let port = spawn_black_hole().await;
        let peer = silent_peer(port);

        let replies = dispatcher
            .send_with_reply(
                &peer,
                MessageBody::Ping,
                Some(Duration::from_secs(1)),
                0,
                CancellationToken::new(),
            )
            .await
            .expect("send without reply");
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn history_ring_drops_oldest() {
        let history = MessageHistory::new();
        let peer = PeerAddress::random();
        for i in 0..40 {
            history.record(Direction::Sent, peer, format!("m{i}"));
        }
        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), HISTORY_CAPACITY);
        assert_eq!(snapshot.first().unwrap().label, "m10");
        assert_eq!(snapshot.last().unwrap().label, "m39");
    }
}
