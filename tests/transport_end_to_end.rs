//! End-to-end scenarios for the transport public API.
//!
//! Each test stands up real in-process transports on ephemeral loopback
//! ports and exercises the full path: codec, version gate, router/dealer
//! sockets, dispatcher, and the discovery protocol.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use braidnet::{
    AppProtocolVersion, BoundPeer, CancellationToken, Endpoint, Message, MessageBody,
    MessageKindRegistry, Peer, PrivateKey, PublicKey, Transport, TransportConfig, TransportError,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};

/// User message kind registered on every test node.
const KIND_TEST: u16 = 0x0021;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);
const SCENARIO_TIMEOUT: Duration = Duration::from_secs(20);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

struct TestNode {
    transport: Arc<Transport>,
    messages: mpsc::UnboundedReceiver<Message>,
}

impl TestNode {
    async fn spawn(version: u64) -> Result<Self> {
        Self::spawn_with(version, HashSet::new()).await
    }

    async fn spawn_with(version: u64, trusted: HashSet<PublicKey>) -> Result<Self> {
        let key = PrivateKey::generate();
        let token = AppProtocolVersion::sign(&key, version, Vec::new());
        let mut config = TransportConfig::new(key, token);
        config.host = Some("127.0.0.1".into());
        config.workers = 3;
        config.trusted_version_signers = trusted;
        config.message_kinds = MessageKindRegistry::new().register(KIND_TEST, "test-payload");

        let (tx, rx) = mpsc::unbounded_channel();
        config.on_message = Arc::new(move |message| {
            let _ = tx.send(message);
        });

        let transport = Transport::new(config);
        transport.start().await?;
        {
            let transport = transport.clone();
            tokio::spawn(async move {
                let _ = transport.run().await;
            });
        }
        transport.wait_for_running().await;
        Ok(Self {
            transport,
            messages: rx,
        })
    }

    async fn as_peer(&self) -> Result<BoundPeer> {
        Ok(self.transport.as_peer().await?)
    }
}

/// A peer record whose endpoint accepts connections but never replies.
async fn black_hole_peer() -> Result<BoundPeer> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
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

    let key = PrivateKey::generate();
    let version = AppProtocolVersion::sign(&key, 1, Vec::new());
    Ok(BoundPeer::new(
        Peer::new(key.public_key(), version),
        Endpoint::new("127.0.0.1", port),
    ))
}

// ----------------------------------------------------------------------
// S1 — Echo loopback
// ----------------------------------------------------------------------

#[tokio::test]
async fn ping_is_answered_with_pong() -> Result<()> {
    init_tracing();
    let a = TestNode::spawn(1).await?;
    let b = TestNode::spawn(1).await?;
    let b_peer = b.as_peer().await?;

    let started = Instant::now();
    let reply = a
        .transport
        .send_message_with_reply(
            &b_peer,
            MessageBody::Ping,
            Some(Duration::from_secs(1)),
            CancellationToken::new(),
        )
        .await?;

    assert!(matches!(reply.body, MessageBody::Pong));
    assert_eq!(reply.remote.address(), b_peer.address());
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "loopback ping took {:?}",
        started.elapsed()
    );

    a.transport.stop(Duration::ZERO).await?;
    b.transport.stop(Duration::ZERO).await?;
    Ok(())
}

// ----------------------------------------------------------------------
// S1b — User request answered through reply_message
// ----------------------------------------------------------------------

#[tokio::test]
async fn user_request_answered_via_reply_message() -> Result<()> {
    init_tracing();
    let a = TestNode::spawn(1).await?;
    let mut b = TestNode::spawn(1).await?;
    let b_peer = b.as_peer().await?;

    // B's host logic: answer every test-kind request with an echo.
    let responder = b.transport.clone();
    tokio::spawn(async move {
        while let Some(message) = b.messages.recv().await {
            if let MessageBody::User { kind: KIND_TEST, payload } = &message.body {
                let mut echoed = payload.clone();
                echoed.reverse();
                let _ = responder
                    .reply_message(
                        &message,
                        MessageBody::User {
                            kind: KIND_TEST,
                            payload: echoed,
                        },
                    )
                    .await;
            }
        }
    });

    let reply = a
        .transport
        .send_message_with_reply(
            &b_peer,
            MessageBody::User {
                kind: KIND_TEST,
                payload: b"ordered".to_vec(),
            },
            Some(EXCHANGE_TIMEOUT),
            CancellationToken::new(),
        )
        .await?;

    match reply.body {
        MessageBody::User { kind, payload } => {
            assert_eq!(kind, KIND_TEST);
            assert_eq!(payload, b"deredro".to_vec());
        }
        other => panic!("unexpected reply body {}", other.label()),
    }

    a.transport.stop(Duration::ZERO).await?;
    Ok(())
}

// ----------------------------------------------------------------------
// S2 — Version rejection
// ----------------------------------------------------------------------

#[tokio::test]
async fn incompatible_version_is_rejected() -> Result<()> {
    init_tracing();
    let a = TestNode::spawn(2).await?;
    let mut b = TestNode::spawn(1).await?;
    let b_peer = b.as_peer().await?;

    let result = timeout(
        SCENARIO_TIMEOUT,
        a.transport.send_message_with_reply(
            &b_peer,
            MessageBody::Ping,
            Some(Duration::from_millis(500)),
            CancellationToken::new(),
        ),
    )
    .await
    .expect("call must resolve");

    match result {
        Err(TransportError::DifferentAppProtocolVersion { expected, actual, .. }) => {
            assert_eq!(expected, 2);
            assert_eq!(actual, 1);
        }
        other => panic!("expected version rejection, got {other:?}"),
    }

    // B saw only the liveness probe, which never reaches the host handler.
    assert!(
        b.messages.try_recv().is_err(),
        "B's handler must not be invoked"
    );

    a.transport.stop(Duration::ZERO).await?;
    b.transport.stop(Duration::ZERO).await?;
    Ok(())
}

#[tokio::test]
async fn trusted_signer_bridges_version_gap() -> Result<()> {
    init_tracing();
    // B runs version 9 signed by a signer A trusts, and A's hook accepts.
    let b_signer = PrivateKey::generate();
    let mut trusted = HashSet::new();
    trusted.insert(b_signer.public_key());

    let a_key = PrivateKey::generate();
    let a_token = AppProtocolVersion::sign(&a_key, 1, Vec::new());
    let mut a_config = TransportConfig::new(a_key, a_token);
    a_config.host = Some("127.0.0.1".into());
    a_config.workers = 2;
    a_config.trusted_version_signers = trusted;
    a_config.on_different_version = Arc::new(|_, _, _| true);
    let a = Transport::new(a_config);
    a.start().await?;
    {
        let a = a.clone();
        tokio::spawn(async move {
            let _ = a.run().await;
        });
    }
    a.wait_for_running().await;

    let b_key = PrivateKey::generate();
    let b_token = AppProtocolVersion::sign(&b_signer, 9, Vec::new());
    let mut b_config = TransportConfig::new(b_key, b_token);
    b_config.host = Some("127.0.0.1".into());
    b_config.workers = 2;
    let b = Transport::new(b_config);
    b.start().await?;
    {
        let b = b.clone();
        tokio::spawn(async move {
            let _ = b.run().await;
        });
    }
    b.wait_for_running().await;

    let b_peer = b.as_peer().await?;
    let reply = a
        .send_message_with_reply(
            &b_peer,
            MessageBody::Ping,
            Some(EXCHANGE_TIMEOUT),
            CancellationToken::new(),
        )
        .await?;
    assert!(matches!(reply.body, MessageBody::Pong));

    a.stop(Duration::ZERO).await?;
    b.stop(Duration::ZERO).await?;
    Ok(())
}

// ----------------------------------------------------------------------
// S3 — Timeout and retry pacing
// ----------------------------------------------------------------------

#[tokio::test]
async fn silent_peer_times_out_after_paced_retries() -> Result<()> {
    init_tracing();
    let a = TestNode::spawn(1).await?;
    let hole = black_hole_peer().await?;

    let started = Instant::now();
    let err = timeout(
        SCENARIO_TIMEOUT,
        a.transport.send_message_with_reply(
            &hole,
            MessageBody::Ping,
            Some(Duration::from_millis(200)),
            CancellationToken::new(),
        ),
    )
    .await
    .expect("call must resolve")
    .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, TransportError::Timeout));
    // Ten 100 ms retry gaps alone put the floor above 1.1 s once the
    // per-attempt timeouts are added.
    assert!(
        elapsed >= Duration::from_millis(1100),
        "retries finished too quickly: {elapsed:?}"
    );

    a.transport.stop(Duration::ZERO).await?;
    Ok(())
}

// ----------------------------------------------------------------------
// S4 — Bootstrap and broadcast
// ----------------------------------------------------------------------

fn is_broadcast(message: &Message, payload: &[u8]) -> bool {
    matches!(
        &message.body,
        MessageBody::User { kind: KIND_TEST, payload: got } if got == payload
    )
}

/// Count deliveries of the broadcast payload within a 2 s window.
async fn count_broadcasts(rx: &mut mpsc::UnboundedReceiver<Message>, payload: &[u8]) -> usize {
    let started = Instant::now();
    let mut count = 0usize;
    while started.elapsed() < Duration::from_secs(2) {
        match timeout(Duration::from_millis(200), rx.recv()).await {
            Ok(Some(message)) if is_broadcast(&message, payload) => count += 1,
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {}
        }
    }
    count
}

#[tokio::test]
async fn bootstrap_then_broadcast_reaches_every_other_node() -> Result<()> {
    init_tracing();
    let seed = TestNode::spawn(1).await?;
    let mut a = TestNode::spawn(1).await?;
    let mut b = TestNode::spawn(1).await?;
    let mut seed_messages = seed.messages;
    let seed_peer = seed.transport.as_peer().await?;

    a.transport
        .bootstrap(
            std::slice::from_ref(&seed_peer),
            Some(EXCHANGE_TIMEOUT),
            Some(EXCHANGE_TIMEOUT),
            2,
        )
        .await?;
    b.transport
        .bootstrap(
            std::slice::from_ref(&seed_peer),
            Some(EXCHANGE_TIMEOUT),
            Some(EXCHANGE_TIMEOUT),
            2,
        )
        .await?;

    // A must have discovered B through the seed for the broadcast to cover it.
    let a_peers = a.transport.peers().await?;
    assert!(
        a_peers.iter().any(|p| p.address() == seed_peer.address()),
        "A must know the seed"
    );

    let payload = b"block-announcement".to_vec();
    a.transport
        .broadcast_message(
            None,
            MessageBody::User {
                kind: KIND_TEST,
                payload: payload.clone(),
            },
        )
        .await?;

    let seed_count = count_broadcasts(&mut seed_messages, &payload).await;
    let b_count = count_broadcasts(&mut b.messages, &payload).await;
    assert_eq!(seed_count, 1, "seed must receive the broadcast exactly once");
    assert_eq!(b_count, 1, "B must receive the broadcast exactly once");

    // The sender's own handler must not see its broadcast.
    let mut a_got = 0usize;
    while let Ok(message) = a.messages.try_recv() {
        if is_broadcast(&message, &payload) {
            a_got += 1;
        }
    }
    assert_eq!(a_got, 0, "A must not deliver its own broadcast");

    a.transport.stop(Duration::ZERO).await?;
    b.transport.stop(Duration::ZERO).await?;
    seed.transport.stop(Duration::ZERO).await?;
    Ok(())
}

// ----------------------------------------------------------------------
// S5 — Dealer churn after table refresh
// ----------------------------------------------------------------------

#[tokio::test]
async fn dead_peer_is_evicted_and_its_dealer_disposed() -> Result<()> {
    init_tracing();
    let a = TestNode::spawn(1).await?;
    let b = TestNode::spawn(1).await?;
    let b_peer = b.as_peer().await?;

    a.transport
        .add_peers(std::slice::from_ref(&b_peer), Some(EXCHANGE_TIMEOUT))
        .await?;
    assert!(a.transport.trace().await?.contains(&b_peer.address().to_string()));

    // A broadcast materializes the pooled dealer for B.
    a.transport
        .broadcast_message(
            None,
            MessageBody::User {
                kind: KIND_TEST,
                payload: b"warm-up".to_vec(),
            },
        )
        .await?;
    let pooled = async {
        loop {
            if a.transport.dealer_count().await > 0 {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    };
    timeout(Duration::from_secs(2), pooled)
        .await
        .expect("dealer must be pooled after broadcast");

    b.transport.stop(Duration::ZERO).await?;

    // Force the refresh path: the ping fails, B is demoted out of the table.
    let _ = a
        .transport
        .check_all_peers(Some(Duration::from_millis(100)))
        .await;
    assert!(
        !a.transport.trace().await?.contains(&b_peer.address().to_string()),
        "B must leave A's routing table"
    );

    // Within one refresh period the sweep disposes the orphaned dealer.
    let swept = async {
        loop {
            if a.transport.dealer_count().await == 0 {
                return;
            }
            sleep(Duration::from_millis(250)).await;
        }
    };
    timeout(Duration::from_secs(12), swept)
        .await
        .expect("dealer for the dead peer must be disposed within a refresh period");

    a.transport.stop(Duration::ZERO).await?;
    Ok(())
}

// ----------------------------------------------------------------------
// S6 — Cancellation
// ----------------------------------------------------------------------

#[tokio::test]
async fn caller_cancellation_resolves_promptly_without_retry() -> Result<()> {
    init_tracing();
    let a = TestNode::spawn(1).await?;
    let hole = black_hole_peer().await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
    }

    let started = Instant::now();
    let err = a
        .transport
        .send_message_with_reply(
            &hole,
            MessageBody::Ping,
            Some(Duration::from_secs(10)),
            cancel,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Cancelled));
    assert!(
        started.elapsed() < Duration::from_millis(600),
        "cancellation resolved too slowly: {:?}",
        started.elapsed()
    );

    // No retry is in flight afterwards.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(a.transport.in_flight().await, 0);

    a.transport.stop(Duration::ZERO).await?;
    Ok(())
}

// ----------------------------------------------------------------------
// Lifecycle odds and ends
// ----------------------------------------------------------------------

#[tokio::test]
async fn history_records_recent_traffic() -> Result<()> {
    init_tracing();
    let a = TestNode::spawn(1).await?;
    let b = TestNode::spawn(1).await?;
    let b_peer = b.as_peer().await?;

    a.transport
        .send_message_with_reply(
            &b_peer,
            MessageBody::Ping,
            Some(EXCHANGE_TIMEOUT),
            CancellationToken::new(),
        )
        .await?;

    let history = a.transport.history();
    assert!(history.iter().any(|e| e.label == "ping"));
    assert!(history.iter().any(|e| e.label == "pong"));

    a.transport.stop(Duration::ZERO).await?;
    b.transport.stop(Duration::ZERO).await?;
    Ok(())
}

#[tokio::test]
async fn send_message_is_fire_and_forget() -> Result<()> {
    init_tracing();
    let a = TestNode::spawn(1).await?;
    let b = TestNode::spawn(1).await?;
    let b_peer = b.as_peer().await?;

    a.transport.send_message(&b_peer, MessageBody::Ping).await?;

    a.transport.stop(Duration::ZERO).await?;
    b.transport.stop(Duration::ZERO).await?;
    Ok(())
}
