//! # Router Socket
//!
//! The single inbound endpoint of the transport. A TCP listener accepts
//! dealer connections; each connection is assigned an opaque identity token
//! which is prepended to every inbound multipart message, so the dispatch
//! path can address replies back to the originating connection without
//! knowing anything about sockets.
//!
//! Wire framing (shared with the dealer side): a `u32` frame count followed
//! by `u32`-length-prefixed frames. Counts and frame sizes are bounded before
//! any allocation.
//!
//! The router never parses message contents; it moves frames. Decoding,
//! signature checks, and the version gate happen in the supervisor's drain
//! loop, where a bad message is logged and skipped without disturbing the
//! connection.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::{Frame, MAX_DESERIALIZE_SIZE, MAX_FRAMES_PER_MESSAGE, RouterIdentity};
use crate::error::TransportError;

/// Depth of the shared inbound queue feeding the drain loop.
const INBOUND_QUEUE_SIZE: usize = 1024;

/// Depth of each connection's outbound write queue.
const WRITE_QUEUE_SIZE: usize = 64;

static IDENTITY_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Mint a fresh 8-byte routing token: a process-wide counter mixed with
/// random bytes so tokens are unique and unguessable across restarts.
fn mint_identity() -> RouterIdentity {
    let counter = IDENTITY_COUNTER.fetch_add(1, Ordering::Relaxed) as u32;
    let mut token = [0u8; 8];
    token[..4].copy_from_slice(&counter.to_be_bytes());
    let _ = getrandom::getrandom(&mut token[4..]);
    RouterIdentity(token.to_vec())
}

/// Write one multipart message.
pub(crate) async fn write_frames<W: AsyncWrite + Unpin>(
    stream: &mut W,
    frames: &[Frame],
) -> std::io::Result<()> {
    stream.write_all(&(frames.len() as u32).to_be_bytes()).await?;
    for frame in frames {
        stream.write_all(&(frame.len() as u32).to_be_bytes()).await?;
        stream.write_all(frame).await?;
    }
    stream.flush().await
}

/// Read one multipart message, enforcing frame-count and frame-size caps
/// before allocating.
pub(crate) async fn read_frames<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> std::io::Result<Vec<Frame>> {
    let mut count_buf = [0u8; 4];
    stream.read_exact(&mut count_buf).await?;
    let count = u32::from_be_bytes(count_buf) as usize;
    if count == 0 || count > MAX_FRAMES_PER_MESSAGE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad frame count: {count}"),
        ));
    }

    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len as u64 > MAX_DESERIALIZE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("oversized frame: {len} bytes"),
            ));
        }
        let mut frame = vec![0u8; len];
        stream.read_exact(&mut frame).await?;
        frames.push(frame);
    }
    Ok(frames)
}

type Writers = Arc<Mutex<HashMap<RouterIdentity, mpsc::Sender<Vec<Frame>>>>>;

pub struct RouterSocket {
    local_addr: SocketAddr,
    writers: Writers,
    inbound: Mutex<Option<mpsc::Receiver<(RouterIdentity, Vec<Frame>)>>>,
    cancel: CancellationToken,
}

impl RouterSocket {
    /// Bind the listener. Port 0 selects a free ephemeral port.
    pub async fn bind(
        bind_ip: IpAddr,
        port: u16,
        cancel: CancellationToken,
    ) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind((bind_ip, port)).await?;
        let local_addr = listener.local_addr()?;
        debug!(addr = %local_addr, "router socket bound");

        let writers: Writers = Arc::new(Mutex::new(HashMap::new()));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);

        let router = Arc::new(Self {
            local_addr,
            writers: writers.clone(),
            inbound: Mutex::new(Some(inbound_rx)),
            cancel: cancel.clone(),
        });

        tokio::spawn(accept_loop(listener, writers, inbound_tx, cancel));
        Ok(router)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The inbound stream, takeable exactly once by the drain loop.
    pub async fn take_inbound(&self) -> Option<mpsc::Receiver<(RouterIdentity, Vec<Frame>)>> {
        self.inbound.lock().await.take()
    }

    /// Send a reply. `frames[0]` is the routing token; the remaining frames
    /// go out on the matching connection.
    pub async fn send_to(&self, mut frames: Vec<Frame>) -> Result<(), TransportError> {
        if frames.is_empty() {
            return Err(TransportError::InvalidMessage("empty reply".into()));
        }
        let identity = RouterIdentity(frames.remove(0));
        let writer = {
            let writers = self.writers.lock().await;
            writers.get(&identity).cloned()
        };
        match writer {
            Some(tx) => tx.send(frames).await.map_err(|_| {
                TransportError::Socket(format!("connection for {identity:?} is gone"))
            }),
            None => Err(TransportError::Socket(format!(
                "no connection for {identity:?}"
            ))),
        }
    }

    pub fn dispose(&self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    writers: Writers,
    inbound_tx: mpsc::Sender<(RouterIdentity, Vec<Frame>)>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "router accept failed");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        let identity = mint_identity();
        trace!(remote = %remote, identity = ?identity, "inbound connection");

        let (write_tx, write_rx) = mpsc::channel::<Vec<Frame>>(WRITE_QUEUE_SIZE);
        writers.lock().await.insert(identity.clone(), write_tx);

        tokio::spawn(serve_connection(
            stream,
            identity,
            write_rx,
            writers.clone(),
            inbound_tx.clone(),
            cancel.clone(),
        ));
    }
    writers.lock().await.clear();
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    identity: RouterIdentity,
    mut write_rx: mpsc::Receiver<Vec<Frame>>,
    writers: Writers,
    inbound_tx: mpsc::Sender<(RouterIdentity, Vec<Frame>)>,
    cancel: CancellationToken,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    let write_task = tokio::spawn(async move {
        while let Some(frames) = write_rx.recv().await {
            if let Err(e) = write_frames(&mut write_half, &frames).await {
                debug!(error = %e, "router connection write failed");
                break;
            }
        }
    });

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = read_frames(&mut read_half) => read,
        };
        match read {
            Ok(frames) => {
                if inbound_tx.send((identity.clone(), frames)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    debug!(error = %e, identity = ?identity, "router connection read failed");
                }
                break;
            }
        }
    }

    write_task.abort();
    writers.lock().await.remove(&identity);
    trace!(identity = ?identity, "connection closed");
}
