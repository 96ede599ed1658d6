//! # Dealer Pool
//!
//! Outbound sockets for broadcast fan-out, one per peer address, created
//! lazily on first send. The pool is bounded; the cap evicts least-recently
//! used dealers the same way the connection cache of any long-lived node
//! must. Entries are removed (and the socket dropped) when:
//!
//! - a send fails or exceeds the send timeout, or
//! - the refresh sweep finds the address gone from the routing table.
//!
//! Each dealer is exclusively owned by the pool; removal drops the socket.
//! Request/reply exchanges do NOT use the pool: the dispatcher opens a
//! dedicated short-lived dealer per exchange so reply frames correlate by
//! receive order alone.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::codec::Frame;
use crate::error::TransportError;
use crate::identity::{BoundPeer, Endpoint, PeerAddress};
use crate::router::{read_frames, write_frames};

/// Upper bound on pooled dealers.
const MAX_DEALERS: usize = 256;

/// One outbound connection to a peer's router.
pub struct DealerSocket {
    stream: TcpStream,
}

impl DealerSocket {
    pub async fn connect(endpoint: &Endpoint) -> std::io::Result<Self> {
        let stream = TcpStream::connect(endpoint.connect_pair()).await?;
        let _ = stream.set_nodelay(true);
        Ok(Self { stream })
    }

    pub async fn send(&mut self, frames: &[Frame]) -> std::io::Result<()> {
        write_frames(&mut self.stream, frames).await
    }

    pub async fn recv(&mut self) -> std::io::Result<Vec<Frame>> {
        read_frames(&mut self.stream).await
    }
}

pub struct DealerPool {
    dealers: Mutex<LruCache<PeerAddress, Arc<Mutex<DealerSocket>>>>,
    send_timeout: Duration,
}

impl DealerPool {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            dealers: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_DEALERS).expect("MAX_DEALERS is non-zero"),
            )),
            send_timeout,
        }
    }

    /// Send one multipart message to `peer`, creating the dealer on demand.
    /// A timeout or send failure disposes the dealer; the next send to the
    /// same peer re-creates it.
    pub async fn send_to(&self, peer: &BoundPeer, frames: &[Frame]) -> Result<(), TransportError> {
        let address = peer.address();
        let dealer = {
            let mut dealers = self.dealers.lock().await;
            dealers.get(&address).cloned()
        };

        let dealer = match dealer {
            Some(dealer) => dealer,
            None => {
                let socket = timeout(self.send_timeout, DealerSocket::connect(&peer.endpoint))
                    .await
                    .map_err(|_| TransportError::Timeout)??;
                let dealer = Arc::new(Mutex::new(socket));
                self.dealers.lock().await.put(address, dealer.clone());
                trace!(peer = %address, endpoint = %peer.endpoint, "dealer created");
                dealer
            }
        };

        let sent = timeout(self.send_timeout, async {
            dealer.lock().await.send(frames).await
        })
        .await;

        match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.remove(&address).await;
                Err(e.into())
            }
            Err(_) => {
                self.remove(&address).await;
                Err(TransportError::Timeout)
            }
        }
    }

    /// Dispose the dealer for `address` if present.
    pub async fn remove(&self, address: &PeerAddress) {
        if self.dealers.lock().await.pop(address).is_some() {
            debug!(peer = %address, "dealer disposed");
        }
    }

    /// Dispose every dealer whose address is not in `live`. Returns how many
    /// were removed.
    pub async fn sweep(&self, live: &HashSet<PeerAddress>) -> usize {
        let mut dealers = self.dealers.lock().await;
        let stale: Vec<PeerAddress> = dealers
            .iter()
            .filter(|&(address, _)| !live.contains(address))
            .map(|(address, _)| *address)
            .collect();
        for address in &stale {
            dealers.pop(address);
            debug!(peer = %address, "dealer swept: peer left routing table");
        }
        stale.len()
    }

    #[cfg(test)]
    pub async fn contains(&self, address: &PeerAddress) -> bool {
        self.dealers.lock().await.contains(address)
    }

    pub async fn len(&self) -> usize {
        self.dealers.lock().await.len()
    }

    pub async fn dispose_all(&self) {
        self.dealers.lock().await.clear();
    }
}
