//! # Kademlia Peer Discovery
//!
//! Routing table and discovery protocol layered on top of the transport's
//! request/reply machinery (injected as [`Messenger`]).
//!
//! ## Routing Table
//!
//! `table_size` buckets indexed by the common-prefix length of the XOR
//! distance between our address and the peer's, clamped to the last bucket.
//! Each bucket holds up to `bucket_size` peers ordered stale → fresh, plus a
//! bounded replacement cache of recently seen peers that did not fit. A peer
//! lives in at most one bucket.
//!
//! ## Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `ping` | Liveness probe; success promotes, failure evicts and promotes from the replacement cache |
//! | `bootstrap` | Ping seeds, then look up our own neighborhood |
//! | `find_specific_peer` | Iterative, depth-bounded neighbor lookup |
//! | `refresh_table` | Re-ping stale peers; random-address lookups for stale buckets |
//! | `check_replacement_cache` | Ping cached candidates, admit the live ones |
//! | `rebuild_connection` | Lookups toward random addresses and ourselves |
//! | `peers_to_broadcast` | Coverage-oriented sample across buckets |
//! | `trace` | Human-readable table dump |

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::{Message, MessageBody};
use crate::error::TransportError;
use crate::identity::{ADDRESS_LEN, BoundPeer, PeerAddress, distance_cmp};
use crate::protocols::Messenger;

/// Default number of buckets.
pub const DEFAULT_TABLE_SIZE: usize = 16;

/// Default peers per bucket.
pub const DEFAULT_BUCKET_SIZE: usize = 16;

/// Parallel queries per lookup round.
pub const DEFAULT_FIND_CONCURRENCY: usize = 3;

/// Default recursion depth for lookups.
pub const DEFAULT_FIND_DEPTH: usize = 3;

/// Deadline for the probe deciding whether a bucket's oldest peer survives.
const EVICTION_PING_TIMEOUT: Duration = Duration::from_secs(3);

/// Random lookups issued (plus one toward ourselves) by a connection rebuild.
const REBUILD_RANDOM_LOOKUPS: usize = 3;

// ============================================================================
// Routing table
// ============================================================================

#[derive(Clone, Debug)]
struct BucketEntry {
    peer: BoundPeer,
    last_seen: Instant,
}

#[derive(Debug)]
struct KBucket {
    /// Ordered stale → fresh.
    entries: Vec<BucketEntry>,
    /// Recently seen peers evicted or rejected for capacity, freshest first.
    replacement: VecDeque<BoundPeer>,
    last_updated: Instant,
}

#[derive(Debug)]
pub enum AddOutcome {
    Added,
    Refreshed,
    /// Bucket is full; the caller decides the oldest entry's fate. The new
    /// peer is parked in the replacement cache meanwhile.
    Full { oldest: BoundPeer },
    /// Our own address or otherwise unusable.
    Rejected,
}

impl KBucket {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            replacement: VecDeque::new(),
            last_updated: Instant::now(),
        }
    }

    fn touch(&mut self, peer: BoundPeer, capacity: usize) -> AddOutcome {
        self.last_updated = Instant::now();
        let address = peer.address();

        if let Some(pos) = self.entries.iter().position(|e| e.peer.address() == address) {
            let mut entry = self.entries.remove(pos);
            entry.peer = peer;
            entry.last_seen = Instant::now();
            self.entries.push(entry);
            return AddOutcome::Refreshed;
        }

        if self.entries.len() < capacity {
            self.entries.push(BucketEntry {
                peer,
                last_seen: Instant::now(),
            });
            return AddOutcome::Added;
        }

        let oldest = self.entries[0].peer.clone();
        self.stash_replacement(peer, capacity);
        AddOutcome::Full { oldest }
    }

    fn stash_replacement(&mut self, peer: BoundPeer, capacity: usize) {
        self.replacement.retain(|p| p.address() != peer.address());
        self.replacement.push_front(peer);
        self.replacement.truncate(capacity);
    }

    fn promote(&mut self, address: &PeerAddress) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.peer.address() == *address) {
            let mut entry = self.entries.remove(pos);
            entry.last_seen = Instant::now();
            self.entries.push(entry);
            self.last_updated = Instant::now();
            true
        } else {
            false
        }
    }

    fn remove(&mut self, address: &PeerAddress) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.peer.address() != *address);
        before != self.entries.len()
    }

    fn pop_replacement(&mut self) -> Option<BoundPeer> {
        self.replacement.pop_front()
    }

    fn drop_replacement(&mut self, address: &PeerAddress) {
        self.replacement.retain(|p| p.address() != *address);
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    local_address: PeerAddress,
    bucket_size: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local_address: PeerAddress, table_size: usize, bucket_size: usize) -> Self {
        assert!(table_size > 0 && table_size <= ADDRESS_LEN * 8);
        assert!(bucket_size > 0);
        let mut buckets = Vec::with_capacity(table_size);
        for _ in 0..table_size {
            buckets.push(KBucket::new());
        }
        Self {
            local_address,
            bucket_size,
            buckets,
        }
    }

    pub fn local_address(&self) -> PeerAddress {
        self.local_address
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Bucket index for `address`: common prefix length of the XOR distance,
    /// clamped to the last bucket.
    pub fn bucket_index(&self, address: &PeerAddress) -> usize {
        self.local_address
            .common_prefix_len(address)
            .min(self.buckets.len() - 1)
    }

    pub fn add(&mut self, peer: BoundPeer) -> AddOutcome {
        if peer.address() == self.local_address {
            return AddOutcome::Rejected;
        }
        let idx = self.bucket_index(&peer.address());
        let capacity = self.bucket_size;
        self.buckets[idx].touch(peer, capacity)
    }

    pub fn promote(&mut self, address: &PeerAddress) -> bool {
        let idx = self.bucket_index(address);
        self.buckets[idx].promote(address)
    }

    pub fn remove(&mut self, address: &PeerAddress) -> bool {
        let idx = self.bucket_index(address);
        self.buckets[idx].remove(address)
    }

    /// Remove `address` and promote the freshest replacement-cache candidate
    /// of its bucket into the vacancy, if any.
    pub fn evict_and_promote(&mut self, address: &PeerAddress) -> Option<BoundPeer> {
        let idx = self.bucket_index(address);
        let bucket = &mut self.buckets[idx];
        if !bucket.remove(address) {
            return None;
        }
        let promoted = bucket.pop_replacement()?;
        bucket.entries.push(BucketEntry {
            peer: promoted.clone(),
            last_seen: Instant::now(),
        });
        Some(promoted)
    }

    #[cfg(test)]
    pub fn contains(&self, address: &PeerAddress) -> bool {
        self.find(address).is_some()
    }

    pub fn find(&self, address: &PeerAddress) -> Option<BoundPeer> {
        let idx = self.bucket_index(address);
        self.buckets[idx]
            .entries
            .iter()
            .find(|e| e.peer.address() == *address)
            .map(|e| e.peer.clone())
    }

    pub fn peers(&self) -> Vec<BoundPeer> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.peer.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    /// The `k` known peers closest to `target` by XOR distance.
    pub fn neighbors(&self, target: &PeerAddress, k: usize) -> Vec<BoundPeer> {
        let mut peers = self.peers();
        peers.sort_by(|a, b| {
            let da = a.address().xor_distance(target);
            let db = b.address().xor_distance(target);
            distance_cmp(&da, &db)
        });
        peers.truncate(k);
        peers
    }

    /// Coverage-oriented broadcast sample: one random member per non-empty
    /// bucket, topped up with further random peers until at least half a
    /// bucket's worth, `except` excluded throughout.
    pub fn peers_to_broadcast(&self, except: Option<PeerAddress>) -> Vec<BoundPeer> {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let mut selected: Vec<BoundPeer> = Vec::new();
        let mut chosen: HashSet<PeerAddress> = HashSet::new();

        for bucket in &self.buckets {
            let candidates: Vec<&BucketEntry> = bucket
                .entries
                .iter()
                .filter(|e| Some(e.peer.address()) != except)
                .collect();
            if candidates.is_empty() {
                continue;
            }
            let pick = &candidates[rng.gen_range(0..candidates.len())].peer;
            if chosen.insert(pick.address()) {
                selected.push(pick.clone());
            }
        }

        let minimum = self.bucket_size / 2;
        if selected.len() < minimum {
            let mut rest: Vec<BoundPeer> = self
                .peers()
                .into_iter()
                .filter(|p| Some(p.address()) != except && !chosen.contains(&p.address()))
                .collect();
            while selected.len() < minimum && !rest.is_empty() {
                let pick = rest.swap_remove(rng.gen_range(0..rest.len()));
                selected.push(pick);
            }
        }
        selected
    }

    /// Peers whose last successful contact is older than `max_age`.
    pub fn stale_peers(&self, max_age: Duration) -> Vec<BoundPeer> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .filter(|e| e.last_seen.elapsed() >= max_age)
            .map(|e| e.peer.clone())
            .collect()
    }

    /// Indices of non-empty buckets with no activity for `max_age`.
    pub fn stale_buckets(&self, max_age: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.entries.is_empty() && b.last_updated.elapsed() >= max_age)
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(idx) {
            bucket.last_updated = Instant::now();
        }
    }

    /// A random address whose bucket index is `idx` (exactly, except for the
    /// clamped last bucket which covers all longer prefixes too).
    pub fn random_address_in_bucket(&self, idx: usize) -> PeerAddress {
        let mut distance = *PeerAddress::random().as_bytes();
        let byte_idx = idx / 8;
        let bit_pos = idx % 8;

        for byte in distance.iter_mut().take(byte_idx) {
            *byte = 0;
        }
        let target_bit = 0x80u8 >> bit_pos;
        let random_mask = target_bit.wrapping_sub(1);
        distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

        let local = self.local_address.as_bytes();
        let mut out = [0u8; ADDRESS_LEN];
        for i in 0..ADDRESS_LEN {
            out[i] = local[i] ^ distance[i];
        }
        PeerAddress::from_bytes(out)
    }

    /// Every replacement-cache candidate across all buckets.
    pub fn replacement_candidates(&self) -> Vec<BoundPeer> {
        self.buckets
            .iter()
            .flat_map(|b| b.replacement.iter().cloned())
            .collect()
    }

    pub fn drop_replacement(&mut self, address: &PeerAddress) {
        let idx = self.bucket_index(address);
        self.buckets[idx].drop_replacement(address);
    }

    /// Human-readable dump used by `trace()`.
    pub fn render(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "routing table for {} ({} peers)",
            self.local_address,
            self.len()
        );
        for (idx, bucket) in self.buckets.iter().enumerate() {
            if bucket.entries.is_empty() && bucket.replacement.is_empty() {
                continue;
            }
            let _ = writeln!(
                out,
                "bucket {idx:02} ({} peers, {} cached):",
                bucket.entries.len(),
                bucket.replacement.len()
            );
            for entry in bucket.entries.iter().rev() {
                let _ = writeln!(
                    out,
                    "  {} {} last seen {}ms ago",
                    entry.peer.address(),
                    entry.peer.endpoint,
                    entry.last_seen.elapsed().as_millis()
                );
            }
            for cached in &bucket.replacement {
                let _ = writeln!(out, "  (cache) {} {}", cached.address(), cached.endpoint);
            }
        }
        out
    }
}

// ============================================================================
// Protocol
// ============================================================================

pub struct KademliaProtocol<M: Messenger> {
    local_address: PeerAddress,
    table: Arc<RwLock<RoutingTable>>,
    messenger: Arc<M>,
    find_concurrency: usize,
}

impl<M: Messenger> Clone for KademliaProtocol<M> {
    fn clone(&self) -> Self {
        Self {
            local_address: self.local_address,
            table: self.table.clone(),
            messenger: self.messenger.clone(),
            find_concurrency: self.find_concurrency,
        }
    }
}

impl<M: Messenger> KademliaProtocol<M> {
    pub fn new(table: Arc<RwLock<RoutingTable>>, messenger: Arc<M>) -> Self {
        let local_address = table.read().expect("routing table lock").local_address();
        Self {
            local_address,
            table,
            messenger,
            find_concurrency: DEFAULT_FIND_CONCURRENCY,
        }
    }

    #[cfg(test)]
    pub fn table(&self) -> &Arc<RwLock<RoutingTable>> {
        &self.table
    }

    pub fn peers(&self) -> Vec<BoundPeer> {
        self.table.read().expect("routing table lock").peers()
    }

    pub fn trace(&self) -> String {
        self.table.read().expect("routing table lock").render()
    }

    /// Liveness probe. Success moves the peer to most-recently-seen in its
    /// bucket; failure evicts it and promotes from the replacement cache.
    pub async fn ping(
        &self,
        peer: &BoundPeer,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        match self.raw_ping(peer, timeout, cancel).await {
            Ok(()) => {
                self.note_alive(peer.clone());
                Ok(())
            }
            Err(TransportError::Cancelled) => Err(TransportError::Cancelled),
            Err(e) => {
                self.note_dead(&peer.address());
                Err(e)
            }
        }
    }

    /// The bare exchange, with no routing-table side effects.
    async fn raw_ping(
        &self,
        peer: &BoundPeer,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let replies = self
            .messenger
            .send_with_reply(peer, MessageBody::Ping, timeout, 1, cancel)
            .await?;
        let reply = replies
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::InvalidMessage("empty ping reply".into()))?;
        if !matches!(reply.body, MessageBody::Pong) {
            return Err(TransportError::InvalidMessage(format!(
                "expected pong, got {}",
                reply.body.label()
            )));
        }
        if reply.remote.address() != peer.address() {
            return Err(TransportError::InvalidMessage(
                "pong signed by a different peer".into(),
            ));
        }
        Ok(())
    }

    /// Record a live sighting of `peer`. When its bucket is full, the oldest
    /// member is probed in the background and replaced only if unresponsive.
    pub fn note_alive(&self, peer: BoundPeer) {
        let outcome = {
            let mut table = self.table.write().expect("routing table lock");
            table.add(peer)
        };
        if let AddOutcome::Full { oldest } = outcome {
            let this = self.clone();
            tokio::spawn(async move {
                let alive = this
                    .raw_ping(&oldest, Some(EVICTION_PING_TIMEOUT), CancellationToken::new())
                    .await
                    .is_ok();
                let mut table = this.table.write().expect("routing table lock");
                if alive {
                    table.promote(&oldest.address());
                } else if let Some(promoted) = table.evict_and_promote(&oldest.address()) {
                    debug!(
                        evicted = %oldest.address(),
                        promoted = %promoted.address(),
                        "bucket eviction: replacement promoted"
                    );
                }
            });
        }
    }

    fn note_dead(&self, address: &PeerAddress) {
        let mut table = self.table.write().expect("routing table lock");
        if let Some(promoted) = table.evict_and_promote(address) {
            debug!(
                evicted = %address,
                promoted = %promoted.address(),
                "unresponsive peer evicted, replacement promoted"
            );
        } else if table.remove(address) {
            debug!(evicted = %address, "unresponsive peer evicted");
        }
    }

    /// Handle one inbound message: note the sender and answer protocol
    /// requests. User messages are the host handler's business, not ours.
    pub async fn receive_message(&self, message: &Message) -> Result<(), TransportError> {
        self.note_alive(message.remote.clone());

        match (&message.body, &message.identity) {
            (MessageBody::Ping, Some(identity)) => {
                self.messenger
                    .reply(identity.clone(), MessageBody::Pong)
                    .await
            }
            (MessageBody::FindNeighbors(target), Some(identity)) => {
                let neighbors = {
                    let table = self.table.read().expect("routing table lock");
                    let k = table.bucket_size();
                    table.neighbors(target, k)
                };
                self.messenger
                    .reply(identity.clone(), MessageBody::Neighbors(neighbors))
                    .await
            }
            _ => Ok(()),
        }
    }

    /// Join the network: ping the seeds, then explore our own neighborhood.
    pub async fn bootstrap(
        &self,
        seeds: &[BoundPeer],
        ping_timeout: Option<Duration>,
        find_timeout: Option<Duration>,
        depth: usize,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let mut any_seed = false;
        for seed in seeds {
            if seed.address() == self.local_address {
                continue;
            }
            match self.ping(seed, ping_timeout, cancel.clone()).await {
                Ok(()) => any_seed = true,
                Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
                Err(e) => warn!(seed = %seed.address(), error = %e, "bootstrap seed unresponsive"),
            }
        }
        if !seeds.is_empty() && !any_seed {
            return Err(TransportError::Unexpected(
                "no bootstrap seed responded".into(),
            ));
        }

        self.find_specific_peer(None, None, depth, self.local_address, find_timeout, cancel)
            .await?;
        Ok(())
    }

    /// Ping `peers` and admit the responsive ones.
    pub async fn add_peers(
        &self,
        peers: &[BoundPeer],
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        for peer in peers {
            match self.ping(peer, timeout, cancel.clone()).await {
                Ok(()) => {}
                Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
                Err(e) => debug!(peer = %peer.address(), error = %e, "add_peers ping failed"),
            }
        }
        Ok(())
    }

    /// Iterative neighbor lookup toward `search_address`, recursing up to
    /// `depth` rounds. When `target` is given, returns as soon as a live
    /// peer with that address is confirmed; otherwise the lookup only
    /// freshens the table and returns `None`.
    pub async fn find_specific_peer(
        &self,
        target: Option<PeerAddress>,
        via: Option<BoundPeer>,
        depth: usize,
        search_address: PeerAddress,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<Option<BoundPeer>, TransportError> {
        // Known already? Confirm liveness before claiming success.
        let known = match target {
            Some(t) => self.table.read().expect("routing table lock").find(&t),
            None => None,
        };
        if let Some(known) = known {
            match self.ping(&known, timeout, cancel.clone()).await {
                Ok(()) => return Ok(Some(known)),
                Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
                Err(_) => {}
            }
        }

        let mut frontier: Vec<BoundPeer> = match via {
            Some(peer) => vec![peer],
            None => self
                .table
                .read()
                .expect("routing table lock")
                .neighbors(&search_address, self.find_concurrency),
        };
        let mut visited: HashSet<PeerAddress> = HashSet::new();
        visited.insert(self.local_address);

        for round in 0..depth.max(1) {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            let batch: Vec<BoundPeer> = frontier
                .iter()
                .filter(|p| !visited.contains(&p.address()))
                .take(self.find_concurrency)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            for peer in &batch {
                visited.insert(peer.address());
            }

            let mut join_set = JoinSet::new();
            for peer in batch {
                let this = self.clone();
                let cancel = cancel.clone();
                join_set.spawn(async move {
                    let result = this
                        .messenger
                        .send_with_reply(
                            &peer,
                            MessageBody::FindNeighbors(search_address),
                            timeout,
                            1,
                            cancel,
                        )
                        .await;
                    (peer, result)
                });
            }

            let mut discovered: Vec<BoundPeer> = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                let Ok((peer, result)) = joined else { continue };
                match result {
                    Ok(replies) => {
                        self.note_alive(peer);
                        for reply in replies {
                            if let MessageBody::Neighbors(neighbors) = reply.body {
                                discovered.extend(neighbors);
                            }
                        }
                    }
                    Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
                    Err(e) => {
                        trace!(peer = %peer.address(), error = %e, "lookup query failed");
                        self.note_dead(&peer.address());
                    }
                }
            }

            discovered.retain(|p| p.address() != self.local_address && !visited.contains(&p.address()));
            discovered.sort_by(|a, b| {
                let da = a.address().xor_distance(&search_address);
                let db = b.address().xor_distance(&search_address);
                distance_cmp(&da, &db)
            });
            discovered.dedup_by_key(|p| p.address());

            // Admit discoveries by pinging them; this is what grows the table.
            let mut ping_set = JoinSet::new();
            for peer in discovered.clone() {
                let this = self.clone();
                let cancel = cancel.clone();
                ping_set.spawn(async move {
                    let alive = this.ping(&peer, timeout, cancel).await.is_ok();
                    (peer, alive)
                });
            }
            let mut alive_peers = Vec::new();
            while let Some(joined) = ping_set.join_next().await {
                if let Ok((peer, true)) = joined {
                    alive_peers.push(peer);
                }
            }

            if let Some(t) = target
                && let Some(found) = alive_peers.iter().find(|p| p.address() == t)
            {
                return Ok(Some(found.clone()));
            }

            trace!(
                round,
                discovered = alive_peers.len(),
                "lookup round complete"
            );
            frontier = alive_peers;
        }

        Ok(None)
    }

    /// Re-ping peers not heard from within `max_age` and run a random-address
    /// lookup for every bucket idle at least that long.
    pub async fn refresh_table(
        &self,
        max_age: Duration,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let stale = {
            self.table
                .read()
                .expect("routing table lock")
                .stale_peers(max_age)
        };
        if !stale.is_empty() {
            trace!(count = stale.len(), "re-pinging stale peers");
        }

        let mut join_set = JoinSet::new();
        for peer in stale {
            let this = self.clone();
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let _ = this.ping(&peer, timeout, cancel).await;
            });
        }
        while join_set.join_next().await.is_some() {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
        }

        let stale_buckets = {
            self.table
                .read()
                .expect("routing table lock")
                .stale_buckets(max_age)
        };
        for idx in stale_buckets {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let address = {
                self.table
                    .read()
                    .expect("routing table lock")
                    .random_address_in_bucket(idx)
            };
            let _ = self
                .find_specific_peer(None, None, 1, address, timeout, cancel.clone())
                .await;
            self.table
                .write()
                .expect("routing table lock")
                .mark_bucket_refreshed(idx);
        }
        Ok(())
    }

    /// Ping every replacement-cache candidate; live ones enter the table via
    /// the ordinary add path, dead ones are dropped from the cache.
    pub async fn check_replacement_cache(
        &self,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let candidates = {
            self.table
                .read()
                .expect("routing table lock")
                .replacement_candidates()
        };
        for candidate in candidates {
            // A live candidate re-enters through the ordinary add path; a
            // dead one is simply forgotten. Either way it leaves the cache.
            let _ = self.ping(&candidate, timeout, cancel.clone()).await;
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            self.table
                .write()
                .expect("routing table lock")
                .drop_replacement(&candidate.address());
        }
        Ok(())
    }

    /// Periodic wide exploration: lookups toward a few random addresses and
    /// toward ourselves.
    pub async fn rebuild_connection(
        &self,
        depth: usize,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        for _ in 0..REBUILD_RANDOM_LOOKUPS {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let _ = self
                .find_specific_peer(
                    None,
                    None,
                    depth,
                    PeerAddress::random(),
                    timeout,
                    cancel.clone(),
                )
                .await;
        }
        self.find_specific_peer(None, None, depth, self.local_address, timeout, cancel)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RouterIdentity;
    use crate::identity::{Endpoint, Peer, PrivateKey};
    use crate::version::AppProtocolVersion;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn make_peer(port: u16) -> BoundPeer {
        let key = PrivateKey::generate();
        let version = AppProtocolVersion::sign(&key, 1, Vec::new());
        BoundPeer::new(
            Peer::new(key.public_key(), version),
            Endpoint::new("127.0.0.1", port),
        )
    }

    fn make_table(bucket_size: usize) -> RoutingTable {
        RoutingTable::new(PeerAddress::random(), DEFAULT_TABLE_SIZE, bucket_size)
    }

    // ------------------------------------------------------------------
    // Routing table
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn peers_live_in_their_distance_bucket() {
        let mut table = make_table(DEFAULT_BUCKET_SIZE);
        let local = table.local_address();
        for port in 0..64 {
            let peer = make_peer(10_000 + port);
            let expected = table.bucket_index(&peer.address());
            table.add(peer.clone());
            assert_eq!(
                expected,
                local
                    .common_prefix_len(&peer.address())
                    .min(DEFAULT_TABLE_SIZE - 1)
            );
            assert!(table.contains(&peer.address()));
        }
        // Each peer appears exactly once across all buckets.
        let mut seen = HashSet::new();
        for peer in table.peers() {
            assert!(seen.insert(peer.address()), "peer appears twice");
        }
    }

    #[tokio::test]
    async fn re_adding_refreshes_instead_of_duplicating() {
        let mut table = make_table(DEFAULT_BUCKET_SIZE);
        let peer = make_peer(1);
        assert!(matches!(table.add(peer.clone()), AddOutcome::Added));
        assert!(matches!(table.add(peer.clone()), AddOutcome::Refreshed));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn full_bucket_reports_oldest_and_caches_newcomer() {
        // Bucket size 1 forces every second insert into the same bucket to
        // overflow once a collision happens.
        let mut table = make_table(1);
        let mut first_in_bucket: HashMap<usize, BoundPeer> = HashMap::new();

        for port in 0..200u16 {
            let peer = make_peer(3000 + port);
            let idx = table.bucket_index(&peer.address());
            match table.add(peer.clone()) {
                AddOutcome::Added => {
                    first_in_bucket.insert(idx, peer);
                }
                AddOutcome::Full { oldest } => {
                    let expected = &first_in_bucket[&idx];
                    assert_eq!(oldest.address(), expected.address());

                    // The newcomer waits in the replacement cache and is
                    // promoted when the incumbent is evicted.
                    let promoted = table
                        .evict_and_promote(&oldest.address())
                        .expect("replacement must be promoted");
                    assert_eq!(promoted.address(), peer.address());
                    assert!(table.contains(&peer.address()));
                    assert!(!table.contains(&oldest.address()));
                    return;
                }
                _ => {}
            }
        }
        panic!("no bucket collision in 200 random peers");
    }

    #[tokio::test]
    async fn neighbors_sorted_by_distance() {
        let mut table = make_table(DEFAULT_BUCKET_SIZE);
        for port in 0..32 {
            table.add(make_peer(5000 + port));
        }
        let target = PeerAddress::random();
        let neighbors = table.neighbors(&target, 8);
        assert!(neighbors.len() <= 8);
        for pair in neighbors.windows(2) {
            let da = pair[0].address().xor_distance(&target);
            let db = pair[1].address().xor_distance(&target);
            assert_ne!(distance_cmp(&da, &db), std::cmp::Ordering::Greater);
        }
    }

    #[tokio::test]
    async fn broadcast_sample_excludes_and_spreads() {
        let mut table = make_table(DEFAULT_BUCKET_SIZE);
        let mut peers = Vec::new();
        for port in 0..40 {
            let peer = make_peer(6000 + port);
            table.add(peer.clone());
            peers.push(peer);
        }
        let except = peers[0].address();
        let sample = table.peers_to_broadcast(Some(except));
        assert!(!sample.is_empty());
        assert!(sample.iter().all(|p| p.address() != except));
        let unique: HashSet<PeerAddress> = sample.iter().map(|p| p.address()).collect();
        assert_eq!(unique.len(), sample.len(), "sample must not repeat peers");
    }

    #[tokio::test]
    async fn random_bucket_address_lands_in_bucket() {
        let table = make_table(DEFAULT_BUCKET_SIZE);
        for idx in 0..DEFAULT_TABLE_SIZE {
            let address = table.random_address_in_bucket(idx);
            assert_eq!(table.bucket_index(&address), idx);
        }
    }

    #[tokio::test]
    async fn render_lists_known_peers() {
        let mut table = make_table(DEFAULT_BUCKET_SIZE);
        let peer = make_peer(7001);
        table.add(peer.clone());
        let dump = table.render();
        assert!(dump.contains(&peer.address().to_string()));
        assert!(dump.contains("127.0.0.1:7001"));
    }

    // ------------------------------------------------------------------
    // Protocol against a scripted messenger
    // ------------------------------------------------------------------

    /// Messenger double: answers Ping with Pong (unless the peer is marked
    /// dead) and FindNeighbors with a scripted peer list.
    struct ScriptedMessenger {
        dead: Mutex<HashSet<PeerAddress>>,
        neighbors: Mutex<HashMap<PeerAddress, Vec<BoundPeer>>>,
        replies_sent: Mutex<Vec<MessageBody>>,
    }

    impl ScriptedMessenger {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                dead: Mutex::new(HashSet::new()),
                neighbors: Mutex::new(HashMap::new()),
                replies_sent: Mutex::new(Vec::new()),
            })
        }

        fn mark_dead(&self, address: PeerAddress) {
            self.dead.lock().unwrap().insert(address);
        }

        fn script_neighbors(&self, of: PeerAddress, peers: Vec<BoundPeer>) {
            self.neighbors.lock().unwrap().insert(of, peers);
        }
    }

    #[async_trait]
    impl Messenger for ScriptedMessenger {
        async fn send_with_reply(
            &self,
            peer: &BoundPeer,
            body: MessageBody,
            _timeout: Option<Duration>,
            _expected_responses: usize,
            _cancel: CancellationToken,
        ) -> Result<Vec<Message>, TransportError> {
            if self.dead.lock().unwrap().contains(&peer.address()) {
                return Err(TransportError::Timeout);
            }
            let reply_body = match body {
                MessageBody::Ping => MessageBody::Pong,
                MessageBody::FindNeighbors(_) => MessageBody::Neighbors(
                    self.neighbors
                        .lock()
                        .unwrap()
                        .get(&peer.address())
                        .cloned()
                        .unwrap_or_default(),
                ),
                other => {
                    return Err(TransportError::Unexpected(format!(
                        "unscripted body {}",
                        other.label()
                    )));
                }
            };
            Ok(vec![Message {
                identity: None,
                body: reply_body,
                remote: peer.clone(),
            }])
        }

        async fn broadcast(
            &self,
            _except: Option<PeerAddress>,
            _body: MessageBody,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn reply(
            &self,
            _identity: RouterIdentity,
            body: MessageBody,
        ) -> Result<(), TransportError> {
            self.replies_sent.lock().unwrap().push(body);
            Ok(())
        }
    }

    fn make_protocol(
        messenger: Arc<ScriptedMessenger>,
    ) -> KademliaProtocol<ScriptedMessenger> {
        let table = Arc::new(RwLock::new(RoutingTable::new(
            PeerAddress::random(),
            DEFAULT_TABLE_SIZE,
            DEFAULT_BUCKET_SIZE,
        )));
        KademliaProtocol::new(table, messenger)
    }

    #[tokio::test]
    async fn ping_success_admits_peer() {
        let messenger = ScriptedMessenger::new();
        let protocol = make_protocol(messenger.clone());
        let peer = make_peer(8000);

        protocol
            .ping(&peer, None, CancellationToken::new())
            .await
            .expect("ping");
        assert!(
            protocol
                .table()
                .read()
                .unwrap()
                .contains(&peer.address())
        );
    }

    #[tokio::test]
    async fn ping_failure_surfaces_and_evicts() {
        let messenger = ScriptedMessenger::new();
        let protocol = make_protocol(messenger.clone());
        let peer = make_peer(8001);

        protocol
            .ping(&peer, None, CancellationToken::new())
            .await
            .expect("first ping");
        messenger.mark_dead(peer.address());

        let err = protocol
            .ping(&peer, None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        assert!(
            !protocol
                .table()
                .read()
                .unwrap()
                .contains(&peer.address())
        );
    }

    #[tokio::test]
    async fn receive_ping_replies_pong() {
        let messenger = ScriptedMessenger::new();
        let protocol = make_protocol(messenger.clone());
        let sender = make_peer(8002);

        let message = Message {
            identity: Some(RouterIdentity(vec![1, 2, 3])),
            body: MessageBody::Ping,
            remote: sender.clone(),
        };
        protocol.receive_message(&message).await.expect("receive");

        let replies = messenger.replies_sent.lock().unwrap();
        assert!(matches!(replies.as_slice(), [MessageBody::Pong]));
        drop(replies);
        assert!(
            protocol
                .table()
                .read()
                .unwrap()
                .contains(&sender.address())
        );
    }

    #[tokio::test]
    async fn receive_find_neighbors_replies_with_closest() {
        let messenger = ScriptedMessenger::new();
        let protocol = make_protocol(messenger.clone());

        let known = make_peer(8003);
        protocol
            .ping(&known, None, CancellationToken::new())
            .await
            .expect("seed table");

        let asker = make_peer(8004);
        let message = Message {
            identity: Some(RouterIdentity(vec![9])),
            body: MessageBody::FindNeighbors(known.address()),
            remote: asker,
        };
        protocol.receive_message(&message).await.expect("receive");

        let replies = messenger.replies_sent.lock().unwrap();
        let MessageBody::Neighbors(neighbors) = &replies[0] else {
            panic!("expected Neighbors reply");
        };
        assert!(neighbors.iter().any(|p| p.address() == known.address()));
    }

    #[tokio::test]
    async fn bootstrap_requires_a_live_seed() {
        let messenger = ScriptedMessenger::new();
        let protocol = make_protocol(messenger.clone());
        let seed = make_peer(8005);
        messenger.mark_dead(seed.address());

        let err = protocol
            .bootstrap(
                std::slice::from_ref(&seed),
                Some(Duration::from_millis(50)),
                None,
                1,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unexpected(_)));
    }

    #[tokio::test]
    async fn lookup_walks_scripted_topology() {
        let messenger = ScriptedMessenger::new();
        let protocol = make_protocol(messenger.clone());

        // seed knows `middle`, middle knows `goal`.
        let seed = make_peer(8100);
        let middle = make_peer(8101);
        let goal = make_peer(8102);
        messenger.script_neighbors(seed.address(), vec![middle.clone()]);
        messenger.script_neighbors(middle.address(), vec![goal.clone()]);

        let found = protocol
            .find_specific_peer(
                Some(goal.address()),
                Some(seed.clone()),
                3,
                goal.address(),
                Some(Duration::from_millis(200)),
                CancellationToken::new(),
            )
            .await
            .expect("lookup");
        assert_eq!(found.map(|p| p.address()), Some(goal.address()));
        assert!(protocol.table().read().unwrap().contains(&goal.address()));
    }

    #[tokio::test]
    async fn refresh_evicts_dead_peers() {
        let messenger = ScriptedMessenger::new();
        let protocol = make_protocol(messenger.clone());
        let peer = make_peer(8200);
        protocol
            .ping(&peer, None, CancellationToken::new())
            .await
            .expect("admit");

        messenger.mark_dead(peer.address());
        protocol
            .refresh_table(
                Duration::ZERO,
                Some(Duration::from_millis(50)),
                CancellationToken::new(),
            )
            .await
            .expect("refresh");
        assert!(
            !protocol
                .table()
                .read()
                .unwrap()
                .contains(&peer.address())
        );
    }
}
