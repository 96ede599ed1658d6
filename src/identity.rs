//! # Peer Identity
//!
//! Core identity types for the transport:
//!
//! - [`PrivateKey`] / [`PublicKey`]: Ed25519 signing keypair halves
//! - [`PeerAddress`]: 20-byte BLAKE3-derived address used for routing
//! - [`Peer`] / [`BoundPeer`]: value-typed peer records, the latter with a
//!   known network endpoint
//!
//! ## Identity Model
//!
//! A peer's address is a fixed hash of its public key, so possession of the
//! private key proves ownership of the address. Addresses are what the
//! Kademlia routing table and the dealer pool key on; two peer records are
//! equal iff their addresses are equal, regardless of advertised endpoint or
//! version metadata.
//!
//! ## Invariants
//!
//! - `PeerAddress::from_public_key` is deterministic and collision-resistant
//!   to the strength of BLAKE3 truncated to 160 bits.
//! - XOR distance is symmetric and zero only for identical addresses.

use std::net::IpAddr;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::version::AppProtocolVersion;

/// Length of a peer address in bytes.
pub const ADDRESS_LEN: usize = 20;

#[derive(Clone)]
pub struct PrivateKey {
    signing_key: SigningKey,
}

impl PrivateKey {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn address(&self) -> PeerAddress {
        self.public_key().address()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether the key decodes to a valid Ed25519 point.
    pub fn is_valid(&self) -> bool {
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }

    /// The routing address derived from this key: BLAKE3 of the key bytes,
    /// truncated to [`ADDRESS_LEN`].
    pub fn address(&self) -> PeerAddress {
        let digest = blake3::hash(&self.0);
        let mut addr = [0u8; ADDRESS_LEN];
        addr.copy_from_slice(&digest.as_bytes()[..ADDRESS_LEN]);
        PeerAddress(addr)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerAddress([u8; ADDRESS_LEN]);

impl PeerAddress {
    #[inline]
    pub fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// A uniformly random address. Used for bucket-range lookups and
    /// connection rebuilds.
    pub fn random() -> Self {
        let mut bytes = [0u8; ADDRESS_LEN];
        if getrandom::getrandom(&mut bytes).is_err() {
            // Fallback only reachable when the OS entropy source is broken;
            // a biased address degrades lookup spread, nothing else.
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = (i as u8).wrapping_mul(97).wrapping_add(13);
            }
        }
        Self(bytes)
    }

    #[inline]
    pub fn xor_distance(&self, other: &PeerAddress) -> [u8; ADDRESS_LEN] {
        let mut out = [0u8; ADDRESS_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Number of leading zero bits in the XOR distance to `other`.
    /// Equals `ADDRESS_LEN * 8` when the addresses are identical.
    pub fn common_prefix_len(&self, other: &PeerAddress) -> usize {
        let dist = self.xor_distance(other);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        ADDRESS_LEN * 8
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Total-order comparison of two XOR distances, closest first.
pub fn distance_cmp(a: &[u8; ADDRESS_LEN], b: &[u8; ADDRESS_LEN]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// A network endpoint as advertised by a peer. The host may be a DNS name;
/// it is resolved at connect time.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `(host, port)` pair accepted by `tokio::net::TcpStream::connect`.
    pub fn connect_pair(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }

    pub fn is_loopback(&self) -> bool {
        self.host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(self.host == "localhost")
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// A peer known by identity but not necessarily reachable.
///
/// Peers are value types: immutable after construction, compared and hashed
/// by [`PeerAddress`] only.
#[derive(Clone, Serialize, Deserialize)]
pub struct Peer {
    pub public_key: PublicKey,
    pub version: AppProtocolVersion,
    pub public_ip: Option<IpAddr>,
}

impl Peer {
    pub fn new(public_key: PublicKey, version: AppProtocolVersion) -> Self {
        Self {
            public_key,
            version,
            public_ip: None,
        }
    }

    #[inline]
    pub fn address(&self) -> PeerAddress {
        self.public_key.address()
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer({:?}, v{})", self.address(), self.version.version)
    }
}

/// A peer with a known network endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct BoundPeer {
    pub peer: Peer,
    pub endpoint: Endpoint,
}

impl BoundPeer {
    pub fn new(peer: Peer, endpoint: Endpoint) -> Self {
        Self { peer, endpoint }
    }

    #[inline]
    pub fn address(&self) -> PeerAddress {
        self.peer.address()
    }

    #[inline]
    pub fn public_key(&self) -> &PublicKey {
        &self.peer.public_key
    }

    #[inline]
    pub fn version(&self) -> &AppProtocolVersion {
        &self.peer.version
    }
}

impl PartialEq for BoundPeer {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for BoundPeer {}

impl std::hash::Hash for BoundPeer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl std::fmt::Debug for BoundPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BoundPeer({:?}, {}, v{})",
            self.address(),
            self.endpoint,
            self.peer.version.version
        )
    }
}
