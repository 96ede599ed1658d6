//! # Braidnet - Peer-to-Peer Transport for Blockchain Nodes
//!
//! Braidnet delivers authenticated, versioned application messages between
//! nodes over an unreliable network, maintains a Kademlia routing table of
//! known peers, and traverses NAT through a TURN relay when the local node
//! has no reachable public address.
//!
//! - **Identity**: Ed25519 keys; a peer's routing address is a BLAKE3 hash
//!   of its public key
//! - **Messages**: multipart-framed, signed per message, versioned by a
//!   signed app protocol token
//! - **Sockets**: one inbound router socket; per-peer outbound dealers
//! - **Dispatch**: worker pool with bounded retries over dedicated
//!   per-exchange sockets
//! - **Discovery**: Kademlia buckets with replacement caches, periodic
//!   refresh, bootstrap, and targeted lookup
//! - **NAT traversal**: TURN (RFC 5766/6062) allocation, permission, and
//!   TCP proxy lifecycle
//!
//! ## Quick Start
//!
//! ```ignore
//! let key = PrivateKey::generate();
//! let version = AppProtocolVersion::sign(&key, 1, Vec::new());
//! let mut config = TransportConfig::new(key, version);
//! config.host = Some("203.0.113.7".into());
//!
//! let transport = Transport::new(config);
//! transport.start().await?;
//! tokio::spawn({ let t = transport.clone(); async move { t.run().await } });
//! transport.wait_for_running().await;
//!
//! transport.bootstrap(&seeds, None, None, 3).await?;
//! let pong = transport
//!     .send_message_with_reply(&peer, MessageBody::Ping, Some(timeout), cancel)
//!     .await?;
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `transport` | Lifecycle supervisor and public API |
//! | `identity` | Keys, addresses, `Peer`/`BoundPeer` records |
//! | `version` | Signed app protocol versions and the compatibility gate |
//! | `codec` | Multipart wire codec with per-message signatures |
//! | `router` / `dealer` | Inbound routing socket, outbound socket pool |
//! | `dispatcher` | Request queue, worker pool, broadcast/reply queues |
//! | `kademlia` | Routing table and discovery protocol |
//! | `turn` / `stun` | TURN relay client and STUN wire codec |

mod codec;
mod dealer;
mod dispatcher;
mod error;
mod identity;
mod kademlia;
mod protocols;
mod router;
mod stun;
mod transport;
mod turn;
mod version;

pub use codec::{Message, MessageBody, MessageKindRegistry, RouterIdentity};
pub use dispatcher::{Direction, HistoryEntry};
pub use error::TransportError;
pub use identity::{BoundPeer, Endpoint, Peer, PeerAddress, PrivateKey, PublicKey};
pub use kademlia::{DEFAULT_BUCKET_SIZE, DEFAULT_FIND_DEPTH, DEFAULT_TABLE_SIZE};
pub use protocols::Messenger;
pub use transport::{MessageHandler, Transport, TransportConfig};
pub use turn::{IceServer, PERMISSION_LIFETIME};
pub use version::{AppProtocolVersion, DifferentVersionHook};

pub use tokio_util::sync::CancellationToken;
