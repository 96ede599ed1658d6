//! Capability trait connecting the Kademlia protocol to the transport.
//!
//! The protocol needs to send request/reply exchanges, broadcasts, and
//! router replies, all of which the transport implements, while the
//! transport's queues need the protocol's routing table to compute broadcast
//! recipients. Defining the narrow [`Messenger`] capability here and
//! injecting it into the protocol keeps that relationship one-directional at
//! the type level.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::codec::{Message, MessageBody, RouterIdentity};
use crate::error::TransportError;
use crate::identity::BoundPeer;

/// The slice of the transport the Kademlia protocol is allowed to use.
#[async_trait]
pub trait Messenger: Send + Sync + 'static {
    /// One request/reply exchange: send `body` to `peer` and await
    /// `expected_responses` reply messages, each within `timeout`.
    ///
    /// The returned list preserves reply arrival order. No ordering holds
    /// across distinct calls, even to the same peer.
    async fn send_with_reply(
        &self,
        peer: &BoundPeer,
        body: MessageBody,
        timeout: Option<Duration>,
        expected_responses: usize,
        cancel: CancellationToken,
    ) -> Result<Vec<Message>, TransportError>;

    /// Fan `body` out to the broadcast recipient set, excluding `except`.
    /// Fire-and-forget; enqueueing is the only awaited step.
    async fn broadcast(
        &self,
        except: Option<crate::identity::PeerAddress>,
        body: MessageBody,
    ) -> Result<(), TransportError>;

    /// Send `body` back through the router to the connection identified by
    /// `identity`. Failures are logged by the reply consumer, not retried.
    async fn reply(
        &self,
        identity: RouterIdentity,
        body: MessageBody,
    ) -> Result<(), TransportError>;
}
