//! # Wire Message Codec
//!
//! Messages travel as ordered multipart frame sequences suitable for an
//! identity-prefixed router protocol:
//!
//! ```text
//! [identity?] [body frames…] [version] [peer] [signature]
//! ```
//!
//! The identity frame exists only on router legs (inbound dispatch and
//! outbound replies); dealers emit and receive messages without it. The
//! signable region opens with a fixed domain tag and then carries the body,
//! version, and peer frames in order, each length-prefixed so frame
//! boundaries are unambiguous; the tag keeps a message signature from ever
//! verifying as any other signed braidnet artifact. The identity frame is
//! assigned by the routing layer and the signature frame is the signature
//! itself, so neither is covered.
//!
//! Deserialization is bounded (`deserialize_bounded`) on every frame.
//! `decode` proves the message was signed by the claimed key; whether that
//! key belongs to a compatible peer is the version gate's call, not the
//! codec's.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use bincode::Options;
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::TransportError;
use crate::identity::{BoundPeer, Endpoint, Peer, PeerAddress, PrivateKey, PublicKey, ADDRESS_LEN};
use crate::version::AppProtocolVersion;

/// One wire frame.
pub type Frame = Vec<u8>;

/// Maximum size of a user payload frame (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization, slightly above the payload cap to
/// allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_PAYLOAD_SIZE as u64) + 4096;

/// Maximum number of frames a single message may carry.
pub const MAX_FRAMES_PER_MESSAGE: usize = 16;

/// Leading bytes of every signable region. Version tokens use their own tag
/// (see `version`), so signatures cannot cross artifact boundaries.
const MESSAGE_SIGNATURE_DOMAIN: &[u8] = b"braidnet-message-v1:";

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced. All inbound frame parsing goes
/// through here.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

// Body tags. User kinds live in a separate registry keyed by u16.
const TAG_PING: u8 = 0x01;
const TAG_PONG: u8 = 0x02;
const TAG_FIND_NEIGHBORS: u8 = 0x03;
const TAG_NEIGHBORS: u8 = 0x04;
const TAG_USER: u8 = 0x10;

/// Opaque routing token attached by the router to inbound messages so
/// replies can be directed back to the originating connection.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RouterIdentity(pub Vec<u8>);

impl RouterIdentity {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for RouterIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RouterIdentity({})", hex::encode(&self.0))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    Ping,
    Pong,
    FindNeighbors(PeerAddress),
    Neighbors(Vec<BoundPeer>),
    User { kind: u16, payload: Vec<u8> },
}

impl MessageBody {
    pub fn is_ping(&self) -> bool {
        matches!(self, MessageBody::Ping)
    }

    /// Short label for logs and the message history ring.
    pub fn label(&self) -> String {
        match self {
            MessageBody::Ping => "ping".into(),
            MessageBody::Pong => "pong".into(),
            MessageBody::FindNeighbors(_) => "find-neighbors".into(),
            MessageBody::Neighbors(peers) => format!("neighbors({})", peers.len()),
            MessageBody::User { kind, .. } => format!("user({kind:#06x})"),
        }
    }
}

/// A parsed wire message.
#[derive(Clone, Debug)]
pub struct Message {
    /// Routing token, present only when the message arrived via the router.
    pub identity: Option<RouterIdentity>,
    pub body: MessageBody,
    /// Sender as claimed by the (signature-verified) peer frame.
    pub remote: BoundPeer,
}

/// Registry of host-defined message kinds. Populated at construction; the
/// codec rejects user messages with unregistered kinds as invalid.
#[derive(Debug, Default)]
pub struct MessageKindRegistry {
    kinds: HashMap<u16, String>,
}

impl MessageKindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: u16, name: impl Into<String>) -> Self {
        self.kinds.insert(kind, name.into());
        self
    }

    pub fn contains(&self, kind: u16) -> bool {
        self.kinds.contains_key(&kind)
    }

    pub fn name_of(&self, kind: u16) -> Option<&str> {
        self.kinds.get(&kind).map(String::as_str)
    }
}

/// Peer frame contents. The sender's version travels in its own frame, so
/// the peer frame carries only key, public IP, and advertised endpoint.
#[derive(Serialize, Deserialize)]
struct WirePeer {
    public_key: PublicKey,
    public_ip: Option<IpAddr>,
    endpoint: Endpoint,
}

pub struct MessageCodec {
    private_key: PrivateKey,
    registry: Arc<MessageKindRegistry>,
}

impl MessageCodec {
    pub fn new(private_key: PrivateKey, registry: Arc<MessageKindRegistry>) -> Self {
        Self {
            private_key,
            registry,
        }
    }

    /// Serialize and sign `body` as sent by `sender` (which must be our own
    /// bound peer record). `identity` is prepended for router-outbound
    /// replies and omitted on dealer legs.
    pub fn encode(
        &self,
        body: &MessageBody,
        sender: &BoundPeer,
        identity: Option<&RouterIdentity>,
    ) -> Result<Vec<Frame>, TransportError> {
        let mut frames: Vec<Frame> = Vec::with_capacity(6);
        if let Some(id) = identity {
            frames.push(id.0.clone());
        }

        let body_frames = encode_body(body)?;
        let body_start = frames.len();
        frames.extend(body_frames);

        let version_frame = bincode::serialize(&sender.peer.version)
            .map_err(|e| TransportError::InvalidMessage(format!("version frame: {e}")))?;
        let peer_frame = bincode::serialize(&WirePeer {
            public_key: *sender.public_key(),
            public_ip: sender.peer.public_ip,
            endpoint: sender.endpoint.clone(),
        })
        .map_err(|e| TransportError::InvalidMessage(format!("peer frame: {e}")))?;

        let signable = signable_region(&frames[body_start..], &version_frame, &peer_frame);
        let signature = self.private_key.sign(&signable).to_bytes().to_vec();

        frames.push(version_frame);
        frames.push(peer_frame);
        frames.push(signature);
        Ok(frames)
    }

    /// Parse a multipart frame sequence. `expect_identity` is true on
    /// router-inbound messages, where the first frame is the routing token.
    pub fn decode(
        &self,
        frames: &[Frame],
        expect_identity: bool,
    ) -> Result<Message, TransportError> {
        if frames.len() > MAX_FRAMES_PER_MESSAGE {
            return Err(TransportError::InvalidMessage(format!(
                "too many frames: {}",
                frames.len()
            )));
        }

        let trailer_len = if expect_identity { 4 } else { 3 };
        if frames.len() < trailer_len + 1 {
            return Err(TransportError::InvalidMessage(format!(
                "too few frames: {}",
                frames.len()
            )));
        }

        let (identity, rest) = if expect_identity {
            let (id, rest) = frames.split_first().expect("length checked above");
            (Some(RouterIdentity(id.clone())), rest)
        } else {
            (None, frames)
        };

        let (signature, rest) = rest.split_last().expect("length checked above");
        let (peer_frame, rest) = rest.split_last().expect("length checked above");
        let (version_frame, body_frames) = rest.split_last().expect("length checked above");

        let wire_peer: WirePeer = deserialize_bounded(peer_frame)
            .map_err(|e| TransportError::InvalidMessage(format!("peer frame: {e}")))?;
        let version: AppProtocolVersion = deserialize_bounded(version_frame)
            .map_err(|e| TransportError::InvalidMessage(format!("version frame: {e}")))?;

        let verifying_key = VerifyingKey::try_from(wire_peer.public_key.as_bytes().as_slice())
            .map_err(|_| {
                TransportError::InvalidMessage("sender key is not a valid Ed25519 point".into())
            })?;
        let sig_bytes: [u8; 64] = signature.as_slice().try_into().map_err(|_| {
            TransportError::InvalidMessage(format!(
                "signature frame is {} bytes, expected 64",
                signature.len()
            ))
        })?;
        let signable = signable_region(body_frames, version_frame, peer_frame);
        verifying_key
            .verify_strict(&signable, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| TransportError::InvalidMessage("signature verification failed".into()))?;

        let body = decode_body(body_frames, &self.registry)?;

        let mut peer = Peer::new(wire_peer.public_key, version);
        peer.public_ip = wire_peer.public_ip;
        Ok(Message {
            identity,
            body,
            remote: BoundPeer::new(peer, wire_peer.endpoint),
        })
    }
}

/// Canonical signable byte string: the domain tag, then every covered frame
/// length-prefixed, in body → version → peer order.
fn signable_region(body_frames: &[Frame], version_frame: &[u8], peer_frame: &[u8]) -> Vec<u8> {
    let total: usize = MESSAGE_SIGNATURE_DOMAIN.len()
        + body_frames.iter().map(|f| f.len() + 4).sum::<usize>()
        + version_frame.len()
        + peer_frame.len()
        + 8;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(MESSAGE_SIGNATURE_DOMAIN);
    for frame in body_frames {
        out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        out.extend_from_slice(frame);
    }
    out.extend_from_slice(&(version_frame.len() as u32).to_be_bytes());
    out.extend_from_slice(version_frame);
    out.extend_from_slice(&(peer_frame.len() as u32).to_be_bytes());
    out.extend_from_slice(peer_frame);
    out
}

fn encode_body(body: &MessageBody) -> Result<Vec<Frame>, TransportError> {
    match body {
        MessageBody::Ping => Ok(vec![vec![TAG_PING]]),
        MessageBody::Pong => Ok(vec![vec![TAG_PONG]]),
        MessageBody::FindNeighbors(target) => {
            Ok(vec![vec![TAG_FIND_NEIGHBORS], target.as_bytes().to_vec()])
        }
        MessageBody::Neighbors(peers) => {
            let encoded = bincode::serialize(peers)
                .map_err(|e| TransportError::InvalidMessage(format!("neighbors frame: {e}")))?;
            Ok(vec![vec![TAG_NEIGHBORS], encoded])
        }
        MessageBody::User { kind, payload } => {
            if payload.len() > MAX_PAYLOAD_SIZE {
                return Err(TransportError::InvalidMessage(format!(
                    "payload too large: {} bytes",
                    payload.len()
                )));
            }
            let kind_bytes = kind.to_be_bytes();
            Ok(vec![
                vec![TAG_USER, kind_bytes[0], kind_bytes[1]],
                payload.clone(),
            ])
        }
    }
}

fn decode_body(
    frames: &[Frame],
    registry: &MessageKindRegistry,
) -> Result<MessageBody, TransportError> {
    let tag_frame = frames
        .first()
        .ok_or_else(|| TransportError::InvalidMessage("missing body tag frame".into()))?;
    let tag = *tag_frame
        .first()
        .ok_or_else(|| TransportError::InvalidMessage("empty body tag frame".into()))?;

    match tag {
        TAG_PING if frames.len() == 1 => Ok(MessageBody::Ping),
        TAG_PONG if frames.len() == 1 => Ok(MessageBody::Pong),
        TAG_FIND_NEIGHBORS if frames.len() == 2 => {
            let raw: [u8; ADDRESS_LEN] = frames[1]
                .as_slice()
                .try_into()
                .map_err(|_| TransportError::InvalidMessage("malformed target address".into()))?;
            Ok(MessageBody::FindNeighbors(PeerAddress::from_bytes(raw)))
        }
        TAG_NEIGHBORS if frames.len() == 2 => {
            let peers: Vec<BoundPeer> = deserialize_bounded(&frames[1])
                .map_err(|e| TransportError::InvalidMessage(format!("neighbors frame: {e}")))?;
            Ok(MessageBody::Neighbors(peers))
        }
        TAG_USER if frames.len() == 2 && tag_frame.len() == 3 => {
            let kind = u16::from_be_bytes([tag_frame[1], tag_frame[2]]);
            if !registry.contains(kind) {
                return Err(TransportError::InvalidMessage(format!(
                    "unregistered message kind {kind:#06x}"
                )));
            }
            if frames[1].len() > MAX_PAYLOAD_SIZE {
                return Err(TransportError::InvalidMessage(format!(
                    "payload too large: {} bytes",
                    frames[1].len()
                )));
            }
            Ok(MessageBody::User {
                kind,
                payload: frames[1].clone(),
            })
        }
        other => Err(TransportError::InvalidMessage(format!(
            "malformed body (tag {other:#04x}, {} frames)",
            frames.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Endpoint, Peer, PrivateKey};
    use crate::version::AppProtocolVersion;

    fn make_codec(registry: MessageKindRegistry) -> (MessageCodec, BoundPeer) {
        let key = PrivateKey::generate();
        let version = AppProtocolVersion::sign(&key, 1, Vec::new());
        let peer = BoundPeer::new(
            Peer::new(key.public_key(), version),
            Endpoint::new("127.0.0.1", 31234),
        );
        (MessageCodec::new(key, Arc::new(registry)), peer)
    }

    fn roundtrip(body: MessageBody) {
        let (codec, sender) = make_codec(MessageKindRegistry::new().register(0x0042, "blocks"));
        let frames = codec.encode(&body, &sender, None).expect("encode");
        let message = codec.decode(&frames, false).expect("decode");
        assert_eq!(message.body, body);
        assert_eq!(message.remote, sender);
        assert_eq!(message.remote.endpoint, sender.endpoint);
        assert!(message.identity.is_none());
    }

    #[test]
    fn bodies_roundtrip() {
        roundtrip(MessageBody::Ping);
        roundtrip(MessageBody::Pong);
        roundtrip(MessageBody::FindNeighbors(PeerAddress::random()));
        roundtrip(MessageBody::User {
            kind: 0x0042,
            payload: b"block data".to_vec(),
        });

        let other_key = PrivateKey::generate();
        let other = BoundPeer::new(
            Peer::new(
                other_key.public_key(),
                AppProtocolVersion::sign(&other_key, 1, Vec::new()),
            ),
            Endpoint::new("10.1.2.3", 9999),
        );
        roundtrip(MessageBody::Neighbors(vec![other]));
    }

    #[test]
    fn identity_frame_roundtrip() {
        let (codec, sender) = make_codec(MessageKindRegistry::new());
        let id = RouterIdentity(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let frames = codec
            .encode(&MessageBody::Pong, &sender, Some(&id))
            .expect("encode");
        let message = codec.decode(&frames, true).expect("decode");
        assert_eq!(message.identity, Some(id));
        assert_eq!(message.body, MessageBody::Pong);
    }

    #[test]
    fn tampered_payload_rejected() {
        let (codec, sender) = make_codec(MessageKindRegistry::new().register(1, "tx"));
        let mut frames = codec
            .encode(
                &MessageBody::User {
                    kind: 1,
                    payload: b"honest".to_vec(),
                },
                &sender,
                None,
            )
            .expect("encode");
        frames[1] = b"forged".to_vec();
        let err = codec.decode(&frames, false).unwrap_err();
        assert!(matches!(err, TransportError::InvalidMessage(_)));
    }

    #[test]
    fn tampered_signature_rejected() {
        let (codec, sender) = make_codec(MessageKindRegistry::new());
        let mut frames = codec.encode(&MessageBody::Ping, &sender, None).expect("encode");
        let last = frames.len() - 1;
        frames[last][0] ^= 0xFF;
        assert!(codec.decode(&frames, false).is_err());
    }

    #[test]
    fn signature_not_transplantable_between_messages() {
        // A valid signature from one message must not authenticate another
        // message from the same sender.
        let (codec, sender) = make_codec(MessageKindRegistry::new());
        let ping = codec.encode(&MessageBody::Ping, &sender, None).expect("encode ping");
        let mut pong = codec.encode(&MessageBody::Pong, &sender, None).expect("encode pong");
        let last = pong.len() - 1;
        pong[last] = ping[ping.len() - 1].clone();
        assert!(codec.decode(&pong, false).is_err());
        assert!(codec.decode(&ping, false).is_ok(), "donor message stays valid");
    }

    #[test]
    fn short_signature_frame_rejected() {
        let (codec, sender) = make_codec(MessageKindRegistry::new());
        let mut frames = codec.encode(&MessageBody::Ping, &sender, None).expect("encode");
        let last = frames.len() - 1;
        frames[last].truncate(10);
        let err = codec.decode(&frames, false).unwrap_err();
        assert!(matches!(err, TransportError::InvalidMessage(_)));
    }

    #[test]
    fn unregistered_kind_rejected() {
        let (codec, sender) = make_codec(MessageKindRegistry::new().register(7, "tx"));
        let frames = codec
            .encode(
                &MessageBody::User {
                    kind: 7,
                    payload: vec![],
                },
                &sender,
                None,
            )
            .expect("encode");

        let bare = MessageCodec::new(PrivateKey::generate(), Arc::new(MessageKindRegistry::new()));
        let err = bare.decode(&frames, false).unwrap_err();
        assert!(matches!(err, TransportError::InvalidMessage(_)));
    }

    #[test]
    fn truncated_messages_rejected() {
        let (codec, sender) = make_codec(MessageKindRegistry::new());
        let frames = codec.encode(&MessageBody::Ping, &sender, None).expect("encode");
        assert!(codec.decode(&frames[..2], false).is_err());
        assert!(codec.decode(&[], false).is_err());
        // A message without an identity frame is one frame short when the
        // router layout is expected.
        assert!(codec.decode(&frames, true).is_err());
    }
}
