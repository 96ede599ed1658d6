//! # STUN/TURN Wire Codec
//!
//! Encoder/decoder for the subset of STUN (RFC 5389/8489) and TURN
//! (RFC 5766, RFC 6062) needed by the relay client:
//!
//! | Method | Use |
//! |--------|-----|
//! | Binding | Server-reflexive address discovery |
//! | Allocate | Reserve a relayed transport address |
//! | Refresh | Extend an allocation's lifetime |
//! | CreatePermission | Authorize inbound traffic from a peer |
//! | Connect / ConnectionBind | TCP relay data connections |
//! | ConnectionAttempt | Server indication of an inbound peer connection |
//!
//! Message integrity uses the long-term credential mechanism with the
//! SHA-256 variant: `key = SHA-256(username:realm:password)` and
//! MESSAGE-INTEGRITY-SHA256 over the message with an adjusted length field.
//!
//! This module is pure (no I/O); connection handling lives in `turn`.

use std::net::{IpAddr, SocketAddr};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const HEADER_LEN: usize = 20;

/// Upper bound on a single STUN message, attributes included.
pub const MAX_MESSAGE_LEN: usize = 4096;

pub const METHOD_BINDING: u16 = 0x001;
pub const METHOD_ALLOCATE: u16 = 0x003;
pub const METHOD_REFRESH: u16 = 0x004;
pub const METHOD_CREATE_PERMISSION: u16 = 0x008;
pub const METHOD_CONNECT: u16 = 0x00A;
pub const METHOD_CONNECTION_BIND: u16 = 0x00B;
pub const METHOD_CONNECTION_ATTEMPT: u16 = 0x00C;

const ATTR_USERNAME: u16 = 0x0006;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_LIFETIME: u16 = 0x000D;
const ATTR_XOR_PEER_ADDRESS: u16 = 0x0012;
const ATTR_REALM: u16 = 0x0014;
const ATTR_NONCE: u16 = 0x0015;
const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;
const ATTR_MESSAGE_INTEGRITY_SHA256: u16 = 0x001C;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_CONNECTION_ID: u16 = 0x002A;

/// IANA protocol number for TCP, used in REQUESTED-TRANSPORT.
pub const TRANSPORT_TCP: u8 = 6;

/// Stale-nonce error code; the request must be retried with the fresh nonce.
pub const ERROR_STALE_NONCE: u16 = 438;
/// Unauthenticated; carries the realm and nonce for the retry.
pub const ERROR_UNAUTHENTICATED: u16 = 401;

#[derive(Debug, Error)]
pub enum StunError {
    #[error("truncated STUN message")]
    Truncated,
    #[error("bad magic cookie")]
    BadMagic,
    #[error("malformed STUN message: {0}")]
    Malformed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Class {
    Request,
    Indication,
    Success,
    Error,
}

impl Class {
    fn bits(self) -> u16 {
        match self {
            Class::Request => 0b00,
            Class::Indication => 0b01,
            Class::Success => 0b10,
            Class::Error => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Class::Request,
            0b01 => Class::Indication,
            0b10 => Class::Success,
            _ => Class::Error,
        }
    }
}

/// The class bits are interleaved into the method per RFC 5389 §6.
fn message_type(method: u16, class: Class) -> u16 {
    let c = class.bits();
    ((method & 0x0F80) << 2)
        | ((method & 0x0070) << 1)
        | (method & 0x000F)
        | ((c & 0b10) << 7)
        | ((c & 0b01) << 4)
}

fn split_type(msg_type: u16) -> (u16, Class) {
    let class = Class::from_bits(((msg_type >> 7) & 0b10) | ((msg_type >> 4) & 0b01));
    let method = ((msg_type >> 2) & 0x0F80) | ((msg_type >> 1) & 0x0070) | (msg_type & 0x000F);
    (method, class)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Attribute {
    XorMappedAddress(SocketAddr),
    XorPeerAddress(SocketAddr),
    XorRelayedAddress(SocketAddr),
    Username(String),
    Realm(String),
    Nonce(Vec<u8>),
    ErrorCode { code: u16, reason: String },
    Lifetime(u32),
    RequestedTransport(u8),
    ConnectionId(u32),
    MessageIntegritySha256(Vec<u8>),
    Unknown { attr_type: u16, value: Vec<u8> },
}

#[derive(Clone, Debug)]
pub struct StunMessage {
    pub method: u16,
    pub class: Class,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<Attribute>,
}

impl StunMessage {
    pub fn request(method: u16) -> Self {
        Self {
            method,
            class: Class::Request,
            transaction_id: transaction_id(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn is_success(&self) -> bool {
        self.class == Class::Success
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn xor_relayed_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorRelayedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn xor_peer_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorPeerAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn lifetime(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Lifetime(secs) => Some(*secs),
            _ => None,
        })
    }

    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }

    pub fn realm(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Realm(realm) => Some(realm.as_str()),
            _ => None,
        })
    }

    pub fn nonce(&self) -> Option<&[u8]> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Nonce(nonce) => Some(nonce.as_slice()),
            _ => None,
        })
    }

    pub fn connection_id(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ConnectionId(id) => Some(*id),
            _ => None,
        })
    }

    /// Serialize the message. When `integrity_key` is given, a
    /// MESSAGE-INTEGRITY-SHA256 attribute is appended, computed with the
    /// length field adjusted to cover the attribute itself.
    pub fn encode(&self, integrity_key: Option<&[u8]>) -> Vec<u8> {
        let mut body = Vec::with_capacity(128);
        for attribute in &self.attributes {
            encode_attribute(&mut body, attribute, &self.transaction_id);
        }

        if let Some(key) = integrity_key {
            let adjusted_len = body.len() + 4 + 32;
            let mut covered = Vec::with_capacity(HEADER_LEN + body.len());
            push_header(&mut covered, self.method, self.class, adjusted_len, &self.transaction_id);
            covered.extend_from_slice(&body);

            let mut mac = HmacSha256::new_from_slice(key)
                .expect("HMAC accepts keys of any length");
            mac.update(&covered);
            let digest = mac.finalize().into_bytes();

            body.extend_from_slice(&ATTR_MESSAGE_INTEGRITY_SHA256.to_be_bytes());
            body.extend_from_slice(&32u16.to_be_bytes());
            body.extend_from_slice(&digest);
        }

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        push_header(&mut out, self.method, self.class, body.len(), &self.transaction_id);
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, StunError> {
        if buf.len() < HEADER_LEN {
            return Err(StunError::Truncated);
        }
        let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(StunError::BadMagic);
        }
        if buf.len() < HEADER_LEN + length {
            return Err(StunError::Truncated);
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&buf[8..20]);
        let (method, class) = split_type(msg_type);

        let mut attributes = Vec::new();
        let mut offset = HEADER_LEN;
        let end = HEADER_LEN + length;
        while offset + 4 <= end {
            let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            offset += 4;
            if offset + attr_len > end {
                return Err(StunError::Malformed(format!(
                    "attribute {attr_type:#06x} overruns message"
                )));
            }
            let value = &buf[offset..offset + attr_len];
            attributes.push(decode_attribute(attr_type, value, &transaction_id)?);
            // Attributes are padded to 32-bit boundaries.
            offset += attr_len + ((4 - attr_len % 4) % 4);
        }

        Ok(Self {
            method,
            class,
            transaction_id,
            attributes,
        })
    }
}

fn push_header(out: &mut Vec<u8>, method: u16, class: Class, length: usize, txid: &[u8; 12]) {
    out.extend_from_slice(&message_type(method, class).to_be_bytes());
    out.extend_from_slice(&(length as u16).to_be_bytes());
    out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    out.extend_from_slice(txid);
}

fn encode_attribute(out: &mut Vec<u8>, attribute: &Attribute, txid: &[u8; 12]) {
    let (attr_type, value): (u16, Vec<u8>) = match attribute {
        Attribute::XorMappedAddress(addr) => (ATTR_XOR_MAPPED_ADDRESS, encode_xor_addr(addr, txid)),
        Attribute::XorPeerAddress(addr) => (ATTR_XOR_PEER_ADDRESS, encode_xor_addr(addr, txid)),
        Attribute::XorRelayedAddress(addr) => {
            (ATTR_XOR_RELAYED_ADDRESS, encode_xor_addr(addr, txid))
        }
        Attribute::Username(name) => (ATTR_USERNAME, name.as_bytes().to_vec()),
        Attribute::Realm(realm) => (ATTR_REALM, realm.as_bytes().to_vec()),
        Attribute::Nonce(nonce) => (ATTR_NONCE, nonce.clone()),
        Attribute::ErrorCode { code, reason } => {
            let mut value = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
            value.extend_from_slice(reason.as_bytes());
            (ATTR_ERROR_CODE, value)
        }
        Attribute::Lifetime(secs) => (ATTR_LIFETIME, secs.to_be_bytes().to_vec()),
        Attribute::RequestedTransport(proto) => {
            (ATTR_REQUESTED_TRANSPORT, vec![*proto, 0, 0, 0])
        }
        Attribute::ConnectionId(id) => (ATTR_CONNECTION_ID, id.to_be_bytes().to_vec()),
        Attribute::MessageIntegritySha256(mac) => (ATTR_MESSAGE_INTEGRITY_SHA256, mac.clone()),
        Attribute::Unknown { attr_type, value } => (*attr_type, value.clone()),
    };

    out.extend_from_slice(&attr_type.to_be_bytes());
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(&value);
    let padding = (4 - value.len() % 4) % 4;
    out.extend_from_slice(&[0u8; 3][..padding]);
}

fn decode_attribute(
    attr_type: u16,
    value: &[u8],
    txid: &[u8; 12],
) -> Result<Attribute, StunError> {
    let malformed = |what: &str| StunError::Malformed(format!("{what} ({attr_type:#06x})"));
    Ok(match attr_type {
        ATTR_XOR_MAPPED_ADDRESS => Attribute::XorMappedAddress(decode_xor_addr(value, txid)?),
        ATTR_XOR_PEER_ADDRESS => Attribute::XorPeerAddress(decode_xor_addr(value, txid)?),
        ATTR_XOR_RELAYED_ADDRESS => Attribute::XorRelayedAddress(decode_xor_addr(value, txid)?),
        ATTR_USERNAME => Attribute::Username(
            String::from_utf8(value.to_vec()).map_err(|_| malformed("non-UTF8 username"))?,
        ),
        ATTR_REALM => Attribute::Realm(
            String::from_utf8(value.to_vec()).map_err(|_| malformed("non-UTF8 realm"))?,
        ),
        ATTR_NONCE => Attribute::Nonce(value.to_vec()),
        ATTR_ERROR_CODE => {
            if value.len() < 4 {
                return Err(malformed("short error code"));
            }
            let code = (value[2] as u16) * 100 + (value[3] as u16);
            let reason = String::from_utf8_lossy(&value[4..]).into_owned();
            Attribute::ErrorCode { code, reason }
        }
        ATTR_LIFETIME => {
            let raw: [u8; 4] = value.try_into().map_err(|_| malformed("short lifetime"))?;
            Attribute::Lifetime(u32::from_be_bytes(raw))
        }
        ATTR_REQUESTED_TRANSPORT => {
            if value.len() != 4 {
                return Err(malformed("short requested transport"));
            }
            Attribute::RequestedTransport(value[0])
        }
        ATTR_CONNECTION_ID => {
            let raw: [u8; 4] = value
                .try_into()
                .map_err(|_| malformed("short connection id"))?;
            Attribute::ConnectionId(u32::from_be_bytes(raw))
        }
        ATTR_MESSAGE_INTEGRITY_SHA256 => Attribute::MessageIntegritySha256(value.to_vec()),
        other => Attribute::Unknown {
            attr_type: other,
            value: value.to_vec(),
        },
    })
}

fn encode_xor_addr(addr: &SocketAddr, txid: &[u8; 12]) -> Vec<u8> {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match addr.ip() {
        IpAddr::V4(ip) => {
            let mut out = vec![0, 0x01];
            out.extend_from_slice(&xport.to_be_bytes());
            for (octet, key) in ip.octets().iter().zip(cookie.iter()) {
                out.push(octet ^ key);
            }
            out
        }
        IpAddr::V6(ip) => {
            let mut out = vec![0, 0x02];
            out.extend_from_slice(&xport.to_be_bytes());
            let mut key = [0u8; 16];
            key[..4].copy_from_slice(&cookie);
            key[4..].copy_from_slice(txid);
            for (octet, k) in ip.octets().iter().zip(key.iter()) {
                out.push(octet ^ k);
            }
            out
        }
    }
}

fn decode_xor_addr(value: &[u8], txid: &[u8; 12]) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::Malformed("short XOR address".into()));
    }
    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    let cookie = MAGIC_COOKIE.to_be_bytes();
    match family {
        0x01 => {
            if value.len() != 8 {
                return Err(StunError::Malformed("bad IPv4 XOR address length".into()));
            }
            let mut octets = [0u8; 4];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ cookie[i];
            }
            Ok(SocketAddr::new(IpAddr::from(octets), port))
        }
        0x02 => {
            if value.len() != 20 {
                return Err(StunError::Malformed("bad IPv6 XOR address length".into()));
            }
            let mut key = [0u8; 16];
            key[..4].copy_from_slice(&cookie);
            key[4..].copy_from_slice(txid);
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ key[i];
            }
            Ok(SocketAddr::new(IpAddr::from(octets), port))
        }
        other => Err(StunError::Malformed(format!("unknown address family {other}"))),
    }
}

/// Long-term credential key, SHA-256 variant:
/// `key = SHA-256(username ":" realm ":" password)`.
pub fn long_term_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

/// Verify the MESSAGE-INTEGRITY-SHA256 attribute of a raw message buffer.
/// Returns false when the attribute is absent or does not match.
pub fn verify_integrity(raw: &[u8], key: &[u8]) -> bool {
    if raw.len() < HEADER_LEN {
        return false;
    }
    let length = u16::from_be_bytes([raw[2], raw[3]]) as usize;
    let end = HEADER_LEN + length;
    if raw.len() < end {
        return false;
    }

    // Find the integrity attribute; everything before it is covered.
    let mut offset = HEADER_LEN;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([raw[offset], raw[offset + 1]]);
        let attr_len = u16::from_be_bytes([raw[offset + 2], raw[offset + 3]]) as usize;
        if attr_type == ATTR_MESSAGE_INTEGRITY_SHA256 {
            if offset + 4 + attr_len > end || attr_len != 32 {
                return false;
            }
            let claimed = &raw[offset + 4..offset + 4 + 32];
            let adjusted_len = offset + 4 + 32 - HEADER_LEN;

            let mut covered = raw[..offset].to_vec();
            covered[2..4].copy_from_slice(&(adjusted_len as u16).to_be_bytes());

            let mut mac = HmacSha256::new_from_slice(key)
                .expect("HMAC accepts keys of any length");
            mac.update(&covered);
            return mac.finalize().into_bytes().as_slice() == claimed;
        }
        offset += 4 + attr_len + ((4 - attr_len % 4) % 4);
    }
    false
}

pub fn transaction_id() -> [u8; 12] {
    let mut txid = [0u8; 12];
    if getrandom::getrandom(&mut txid).is_err() {
        // Entropy failure leaves a zero txid; transactions still match by id.
        txid[0] = 0x7F;
    }
    txid
}
