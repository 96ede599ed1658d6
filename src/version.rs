//! # App Protocol Version Gate
//!
//! An [`AppProtocolVersion`] is a signed version token: a numeric version, an
//! arbitrary `extra` blob (release metadata, chain parameters), and an
//! Ed25519 signature binding both to a signer key.
//!
//! A sender is *compatible* iff its version number equals ours, or its token
//! is signed by a member of the trusted-signer set and the host-supplied
//! callback accepts it. The callback always fires on a version-number
//! mismatch, whether or not the trusted path ends up accepting, so hosts can
//! observe newer versions in the wild even while rejecting them.
//!
//! Inbound liveness probes (Ping) are exempted from the gate by the router
//! dispatch path, not here; the gate itself is a pure predicate plus hook.

use std::collections::HashSet;
use std::sync::Arc;

use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TransportError;
use crate::identity::{Peer, PrivateKey, PublicKey};

/// Leading bytes of every signed version payload; distinct from the wire
/// message tag so the two kinds of signature can never stand in for each
/// other.
const VERSION_SIGNATURE_DOMAIN: &[u8] = b"braidnet-version-v1:";

/// Host callback observed on every version mismatch.
///
/// Arguments are `(peer, expected, actual)`. The returned bool is consulted
/// only when the actual version's signer is trusted; for untrusted signers
/// the call is a pure side effect.
pub type DifferentVersionHook =
    Arc<dyn Fn(&Peer, &AppProtocolVersion, &AppProtocolVersion) -> bool + Send + Sync>;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppProtocolVersion {
    pub version: u64,
    pub extra: Vec<u8>,
    pub signature: Vec<u8>,
    pub signer: PublicKey,
}

impl AppProtocolVersion {
    /// Create a token signed by `key` over the tagged `version || extra`
    /// payload.
    pub fn sign(key: &PrivateKey, version: u64, extra: Vec<u8>) -> Self {
        let payload = Self::signed_payload(version, &extra);
        let signature = key.sign(&payload).to_bytes().to_vec();
        Self {
            version,
            extra,
            signature,
            signer: key.public_key(),
        }
    }

    fn signed_payload(version: u64, extra: &[u8]) -> Vec<u8> {
        let mut payload =
            Vec::with_capacity(VERSION_SIGNATURE_DOMAIN.len() + 8 + extra.len());
        payload.extend_from_slice(VERSION_SIGNATURE_DOMAIN);
        payload.extend_from_slice(&version.to_be_bytes());
        payload.extend_from_slice(extra);
        payload
    }

    /// Whether the embedded signature verifies against the embedded signer.
    /// A malformed signer key or signature simply reads as unverified.
    pub fn verify(&self) -> bool {
        let Ok(verifying_key) = VerifyingKey::try_from(self.signer.as_bytes().as_slice()) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(self.signature.as_slice()) else {
            return false;
        };
        let payload = Self::signed_payload(self.version, &self.extra);
        verifying_key
            .verify_strict(&payload, &Signature::from_bytes(&sig_bytes))
            .is_ok()
    }
}

impl std::fmt::Debug for AppProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppProtocolVersion")
            .field("version", &self.version)
            .field("extra_len", &self.extra.len())
            .field("signer", &self.signer)
            .finish()
    }
}

/// Compatibility gate applied to every non-Ping inbound message and every
/// reply received by the dispatcher.
pub struct VersionGate {
    ours: AppProtocolVersion,
    trusted_signers: HashSet<PublicKey>,
    on_different_version: DifferentVersionHook,
}

impl VersionGate {
    pub fn new(
        ours: AppProtocolVersion,
        trusted_signers: HashSet<PublicKey>,
        on_different_version: DifferentVersionHook,
    ) -> Self {
        Self {
            ours,
            trusted_signers,
            on_different_version,
        }
    }

    /// Validate a sender's advertised version.
    ///
    /// On a version-number mismatch the hook fires unconditionally; its
    /// verdict is honored only when the token's signer is in the trusted set
    /// and the token's signature verifies.
    pub fn validate_sender(&self, peer: &Peer) -> Result<(), TransportError> {
        let theirs = &peer.version;
        if theirs.version == self.ours.version {
            return Ok(());
        }

        let trusted = self.trusted_signers.contains(&theirs.signer) && theirs.verify();
        let accepted = (self.on_different_version)(peer, &self.ours, theirs);

        if trusted && accepted {
            debug!(
                peer = %peer.address(),
                actual = theirs.version,
                expected = self.ours.version,
                "accepting peer with trusted differing version"
            );
            return Ok(());
        }

        debug!(
            peer = %peer.address(),
            actual = theirs.version,
            expected = self.ours.version,
            trusted,
            "rejecting peer with incompatible version"
        );
        Err(TransportError::DifferentAppProtocolVersion {
            peer: peer.address(),
            expected: self.ours.version,
            actual: theirs.version,
        })
    }
}
