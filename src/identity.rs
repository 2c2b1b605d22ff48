//! # Identity
//!
//! - [`Keypair`]: Ed25519 signing keypair
//! - [`InstanceId`]: one running session of an identity
//! - [`LocalIdentity`]: what a node knows about itself
//!
//! ## Identity Model
//!
//! A node's ring position is `BLAKE3(public_key)`. Nothing else is trusted:
//! every signed payload embeds the signer's public key and receivers check
//! that it hashes to the claimed sender id (see [`crate::crypto`]).
//!
//! The same keypair may be running in several processes at once (for
//! example two browser tabs). Each process gets a fresh
//! [`InstanceId`]; the older instance keeps the ring position and newer ones
//! route through it.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::ring::RingId;

/// Random bytes in an instance token.
const INSTANCE_TOKEN_LEN: usize = 8;

/// Returns current time as milliseconds since Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore a keypair from its 32-byte secret. Persisting the secret is
    /// the caller's job.
    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Deterministic keypair derived from a seed string. Used for fixed test
    /// rings and simulations.
    pub fn from_seed(seed: &str) -> Self {
        Self::from_secret_key_bytes(blake3::hash(seed.as_bytes()).as_bytes())
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Ring id of this keypair.
    pub fn id(&self) -> RingId {
        id_for_public_key(&self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("id", &self.id().short_name())
            .finish_non_exhaustive()
    }
}

/// Ring id bound to a public key.
pub fn id_for_public_key(public_key: &[u8; 32]) -> RingId {
    RingId::hash_of(public_key)
}

/// One session of an identity. Ordered by creation time, then token, so
/// "earlier instance" is well defined even for sessions started in the same
/// millisecond.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId {
    #[serde(rename = "created")]
    pub created_ms: u64,
    pub token: String,
}

impl InstanceId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; INSTANCE_TOKEN_LEN];
        if getrandom::getrandom(&mut bytes).is_err() {
            // Fall back to the clock; uniqueness then rests on created_ms.
            bytes.copy_from_slice(&now_ms().to_be_bytes());
        }
        Self {
            created_ms: now_ms(),
            token: hex::encode(bytes),
        }
    }

    /// Tokens arrive from peers, so truncate by characters, not bytes.
    pub fn short_name(&self) -> String {
        let token: String = self.token.chars().take(6).collect();
        format!("{}@{}", token, self.created_ms)
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.created_ms, self.token)
    }
}

/// A specific session of a specific identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerKey {
    pub id: RingId,
    pub instance: InstanceId,
}

impl PeerKey {
    pub fn new(id: RingId, instance: InstanceId) -> Self {
        Self { id, instance }
    }
}

impl std::fmt::Display for PeerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.id.short_name(), self.instance.short_name())
    }
}

/// The local node's identity and session.
#[derive(Clone, Debug)]
pub struct LocalIdentity {
    pub keypair: Keypair,
    pub id: RingId,
    pub instance: InstanceId,
}

impl LocalIdentity {
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate())
    }

    pub fn from_keypair(keypair: Keypair) -> Self {
        let id = keypair.id();
        Self {
            keypair,
            id,
            instance: InstanceId::generate(),
        }
    }

    /// A second session of the same identity.
    pub fn new_instance(&self) -> Self {
        Self::from_keypair(self.keypair.clone())
    }

    pub fn key(&self) -> PeerKey {
        PeerKey::new(self.id, self.instance.clone())
    }
}
