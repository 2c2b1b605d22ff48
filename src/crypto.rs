//! # Message Authentication
//!
//! Every overlay payload and every rendezvous hello travels as a
//! [`SignedPacket`]: the JSON serialization of the payload with the signer's
//! public key embedded, plus an Ed25519 signature over a domain-separated
//! BLAKE3 digest of exactly those bytes.
//!
//! [`unpack`] binds the claimed sender id to the signing key: the signature
//! must verify against the embedded key and `BLAKE3(key)` must equal the id
//! the caller expected. No PKI is involved; an id *is* a key hash.
//!
//! ## Security Properties
//!
//! - Receivers verify the bytes that were signed, never a re-serialization
//! - Swapping the body while keeping an old signature fails verification
//! - A valid signature from a key that does not hash to the claimed id fails
//! - Only strict Ed25519 verification is used

use ed25519_dalek::{Signature, VerifyingKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::identity::{id_for_public_key, Keypair};
use crate::ring::RingId;

/// Domain separation prefix for signed packet digests.
pub const PACKET_SIGNATURE_DOMAIN: &[u8] = b"ringmesh-packet-v1:";

/// Serialized payload and its signature, both as text so the packet can ride
/// inside any JSON frame unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPacket {
    pub signed: String,
    pub signature: String,
}

#[derive(Serialize)]
struct SignedBodyRef<'a, T> {
    public_key: String,
    payload: &'a T,
}

#[derive(Deserialize)]
struct SignedBody<T> {
    public_key: String,
    payload: T,
}

/// Reasons a packet was rejected. Callers log these and drop the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnpackError {
    /// The signed text is not a valid body for the expected payload type.
    Malformed(String),
    /// The embedded public key is not a valid Ed25519 point.
    InvalidPublicKey,
    /// Signature missing, wrong length, or does not verify.
    SignatureInvalid,
    /// The key is valid but does not hash to the claimed sender.
    IdentityMismatch { expected: RingId, actual: RingId },
}

impl std::fmt::Display for UnpackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnpackError::Malformed(reason) => write!(f, "malformed signed body: {}", reason),
            UnpackError::InvalidPublicKey => write!(f, "invalid embedded public key"),
            UnpackError::SignatureInvalid => write!(f, "signature verification failed"),
            UnpackError::IdentityMismatch { expected, actual } => write!(
                f,
                "key hashes to {} but sender claimed {}",
                actual.short_name(),
                expected.short_name()
            ),
        }
    }
}

impl std::error::Error for UnpackError {}

fn digest(signed: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(PACKET_SIGNATURE_DOMAIN);
    hasher.update(signed);
    *hasher.finalize().as_bytes()
}

/// Sign `payload` with `keypair`, embedding the public key.
pub fn pack<T: Serialize>(payload: &T, keypair: &Keypair) -> anyhow::Result<SignedPacket> {
    let body = SignedBodyRef {
        public_key: hex::encode(keypair.public_key_bytes()),
        payload,
    };
    let signed = serde_json::to_string(&body)?;
    let signature = keypair.sign(&digest(signed.as_bytes()));
    Ok(SignedPacket {
        signed,
        signature: hex::encode(signature.to_bytes()),
    })
}

/// Verify `packet` and return its payload if it was signed by the key whose
/// hash is `expected_id`.
pub fn unpack<T: DeserializeOwned>(
    expected_id: &RingId,
    packet: &SignedPacket,
) -> Result<T, UnpackError> {
    let body: SignedBody<T> = serde_json::from_str(&packet.signed)
        .map_err(|e| UnpackError::Malformed(e.to_string()))?;

    let key_bytes: [u8; 32] = hex::decode(&body.public_key)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(UnpackError::InvalidPublicKey)?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| UnpackError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = hex::decode(&packet.signature)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(UnpackError::SignatureInvalid)?;
    let signature = Signature::from_bytes(&sig_bytes);
    verifying_key
        .verify_strict(&digest(packet.signed.as_bytes()), &signature)
        .map_err(|_| UnpackError::SignatureInvalid)?;

    let actual = id_for_public_key(&key_bytes);
    if actual != *expected_id {
        return Err(UnpackError::IdentityMismatch {
            expected: *expected_id,
            actual,
        });
    }
    Ok(body.payload)
}
