//! Segment signing primitives
//!
//! Digests media segments with SHA-256 and signs the digest with a per-session
//! ECDSA P-256 key. Signatures are the fixed 64-byte `r || s` form so browser
//! viewers can check them with WebCrypto (`ECDSA` / `SHA-256` over the raw
//! digest bytes). Public keys leave the server as SubjectPublicKeyInfo DER.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;

/// Digest length in bytes (SHA-256)
pub const DIGEST_LEN: usize = 32;

/// PEM tag for exported public keys
const PUBLIC_KEY_PEM_TAG: &str = "PUBLIC KEY";

/// Error type for signing operations.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("Failed to export public key: {0}")]
    KeyExport(String),

    #[error("Signing failed: {0}")]
    Signing(String),
}

/// SHA-256 digest of a segment's bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDigest([u8; DIGEST_LEN]);

impl SegmentDigest {
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex, 64 characters
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> Option<Self> {
        let bytes = hex::decode(value).ok()?;
        let array: [u8; DIGEST_LEN] = bytes.try_into().ok()?;
        Some(SegmentDigest(array))
    }
}

/// ECDSA P-256 signature over a segment digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSignature(Signature);

impl SegmentSignature {
    /// Fixed-size `r || s` encoding (64 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0.to_bytes())
    }

    pub fn from_base64(value: &str) -> Option<Self> {
        let bytes = STANDARD.decode(value).ok()?;
        Signature::from_slice(&bytes).ok().map(SegmentSignature)
    }
}

/// Signing key pair for one stream session.
///
/// The SPKI export of the public half is computed once at generation time,
/// so a key that cannot be exported never becomes a session.
pub struct SessionKeyPair {
    signing_key: SigningKey,
    public_key_der: Vec<u8>,
}

impl SessionKeyPair {
    /// Generate a fresh key pair from the OS random source
    pub fn generate() -> Result<Self, SignerError> {
        let signing_key = SigningKey::random(&mut OsRng);
        let public_key_der = export_public_key(signing_key.verifying_key())?;
        Ok(SessionKeyPair {
            signing_key,
            public_key_der,
        })
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// SubjectPublicKeyInfo DER of the public key
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }
}

impl fmt::Debug for SessionKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeyPair")
            .field("public_key_der_len", &self.public_key_der.len())
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

/// Compute the SHA-256 digest of a segment
pub fn digest(bytes: &[u8]) -> SegmentDigest {
    SegmentDigest(Sha256::digest(bytes).into())
}

/// Sign a segment digest.
///
/// The signed message is the 32 raw digest bytes; ECDSA hashes them again
/// with SHA-256 as part of the signature scheme.
pub fn sign(digest: &SegmentDigest, key: &SigningKey) -> Result<SegmentSignature, SignerError> {
    let signature: Signature = key
        .try_sign(digest.as_bytes())
        .map_err(|e| SignerError::Signing(e.to_string()))?;
    Ok(SegmentSignature(signature))
}

/// Export a public key as SubjectPublicKeyInfo DER
pub fn export_public_key(key: &VerifyingKey) -> Result<Vec<u8>, SignerError> {
    key.to_public_key_der()
        .map(|document| document.as_bytes().to_vec())
        .map_err(|e| SignerError::KeyExport(e.to_string()))
}

/// Wrap SPKI DER bytes in a `PUBLIC KEY` PEM document
pub fn public_key_pem(public_key_der: &[u8]) -> String {
    pem::encode(&pem::Pem::new(PUBLIC_KEY_PEM_TAG, public_key_der.to_vec()))
}

/// Check a signature against a digest and an SPKI DER public key.
///
/// Returns false for malformed keys as well as bad signatures.
pub fn verify(digest: &SegmentDigest, signature: &SegmentSignature, public_key_der: &[u8]) -> bool {
    match VerifyingKey::from_public_key_der(public_key_der) {
        Ok(key) => key.verify(digest.as_bytes(), &signature.0).is_ok(),
        Err(e) => {
            log::debug!("Rejecting malformed public key: {}", e);
            false
        }
    }
}

/// Base64 encode data using standard encoding
pub fn base64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Base64 decode data using standard encoding
pub fn base64_decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data)
}
