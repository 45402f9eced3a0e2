//! Ed25519 authentication handshake primitives and address derivation for
//! the pinch relay.
//!
//! This crate does not know about sockets, timeouts, or challenge-TTL
//! bookkeeping — that belongs to the session layer. It only answers two
//! questions: "is this signature valid for this relay host and nonce" and
//! "what address does this public key resolve to on this host".

use std::fmt;

use ed25519_dalek::{Signer, Verifier};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

pub const NONCE_MIN_LEN: usize = 16;
const CHECKSUM_LEN: usize = 4;

#[derive(Debug)]
pub enum Error {
    InvalidPublicKey,
    InvalidSignature,
    SignatureInvalid,
    MalformedAddress,
    ChecksumMismatch,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPublicKey => write!(f, "invalid ed25519 public key"),
            Self::InvalidSignature => write!(f, "invalid ed25519 signature encoding"),
            Self::SignatureInvalid => write!(f, "signature does not verify"),
            Self::MalformedAddress => write!(f, "malformed pinch address"),
            Self::ChecksumMismatch => write!(f, "address checksum mismatch"),
        }
    }
}

/// An Ed25519 signing key held by the relay itself (used only in tests and
/// tooling; production clients hold their own keys, the relay never does).
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl Clone for SigningKey {
    fn clone(&self) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(&self.inner.to_bytes()),
        }
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        let mut bytes = self.inner.to_bytes();
        bytes.zeroize();
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey").field("public", &self.verifying_key_bytes()).finish()
    }
}

impl SigningKey {
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            inner: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.inner.verifying_key().to_bytes()
    }

    /// Sign the canonical auth payload `relay_host ‖ nonce`.
    pub fn sign_challenge(&self, relay_host: &str, nonce: &[u8]) -> [u8; 64] {
        self.inner.sign(&signing_payload(relay_host, nonce)).to_bytes()
    }
}

/// The exact payload an Auth-response signature must cover: the UTF-8
/// relay host concatenated with the raw nonce bytes. Binding the host
/// prevents a signature obtained by relay A from being replayed at relay B.
pub fn signing_payload(relay_host: &str, nonce: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(relay_host.len() + nonce.len());
    payload.extend_from_slice(relay_host.as_bytes());
    payload.extend_from_slice(nonce);
    payload
}

/// Draw a fresh challenge nonce. Always at least [`NONCE_MIN_LEN`] bytes.
pub fn generate_nonce() -> Vec<u8> {
    use rand::RngCore;
    let mut nonce = vec![0u8; NONCE_MIN_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Verify an Auth-response signature against the issued challenge.
///
/// Does not check nonce freshness, echo equality, or challenge-TTL — the
/// caller (the session's handshake state machine) owns that bookkeeping
/// because it requires knowing which nonce was issued and when.
pub fn verify_response(
    relay_host: &str,
    nonce: &[u8],
    public_key: &[u8; 32],
    signature: &[u8],
) -> Result<(), Error> {
    let verifying_key =
        ed25519_dalek::VerifyingKey::from_bytes(public_key).map_err(|_| Error::InvalidPublicKey)?;

    let signature: &[u8; 64] = signature.try_into().map_err(|_| Error::InvalidSignature)?;
    let signature = ed25519_dalek::Signature::from_bytes(signature);

    verifying_key
        .verify(&signing_payload(relay_host, nonce), &signature)
        .map_err(|_| Error::SignatureInvalid)
}

/// Derive the canonical `pinch:<base58>@<relay-host>` address for a
/// verified public key on this relay. Deterministic: the address is never
/// taken from client input, only ever recomputed from a key the auth
/// handshake has already verified.
pub fn derive_address(public_key: &[u8; 32], relay_host: &str) -> String {
    let checksum = checksum_of(public_key);
    let mut payload = [0u8; 36];
    payload[..32].copy_from_slice(public_key);
    payload[32..].copy_from_slice(&checksum);
    format!("pinch:{}@{}", bs58::encode(payload).into_string(), relay_host)
}

/// Parse a canonical address back into its public key and relay host,
/// validating the embedded checksum.
pub fn parse_address(address: &str) -> Result<([u8; 32], String), Error> {
    let rest = address.strip_prefix("pinch:").ok_or(Error::MalformedAddress)?;
    let (encoded, host) = rest.split_once('@').ok_or(Error::MalformedAddress)?;
    if host.is_empty() {
        return Err(Error::MalformedAddress);
    }

    let decoded = bs58::decode(encoded).into_vec().map_err(|_| Error::MalformedAddress)?;
    if decoded.len() != 36 {
        return Err(Error::MalformedAddress);
    }

    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&decoded[..32]);
    let expected_checksum = checksum_of(&public_key);
    if decoded[32..] != expected_checksum {
        return Err(Error::ChecksumMismatch);
    }

    Ok((public_key, host.to_string()))
}

fn checksum_of(public_key: &[u8; 32]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(public_key);
    let mut checksum = [0u8; CHECKSUM_LEN];
    checksum.copy_from_slice(&digest[..CHECKSUM_LEN]);
    checksum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips() {
        let key = SigningKey::from_bytes(&[0u8; 32]);
        let public_key = key.verifying_key_bytes();
        let address = derive_address(&public_key, "relay.example.com");
        assert!(address.starts_with("pinch:"));

        let (parsed_key, host) = parse_address(&address).unwrap();
        assert_eq!(parsed_key, public_key);
        assert_eq!(host, "relay.example.com");
    }

    #[test]
    fn address_rejects_tampered_checksum() {
        let key = SigningKey::from_bytes(&[1u8; 32]);
        let address = derive_address(&key.verifying_key_bytes(), "relay.example.com");
        let (_, encoded_and_host) = address.split_once(':').unwrap();
        let (encoded, host) = encoded_and_host.split_once('@').unwrap();
        let mut decoded = bs58::decode(encoded).into_vec().unwrap();
        let last = decoded.len() - 1;
        decoded[last] ^= 0xff;
        let tampered = format!("pinch:{}@{}", bs58::encode(decoded).into_string(), host);
        assert!(matches!(parse_address(&tampered), Err(Error::ChecksumMismatch)));
    }

    #[test]
    fn address_rejects_malformed_prefix() {
        assert!(parse_address("notpinch:abc@host").is_err());
        assert!(parse_address("pinch:abc-no-host").is_err());
        assert!(parse_address("pinch:abc@").is_err());
    }

    #[test]
    fn signature_verifies_with_correct_payload() {
        let key = SigningKey::generate();
        let nonce = generate_nonce();
        let signature = key.sign_challenge("relay.example.com", &nonce);
        let public_key = key.verifying_key_bytes();
        assert!(verify_response("relay.example.com", &nonce, &public_key, &signature).is_ok());
    }

    #[test]
    fn signature_rejected_for_wrong_host() {
        let key = SigningKey::generate();
        let nonce = generate_nonce();
        let signature = key.sign_challenge("relay-a.example.com", &nonce);
        let public_key = key.verifying_key_bytes();
        assert!(verify_response("relay-b.example.com", &nonce, &public_key, &signature).is_err());
    }

    #[test]
    fn signature_rejected_for_wrong_nonce() {
        let key = SigningKey::generate();
        let nonce = generate_nonce();
        let other_nonce = generate_nonce();
        let signature = key.sign_challenge("relay.example.com", &nonce);
        let public_key = key.verifying_key_bytes();
        assert!(verify_response("relay.example.com", &other_nonce, &public_key, &signature).is_err());
    }

    #[test]
    fn signature_rejected_for_wrong_key() {
        let key = SigningKey::generate();
        let other_key = SigningKey::generate();
        let nonce = generate_nonce();
        let signature = key.sign_challenge("relay.example.com", &nonce);
        let public_key = other_key.verifying_key_bytes();
        assert!(verify_response("relay.example.com", &nonce, &public_key, &signature).is_err());
    }

    #[test]
    fn nonce_is_long_enough() {
        assert!(generate_nonce().len() >= NONCE_MIN_LEN);
    }
}
