//! ## Pinch wire envelope
//!
//! Every frame exchanged between a client and the relay over the websocket
//! is exactly one [`Envelope`]: a fixed header plus one [`Payload`] variant.
//! The relay never inspects the contents of an [`Payload::Encrypted`]
//! payload; everything else is either routed opaquely or interpreted
//! directly by the hub (block/unblock, auth).
//!
//! Encoding is CBOR (RFC 8949) via `ciborium`. A websocket binary frame is
//! already length-delimited by the transport, so the envelope itself does
//! not carry an internal length prefix.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum size of a single encoded envelope the relay will accept.
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub enum Error {
    Malformed,
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed envelope"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Message,
    DeliveryConfirm,
    AuthChallenge,
    AuthResponse,
    AuthResult,
    Heartbeat,
    ConnectionRequest,
    ConnectionResponse,
    ConnectionRevoke,
    Block,
    Unblock,
    QueueStatus,
    QueueFull,
}

impl Payload {
    /// The [`MessageType`] tag that a correctly-formed envelope carrying
    /// this payload must have in its header.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Encrypted { .. } => MessageType::Message,
            Self::DeliveryConfirm { .. } => MessageType::DeliveryConfirm,
            Self::AuthChallenge { .. } => MessageType::AuthChallenge,
            Self::AuthResponse { .. } => MessageType::AuthResponse,
            Self::AuthResult { .. } => MessageType::AuthResult,
            Self::Heartbeat => MessageType::Heartbeat,
            Self::ConnectionRequest { .. } => MessageType::ConnectionRequest,
            Self::ConnectionResponse { .. } => MessageType::ConnectionResponse,
            Self::ConnectionRevoke { .. } => MessageType::ConnectionRevoke,
            Self::Block { .. } => MessageType::Block,
            Self::Unblock { .. } => MessageType::Unblock,
            Self::QueueStatus { .. } => MessageType::QueueStatus,
            Self::QueueFull { .. } => MessageType::QueueFull,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Payload {
    Encrypted {
        nonce: [u8; 24],
        ciphertext: Vec<u8>,
        sender_public_key: [u8; 32],
    },
    DeliveryConfirm {
        message_id: Vec<u8>,
        signature: Vec<u8>,
        timestamp: i64,
        was_stored: bool,
    },
    AuthChallenge {
        nonce: Vec<u8>,
        relay_host: String,
        timestamp: i64,
    },
    AuthResponse {
        public_key: [u8; 32],
        signature: Vec<u8>,
        client_echo_of_nonce: Vec<u8>,
    },
    AuthResult {
        success: bool,
        assigned_address: String,
        error_message: String,
    },
    Heartbeat,
    ConnectionRequest {
        body: Vec<u8>,
    },
    ConnectionResponse {
        body: Vec<u8>,
    },
    ConnectionRevoke {
        body: Vec<u8>,
    },
    Block {
        blocker_address: String,
        target_address: String,
    },
    Unblock {
        blocker_address: String,
        target_address: String,
    },
    QueueStatus {
        pending_count: i64,
    },
    QueueFull {
        recipient_address: String,
        reason: String,
    },
}

/// Outer header shared by every envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub protocol_version: u32,
    pub from_address: String,
    pub to_address: String,
    pub message_type: MessageType,
    pub message_id: Vec<u8>,
    pub server_clock: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(
        from_address: impl Into<String>,
        to_address: impl Into<String>,
        message_id: Vec<u8>,
        server_clock: i64,
        payload: Payload,
    ) -> Self {
        Self {
            header: Header {
                protocol_version: PROTOCOL_VERSION,
                from_address: from_address.into(),
                to_address: to_address.into(),
                message_type: payload.message_type(),
                message_id,
                server_clock,
            },
            payload,
        }
    }

    /// Overwrite `from_address` with the authenticated sender's address.
    /// Called on every inbound envelope before routing; never trust the
    /// claimed sender.
    pub fn rewrite_from(&mut self, address: &str) {
        self.header.from_address = address.to_string();
    }
}

/// Serialize an envelope to its wire representation. Deterministic under
/// equal input: encoding never mutates the value.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    ciborium::into_writer(envelope, &mut buf).map_err(|_| Error::Malformed)?;
    Ok(buf)
}

/// Parse a wire frame into an envelope. Fails with [`Error::Malformed`] when
/// the frame is unparseable, exceeds [`MAX_ENVELOPE_SIZE`], or the header's
/// `message_type` disagrees with the payload variant actually present.
pub fn decode(bytes: &[u8]) -> Result<Envelope, Error> {
    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(Error::Malformed);
    }

    let envelope: Envelope = ciborium::from_reader(bytes).map_err(|_| Error::Malformed)?;
    if envelope.header.message_type != envelope.payload.message_type() {
        return Err(Error::Malformed);
    }

    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(payload: Payload) -> Envelope {
        Envelope::new("pinch:alice@relay.example.com", "pinch:bob@relay.example.com", vec![1, 2, 3], 42, payload)
    }

    #[test]
    fn roundtrip_encrypted() {
        let envelope = sample(Payload::Encrypted {
            nonce: [7u8; 24],
            ciphertext: vec![0xDE, 0xAD, 0xBE, 0xEF],
            sender_public_key: [1u8; 32],
        });

        let bytes = encode(&envelope).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.header.from_address, envelope.header.from_address);
        match decoded.payload {
            Payload::Encrypted { ciphertext, .. } => assert_eq!(ciphertext, vec![0xDE, 0xAD, 0xBE, 0xEF]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn roundtrip_heartbeat() {
        let envelope = sample(Payload::Heartbeat);
        let bytes = encode(&envelope).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert!(matches!(decoded.payload, Payload::Heartbeat));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(&[0xff, 0x00, 0x01]).is_err());
    }

    #[test]
    fn decode_rejects_empty() {
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn decode_rejects_oversize() {
        let big = vec![0u8; MAX_ENVELOPE_SIZE + 1];
        assert!(decode(&big).is_err());
    }

    #[test]
    fn encode_is_deterministic() {
        let envelope = sample(Payload::QueueStatus { pending_count: 3 });
        let a = encode(&envelope).unwrap();
        let b = encode(&envelope).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn from_address_is_rewritten() {
        let mut envelope = sample(Payload::Heartbeat);
        envelope.rewrite_from("pinch:mallory@relay.example.com");
        assert_eq!(envelope.header.from_address, "pinch:mallory@relay.example.com");
    }
}
