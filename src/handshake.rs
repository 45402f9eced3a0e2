//! Server-driven Ed25519 challenge/response handshake over a freshly
//! upgraded websocket (§4.2). Everything that needs to know about nonce
//! freshness or signature binding lives in `auth`; this module only owns
//! the wire choreography and the single round-trip deadline.

use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};

use codec::{decode, encode, Envelope, Payload};

/// §5: "Authentication: 10s total."
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Failures from steps (i)-(iv) of the handshake all collapse to the same
/// generic message on the wire — no oracle that would tell an attacker
/// which check failed.
const GENERIC_AUTH_FAILURE: &str = "authentication failed";

pub struct Authenticated {
    pub public_key: [u8; 32],
    pub address: String,
}

/// Issues the challenge and validates the response. Returns `None` after
/// already having sent an `Auth-result{success: false}` and a
/// policy-violation close frame — the caller only needs to drop the
/// socket. On success, nothing has been written to the wire yet; the
/// caller decides whether a locked-mode gate applies before calling
/// [`send_success`] or [`send_failure`] itself.
pub async fn perform(socket: &mut WebSocket, relay_host: &str, now_nanos: i64) -> Option<Authenticated> {
    let nonce = auth::generate_nonce();

    let challenge = Envelope::new(
        "",
        "",
        Vec::new(),
        now_nanos,
        Payload::AuthChallenge {
            nonce: nonce.clone(),
            relay_host: relay_host.to_string(),
            timestamp: now_nanos,
        },
    );

    let Ok(bytes) = encode(&challenge) else {
        return None;
    };

    if socket.send(Message::Binary(bytes.into())).await.is_err() {
        return None;
    }

    let frame = match tokio::time::timeout(AUTH_TIMEOUT, socket.next()).await {
        Ok(Some(Ok(Message::Binary(bytes)))) => bytes,
        _ => {
            send_failure(socket, GENERIC_AUTH_FAILURE, now_nanos).await;
            return None;
        }
    };

    let envelope = match decode(&frame) {
        Ok(envelope) => envelope,
        Err(_) => {
            send_failure(socket, GENERIC_AUTH_FAILURE, now_nanos).await;
            return None;
        }
    };

    let Payload::AuthResponse { public_key, signature, client_echo_of_nonce } = envelope.payload else {
        send_failure(socket, GENERIC_AUTH_FAILURE, now_nanos).await;
        return None;
    };

    if client_echo_of_nonce != nonce {
        send_failure(socket, GENERIC_AUTH_FAILURE, now_nanos).await;
        return None;
    }

    if auth::verify_response(relay_host, &nonce, &public_key, &signature).is_err() {
        send_failure(socket, GENERIC_AUTH_FAILURE, now_nanos).await;
        return None;
    }

    let address = auth::derive_address(&public_key, relay_host);
    Some(Authenticated { public_key, address })
}

/// Sends the one and only success result a client ever sees.
pub async fn send_success(socket: &mut WebSocket, address: &str, now_nanos: i64) {
    let result = Envelope::new(
        "",
        address,
        Vec::new(),
        now_nanos,
        Payload::AuthResult {
            success: true,
            assigned_address: address.to_string(),
            error_message: String::new(),
        },
    );

    if let Ok(bytes) = encode(&result) {
        let _ = socket.send(Message::Binary(bytes.into())).await;
    }
}

/// Sends a failed `Auth-result` and closes the connection with a
/// policy-violation status, per §4.2 step 5.
pub async fn send_failure(socket: &mut WebSocket, message: &str, now_nanos: i64) {
    let result = Envelope::new(
        "",
        "",
        Vec::new(),
        now_nanos,
        Payload::AuthResult {
            success: false,
            assigned_address: String::new(),
            error_message: message.to_string(),
        },
    );

    if let Ok(bytes) = encode(&result) {
        let _ = socket.send(Message::Binary(bytes.into())).await;
    }

    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "authentication failed".into(),
        })))
        .await;
}
