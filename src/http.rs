//! The relay's entire HTTP/WS surface (§4.10): `/ws`, `/health`,
//! `/agents/register`, `/agents/claim`, `/claim`. Everything here is thin
//! plumbing over `auth`, `service`, and `store`; the only policy decided
//! in this file is the origin allow-list and the locked-mode gate.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;

use service::{RegisterError, Session};

use crate::{handshake, session_tasks, AppState, SOFTWARE};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/agents/register", post(register))
        .route("/agents/claim", post(claim))
        .route("/claim", get(claim_page))
        .with_state(state)
}

/// §4.10: "empty list ⇒ reject any non-empty `Origin` header; explicit
/// entries permit matching browser origins." A request with no `Origin`
/// header at all (non-browser clients) is always allowed.
fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    match headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) {
        None => true,
        Some(origin) => allowed.iter().any(|a| a == origin),
    }
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !origin_allowed(&headers, &state.config.allowed_origins) {
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: axum::extract::ws::WebSocket, state: Arc<AppState>) {
    let now = crate::now_nanos();

    let Some(authenticated) = handshake::perform(&mut socket, &state.config.relay_public_host, now).await else {
        return;
    };

    if state.config.locked_mode() {
        let approved = state.keys.is_approved(&authenticated.public_key).unwrap_or(false);
        if !approved {
            handshake::send_failure(&mut socket, "key not approved", now).await;
            return;
        }
    }

    let (outbound, outbound_rx) = Session::new(authenticated.address.clone());

    match state.hub.register(outbound.clone(), now) {
        Ok(()) => {}
        Err(RegisterError::AddressInUse) => {
            handshake::send_failure(&mut socket, "address already has an active session", now).await;
            return;
        }
    }

    handshake::send_success(&mut socket, &authenticated.address, now).await;

    state.active_tasks.fetch_add(3, Ordering::Relaxed);
    let shutdown = state.shutdown.clone();
    let cancellation = outbound.cancellation.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => cancellation.cancel(),
            _ = cancellation.cancelled() => {}
        }
    });

    session_tasks::run(socket, outbound.clone(), state.hub.clone(), outbound_rx).await;
    state.active_tasks.fetch_sub(3, Ordering::Relaxed);

    state.hub.unregister(&outbound);
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "connections": state.hub.client_count(),
        "goroutines": state.active_tasks.load(Ordering::Relaxed),
        "software": SOFTWARE,
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

#[derive(Deserialize)]
struct RegisterRequest {
    public_key: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    address: String,
    claim_code: String,
}

async fn register(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<RegisterRequest>,
) -> axum::response::Response {
    if !state.config.locked_mode() {
        return StatusCode::NOT_FOUND.into_response();
    }

    if !state.register_limiter.allow(&addr.ip().to_string()) {
        return (StatusCode::TOO_MANY_REQUESTS, "rate limited").into_response();
    }

    let Ok(raw) = BASE64_STANDARD.decode(body.public_key.as_bytes()) else {
        return (StatusCode::BAD_REQUEST, "malformed public key").into_response();
    };
    let Ok(public_key): Result<[u8; 32], _> = raw.try_into() else {
        return (StatusCode::BAD_REQUEST, "malformed public key").into_response();
    };

    let address = auth::derive_address(&public_key, &state.config.relay_public_host);

    match state.keys.register_pending(&public_key, &address) {
        Ok(claim_code) => Json(RegisterResponse { address, claim_code }).into_response(),
        Err(e) => {
            log::warn!("register_pending failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
struct ClaimRequest {
    claim_code: String,
    bot_challenge_token: String,
}

#[derive(Serialize)]
struct ClaimResponse {
    address: String,
}

async fn claim(State(state): State<Arc<AppState>>, Json(body): Json<ClaimRequest>) -> axum::response::Response {
    if !state.config.locked_mode() {
        return StatusCode::NOT_FOUND.into_response();
    }

    if body.claim_code.is_empty() || body.bot_challenge_token.is_empty() {
        return (StatusCode::BAD_REQUEST, "malformed request").into_response();
    }

    match verify_bot_challenge(&state, &body.bot_challenge_token).await {
        Ok(true) => {}
        Ok(false) => return (StatusCode::FORBIDDEN, "bot challenge failed").into_response(),
        Err(e) => {
            log::warn!("bot-mitigation provider error: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    match state.keys.claim(&body.claim_code) {
        Ok(Some(address)) => Json(ClaimResponse { address }).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "unknown claim code").into_response(),
        Err(e) => {
            log::warn!("claim failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Verifies a bot-mitigation token with the configured out-of-band
/// provider. The relay is provider-agnostic: it posts `secret` + `response`
/// form fields and reads back a JSON `{success: bool}`, the shape shared by
/// every mainstream challenge provider's siteverify-style endpoint.
async fn verify_bot_challenge(state: &AppState, token: &str) -> anyhow::Result<bool> {
    #[derive(Deserialize)]
    struct VerifyResponse {
        success: bool,
    }

    let secret = state
        .config
        .bot_challenge_secret_key
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("locked mode without a secret key"))?;

    let response: VerifyResponse = state
        .http_client
        .post("https://challenges.cloudflare.com/turnstile/v0/siteverify")
        .form(&[("secret", secret), ("response", token)])
        .send()
        .await?
        .json()
        .await?;

    Ok(response.success)
}

async fn claim_page(State(state): State<Arc<AppState>>) -> axum::response::Response {
    if !state.config.locked_mode() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let site_key = state.config.bot_challenge_site_key.as_deref().unwrap_or("");
    Html(CLAIM_PAGE_TEMPLATE.replace("{{site_key}}", site_key)).into_response()
}

const CLAIM_PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>Pinch relay - claim an agent</title>
  <script src="https://challenges.cloudflare.com/turnstile/v0/api.js" async defer></script>
</head>
<body>
  <form id="claim-form">
    <label>Claim code <input type="text" name="claim_code" required></label>
    <div class="cf-turnstile" data-sitekey="{{site_key}}"></div>
    <button type="submit">Claim</button>
  </form>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_origin(origin: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::ORIGIN, origin.parse().unwrap());
        headers
    }

    #[test]
    fn missing_origin_is_allowed() {
        assert!(origin_allowed(&HeaderMap::new(), &[]));
        assert!(origin_allowed(&HeaderMap::new(), &["https://example.com".to_string()]));
    }

    #[test]
    fn empty_allowlist_rejects_any_origin() {
        let headers = headers_with_origin("https://example.com");
        assert!(!origin_allowed(&headers, &[]));
    }

    #[test]
    fn matching_origin_is_allowed() {
        let headers = headers_with_origin("https://example.com");
        let allowed = vec!["https://example.com".to_string()];
        assert!(origin_allowed(&headers, &allowed));
    }

    #[test]
    fn non_matching_origin_is_rejected() {
        let headers = headers_with_origin("https://evil.example.com");
        let allowed = vec!["https://example.com".to_string()];
        assert!(!origin_allowed(&headers, &allowed));
    }
}
