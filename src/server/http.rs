//! HTTP routing and the WebSocket upgrade

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT,
    SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE, USER_AGENT,
};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use super::{connection, ConnectionSlot, Shared};
use crate::admission::{AdmissionRequest, Stage};

type Body = Full<Bytes>;

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Body> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn json(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = respond(status, body);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Refusal of an upgrade: the client gets a status line and the socket is closed
fn refuse(status: StatusCode) -> Response<Body> {
    let mut response = respond(status, status.canonical_reason().unwrap_or_default());
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

/// Whether a comma-separated header contains `token` (case-insensitive)
fn has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// The `Sec-WebSocket-Key` of a well-formed upgrade request
fn websocket_key<B>(req: &Request<B>) -> Option<&HeaderValue> {
    let headers = req.headers();
    if req.method() != Method::GET
        || !has_token(headers, CONNECTION, "upgrade")
        || !has_token(headers, UPGRADE, "websocket")
        || headers.get(SEC_WEBSOCKET_VERSION).map_or(true, |v| v != "13")
    {
        return None;
    }
    headers.get(SEC_WEBSOCKET_KEY)
}

pub(super) async fn route(
    shared: Arc<Shared>,
    req: Request<Incoming>,
    peer: SocketAddr,
) -> Response<Body> {
    let path = req.uri().path();
    if path == shared.config.ws_path {
        return upgrade(shared, req, peer).await;
    }

    match (req.method(), path) {
        (&Method::GET, "/ping") => json(StatusCode::OK, r#"{"message":"pong"}"#),
        _ => respond(StatusCode::NOT_FOUND, "Not Found"),
    }
}

async fn upgrade(
    shared: Arc<Shared>,
    mut req: Request<Incoming>,
    peer: SocketAddr,
) -> Response<Body> {
    let Some(accept_key) = websocket_key(&req).map(|key| derive_accept_key(key.as_bytes())) else {
        return respond(StatusCode::BAD_REQUEST, "Expected WebSocket upgrade");
    };

    if shared.is_shutting_down() {
        return refuse(StatusCode::SERVICE_UNAVAILABLE);
    }

    let Some(slot) = ConnectionSlot::reserve(&shared) else {
        warn!(
            "Rejected {}: connection limit ({}) reached",
            peer, shared.config.max_connections
        );
        shared.record_rejection(Stage::Upgrade.as_str(), "capacity");
        return refuse(StatusCode::SERVICE_UNAVAILABLE);
    };

    let mut request = AdmissionRequest::new(peer, req.uri().path());
    if let Some(ua) = req.headers().get(USER_AGENT).and_then(|v| v.to_str().ok()) {
        request = request.with_user_agent(ua);
    }

    if let Err(rejection) = shared.gate.evaluate(&request).await {
        shared.record_rejection(Stage::Upgrade.as_str(), rejection.as_str());
        return refuse(rejection.status());
    }

    let Ok(accept) = HeaderValue::from_str(&accept_key) else {
        return respond(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        // Held until the connection task ends
        let _slot = slot;
        match on_upgrade.await {
            Ok(upgraded) => {
                let mut ws_config = WebSocketConfig::default();
                ws_config.max_message_size = Some(shared.config.max_message_size);
                ws_config.max_frame_size = Some(shared.config.max_message_size);

                let ws = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    Some(ws_config),
                )
                .await;
                debug!("WebSocket handshake complete for {}", peer);
                connection::serve(shared, ws, request).await;
            }
            Err(e) => {
                debug!("WebSocket upgrade failed for {}: {}", peer, e);
            }
        }
    });

    let mut response = respond(StatusCode::SWITCHING_PROTOCOLS, Bytes::new());
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    response
}
