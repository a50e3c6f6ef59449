//! HTTP surface: the websocket upgrade and the small JSON api.

use crate::auth;
use crate::backend::Backend;
use crate::connection;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum_extra::extract::CookieJar;
use ipnet::Ipv6Net;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};

pub fn router(backend: Arc<Backend>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/chat/me", get(me_handler))
        .route("/api/chat/history", get(history_handler))
        .route("/api/chat/viewer-states", get(viewer_states_handler))
        .with_state(backend)
}

/// Bind and serve until shutdown.
pub async fn serve(backend: Arc<Backend>, addr: SocketAddr) -> std::io::Result<()> {
    let app = router(backend).into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app).await
}

async fn ws_handler(
    State(backend): State<Arc<Backend>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    ws: WebSocketUpgrade,
) -> Response {
    let ip = client_ip(&headers, peer);

    if backend.bans.is_ip_banned(&ip) {
        return reject_banned(ws);
    }

    let user = match jar.get(&backend.config.auth.jwt_cookie) {
        None => None,
        Some(cookie) => {
            match auth::resolve_user(
                &backend.db,
                &backend.directory,
                backend.names.memo(),
                &backend.config.auth.jwt_secret,
                cookie.value(),
                &ip,
            )
            .await
            {
                Ok(user) => Some(user),
                Err(e) => {
                    debug!(error = %e, "rejecting upgrade");
                    return StatusCode::UNAUTHORIZED.into_response();
                }
            }
        }
    };

    if user
        .as_ref()
        .is_some_and(|u| backend.bans.is_user_banned(u.id))
    {
        return reject_banned(ws);
    }

    ws.on_upgrade(move |socket| connection::run(socket, user, ip, backend))
}

/// Complete the upgrade, deliver a single `ERR "banned"` frame, close.
fn reject_banned(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket| async move {
        let _ = socket
            .send(axum::extract::ws::Message::Text(
                crate::proto::pack_err("banned").into(),
            ))
            .await;
    })
}

/// Auth probe: resolves the caller's token to a username.
async fn me_handler(State(backend): State<Arc<Backend>>, jar: CookieJar) -> Response {
    let Some(cookie) = jar.get(&backend.config.auth.jwt_cookie) else {
        return (StatusCode::UNAUTHORIZED, "Not logged in").into_response();
    };
    let claims = match auth::parse_token(&backend.config.auth.jwt_secret, cookie.value()) {
        Ok(claims) => claims,
        Err(_) => return (StatusCode::UNAUTHORIZED, "Not logged in").into_response(),
    };
    match backend.directory.username(&claims.id).await {
        Ok(username) => Json(json!({ "username": username, "nick": username })).into_response(),
        Err(_) => (StatusCode::UNAUTHORIZED, "Not logged in").into_response(),
    }
}

/// The recent-broadcast ring, as an array of raw frames.
async fn history_handler(State(backend): State<Arc<Backend>>) -> Response {
    Json(backend.history.snapshot()).into_response()
}

async fn viewer_states_handler(State(backend): State<Arc<Backend>>) -> Response {
    Json(backend.viewers.dump()).into_response()
}

/// Client address from `X-Forwarded-For` (first hop) or the peer, masked.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    match forwarded {
        Some(ip) => mask_ip(ip),
        None => mask_ip(&peer.ip().to_string()),
    }
}

/// IPv4 addresses are kept whole; IPv6 addresses are truncated to their
/// /64 prefix.
pub fn mask_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => match Ipv6Net::new(v6, 64) {
            Ok(net) => net.network().to_string(),
            Err(_) => v6.to_string(),
        },
        Ok(IpAddr::V4(_)) | Err(_) => ip.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_is_kept_whole() {
        assert_eq!(mask_ip("203.0.113.9"), "203.0.113.9");
    }

    #[test]
    fn ipv6_is_masked_to_64() {
        assert_eq!(
            mask_ip("2001:db8:1:2:3:4:5:6"),
            "2001:db8:1:2::"
        );
    }

    #[test]
    fn unparseable_input_passes_through() {
        assert_eq!(mask_ip("not-an-ip"), "not-an-ip");
    }

    #[test]
    fn forwarded_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "2001:db8::1, 10.0.0.1".parse().unwrap());
        let peer: SocketAddr = "192.0.2.1:1234".parse().unwrap();
        assert_eq!(client_ip(&headers, peer), "2001:db8::");
    }

    #[test]
    fn peer_address_is_fallback() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "192.0.2.1:1234".parse().unwrap();
        assert_eq!(client_ip(&headers, peer), "192.0.2.1");
    }
}
