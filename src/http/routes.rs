use super::upgrade::into_hijacked;
use crate::constants::limits::MAX_REQUEST_BODY_BYTES;
use crate::constants::upgrade::PROTOCOL;
use crate::errors::ProxyError;
use crate::managers::session::{SessionHandler, UpgradeRequest};
use crate::services::config::TlsIoMode;
use crate::services::logger::Logger;
use axum::body::to_bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::upgrade::OnUpgrade;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

/// Shared state behind the routes.
#[derive(Clone)]
pub struct Routes {
    logger: Logger,
    sessions: Arc<SessionHandler>,
    tls_io_mode: TlsIoMode,
}

impl Routes {
    pub fn new(logger: Logger, sessions: Arc<SessionHandler>, tls_io_mode: TlsIoMode) -> Self {
        Self {
            logger: logger.child("routes"),
            sessions,
            tls_io_mode,
        }
    }
}

pub fn router(routes: Routes) -> Router {
    Router::new()
        .route("/pubkey", get(pubkey))
        .route("/session", post(open_session))
        .fallback(not_found)
        .with_state(routes)
}

pub fn error_response(err: &ProxyError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.public_body())).into_response()
}

async fn pubkey(State(routes): State<Routes>) -> Response {
    match routes.sessions.pubkey() {
        Ok(bytes) => ([(header::CONTENT_TYPE, "text/plain")], bytes).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn not_found(method: Method, uri: Uri) -> Response {
    error_response(&ProxyError::not_found(format!(
        "No route for {} {}",
        method,
        uri.path()
    )))
}

/// Validates the request, answers `101 Switching Protocols`, and hands the upgraded
/// socket to a blocking session worker. Rejections before the upgrade are ordinary
/// HTTP responses; after it, the session reports on the raw stream.
async fn open_session(State(routes): State<Routes>, mut request: Request) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let on_upgrade = request.extensions_mut().remove::<OnUpgrade>();
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            return error_response(&ProxyError::invalid_request(format!(
                "Failed to read request body: {}",
                err
            )))
        }
    };

    let accepted = routes.sessions.accept(&UpgradeRequest {
        headers: &parts.headers,
        peer,
        upgradable: on_upgrade.is_some(),
        body: &body,
    });
    let (accepted, on_upgrade) = match (accepted, on_upgrade) {
        (Ok(accepted), Some(on_upgrade)) => (accepted, on_upgrade),
        (Err(err), _) => return error_response(&err),
        (Ok(_), None) => {
            return error_response(&ProxyError::hijack_unsupported(
                "Connection cannot be upgraded",
            ))
        }
    };

    tokio::spawn(async move {
        let peer = peer.map(|p| p.to_string());
        let hijacked = match on_upgrade.await {
            Ok(upgraded) => into_hijacked(upgraded, routes.tls_io_mode),
            Err(err) => Err(ProxyError::internal(format!(
                "Connection upgrade failed: {}",
                err
            ))),
        };
        let hijacked = match hijacked {
            Ok(hijacked) => hijacked,
            Err(err) => {
                routes.logger.error(
                    "upgraded connection could not be taken over",
                    Some(&json!({ "peer": peer, "error": err.message })),
                );
                return;
            }
        };
        let sessions = routes.sessions.clone();
        let worker = tokio::task::spawn_blocking(move || sessions.run(accepted, hijacked));
        if let Err(err) = worker.await {
            routes.logger.error(
                "session worker failed",
                Some(&json!({ "peer": peer, "error": err.to_string() })),
            );
        }
    });

    (
        StatusCode::SWITCHING_PROTOCOLS,
        [(header::CONNECTION, "upgrade"), (header::UPGRADE, PROTOCOL)],
    )
        .into_response()
}
