//! HTTP front: axum routes served over hyper HTTP/1.1 connections that can be
//! upgraded and handed to a session worker.

mod routes;
mod server;
mod upgrade;

pub use routes::{error_response, router, Routes};
pub use server::{load_tls_config, HttpServer};
pub use upgrade::into_hijacked;

use axum::http::HeaderMap;

/// True when any value of the header carries `token` as one of its comma-separated
/// parts, ignoring case.
pub fn header_has_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}
